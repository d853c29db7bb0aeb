//! SHA-256 block graph encoder and size-bounded chunker.
//!
//! Files are split into leaf blocks of at most `block_size` bytes; a JSON node
//! block links the leaves and its address is the file address. A directory is a
//! JSON node block listing `(name, address, size)` entries, sorted by name.
//! Addresses are multibase base32 lower without padding (`b` prefix) of the
//! SHA-256 digest, so they stay valid as a single DNS label.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use futures::{
    future,
    stream::{self, StreamExt},
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::domain::ContentAddress;
use tokio::sync::oneshot;

use crate::{
    Block, BlockStream, Chunk, ChunkStream, EncodedGraph, NamedFile, Packager, RootAddress,
};

pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

const BASE32_LOWER: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

pub fn address_of(bytes: &[u8]) -> ContentAddress {
    ContentAddress(format!("b{}", base32_lower(&Sha256::digest(bytes))))
}

/// RFC 4648 base32, lowercase alphabet, no padding.
fn base32_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(char::from(BASE32_LOWER[((buffer >> bits) & 31) as usize]));
        }
    }
    if bits > 0 {
        out.push(char::from(BASE32_LOWER[((buffer << (5 - bits)) & 31) as usize]));
    }
    out
}

#[derive(Serialize)]
struct FileNode<'a> {
    kind: &'static str,
    size: usize,
    links: Vec<&'a str>,
}

#[derive(Serialize)]
struct DirectoryEntry<'a> {
    name: &'a str,
    address: &'a str,
    size: usize,
}

#[derive(Serialize)]
struct DirectoryNode<'a> {
    kind: &'static str,
    entries: Vec<DirectoryEntry<'a>>,
}

#[derive(Debug, Clone)]
pub struct Sha256Packager {
    block_size: usize,
    chunk_size: usize,
}

impl Default for Sha256Packager {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE)
    }
}

impl Sha256Packager {
    /// Leaf blocks never exceed `chunk_size`, so a leaf always fits a chunk.
    pub fn new(block_size: usize, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            block_size: block_size.clamp(1, chunk_size),
            chunk_size,
        }
    }

    fn encode_file(&self, file: &NamedFile) -> Result<(Vec<Block>, ContentAddress)> {
        let mut blocks: Vec<Block> = if file.bytes.is_empty() {
            vec![Block {
                address: address_of(&[]),
                data: Vec::new(),
            }]
        } else {
            file.bytes
                .chunks(self.block_size)
                .map(|leaf| Block {
                    address: address_of(leaf),
                    data: leaf.to_vec(),
                })
                .collect()
        };

        let node = FileNode {
            kind: "file",
            size: file.bytes.len(),
            links: blocks.iter().map(|block| block.address.as_str()).collect(),
        };
        let node_bytes = serde_json::to_vec(&node)
            .with_context(|| format!("failed to encode file node for {}", file.name))?;
        let root = address_of(&node_bytes);
        blocks.push(Block {
            address: root.clone(),
            data: node_bytes,
        });
        Ok((blocks, root))
    }
}

/// Streams `blocks`, then resolves the root once the last block was consumed.
fn graph_from_blocks(blocks: Vec<Block>, root: ContentAddress) -> EncodedGraph {
    let (tx, rx) = oneshot::channel();
    let resolve_root = stream::once(async move {
        let _ = tx.send(root);
    })
    .filter_map(|()| future::ready(None::<Result<Block>>));
    let blocks = stream::iter(blocks.into_iter().map(Ok))
        .chain(resolve_root)
        .boxed();
    EncodedGraph::new(blocks, RootAddress::new(rx))
}

impl Packager for Sha256Packager {
    fn content_address_file(&self, file: &NamedFile) -> Result<EncodedGraph> {
        let (blocks, root) = self.encode_file(file)?;
        Ok(graph_from_blocks(blocks, root))
    }

    fn content_address_directory(&self, files: &[NamedFile]) -> Result<EncodedGraph> {
        let mut seen = HashSet::new();
        for file in files {
            if file.name.is_empty() || file.name.contains('/') {
                bail!("invalid file name '{}' in directory", file.name);
            }
            if !seen.insert(file.name.as_str()) {
                bail!("duplicate file name '{}' in directory", file.name);
            }
        }

        let mut encoded = Vec::with_capacity(files.len());
        for file in files {
            let (blocks, root) = self.encode_file(file)?;
            encoded.push((file, blocks, root));
        }
        encoded.sort_by(|a, b| a.0.name.cmp(&b.0.name));

        let node = DirectoryNode {
            kind: "directory",
            entries: encoded
                .iter()
                .map(|(file, _, root)| DirectoryEntry {
                    name: &file.name,
                    address: root.as_str(),
                    size: file.bytes.len(),
                })
                .collect(),
        };
        let node_bytes = serde_json::to_vec(&node).context("failed to encode directory node")?;
        let root = address_of(&node_bytes);

        let mut blocks: Vec<Block> = encoded
            .into_iter()
            .flat_map(|(_, blocks, _)| blocks)
            .collect();
        blocks.push(Block {
            address: root.clone(),
            data: node_bytes,
        });
        Ok(graph_from_blocks(blocks, root))
    }

    fn chunk(&self, blocks: BlockStream) -> ChunkStream {
        let max = self.chunk_size;
        stream::unfold(
            (blocks, Vec::<Block>::new(), 0usize, false),
            move |(mut blocks, mut pending, mut size, done)| async move {
                if done {
                    return None;
                }
                loop {
                    match blocks.next().await {
                        Some(Ok(block)) => {
                            let len = block.data.len();
                            if !pending.is_empty() && size + len > max {
                                let chunk = Chunk::from_blocks(std::mem::take(&mut pending));
                                pending.push(block);
                                return Some((Ok(chunk), (blocks, pending, len, false)));
                            }
                            size += len;
                            pending.push(block);
                        }
                        Some(Err(err)) => {
                            return Some((Err(err), (blocks, Vec::new(), 0, true)));
                        }
                        None if pending.is_empty() => return None,
                        None => {
                            let chunk = Chunk::from_blocks(pending);
                            return Some((Ok(chunk), (blocks, Vec::new(), 0, true)));
                        }
                    }
                }
            },
        )
        .boxed()
    }
}

#[cfg(test)]
#[path = "tests/packaging_tests.rs"]
mod tests;
