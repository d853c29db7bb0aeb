//! Identity handles, file payloads and block-graph types shared by the flow.

use std::{fmt, sync::Arc};

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::{Signer, SigningKey};
use futures::{stream::BoxStream, StreamExt};
use shared::domain::{ContentAddress, Did};
use tokio::sync::oneshot;

const DID_KEY_PREFIX: &str = "did:key:";
const SECRET_KEY_LEN: usize = 32;

/// A signing identity bound to an email address.
///
/// The secret key never appears in `Debug` output.
#[derive(Clone)]
pub struct Identity {
    did: Did,
    email: String,
    signer: Arc<SigningKey>,
}

impl Identity {
    fn from_signing_key(email: impl Into<String>, signer: SigningKey) -> Self {
        let did = Did(format!(
            "{DID_KEY_PREFIX}{}",
            URL_SAFE_NO_PAD.encode(signer.verifying_key().as_bytes())
        ));
        Self {
            did,
            email: email.into(),
            signer: Arc::new(signer),
        }
    }

    /// Rebuilds a persisted identity from its raw secret key.
    pub fn from_secret_key(email: impl Into<String>, secret_key: &[u8]) -> Result<Self> {
        let bytes: [u8; SECRET_KEY_LEN] = secret_key.try_into().map_err(|_| {
            anyhow!(
                "invalid secret key length: expected {SECRET_KEY_LEN}, got {}",
                secret_key.len()
            )
        })?;
        Ok(Self::from_signing_key(email, SigningKey::from_bytes(&bytes)))
    }

    pub fn did(&self) -> &Did {
        &self.did
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LEN] {
        self.signer.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signer.sign(message).to_bytes().to_vec()
    }

    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.signer.verifying_key()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("did", &self.did)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Freshly generated identity that has not yet passed email verification.
#[derive(Clone, Debug)]
pub struct UnverifiedIdentity {
    inner: Identity,
}

impl UnverifiedIdentity {
    pub fn generate(email: impl Into<String>) -> Self {
        let signer = SigningKey::generate(&mut rand_core::OsRng);
        Self {
            inner: Identity::from_signing_key(email, signer),
        }
    }

    pub fn did(&self) -> &Did {
        self.inner.did()
    }

    pub fn email(&self) -> &str {
        self.inner.email()
    }

    /// Promotes the identity once the verification proof has been obtained.
    pub fn into_verified(self) -> Identity {
        self.inner
    }
}

/// Opaque proof returned by the access service once the email link was followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationProof(pub String);

/// A named file-like payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl NamedFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// An image that made it through fetch and content addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAsset {
    pub index: usize,
    pub source_url: String,
    pub file: NamedFile,
    pub content_address: ContentAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub address: ContentAddress,
    pub data: Vec<u8>,
}

/// A transport-sized group of blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    blocks: Vec<Block>,
}

impl Chunk {
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn byte_len(&self) -> usize {
        self.blocks.iter().map(|block| block.data.len()).sum()
    }

    /// Frames every block as `u16 address len | address | u32 data len | data`, big endian.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.byte_len() + self.blocks.len() * 64);
        for block in &self.blocks {
            let address = block.address.as_str().as_bytes();
            let address_len = u16::try_from(address.len())
                .map_err(|_| anyhow!("block address {} is too long to frame", block.address))?;
            let data_len = u32::try_from(block.data.len()).map_err(|_| {
                anyhow!("block {} has {} bytes, too many to frame", block.address, block.data.len())
            })?;
            out.extend_from_slice(&address_len.to_be_bytes());
            out.extend_from_slice(address);
            out.extend_from_slice(&data_len.to_be_bytes());
            out.extend_from_slice(&block.data);
        }
        Ok(out)
    }
}

pub type BlockStream = BoxStream<'static, Result<Block>>;
pub type ChunkStream = BoxStream<'static, Result<Chunk>>;

/// Root address of a graph, resolved by the encoder once its block stream is drained.
pub struct RootAddress {
    rx: oneshot::Receiver<ContentAddress>,
}

impl RootAddress {
    pub fn new(rx: oneshot::Receiver<ContentAddress>) -> Self {
        Self { rx }
    }

    pub async fn resolve(self) -> Result<ContentAddress> {
        self.rx
            .await
            .map_err(|_| anyhow!("root address unresolved: block stream was not fully drained"))
    }
}

/// Output of content addressing: the block stream plus its pending root address.
pub struct EncodedGraph {
    blocks: BlockStream,
    root: RootAddress,
}

impl EncodedGraph {
    pub fn new(blocks: BlockStream, root: RootAddress) -> Self {
        Self { blocks, root }
    }

    pub fn into_parts(self) -> (BlockStream, RootAddress) {
        (self.blocks, self.root)
    }

    /// Consumes every block and returns the root address.
    pub async fn drain(self) -> Result<ContentAddress> {
        let (mut blocks, root) = self.into_parts();
        while let Some(block) = blocks.next().await {
            block?;
        }
        root.resolve().await
    }
}
