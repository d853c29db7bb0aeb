use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use reqwest::Client;
use shared::protocol::{UploadChunkResponse, AGENT_DID_HEADER, AGENT_SIGNATURE_HEADER};
use tracing::{debug, info};

use crate::{ChunkStream, Identity, Transport};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Posts each framed chunk to the upload service, signed by the uploading identity.
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    upload_url: String,
}

impl HttpTransport {
    pub fn new(upload_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .context("failed to create upload HTTP client")?;
        Ok(Self {
            http,
            upload_url: upload_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn upload(&self, identity: &Identity, mut chunks: ChunkStream) -> Result<()> {
        let did = identity.did();
        let mut sent = 0usize;
        let mut stored_blocks = 0usize;

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.context("failed to produce upload chunk")?;
            let body = chunk
                .encode()
                .with_context(|| format!("failed to frame chunk {sent} for {did}"))?;
            let signature = STANDARD.encode(identity.sign(&body));

            let response: UploadChunkResponse = self
                .http
                .post(format!("{}/car", self.upload_url))
                .header(AGENT_DID_HEADER, did.as_str())
                .header(AGENT_SIGNATURE_HEADER, signature)
                .body(body)
                .send()
                .await
                .with_context(|| format!("failed to send chunk {sent} for {did}"))?
                .error_for_status()
                .with_context(|| format!("upload service rejected chunk {sent} for {did}"))?
                .json()
                .await
                .with_context(|| format!("invalid upload response for chunk {sent}"))?;

            debug!(
                %did,
                chunk = sent,
                blocks = chunk.block_count(),
                bytes = chunk.byte_len(),
                stored = response.stored_blocks,
                "chunk uploaded"
            );
            sent += 1;
            stored_blocks += response.stored_blocks;
        }

        info!(%did, chunks = sent, stored_blocks, "upload finished");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
