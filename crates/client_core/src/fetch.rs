use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::AssetFetcher;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Downloads generated images over HTTP(S).
#[derive(Clone)]
pub struct HttpAssetFetcher {
    http: Client,
}

impl HttpAssetFetcher {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_FETCH_TIMEOUT)
            .build()
            .context("failed to create asset HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("request for {url} failed"))?
            .error_for_status()
            .with_context(|| format!("asset host rejected {url}"))?
            .bytes()
            .await
            .with_context(|| format!("failed to read body of {url}"))?;
        debug!(url, bytes = bytes.len(), "fetched asset");
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
#[path = "tests/fetch_tests.rs"]
mod tests;
