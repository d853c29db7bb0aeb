//! Fetch, package and upload pipeline with blended progress.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use futures::future::join_all;
use shared::{
    domain::{UploadInput, UploadResult},
    error::{ErrorCode, FlowError},
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use crate::{
    contact_sheet::{self, MetadataDocument, INDEX_FILE_NAME, METADATA_FILE_NAME},
    AssetFetcher, BranchUpdate, FetchedAsset, Identity, NamedFile, Packager, Progress,
    ProgressAggregator, Transport,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("packaging failed at {stage}: {source}")]
    Packaging {
        stage: &'static str,
        source: anyhow::Error,
    },
    #[error("upload failed for {did}: {source}")]
    Transport { did: String, source: anyhow::Error },
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::Packaging { .. } => ErrorCode::Internal,
            PipelineError::Transport { .. } => ErrorCode::TransportError,
        }
    }
}

fn packaging(stage: &'static str) -> impl FnOnce(anyhow::Error) -> PipelineError {
    move |source| PipelineError::Packaging { stage, source }
}

pub struct UploadPipeline {
    fetcher: Arc<dyn AssetFetcher>,
    packager: Arc<dyn Packager>,
    transport: Arc<dyn Transport>,
}

impl UploadPipeline {
    pub fn new(
        fetcher: Arc<dyn AssetFetcher>,
        packager: Arc<dyn Packager>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            fetcher,
            packager,
            transport,
        }
    }

    /// Runs both branches concurrently and publishes the blended progress on
    /// `progress`. Per-asset failures only shrink the bundle; packaging and
    /// transport failures end the run.
    pub async fn run(
        &self,
        identity: &Identity,
        input: &UploadInput,
        progress: watch::Sender<Progress>,
    ) -> Result<UploadResult, PipelineError> {
        let urls = input.image_urls();
        info!(did = %identity.did(), images = urls.len(), "upload pipeline started");

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (assets_tx, assets_rx) = oneshot::channel::<(Vec<FetchedAsset>, Vec<FlowError>)>();
        let aggregator = ProgressAggregator::new(urls.len(), progress);

        let fetch_updates = updates_tx.clone();
        let fetch_branch = async move {
            let slots = join_all(urls.iter().enumerate().map(|(index, url)| {
                let updates = fetch_updates.clone();
                async move {
                    let slot = self.fetch_asset(index, url).await;
                    let _ = updates.send(BranchUpdate::AssetSettled { index });
                    slot
                }
            }))
            .await;
            let mut assets = Vec::with_capacity(slots.len());
            let mut omitted = Vec::new();
            for slot in slots {
                match slot {
                    Ok(asset) => assets.push(asset),
                    Err(failure) => omitted.push(failure),
                }
            }
            info!(
                fetched = assets.len(),
                omitted = omitted.len(),
                requested = urls.len(),
                "asset fetch branch settled"
            );
            let _ = assets_tx.send((assets, omitted));
        };

        let upload_updates = updates_tx;
        let upload_branch = async move {
            let (assets, omitted) = assets_rx
                .await
                .map_err(|_| anyhow!("asset fetch branch ended without a result"))
                .map_err(packaging("fetch"))?;
            let result = self
                .package_and_upload(identity, input, assets, omitted)
                .await?;
            let _ = upload_updates.send(BranchUpdate::BundleUploaded);
            Ok::<_, PipelineError>(result)
        };

        let ((), result, last) = tokio::join!(fetch_branch, upload_branch, aggregator.run(updates_rx));
        match &result {
            Ok(result) => info!(
                did = %identity.did(),
                root = %result.root_address,
                assets = result.asset_count,
                progress = last.value(),
                "upload pipeline completed"
            ),
            Err(err) => error!(did = %identity.did(), error = %err, "upload pipeline failed"),
        }
        result
    }

    /// Fetches and encodes one image. A failure omits the image and is
    /// reported back as an `AssetFetchFailed` entry of the result.
    async fn fetch_asset(&self, index: usize, url: &str) -> Result<FetchedAsset, FlowError> {
        let omitted = |err: anyhow::Error| {
            FlowError::new(
                ErrorCode::AssetFetchFailed,
                format!("image {index} ({url}) omitted: {err}"),
            )
        };
        let bytes = match self.fetcher.fetch(url).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(index, url, error = %err, "asset fetch failed; omitting from bundle");
                return Err(omitted(err));
            }
        };

        let file = NamedFile::new(format!("{index}.png"), bytes);
        let encoded = match self.packager.content_address_file(&file) {
            Ok(encoded) => encoded.drain().await,
            Err(err) => Err(err),
        };
        match encoded {
            Ok(content_address) => Ok(FetchedAsset {
                index,
                source_url: url.to_string(),
                file,
                content_address,
            }),
            Err(err) => {
                warn!(index, url, error = %err, "asset encode failed; omitting from bundle");
                Err(omitted(err))
            }
        }
    }

    async fn package_and_upload(
        &self,
        identity: &Identity,
        input: &UploadInput,
        assets: Vec<FetchedAsset>,
        omitted: Vec<FlowError>,
    ) -> Result<UploadResult, PipelineError> {
        let metadata_bytes = MetadataDocument::new(input)
            .to_bytes()
            .context("failed to serialize metadata document")
            .map_err(packaging("metadata"))?;
        let metadata = NamedFile::new(METADATA_FILE_NAME, metadata_bytes);
        let metadata_address = self
            .packager
            .content_address_file(&metadata)
            .map_err(packaging("metadata"))?
            .drain()
            .await
            .map_err(packaging("metadata"))?;

        let index_html = contact_sheet::render_contact_sheet(input, &assets, &metadata_address);
        let asset_count = assets.len();
        let mut files = Vec::with_capacity(asset_count + 2);
        files.push(NamedFile::new(INDEX_FILE_NAME, index_html.into_bytes()));
        files.push(metadata);
        files.extend(assets.into_iter().map(|asset| asset.file));

        let (blocks, root) = self
            .packager
            .content_address_directory(&files)
            .map_err(packaging("directory"))?
            .into_parts();
        let chunks = self.packager.chunk(blocks);

        self.transport
            .upload(identity, chunks)
            .await
            .map_err(|source| PipelineError::Transport {
                did: identity.did().to_string(),
                source,
            })?;

        let root_address = root.resolve().await.map_err(packaging("root"))?;
        Ok(UploadResult {
            root_address,
            asset_count,
            omitted,
        })
    }
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
