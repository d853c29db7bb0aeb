use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

pub mod access;
mod contact_sheet;
pub mod fetch;
pub mod identity;
pub mod launch;
pub mod packaging;
pub mod pipeline;
pub mod progress;
pub mod session;
pub mod transport;
pub mod types;

pub use access::{HttpAccessClient, KeyringService};
pub use contact_sheet::{render_contact_sheet, MetadataDocument};
pub use fetch::HttpAssetFetcher;
pub use identity::{
    IdentityError, IdentityFlow, IdentityState, RegistrationFailurePolicy, RegistrationOutcome,
    VerificationCancelHandle,
};
pub use launch::LaunchParams;
pub use packaging::Sha256Packager;
pub use pipeline::{PipelineError, UploadPipeline};
pub use progress::{BranchUpdate, Progress, ProgressAggregator};
pub use session::{
    GatewayTemplate, InputStatus, PipelineState, PresentationState, Session, SessionError,
    SessionEvent, DEFAULT_GATEWAY,
};
pub use transport::HttpTransport;
pub use types::{
    Block, BlockStream, Chunk, ChunkStream, EncodedGraph, FetchedAsset, Identity, NamedFile,
    RootAddress, UnverifiedIdentity, VerificationProof,
};

/// Email verification, registration and local persistence of identities.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn create_unverified_identity(&self, email: &str) -> Result<UnverifiedIdentity>;
    async fn dispatch_verification(&self, identity: &UnverifiedIdentity) -> Result<()>;
    /// Resolves once the out-of-band verification completed. Implementations should
    /// give up promptly once `cancel` fires.
    async fn await_verification(
        &self,
        identity: &UnverifiedIdentity,
        cancel: CancellationToken,
    ) -> Result<(Identity, VerificationProof)>;
    async fn register(&self, identity: &Identity, proof: &VerificationProof) -> Result<()>;
    async fn persist(&self, identity: &Identity) -> Result<()>;
    async fn erase(&self, identity: &Identity) -> Result<()>;
    async fn load_persisted(&self) -> Result<Option<Identity>>;
}

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Content addressing and chunking of files into a block graph.
pub trait Packager: Send + Sync {
    fn content_address_file(&self, file: &NamedFile) -> Result<EncodedGraph>;
    fn content_address_directory(&self, files: &[NamedFile]) -> Result<EncodedGraph>;
    fn chunk(&self, blocks: BlockStream) -> ChunkStream;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn upload(&self, identity: &Identity, chunks: ChunkStream) -> Result<()>;
}

pub struct MissingIdentityService;

#[async_trait]
impl IdentityService for MissingIdentityService {
    async fn create_unverified_identity(&self, _email: &str) -> Result<UnverifiedIdentity> {
        Err(anyhow!("identity service is unavailable"))
    }

    async fn dispatch_verification(&self, identity: &UnverifiedIdentity) -> Result<()> {
        Err(anyhow!(
            "identity service is unavailable; cannot verify {}",
            identity.did()
        ))
    }

    async fn await_verification(
        &self,
        identity: &UnverifiedIdentity,
        _cancel: CancellationToken,
    ) -> Result<(Identity, VerificationProof)> {
        Err(anyhow!(
            "identity service is unavailable; cannot verify {}",
            identity.did()
        ))
    }

    async fn register(&self, identity: &Identity, _proof: &VerificationProof) -> Result<()> {
        Err(anyhow!(
            "identity service is unavailable; cannot register {}",
            identity.did()
        ))
    }

    async fn persist(&self, identity: &Identity) -> Result<()> {
        Err(anyhow!(
            "identity service is unavailable; cannot persist {}",
            identity.did()
        ))
    }

    async fn erase(&self, identity: &Identity) -> Result<()> {
        Err(anyhow!(
            "identity service is unavailable; cannot erase {}",
            identity.did()
        ))
    }

    async fn load_persisted(&self) -> Result<Option<Identity>> {
        Ok(None)
    }
}

pub struct MissingAssetFetcher;

#[async_trait]
impl AssetFetcher for MissingAssetFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        Err(anyhow!("asset fetcher is unavailable for {url}"))
    }
}

pub struct MissingPackager;

impl Packager for MissingPackager {
    fn content_address_file(&self, file: &NamedFile) -> Result<EncodedGraph> {
        Err(anyhow!("packager is unavailable for file {}", file.name))
    }

    fn content_address_directory(&self, files: &[NamedFile]) -> Result<EncodedGraph> {
        Err(anyhow!(
            "packager is unavailable for directory of {} files",
            files.len()
        ))
    }

    fn chunk(&self, _blocks: BlockStream) -> ChunkStream {
        stream::once(async { Err(anyhow!("packager is unavailable for chunking")) }).boxed()
    }
}

pub struct MissingTransport;

#[async_trait]
impl Transport for MissingTransport {
    async fn upload(&self, identity: &Identity, _chunks: ChunkStream) -> Result<()> {
        Err(anyhow!(
            "transport is unavailable; cannot upload for {}",
            identity.did()
        ))
    }
}
