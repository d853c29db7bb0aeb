//! Access API client and the keyring-backed identity service built on it.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use shared::{
    domain::Did,
    protocol::{RegisterRequest, ValidateEmailQuery, ValidateEmailRequest, VerificationResponse},
};
use storage::{IdentityStore, StoredIdentity};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Identity, IdentityService, UnverifiedIdentity, VerificationProof};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_VERIFICATION_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HttpAccessClient {
    http: Client,
    base_url: String,
    poll_interval: Duration,
    verification_timeout: Duration,
}

impl HttpAccessClient {
    pub fn new(
        base_url: &str,
        poll_interval: Duration,
        verification_timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to create access HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
            verification_timeout,
        })
    }

    /// Asks the access service to email a verification link for `did`.
    pub async fn request_validation(&self, did: &Did, email: &str) -> Result<()> {
        self.http
            .post(format!("{}/validate-email", self.base_url))
            .json(&ValidateEmailRequest {
                did: did.clone(),
                email: email.to_string(),
            })
            .send()
            .await
            .with_context(|| format!("failed to request email validation for {did}"))?
            .error_for_status()
            .with_context(|| format!("access service refused email validation for {did}"))?;
        Ok(())
    }

    /// Returns the proof once the link was followed, `None` while still pending.
    async fn check_verification(&self, did: &Did) -> Result<Option<VerificationProof>> {
        let response = self
            .http
            .get(format!("{}/validate-email", self.base_url))
            .query(&ValidateEmailQuery { did: did.clone() })
            .send()
            .await
            .with_context(|| format!("failed to poll verification for {did}"))?;

        match response.status() {
            StatusCode::ACCEPTED => Ok(None),
            StatusCode::FORBIDDEN => bail!("email verification was denied for {did}"),
            _ => {
                let body: VerificationResponse = response
                    .error_for_status()
                    .with_context(|| format!("verification poll failed for {did}"))?
                    .json()
                    .await
                    .context("invalid verification response")?;
                Ok(Some(VerificationProof(body.proof)))
            }
        }
    }

    /// Polls until the address is verified, denied, timed out or `cancel` fires.
    pub async fn await_verification(
        &self,
        did: &Did,
        cancel: CancellationToken,
    ) -> Result<VerificationProof> {
        let poll = async {
            loop {
                if let Some(proof) = self.check_verification(did).await? {
                    return Ok::<_, anyhow::Error>(proof);
                }
                debug!(%did, "verification still pending");
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow!("verification wait for {did} cancelled")),
            result = tokio::time::timeout(self.verification_timeout, poll) => result
                .map_err(|_| anyhow!(
                    "verification for {did} timed out after {}s",
                    self.verification_timeout.as_secs()
                ))?,
        }
    }

    pub async fn register(&self, did: &Did, email: &str, proof: &VerificationProof) -> Result<()> {
        self.http
            .post(format!("{}/register", self.base_url))
            .json(&RegisterRequest {
                did: did.clone(),
                email: email.to_string(),
                proof: proof.0.clone(),
            })
            .send()
            .await
            .with_context(|| format!("failed to register {did}"))?
            .error_for_status()
            .with_context(|| format!("access service refused registration of {did}"))?;
        Ok(())
    }
}

/// [`IdentityService`] that generates ed25519 keys locally, verifies them
/// through the access API and keeps the default identity in SQLite.
pub struct KeyringService {
    access: HttpAccessClient,
    store: IdentityStore,
}

impl KeyringService {
    pub fn new(access: HttpAccessClient, store: IdentityStore) -> Self {
        Self { access, store }
    }
}

#[async_trait]
impl IdentityService for KeyringService {
    async fn create_unverified_identity(&self, email: &str) -> Result<UnverifiedIdentity> {
        Ok(UnverifiedIdentity::generate(email))
    }

    async fn dispatch_verification(&self, identity: &UnverifiedIdentity) -> Result<()> {
        self.access
            .request_validation(identity.did(), identity.email())
            .await
    }

    async fn await_verification(
        &self,
        identity: &UnverifiedIdentity,
        cancel: CancellationToken,
    ) -> Result<(Identity, VerificationProof)> {
        let proof = self.access.await_verification(identity.did(), cancel).await?;
        Ok((identity.clone().into_verified(), proof))
    }

    async fn register(&self, identity: &Identity, proof: &VerificationProof) -> Result<()> {
        self.access
            .register(identity.did(), identity.email(), proof)
            .await?;
        info!(did = %identity.did(), "identity registered with access service");
        Ok(())
    }

    async fn persist(&self, identity: &Identity) -> Result<()> {
        self.store
            .save_default_identity(&StoredIdentity {
                did: identity.did().clone(),
                email: identity.email().to_string(),
                secret_key: identity.secret_key_bytes().to_vec(),
                created_at: Utc::now(),
            })
            .await
    }

    async fn erase(&self, identity: &Identity) -> Result<()> {
        if !self.store.delete_identity(identity.did()).await? {
            warn!(did = %identity.did(), "no stored identity to erase");
        }
        Ok(())
    }

    async fn load_persisted(&self) -> Result<Option<Identity>> {
        let Some(stored) = self.store.load_default_identity().await? else {
            return Ok(None);
        };
        let identity = Identity::from_secret_key(stored.email, &stored.secret_key)
            .with_context(|| format!("stored key for {} is unusable", stored.did))?;
        if identity.did() != &stored.did {
            bail!(
                "stored key does not match its identifier {} (derived {})",
                stored.did,
                identity.did()
            );
        }
        Ok(Some(identity))
    }
}

#[cfg(test)]
#[path = "tests/access_tests.rs"]
mod tests;
