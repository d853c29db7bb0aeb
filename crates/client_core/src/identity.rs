//! Identity acquisition: email verification, registration and sign-out.

use std::{fmt, str::FromStr, sync::Arc};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use shared::{domain::Did, error::ErrorCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{Identity, IdentityService, UnverifiedIdentity, VerificationProof};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityState {
    Unauthenticated,
    AwaitingVerification {
        email: String,
    },
    Registering {
        email: String,
    },
    /// `registered` is false only when registration failed under
    /// [`RegistrationFailurePolicy::LogAndProceed`].
    Verified {
        did: Did,
        email: String,
        registered: bool,
    },
    Cancelled,
    Failed {
        code: ErrorCode,
        reason: String,
    },
    SignedOut,
}

impl IdentityState {
    fn name(&self) -> &'static str {
        match self {
            IdentityState::Unauthenticated => "unauthenticated",
            IdentityState::AwaitingVerification { .. } => "awaiting_verification",
            IdentityState::Registering { .. } => "registering",
            IdentityState::Verified { .. } => "verified",
            IdentityState::Cancelled => "cancelled",
            IdentityState::Failed { .. } => "failed",
            IdentityState::SignedOut => "signed_out",
        }
    }
}

/// What to do when the directory or the local keyring rejects a verified identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationFailurePolicy {
    /// Surface the failure and stop before the confirmation step.
    #[default]
    Block,
    /// Log the failure and continue to the confirmation step anyway.
    LogAndProceed,
}

impl FromStr for RegistrationFailurePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "block" => Ok(Self::Block),
            "log_and_proceed" => Ok(Self::LogAndProceed),
            other => Err(format!("unknown registration failure policy '{other}'")),
        }
    }
}

impl fmt::Display for RegistrationFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => f.write_str("block"),
            Self::LogAndProceed => f.write_str("log_and_proceed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("email address must not be empty")]
    EmptyEmail,
    #[error("a verification attempt is already outstanding for this session")]
    AttemptInProgress,
    #[error("`{operation}` is not valid while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: &'static str,
    },
    #[error("failed to start verification for {email}: {source}")]
    BeginFailed {
        email: String,
        source: anyhow::Error,
    },
    #[error("verification failed for {did}: {source}")]
    VerificationFailed { did: Did, source: anyhow::Error },
    #[error("verification cancelled for {did}")]
    VerificationCancelled { did: Did },
    #[error("registration failed for {did}: {source}")]
    RegistrationFailed { did: Did, source: anyhow::Error },
    #[error("sign out failed for {did}: {source}")]
    SignOutFailed { did: Did, source: anyhow::Error },
    #[error("failed to load persisted identity: {0}")]
    RestoreFailed(anyhow::Error),
}

impl IdentityError {
    pub fn code(&self) -> ErrorCode {
        match self {
            IdentityError::EmptyEmail
            | IdentityError::BeginFailed { .. }
            | IdentityError::VerificationFailed { .. } => ErrorCode::VerificationFailed,
            IdentityError::VerificationCancelled { .. } => ErrorCode::VerificationCancelled,
            IdentityError::RegistrationFailed { .. } => ErrorCode::RegistrationFailed,
            IdentityError::AttemptInProgress
            | IdentityError::InvalidTransition { .. }
            | IdentityError::SignOutFailed { .. }
            | IdentityError::RestoreFailed(_) => ErrorCode::Internal,
        }
    }
}

struct VerificationAttempt {
    id: Uuid,
    unverified: UnverifiedIdentity,
    cancel: CancellationToken,
}

/// Cancels an outstanding verification wait from another task.
#[derive(Debug, Clone)]
pub struct VerificationCancelHandle {
    attempt_id: Uuid,
    token: CancellationToken,
}

impl VerificationCancelHandle {
    pub fn cancel(&self) {
        info!(attempt_id = %self.attempt_id, "verification cancel requested");
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    pub identity: Identity,
    pub registered: bool,
}

pub struct IdentityFlow {
    service: Arc<dyn IdentityService>,
    policy: RegistrationFailurePolicy,
    state: IdentityState,
    attempt: Option<VerificationAttempt>,
}

impl IdentityFlow {
    pub fn new(service: Arc<dyn IdentityService>, policy: RegistrationFailurePolicy) -> Self {
        Self {
            service,
            policy,
            state: IdentityState::Unauthenticated,
            attempt: None,
        }
    }

    pub fn state(&self) -> &IdentityState {
        &self.state
    }

    pub fn is_verified(&self) -> bool {
        matches!(self.state, IdentityState::Verified { .. })
    }

    pub fn cancel_handle(&self) -> Option<VerificationCancelHandle> {
        self.attempt.as_ref().map(|attempt| VerificationCancelHandle {
            attempt_id: attempt.id,
            token: attempt.cancel.clone(),
        })
    }

    fn invalid(&self, operation: &'static str) -> IdentityError {
        IdentityError::InvalidTransition {
            operation,
            state: self.state.name(),
        }
    }

    /// Loads a previously stored identity and jumps straight to `Verified`.
    pub async fn restore(&mut self) -> Result<Option<Identity>, IdentityError> {
        if self.state != IdentityState::Unauthenticated {
            return Err(self.invalid("restore"));
        }

        let Some(identity) = self
            .service
            .load_persisted()
            .await
            .map_err(IdentityError::RestoreFailed)?
        else {
            info!("no persisted identity");
            return Ok(None);
        };

        info!(did = %identity.did(), "restored persisted identity");
        self.state = IdentityState::Verified {
            did: identity.did().clone(),
            email: identity.email().to_string(),
            registered: true,
        };
        Ok(Some(identity))
    }

    /// Creates an unverified identity for `email` and sends the verification message.
    pub async fn begin(&mut self, email: &str) -> Result<VerificationCancelHandle, IdentityError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(IdentityError::EmptyEmail);
        }
        if self.attempt.is_some() {
            return Err(IdentityError::AttemptInProgress);
        }
        if self.state != IdentityState::Unauthenticated {
            return Err(self.invalid("begin"));
        }

        let unverified = match self.service.create_unverified_identity(email).await {
            Ok(unverified) => unverified,
            Err(source) => {
                error!(email, error = %source, "failed to create unverified identity");
                self.state = IdentityState::Failed {
                    code: ErrorCode::VerificationFailed,
                    reason: source.to_string(),
                };
                return Err(IdentityError::BeginFailed {
                    email: email.to_string(),
                    source,
                });
            }
        };
        info!(did = %unverified.did(), "created unverified identity");

        if let Err(source) = self.service.dispatch_verification(&unverified).await {
            error!(did = %unverified.did(), error = %source, "failed to dispatch verification email");
            self.state = IdentityState::Failed {
                code: ErrorCode::VerificationFailed,
                reason: source.to_string(),
            };
            return Err(IdentityError::VerificationFailed {
                did: unverified.did().clone(),
                source,
            });
        }

        let attempt = VerificationAttempt {
            id: Uuid::new_v4(),
            unverified,
            cancel: CancellationToken::new(),
        };
        info!(
            attempt_id = %attempt.id,
            did = %attempt.unverified.did(),
            "verification email dispatched"
        );
        let handle = VerificationCancelHandle {
            attempt_id: attempt.id,
            token: attempt.cancel.clone(),
        };
        self.attempt = Some(attempt);
        self.state = IdentityState::AwaitingVerification {
            email: email.to_string(),
        };
        Ok(handle)
    }

    /// Waits for the out-of-band verification of the outstanding attempt.
    ///
    /// Cancellation wins over a verification that completes at the same time, so a
    /// cancelled attempt never reaches `Registering`.
    pub async fn await_verification(
        &mut self,
    ) -> Result<(Identity, VerificationProof), IdentityError> {
        let IdentityState::AwaitingVerification { email } = &self.state else {
            return Err(self.invalid("await_verification"));
        };
        let email = email.clone();
        let Some(attempt) = self.attempt.as_ref() else {
            return Err(self.invalid("await_verification"));
        };

        let attempt_id = attempt.id;
        let did = attempt.unverified.did().clone();
        let token = attempt.cancel.clone();
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = self.service.await_verification(&attempt.unverified, token.clone()) => Some(result),
        };
        self.attempt = None;

        match outcome {
            Some(Ok((identity, proof))) if !token.is_cancelled() => {
                info!(%attempt_id, did = %identity.did(), "email verification completed");
                self.state = IdentityState::Registering { email };
                Ok((identity, proof))
            }
            Some(Err(source)) if !token.is_cancelled() => {
                error!(%attempt_id, %did, error = %source, "email verification failed");
                self.state = IdentityState::Failed {
                    code: ErrorCode::VerificationFailed,
                    reason: source.to_string(),
                };
                Err(IdentityError::VerificationFailed { did, source })
            }
            _ => {
                warn!(%attempt_id, %did, "email verification cancelled");
                self.state = IdentityState::Cancelled;
                Err(IdentityError::VerificationCancelled { did })
            }
        }
    }

    /// Cancels the outstanding attempt. Only valid while awaiting verification.
    pub fn cancel(&mut self) -> Result<(), IdentityError> {
        if !matches!(self.state, IdentityState::AwaitingVerification { .. }) {
            return Err(self.invalid("cancel"));
        }
        if let Some(attempt) = self.attempt.take() {
            warn!(attempt_id = %attempt.id, did = %attempt.unverified.did(), "verification cancelled");
            attempt.cancel.cancel();
        }
        self.state = IdentityState::Cancelled;
        Ok(())
    }

    /// Registers the verified identity with the directory and stores it locally.
    pub async fn complete_registration(
        &mut self,
        identity: Identity,
        proof: VerificationProof,
    ) -> Result<RegistrationOutcome, IdentityError> {
        let IdentityState::Registering { email } = &self.state else {
            return Err(self.invalid("complete_registration"));
        };
        let email = email.clone();

        let result = match self.service.register(&identity, &proof).await {
            Ok(()) => self
                .service
                .persist(&identity)
                .await
                .context("failed to store identity locally"),
            Err(err) => Err(err.context("directory rejected registration")),
        };

        match result {
            Ok(()) => {
                info!(did = %identity.did(), "identity registered and stored");
                self.state = IdentityState::Verified {
                    did: identity.did().clone(),
                    email,
                    registered: true,
                };
                Ok(RegistrationOutcome {
                    identity,
                    registered: true,
                })
            }
            Err(source) => match self.policy {
                RegistrationFailurePolicy::Block => {
                    error!(did = %identity.did(), error = %source, "registration failed");
                    self.state = IdentityState::Failed {
                        code: ErrorCode::RegistrationFailed,
                        reason: source.to_string(),
                    };
                    Err(IdentityError::RegistrationFailed {
                        did: identity.did().clone(),
                        source,
                    })
                }
                RegistrationFailurePolicy::LogAndProceed => {
                    error!(
                        did = %identity.did(),
                        error = %source,
                        "registration failed; proceeding to confirmation"
                    );
                    self.state = IdentityState::Verified {
                        did: identity.did().clone(),
                        email,
                        registered: false,
                    };
                    Ok(RegistrationOutcome {
                        identity,
                        registered: false,
                    })
                }
            },
        }
    }

    /// Erases the stored identity. Terminal for the session.
    pub async fn sign_out(&mut self, identity: &Identity) -> Result<(), IdentityError> {
        if !self.is_verified() {
            return Err(self.invalid("sign_out"));
        }

        self.service
            .erase(identity)
            .await
            .map_err(|source| IdentityError::SignOutFailed {
                did: identity.did().clone(),
                source,
            })?;
        info!(did = %identity.did(), "signed out");
        self.state = IdentityState::SignedOut;
        Ok(())
    }

    /// Returns to `Unauthenticated` after a cancelled or failed attempt.
    pub fn reset(&mut self) -> Result<(), IdentityError> {
        if !matches!(
            self.state,
            IdentityState::Cancelled | IdentityState::Failed { .. }
        ) {
            return Err(self.invalid("reset"));
        }
        self.attempt = None;
        self.state = IdentityState::Unauthenticated;
        Ok(())
    }

    /// Fires the cancellation signal of any outstanding attempt and drops it.
    pub fn teardown(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.cancel.cancel();
        }
    }
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;
