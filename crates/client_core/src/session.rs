//! Session controller: validated input, identity acquisition, one pipeline run.

use shared::{
    domain::{ContentAddress, UploadInput, UploadResult},
    error::{ErrorCode, FlowError, InputError},
};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::{
    Identity, IdentityError, IdentityFlow, IdentityState, LaunchParams, PipelineError, Progress,
    UploadPipeline, VerificationCancelHandle,
};

pub const DEFAULT_GATEWAY: &str = "https://w3s.link/ipfs";
const ROOT_PLACEHOLDER: &str = "{root}";
const EVENT_CAPACITY: usize = 64;

/// Turns a root content address into a shareable link.
///
/// A template containing `{root}` is substituted in place, anything else is
/// treated as a path gateway origin and the root is appended as a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayTemplate(String);

impl GatewayTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        let template = template.into().trim().to_string();
        if template.contains(ROOT_PLACEHOLDER) {
            Self(template)
        } else {
            Self(template.trim_end_matches('/').to_string())
        }
    }

    pub fn share_url(&self, root: &ContentAddress) -> String {
        if self.0.contains(ROOT_PLACEHOLDER) {
            self.0.replace(ROOT_PLACEHOLDER, root.as_str())
        } else {
            format!("{}/{}", self.0, root)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for GatewayTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_GATEWAY)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputStatus {
    Missing,
    Malformed(FlowError),
    Valid(UploadInput),
}

impl InputStatus {
    fn from_launch(params: &LaunchParams) -> Self {
        match params.validate() {
            Ok(input) => InputStatus::Valid(input),
            Err(InputError::Missing) => InputStatus::Missing,
            Err(err) => InputStatus::Malformed(err.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Idle,
    Running { progress: Progress },
    Succeeded { result: UploadResult, share_url: String },
    Failed(FlowError),
}

/// What the user should currently see.
#[derive(Debug, Clone, PartialEq)]
pub enum PresentationState {
    EmptyInput,
    MalformedInput(FlowError),
    /// Email entry. Carries the error of the previous attempt, if any.
    SignIn { error: Option<FlowError> },
    AwaitingVerification { email: String },
    Confirm {
        email: String,
        image_urls: Vec<String>,
        registered: bool,
    },
    Uploading { progress: Progress },
    Published { share_url: String, asset_count: usize },
    UploadFailed(FlowError),
    SignedOut,
}

impl PresentationState {
    /// Pipeline state is only consulted once the identity is verified, so a
    /// running upload without an identity has no presentation.
    pub fn derive(
        input: &InputStatus,
        identity: &IdentityState,
        pipeline: &PipelineState,
    ) -> PresentationState {
        let input = match input {
            InputStatus::Missing => return PresentationState::EmptyInput,
            InputStatus::Malformed(error) => return PresentationState::MalformedInput(error.clone()),
            InputStatus::Valid(input) => input,
        };

        match identity {
            IdentityState::Unauthenticated => PresentationState::SignIn { error: None },
            IdentityState::Cancelled => PresentationState::SignIn {
                error: Some(FlowError::new(
                    ErrorCode::VerificationCancelled,
                    "verification cancelled",
                )),
            },
            IdentityState::Failed { code, reason } => PresentationState::SignIn {
                error: Some(FlowError::new(*code, reason.clone())),
            },
            IdentityState::AwaitingVerification { email } | IdentityState::Registering { email } => {
                PresentationState::AwaitingVerification {
                    email: email.clone(),
                }
            }
            IdentityState::SignedOut => PresentationState::SignedOut,
            IdentityState::Verified {
                email, registered, ..
            } => match pipeline {
                PipelineState::Idle => PresentationState::Confirm {
                    email: email.clone(),
                    image_urls: input.image_urls().to_vec(),
                    registered: *registered,
                },
                PipelineState::Running { progress } => PresentationState::Uploading {
                    progress: *progress,
                },
                PipelineState::Succeeded { result, share_url } => PresentationState::Published {
                    share_url: share_url.clone(),
                    asset_count: result.asset_count,
                },
                PipelineState::Failed(error) => PresentationState::UploadFailed(error.clone()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PresentationChanged(PresentationState),
    Progress(Progress),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no valid upload input for this session")]
    NoInput,
    #[error("no verified identity for this session")]
    NotSignedIn,
    #[error("this session has already run its upload")]
    AlreadyPublished,
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::NoInput => ErrorCode::InputMissing,
            SessionError::NotSignedIn | SessionError::AlreadyPublished => ErrorCode::Internal,
            SessionError::Identity(err) => err.code(),
            SessionError::Pipeline(err) => err.code(),
        }
    }
}

pub struct Session {
    flow: IdentityFlow,
    pipeline: UploadPipeline,
    gateway: GatewayTemplate,
    input: InputStatus,
    identity: Option<Identity>,
    email: Option<String>,
    root_address: Option<ContentAddress>,
    share_url: Option<String>,
    pipeline_state: PipelineState,
    presentation: PresentationState,
    events: broadcast::Sender<SessionEvent>,
    progress: watch::Sender<Progress>,
}

impl Session {
    /// Validates the launch input and, when it is usable, restores a stored
    /// identity. Invalid input leaves the identity flow untouched.
    pub async fn activate(
        params: &LaunchParams,
        flow: IdentityFlow,
        pipeline: UploadPipeline,
        gateway: GatewayTemplate,
    ) -> Session {
        let input = InputStatus::from_launch(params);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (progress, _) = watch::channel(Progress::ZERO);
        let mut session = Session {
            presentation: PresentationState::derive(&input, flow.state(), &PipelineState::Idle),
            flow,
            pipeline,
            gateway,
            input,
            identity: None,
            email: None,
            root_address: None,
            share_url: None,
            pipeline_state: PipelineState::Idle,
            events,
            progress,
        };

        match &session.input {
            InputStatus::Missing => info!("session activated without launch input"),
            InputStatus::Malformed(error) => {
                warn!(error = %error.message, "session activated with malformed launch input")
            }
            InputStatus::Valid(input) => {
                info!(images = input.image_urls().len(), "session activated");
                match session.flow.restore().await {
                    Ok(Some(identity)) => {
                        session.email = Some(identity.email().to_string());
                        session.identity = Some(identity);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "ignoring unreadable stored identity"),
                }
            }
        }
        session.refresh();
        session
    }

    pub fn presentation(&self) -> &PresentationState {
        &self.presentation
    }

    pub fn input(&self) -> &InputStatus {
        &self.input
    }

    pub fn identity_state(&self) -> &IdentityState {
        self.flow.state()
    }

    pub fn pipeline_state(&self) -> &PipelineState {
        &self.pipeline_state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn root_address(&self) -> Option<&ContentAddress> {
        self.root_address.as_ref()
    }

    pub fn share_url(&self) -> Option<&str> {
        self.share_url.as_deref()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    fn refresh(&mut self) {
        let next = PresentationState::derive(&self.input, self.flow.state(), &self.pipeline_state);
        if next != self.presentation {
            self.presentation = next.clone();
            let _ = self.events.send(SessionEvent::PresentationChanged(next));
        }
    }

    fn require_input(&self) -> Result<&UploadInput, SessionError> {
        match &self.input {
            InputStatus::Valid(input) => Ok(input),
            _ => Err(SessionError::NoInput),
        }
    }

    fn clear_email_after_failure(&mut self) {
        if matches!(
            self.flow.state(),
            IdentityState::Failed { .. } | IdentityState::Cancelled
        ) {
            self.email = None;
        }
    }

    /// Starts email verification. The returned handle cancels the wait from
    /// another task.
    pub async fn begin_sign_in(
        &mut self,
        email: &str,
    ) -> Result<VerificationCancelHandle, SessionError> {
        self.require_input()?;
        let result = self.flow.begin(email).await;
        match &result {
            Ok(_) => self.email = Some(email.trim().to_string()),
            Err(_) => self.clear_email_after_failure(),
        }
        self.refresh();
        Ok(result?)
    }

    /// Waits for verification, then registers and stores the identity.
    pub async fn finish_sign_in(&mut self) -> Result<&Identity, SessionError> {
        let result = match self.flow.await_verification().await {
            Ok((identity, proof)) => {
                self.refresh();
                self.flow.complete_registration(identity, proof).await
            }
            Err(err) => Err(err),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.clear_email_after_failure();
                self.refresh();
                return Err(err.into());
            }
        };
        if !outcome.registered {
            warn!(did = %outcome.identity.did(), "continuing with an unregistered identity");
        }
        self.refresh();
        Ok(self.identity.insert(outcome.identity))
    }

    pub fn cancel_sign_in(&mut self) -> Result<(), SessionError> {
        self.flow.cancel()?;
        self.email = None;
        self.refresh();
        Ok(())
    }

    pub fn reset_sign_in(&mut self) -> Result<(), SessionError> {
        self.flow.reset()?;
        self.email = None;
        self.refresh();
        Ok(())
    }

    /// Runs the upload pipeline once and exposes the share link on success.
    pub async fn publish(&mut self) -> Result<UploadResult, SessionError> {
        if self.pipeline_state != PipelineState::Idle {
            return Err(SessionError::AlreadyPublished);
        }
        self.require_input()?;
        if self.identity.is_none() || !self.flow.is_verified() {
            return Err(SessionError::NotSignedIn);
        }

        self.pipeline_state = PipelineState::Running {
            progress: Progress::ZERO,
        };
        self.refresh();

        let (tx, mut rx) = watch::channel(Progress::ZERO);
        let Session {
            flow,
            pipeline,
            identity,
            input,
            events,
            progress,
            pipeline_state,
            presentation,
            ..
        } = &mut *self;
        let input: &InputStatus = input;
        let (Some(identity), InputStatus::Valid(upload_input)) = (identity.as_ref(), input) else {
            return Err(SessionError::NotSignedIn);
        };

        let forward = async {
            while rx.changed().await.is_ok() {
                let value = *rx.borrow_and_update();
                *pipeline_state = PipelineState::Running { progress: value };
                let next = PresentationState::derive(input, flow.state(), pipeline_state);
                if next != *presentation {
                    *presentation = next.clone();
                    let _ = events.send(SessionEvent::PresentationChanged(next));
                }
                progress.send_replace(value);
                let _ = events.send(SessionEvent::Progress(value));
            }
        };
        let (result, ()) = tokio::join!(pipeline.run(identity, upload_input, tx), forward);

        match result {
            Ok(result) => {
                let root = self.root_address.get_or_insert(result.root_address.clone());
                let share_url = self.gateway.share_url(root);
                info!(root = %root, share_url = %share_url, assets = result.asset_count, "bundle published");
                self.share_url = Some(share_url.clone());
                self.pipeline_state = PipelineState::Succeeded {
                    result: result.clone(),
                    share_url,
                };
                self.refresh();
                Ok(result)
            }
            Err(err) => {
                error!(error = %err, "publish failed");
                self.pipeline_state = PipelineState::Failed(FlowError::new(err.code(), err.to_string()));
                self.refresh();
                Err(err.into())
            }
        }
    }

    /// Erases the stored identity. Terminal for the session.
    pub async fn sign_out(&mut self) -> Result<(), SessionError> {
        let identity = self.identity.as_ref().ok_or(SessionError::NotSignedIn)?;
        self.flow.sign_out(identity).await?;
        self.identity = None;
        self.email = None;
        self.refresh();
        Ok(())
    }

    /// Cancels any outstanding verification and drops all session state.
    pub fn teardown(mut self) {
        self.flow.teardown();
        info!(published = self.root_address.is_some(), "session torn down");
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
