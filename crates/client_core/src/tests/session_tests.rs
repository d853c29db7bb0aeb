use super::*;
use crate::{
    AssetFetcher, ChunkStream, IdentityService, RegistrationFailurePolicy, Sha256Packager,
    Transport, UnverifiedIdentity, VerificationProof,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct TestIdentityService {
    hang: bool,
    reject_registration: bool,
    persisted: Option<Identity>,
    calls: AtomicUsize,
    registered: AtomicUsize,
    erased: AtomicUsize,
}

impl TestIdentityService {
    fn approving() -> Self {
        Self {
            hang: false,
            reject_registration: false,
            persisted: None,
            calls: AtomicUsize::new(0),
            registered: AtomicUsize::new(0),
            erased: AtomicUsize::new(0),
        }
    }

    fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::approving()
        }
    }

    fn rejecting_registration() -> Self {
        Self {
            reject_registration: true,
            ..Self::approving()
        }
    }

    fn with_persisted(identity: Identity) -> Self {
        Self {
            persisted: Some(identity),
            ..Self::approving()
        }
    }
}

#[async_trait]
impl IdentityService for TestIdentityService {
    async fn create_unverified_identity(&self, email: &str) -> Result<UnverifiedIdentity> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(UnverifiedIdentity::generate(email))
    }

    async fn dispatch_verification(&self, _identity: &UnverifiedIdentity) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn await_verification(
        &self,
        identity: &UnverifiedIdentity,
        cancel: CancellationToken,
    ) -> Result<(Identity, VerificationProof)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            cancel.cancelled().await;
            return Err(anyhow!("verification aborted"));
        }
        Ok((
            identity.clone().into_verified(),
            VerificationProof("proof".into()),
        ))
    }

    async fn register(&self, _identity: &Identity, _proof: &VerificationProof) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_registration {
            return Err(anyhow!("directory returned 500"));
        }
        self.registered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn persist(&self, _identity: &Identity) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn erase(&self, _identity: &Identity) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.erased.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_persisted(&self) -> Result<Option<Identity>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.persisted.clone())
    }
}

#[derive(Default)]
struct CountingFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl AssetFetcher for CountingFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("pixels of {url}").into_bytes())
    }
}

struct DrainingTransport;

#[async_trait]
impl Transport for DrainingTransport {
    async fn upload(&self, _identity: &Identity, mut chunks: ChunkStream) -> Result<()> {
        while let Some(chunk) = chunks.next().await {
            chunk?;
        }
        Ok(())
    }
}

struct Harness {
    identity: Arc<TestIdentityService>,
    fetcher: Arc<CountingFetcher>,
}

impl Harness {
    fn new(identity: TestIdentityService) -> Self {
        Self {
            identity: Arc::new(identity),
            fetcher: Arc::new(CountingFetcher::default()),
        }
    }

    async fn activate(&self, query: &str) -> Session {
        self.activate_with_policy(query, RegistrationFailurePolicy::Block)
            .await
    }

    async fn activate_with_policy(
        &self,
        query: &str,
        policy: RegistrationFailurePolicy,
    ) -> Session {
        let flow = IdentityFlow::new(self.identity.clone(), policy);
        activate_with(self.fetcher.clone(), flow, query).await
    }

    fn identity_calls(&self) -> usize {
        self.identity.calls.load(Ordering::SeqCst)
    }

    fn fetch_calls(&self) -> usize {
        self.fetcher.calls.load(Ordering::SeqCst)
    }
}

async fn activate_with(fetcher: Arc<CountingFetcher>, flow: IdentityFlow, query: &str) -> Session {
    let pipeline = UploadPipeline::new(
        fetcher,
        Arc::new(Sha256Packager::default()),
        Arc::new(DrainingTransport),
    );
    Session::activate(
        &LaunchParams::from_query(query),
        flow,
        pipeline,
        GatewayTemplate::new("https://gateway.test/ipfs/"),
    )
    .await
}

const VALID_QUERY: &str =
    "images=https%3A%2F%2Fimg.test%2Fa.png,https%3A%2F%2Fimg.test%2Fb.png&description=x&params=%7B%22seed%22%3A1%7D";

fn stored_identity() -> Identity {
    UnverifiedIdentity::generate("artist@example.com").into_verified()
}

#[tokio::test]
async fn empty_input_shows_empty_state_without_touching_identity() {
    let harness = Harness::new(TestIdentityService::approving());
    let mut session = harness.activate("").await;

    assert_eq!(session.presentation(), &PresentationState::EmptyInput);
    assert_eq!(session.identity_state(), &IdentityState::Unauthenticated);

    let err = session
        .begin_sign_in("artist@example.com")
        .await
        .expect_err("no input");
    assert!(matches!(err, SessionError::NoInput));
    assert_eq!(harness.identity_calls(), 0);
    assert_eq!(harness.fetch_calls(), 0);
}

#[tokio::test]
async fn unparsable_params_are_malformed_and_distinct_from_empty() {
    let harness = Harness::new(TestIdentityService::approving());
    let mut session = harness
        .activate("images=https://img.test/a.png&description=x&params=%7Bseed")
        .await;

    let PresentationState::MalformedInput(error) = session.presentation() else {
        panic!("expected malformed input, got {:?}", session.presentation());
    };
    assert_eq!(error.code, ErrorCode::InputMalformed);

    let err = session.publish().await.expect_err("no input");
    assert!(matches!(err, SessionError::NoInput | SessionError::NotSignedIn));
    assert_eq!(harness.identity_calls(), 0);
    assert_eq!(harness.fetch_calls(), 0);
}

#[tokio::test]
async fn partial_input_is_malformed_not_empty() {
    let harness = Harness::new(TestIdentityService::approving());
    let session = harness.activate("description=only%20a%20description").await;

    assert!(matches!(
        session.presentation(),
        PresentationState::MalformedInput(_)
    ));
    assert_eq!(harness.identity_calls(), 0);
}

#[tokio::test]
async fn restored_identity_skips_to_confirm_and_publishes() {
    let stored = stored_identity();
    let harness = Harness::new(TestIdentityService::with_persisted(stored.clone()));
    let mut session = harness.activate(VALID_QUERY).await;

    let PresentationState::Confirm {
        email,
        image_urls,
        registered,
    } = session.presentation()
    else {
        panic!("expected confirm, got {:?}", session.presentation());
    };
    assert_eq!(email, "artist@example.com");
    assert_eq!(image_urls, &["https://img.test/a.png", "https://img.test/b.png"]);
    assert!(*registered);

    let result = session.publish().await.expect("publish");
    assert_eq!(result.asset_count, 2);
    assert_eq!(harness.fetch_calls(), 2);

    let expected = format!("https://gateway.test/ipfs/{}", result.root_address);
    assert_eq!(session.share_url(), Some(expected.as_str()));
    assert_eq!(session.root_address(), Some(&result.root_address));
    assert_eq!(
        session.presentation(),
        &PresentationState::Published {
            share_url: expected,
            asset_count: 2,
        }
    );
    assert_eq!(*session.subscribe_progress().borrow(), Progress::COMPLETE);
}

#[tokio::test]
async fn sign_in_then_publish_broadcasts_transitions_and_progress() {
    let harness = Harness::new(TestIdentityService::approving());
    let mut session = harness.activate(VALID_QUERY).await;
    let mut events = session.subscribe_events();
    assert_eq!(
        session.presentation(),
        &PresentationState::SignIn { error: None }
    );

    session
        .begin_sign_in("  artist@example.com ")
        .await
        .expect("begin");
    assert_eq!(session.email(), Some("artist@example.com"));
    let did = session.finish_sign_in().await.expect("finish").did().clone();
    assert_eq!(harness.identity.registered.load(Ordering::SeqCst), 1);
    assert_eq!(session.identity().map(|identity| identity.did()), Some(&did));

    session.publish().await.expect("publish");

    let mut presentations = Vec::new();
    let mut progress = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::PresentationChanged(state) => presentations.push(state),
            SessionEvent::Progress(value) => progress.push(value),
        }
    }

    assert!(matches!(
        presentations.first(),
        Some(PresentationState::AwaitingVerification { .. })
    ));
    assert!(presentations
        .iter()
        .any(|state| matches!(state, PresentationState::Confirm { .. })));
    assert!(presentations
        .iter()
        .any(|state| matches!(state, PresentationState::Uploading { .. })));
    assert!(matches!(
        presentations.last(),
        Some(PresentationState::Published { asset_count: 2, .. })
    ));
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(progress.last().copied(), Some(Progress::COMPLETE));

    let uploading: Vec<Progress> = presentations
        .iter()
        .filter_map(|state| match state {
            PresentationState::Uploading { progress } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(uploading.first(), Some(&Progress::ZERO));
    assert_eq!(uploading.last(), Some(&Progress::COMPLETE));
    assert!(uploading.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn blocked_registration_returns_to_sign_in_without_email() {
    let harness = Harness::new(TestIdentityService::rejecting_registration());
    let mut session = harness.activate(VALID_QUERY).await;

    session
        .begin_sign_in("artist@example.com")
        .await
        .expect("begin");
    let err = session.finish_sign_in().await.expect_err("registration blocked");

    assert_eq!(err.code(), ErrorCode::RegistrationFailed);
    assert_eq!(session.email(), None);
    assert!(session.identity().is_none());
    let PresentationState::SignIn { error: Some(error) } = session.presentation() else {
        panic!("expected sign in with error, got {:?}", session.presentation());
    };
    assert_eq!(error.code, ErrorCode::RegistrationFailed);
    assert!(matches!(
        session.publish().await,
        Err(SessionError::NotSignedIn)
    ));
    assert_eq!(harness.fetch_calls(), 0);
}

#[tokio::test]
async fn tolerated_registration_failure_confirms_unregistered_identity() {
    let harness = Harness::new(TestIdentityService::rejecting_registration());
    let mut session = harness
        .activate_with_policy(VALID_QUERY, RegistrationFailurePolicy::LogAndProceed)
        .await;

    session
        .begin_sign_in("artist@example.com")
        .await
        .expect("begin");
    session.finish_sign_in().await.expect("proceeds");

    let PresentationState::Confirm {
        email, registered, ..
    } = session.presentation()
    else {
        panic!("expected confirm, got {:?}", session.presentation());
    };
    assert_eq!(email, "artist@example.com");
    assert!(!*registered);
    assert_eq!(session.email(), Some("artist@example.com"));

    let result = session.publish().await.expect("publish");
    assert_eq!(result.asset_count, 2);
}

#[tokio::test]
async fn cancel_sign_in_stops_the_wait_and_returns_to_sign_in() {
    let harness = Harness::new(TestIdentityService::hanging());
    let mut session = harness.activate(VALID_QUERY).await;

    let err = session.cancel_sign_in().expect_err("nothing to cancel");
    assert_eq!(err.code(), ErrorCode::Internal);

    let handle = session
        .begin_sign_in("artist@example.com")
        .await
        .expect("begin");
    session.cancel_sign_in().expect("cancel");

    assert!(handle.is_cancelled());
    assert_eq!(session.email(), None);
    assert_eq!(session.identity_state(), &IdentityState::Cancelled);
    let PresentationState::SignIn { error: Some(error) } = session.presentation() else {
        panic!("expected sign in with error, got {:?}", session.presentation());
    };
    assert_eq!(error.code, ErrorCode::VerificationCancelled);

    assert!(session.finish_sign_in().await.is_err());
    assert_eq!(harness.identity.registered.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unavailable_identity_service_fails_sign_in() {
    let fetcher = Arc::new(CountingFetcher::default());
    let flow = IdentityFlow::new(
        Arc::new(crate::MissingIdentityService),
        RegistrationFailurePolicy::Block,
    );
    let mut session = activate_with(fetcher, flow, VALID_QUERY).await;
    assert_eq!(
        session.presentation(),
        &PresentationState::SignIn { error: None }
    );

    let err = session
        .begin_sign_in("artist@example.com")
        .await
        .expect_err("service unavailable");
    assert_eq!(err.code(), ErrorCode::VerificationFailed);
    assert_eq!(session.email(), None);
    assert!(matches!(
        session.presentation(),
        PresentationState::SignIn { error: Some(_) }
    ));
}

#[tokio::test]
async fn cancelled_sign_in_clears_email_and_can_reset() {
    let harness = Harness::new(TestIdentityService::hanging());
    let mut session = harness.activate(VALID_QUERY).await;

    let handle = session
        .begin_sign_in("artist@example.com")
        .await
        .expect("begin");
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
    });

    let err = session.finish_sign_in().await.expect_err("cancelled");
    canceller.await.expect("canceller");
    assert_eq!(err.code(), ErrorCode::VerificationCancelled);
    assert_eq!(session.email(), None);
    assert_eq!(harness.identity.registered.load(Ordering::SeqCst), 0);
    let PresentationState::SignIn { error: Some(error) } = session.presentation() else {
        panic!("expected sign in with error, got {:?}", session.presentation());
    };
    assert_eq!(error.code, ErrorCode::VerificationCancelled);

    session.reset_sign_in().expect("reset");
    assert_eq!(
        session.presentation(),
        &PresentationState::SignIn { error: None }
    );
}

#[tokio::test]
async fn publish_requires_identity_and_runs_once() {
    let harness = Harness::new(TestIdentityService::approving());
    let mut session = harness.activate(VALID_QUERY).await;

    let err = session.publish().await.expect_err("not signed in");
    assert!(matches!(err, SessionError::NotSignedIn));
    assert_eq!(harness.fetch_calls(), 0);

    session.begin_sign_in("artist@example.com").await.expect("begin");
    session.finish_sign_in().await.expect("finish");
    let first = session.publish().await.expect("publish");

    let err = session.publish().await.expect_err("second publish");
    assert!(matches!(err, SessionError::AlreadyPublished));
    assert_eq!(session.root_address(), Some(&first.root_address));
    assert_eq!(harness.fetch_calls(), 2);
}

#[tokio::test]
async fn sign_out_erases_identity_and_ends_session() {
    let harness = Harness::new(TestIdentityService::with_persisted(stored_identity()));
    let mut session = harness.activate(VALID_QUERY).await;

    session.sign_out().await.expect("sign out");
    assert_eq!(harness.identity.erased.load(Ordering::SeqCst), 1);
    assert_eq!(session.presentation(), &PresentationState::SignedOut);
    assert!(session.identity().is_none());
    assert!(matches!(
        session.publish().await,
        Err(SessionError::NotSignedIn)
    ));
    session.teardown();
}

#[tokio::test]
async fn teardown_cancels_outstanding_verification() {
    let harness = Harness::new(TestIdentityService::hanging());
    let mut session = harness.activate(VALID_QUERY).await;
    let handle = session
        .begin_sign_in("artist@example.com")
        .await
        .expect("begin");

    session.teardown();
    assert!(handle.is_cancelled());
}

#[test]
fn running_pipeline_without_identity_is_not_presentable() {
    let input = LaunchParams::from_query(VALID_QUERY)
        .validate()
        .expect("valid");
    let state = PresentationState::derive(
        &InputStatus::Valid(input),
        &IdentityState::Unauthenticated,
        &PipelineState::Running {
            progress: Progress::new(0.5),
        },
    );
    assert_eq!(state, PresentationState::SignIn { error: None });
}

#[test]
fn gateway_template_supports_path_and_subdomain_forms() {
    let root = ContentAddress::new("broot");
    assert_eq!(
        GatewayTemplate::new("https://w3s.link/ipfs/").share_url(&root),
        "https://w3s.link/ipfs/broot"
    );
    assert_eq!(
        GatewayTemplate::new("https://{root}.ipfs.w3s.link").share_url(&root),
        "https://broot.ipfs.w3s.link"
    );
    assert_eq!(GatewayTemplate::default().as_str(), DEFAULT_GATEWAY);
}

#[test]
fn subdomain_links_survive_hostname_lowercasing() {
    let root = crate::packaging::address_of(b"bundle root node");
    let url = GatewayTemplate::new("https://{root}.ipfs.w3s.link").share_url(&root);

    let host = url
        .strip_prefix("https://")
        .and_then(|rest| rest.split('/').next())
        .expect("host");
    let label = host.split('.').next().expect("label");
    assert_eq!(label, root.as_str());
    assert_eq!(label, label.to_ascii_lowercase());
    assert!(label.len() <= 63);
    assert!(label.bytes().all(|b| b.is_ascii_alphanumeric()));
}
