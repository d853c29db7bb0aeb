use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use arboard::Clipboard;
use clap::Parser;
use client_core::{
    packaging::DEFAULT_BLOCK_SIZE, GatewayTemplate, HttpAccessClient, HttpAssetFetcher,
    HttpTransport, IdentityFlow, KeyringService, LaunchParams, PresentationState, Session,
    SessionEvent, Sha256Packager, UploadPipeline,
};
use storage::IdentityStore;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod interrupt;
mod render;

use config::Settings;
use interrupt::prompt;

/// Exit status for a run ended by Ctrl-C.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// How an interactive run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Finished,
    Interrupted,
}

/// Publishes generated images with their prompt as a content-addressed gallery.
#[derive(Parser, Debug)]
#[command(name = "publisher")]
struct Args {
    /// Launch query string, e.g. `images=https://a.png,https://b.png&description=...&params={...}`.
    #[arg(long)]
    query: Option<String>,
    /// Comma-separated image URLs. Overrides `images` in --query.
    #[arg(long)]
    images: Option<String>,
    #[arg(long)]
    description: Option<String>,
    /// Generation parameters as a flat JSON object.
    #[arg(long)]
    params: Option<String>,
    /// Email address used when no stored identity exists.
    #[arg(long)]
    email: Option<String>,
    /// Config file, defaults to ./publisher.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    gateway: Option<String>,
    #[arg(long)]
    access_api_url: Option<String>,
    #[arg(long)]
    upload_api_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    /// Publish without asking for confirmation.
    #[arg(long, short = 'y')]
    yes: bool,
    /// Copy the share link to the clipboard.
    #[arg(long)]
    copy: bool,
    /// Erase the stored identity instead of publishing.
    #[arg(long)]
    sign_out: bool,
}

impl Args {
    fn launch_params(&self) -> LaunchParams {
        let mut launch = self
            .query
            .as_deref()
            .map(LaunchParams::from_query)
            .unwrap_or_default();
        let flag = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        if let Some(images) = flag(&self.images) {
            launch.images = Some(images);
        }
        if let Some(description) = flag(&self.description) {
            launch.description = Some(description);
        }
        if let Some(params) = flag(&self.params) {
            launch.params = Some(params);
        }
        launch
    }

    fn apply_to(&self, settings: &mut Settings) {
        if let Some(v) = &self.gateway {
            settings.gateway_template = v.clone();
        }
        if let Some(v) = &self.access_api_url {
            settings.access_api_url = v.clone();
        }
        if let Some(v) = &self.upload_api_url {
            settings.upload_api_url = v.clone();
        }
        if let Some(v) = &self.database_url {
            settings.database_url = v.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut settings = config::load_settings(args.config.as_deref())?;
    args.apply_to(&mut settings);
    info!(
        access = %settings.access_api_url,
        upload = %settings.upload_api_url,
        gateway = %settings.gateway_template,
        policy = %settings.registration_failure_policy,
        "publisher starting"
    );

    let session = activate_session(&settings, &args.launch_params()).await?;
    println!("{}", render::render(session.presentation()));
    let printer = spawn_event_printer(&session);

    let outcome = drive(session, &args).await;
    let _ = printer.await;
    if outcome? == Outcome::Interrupted {
        // A prompt may still be blocked on stdin, which would stall runtime shutdown.
        info!("interrupted");
        std::process::exit(INTERRUPTED_EXIT_CODE);
    }
    Ok(())
}

async fn activate_session(settings: &Settings, launch: &LaunchParams) -> Result<Session> {
    let store = IdentityStore::new(&settings.database_url).await?;
    let access = HttpAccessClient::new(
        &settings.access_api_url,
        settings.verification_poll_interval(),
        settings.verification_timeout(),
    )?;
    let flow = IdentityFlow::new(
        Arc::new(KeyringService::new(access, store)),
        settings.registration_failure_policy,
    );
    let pipeline = UploadPipeline::new(
        Arc::new(HttpAssetFetcher::new()?),
        Arc::new(Sha256Packager::new(
            DEFAULT_BLOCK_SIZE,
            settings.chunk_size_bytes,
        )),
        Arc::new(HttpTransport::new(&settings.upload_api_url)?),
    );
    Ok(Session::activate(
        launch,
        flow,
        pipeline,
        GatewayTemplate::new(settings.gateway_template.as_str()),
    )
    .await)
}

fn spawn_event_printer(session: &Session) -> JoinHandle<()> {
    let mut events = session.subscribe_events();
    tokio::spawn(async move {
        let mut last_line = String::new();
        loop {
            match events.recv().await {
                // Uploading states arrive per progress step; identical lines are skipped.
                Ok(SessionEvent::PresentationChanged(state)) => {
                    let line = render::render(&state);
                    if line != last_line {
                        println!("{line}");
                        last_line = line;
                    }
                }
                Ok(SessionEvent::Progress(_)) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn drive(mut session: Session, args: &Args) -> Result<Outcome> {
    let outcome = drive_session(&mut session, args).await;
    session.teardown();
    outcome
}

async fn drive_session(session: &mut Session, args: &Args) -> Result<Outcome> {
    match session.presentation() {
        PresentationState::EmptyInput => return Ok(Outcome::Finished),
        PresentationState::MalformedInput(error) => bail!("{}", error.message),
        _ => {}
    }

    if args.sign_out {
        session.sign_out().await?;
        return Ok(Outcome::Finished);
    }

    if matches!(session.presentation(), PresentationState::SignIn { .. }) {
        let email = match &args.email {
            Some(email) => email.clone(),
            None => match prompt("Email address: ").await? {
                Some(email) => email,
                None => return Ok(Outcome::Interrupted),
            },
        };
        let handle = session.begin_sign_in(&email).await?;
        let ctrl_c = tokio::spawn(async move {
            interrupt::ctrl_c().await;
            handle.cancel();
        });
        let signed_in = session.finish_sign_in().await.map(|_| ());
        ctrl_c.abort();
        signed_in?;
    }

    if !args.yes {
        let Some(answer) = prompt("Publish now? [y/N] ").await? else {
            return Ok(Outcome::Interrupted);
        };
        if !matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
            info!("publish declined");
            return Ok(Outcome::Finished);
        }
    }

    session.publish().await?;
    if args.copy {
        if let Some(share_url) = session.share_url() {
            copy_to_clipboard(share_url);
        }
    }
    Ok(Outcome::Finished)
}

fn copy_to_clipboard(text: &str) {
    match Clipboard::new().and_then(|mut clipboard| clipboard.set_text(text.to_string())) {
        Ok(()) => println!("Link copied to clipboard."),
        Err(err) => warn!(error = %err, "failed to copy link to clipboard"),
    }
}
