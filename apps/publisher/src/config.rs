use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Context, Result};
use client_core::{RegistrationFailurePolicy, DEFAULT_GATEWAY};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "publisher.toml";
const ENV_PREFIX: &str = "PUBLISHER__";
/// Local development services; real deployments set both URLs explicitly.
pub const DEFAULT_ACCESS_API_URL: &str = "http://127.0.0.1:8787";
pub const DEFAULT_UPLOAD_API_URL: &str = "http://127.0.0.1:8788";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub access_api_url: String,
    pub upload_api_url: String,
    pub gateway_template: String,
    pub database_url: String,
    pub chunk_size_bytes: usize,
    pub verification_poll_interval_ms: u64,
    pub verification_timeout_secs: u64,
    pub registration_failure_policy: RegistrationFailurePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            access_api_url: DEFAULT_ACCESS_API_URL.into(),
            upload_api_url: DEFAULT_UPLOAD_API_URL.into(),
            gateway_template: DEFAULT_GATEWAY.into(),
            database_url: default_database_url(),
            chunk_size_bytes: 8 * 1024 * 1024,
            verification_poll_interval_ms: 2_000,
            verification_timeout_secs: 15 * 60,
            registration_failure_policy: RegistrationFailurePolicy::Block,
        }
    }
}

impl Settings {
    pub fn verification_poll_interval(&self) -> Duration {
        Duration::from_millis(self.verification_poll_interval_ms.max(1))
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs.max(1))
    }
}

/// Defaults, then the TOML file, then `PUBLISHER__*` environment variables.
///
/// An explicitly named file must exist; the default `publisher.toml` is optional.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let mut settings = match path {
        Some(path) => read_settings_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            read_settings_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => Settings::default(),
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;
    settings.database_url = normalize_database_url(&settings.database_url);
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<Settings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config file '{}'", path.display()))
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| anyhow!("invalid value '{raw}' for {ENV_PREFIX}{key}: {err}"))
}

pub fn apply_env_overrides(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let var = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));

    if let Some(v) = var("ACCESS_API_URL") {
        settings.access_api_url = v;
    }
    if let Some(v) = var("UPLOAD_API_URL") {
        settings.upload_api_url = v;
    }
    if let Some(v) = var("GATEWAY_TEMPLATE") {
        settings.gateway_template = v;
    }
    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("CHUNK_SIZE_BYTES") {
        settings.chunk_size_bytes = parse_env("CHUNK_SIZE_BYTES", &v)?;
    }
    if let Some(v) = var("VERIFICATION_POLL_INTERVAL_MS") {
        settings.verification_poll_interval_ms = parse_env("VERIFICATION_POLL_INTERVAL_MS", &v)?;
    }
    if let Some(v) = var("VERIFICATION_TIMEOUT_SECS") {
        settings.verification_timeout_secs = parse_env("VERIFICATION_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = var("REGISTRATION_FAILURE_POLICY") {
        settings.registration_failure_policy = parse_env("REGISTRATION_FAILURE_POLICY", &v)?;
    }

    Ok(())
}

fn default_database_url() -> String {
    let path = dirs::data_local_dir()
        .map(|dir| dir.join("gallery_publisher").join("identities.sqlite3"))
        .unwrap_or_else(|| Path::new("./data/identities.sqlite3").to_path_buf());
    normalize_database_url(&path.to_string_lossy())
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return default_database_url();
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url)
        .replace('\\', "/");
    format!("sqlite://{path}")
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
