//! Configuration loading and validation.
//!
//! Configuration comes from `quayside.toml` with serde field defaults, then
//! `QUAYSIDE_*` environment variables override individual knobs. Every knob
//! is optional; a missing config file yields the full default set.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Filesystem layout.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Upstream backend endpoint and timeout.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Session acquisition retry policy.
    #[serde(default)]
    pub session: SessionConfig,

    /// Pipeline execution knobs.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Scheduler defaults.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Admin HTTP surface.
    #[serde(default)]
    pub server: ServerConfig,

    /// Relational store location.
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Filesystem layout configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root under which per-tenant trees live.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

/// Upstream backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the browser-automation backend.
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,

    /// Uniform upper-bound timeout for every upstream call, in seconds.
    /// Long by default; browser flows routinely take minutes.
    #[serde(default = "default_upstream_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl UpstreamConfig {
    /// Timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            timeout_seconds: default_upstream_timeout_seconds(),
        }
    }
}

/// Session acquisition retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Total acquisition attempts when the upstream answers 401.
    #[serde(default = "default_acquire_max_retries")]
    pub acquire_max_retries: u32,

    /// Delay between acquisition attempts, in minutes.
    #[serde(default = "default_acquire_retry_minutes")]
    pub acquire_retry_minutes: u64,
}

impl SessionConfig {
    /// Retry delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.acquire_retry_minutes.saturating_mul(60))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            acquire_max_retries: default_acquire_max_retries(),
            acquire_retry_minutes: default_acquire_retry_minutes(),
        }
    }
}

/// Pipeline execution knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// How many stage-4 items between flushes of the filtered spreadsheet.
    #[serde(default = "default_stage4_checkpoint_every")]
    pub stage4_checkpoint_every: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage4_checkpoint_every: default_stage4_checkpoint_every(),
        }
    }
}

/// Scheduler defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Tick frequency for tenants that never set one, in minutes.
    #[serde(default = "default_frequency_minutes")]
    pub default_frequency_minutes: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_frequency_minutes: default_frequency_minutes(),
        }
    }
}

/// Admin HTTP surface configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the admin API.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Shared secret for admin operations, sent as `x-admin-secret`.
    #[serde(default)]
    pub admin_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_secret: None,
        }
    }
}

/// Relational store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite DSN. Defaults to `quayside.db` under the storage root.
    #[serde(default)]
    pub url: Option<String>,
}

impl Config {
    /// Resolve the database URL, defaulting under the storage root.
    pub fn database_url(&self) -> String {
        match &self.database.url {
            Some(url) => url.clone(),
            None => format!(
                "sqlite://{}?mode=rwc",
                self.storage.root.join("quayside.db").display()
            ),
        }
    }
}

// Default value functions for serde

fn default_storage_root() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".quayside"))
        .unwrap_or_else(|| PathBuf::from(".quayside"))
}
fn default_upstream_base_url() -> String {
    "http://localhost:5000/".to_owned()
}
fn default_upstream_timeout_seconds() -> u64 {
    2400
}
fn default_acquire_max_retries() -> u32 {
    3
}
fn default_acquire_retry_minutes() -> u64 {
    10
}
fn default_stage4_checkpoint_every() -> usize {
    5
}
fn default_frequency_minutes() -> u32 {
    60
}
fn default_listen_addr() -> String {
    "127.0.0.1:8088".to_owned()
}

/// Load configuration from a TOML file, then apply environment overrides.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed, or if
/// a `QUAYSIDE_*` override fails to parse.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
        toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Apply `QUAYSIDE_*` environment overrides onto a parsed config.
///
/// # Errors
///
/// Returns an error when a numeric override does not parse.
pub fn apply_env_overrides(config: &mut Config) -> anyhow::Result<()> {
    if let Ok(root) = std::env::var("QUAYSIDE_STORAGE_ROOT") {
        config.storage.root = PathBuf::from(root);
    }
    if let Ok(url) = std::env::var("QUAYSIDE_UPSTREAM_BASE_URL") {
        config.upstream.base_url = url;
    }
    if let Ok(v) = std::env::var("QUAYSIDE_UPSTREAM_TIMEOUT_SECONDS") {
        config.upstream.timeout_seconds = parse_env("QUAYSIDE_UPSTREAM_TIMEOUT_SECONDS", &v)?;
    }
    if let Ok(v) = std::env::var("QUAYSIDE_SESSION_ACQUIRE_MAX_RETRIES") {
        config.session.acquire_max_retries = parse_env("QUAYSIDE_SESSION_ACQUIRE_MAX_RETRIES", &v)?;
    }
    if let Ok(v) = std::env::var("QUAYSIDE_SESSION_ACQUIRE_RETRY_MINUTES") {
        config.session.acquire_retry_minutes =
            parse_env("QUAYSIDE_SESSION_ACQUIRE_RETRY_MINUTES", &v)?;
    }
    if let Ok(v) = std::env::var("QUAYSIDE_STAGE4_CHECKPOINT_EVERY") {
        config.pipeline.stage4_checkpoint_every =
            parse_env("QUAYSIDE_STAGE4_CHECKPOINT_EVERY", &v)?;
    }
    if let Ok(v) = std::env::var("QUAYSIDE_SCHEDULER_DEFAULT_FREQUENCY_MINUTES") {
        config.scheduler.default_frequency_minutes =
            parse_env("QUAYSIDE_SCHEDULER_DEFAULT_FREQUENCY_MINUTES", &v)?;
    }
    if let Ok(secret) = std::env::var("QUAYSIDE_ADMIN_SECRET") {
        config.server.admin_secret = Some(secret);
    }
    if let Ok(url) = std::env::var("QUAYSIDE_DATABASE_URL") {
        config.database.url = Some(url);
    }
    if let Ok(addr) = std::env::var("QUAYSIDE_LISTEN_ADDR") {
        config.server.listen_addr = addr;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {key}={value}: {e}"))
}
