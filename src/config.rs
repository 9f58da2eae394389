//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Keychain service under which the remote API token is stored.
pub const KEYRING_SERVICE: &str = "agent-lifeline";

/// Environment variable consulted when the keychain has no API token.
pub const API_TOKEN_ENV: &str = "LIFELINE_API_TOKEN";

/// Remote command interface settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RemoteConfig {
    /// Base URL of the backend command interface.
    pub base_url: String,
    /// Path probed to decide connectivity.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Bearer token (populated at runtime from keychain or env).
    #[serde(skip)]
    pub api_token: Option<String>,
}

fn default_health_path() -> String {
    "/health".into()
}

fn default_request_timeout() -> u64 {
    20
}

/// Process liveness probe settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LivenessConfig {
    /// Upper bound for one liveness probe; slower probes count as unknown.
    #[serde(default = "default_liveness_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_liveness_timeout_ms(),
        }
    }
}

fn default_liveness_timeout_ms() -> u64 {
    1500
}

/// Stale session scan configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ScanConfig {
    /// Scan once when the service starts.
    #[serde(default = "default_true")]
    pub on_startup: bool,
    /// Interval between periodic scans; 0 disables the periodic scanner.
    #[serde(default = "default_scan_interval")]
    pub interval_seconds: u64,
    /// Recover stale sessions without waiting for a user decision.
    #[serde(default)]
    pub auto_recover: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            on_startup: true,
            interval_seconds: default_scan_interval(),
            auto_recover: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_scan_interval() -> u64 {
    60
}

/// Outbox synchronisation configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    /// Upper bound for one remote dispatch.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_seconds: u64,
    /// Automatic retries granted to a transiently failed action.
    #[serde(default = "default_max_auto_retries")]
    pub max_auto_retries: u32,
    /// Delay before the first automatic retry.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_seconds: u64,
    /// Ceiling for the exponential retry delay.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: u64,
    /// Interval between connectivity probes; 0 disables probing.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_seconds: default_dispatch_timeout(),
            max_auto_retries: default_max_auto_retries(),
            initial_backoff_seconds: default_initial_backoff(),
            max_backoff_seconds: default_max_backoff(),
            probe_interval_seconds: default_probe_interval(),
        }
    }
}

fn default_dispatch_timeout() -> u64 {
    30
}

fn default_max_auto_retries() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    2
}

fn default_max_backoff() -> u64 {
    60
}

fn default_probe_interval() -> u64 {
    15
}

fn default_retention_days() -> u32 {
    30
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding the durable lock store and outbox database.
    pub data_dir: PathBuf,
    /// Days a recovery log entry is kept.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Remote command interface.
    pub remote: RemoteConfig,
    /// Liveness probe bounds.
    #[serde(default)]
    pub liveness: LivenessConfig,
    /// Stale session scanning.
    #[serde(default)]
    pub scan: ScanConfig,
    /// Outbox synchronisation.
    #[serde(default)]
    pub sync: SyncConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the remote API token from the OS keychain with env-var fallback.
    ///
    /// A missing token is not an error; requests are then sent unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the keychain task panics.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.remote.api_token = load_credential("api_token", API_TOKEN_ENV).await?;
        Ok(())
    }

    /// Derived path of the `SQLite` database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("lifeline.db")
    }

    /// Liveness probe timeout.
    #[must_use]
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness.timeout_ms)
    }

    /// Upper bound for one remote dispatch.
    #[must_use]
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.dispatch_timeout_seconds)
    }

    /// Periodic scan interval, `None` when disabled.
    #[must_use]
    pub fn scan_interval(&self) -> Option<Duration> {
        (self.scan.interval_seconds > 0).then(|| Duration::from_secs(self.scan.interval_seconds))
    }

    /// Connectivity probe interval, `None` when disabled.
    #[must_use]
    pub fn probe_interval(&self) -> Option<Duration> {
        (self.sync.probe_interval_seconds > 0)
            .then(|| Duration::from_secs(self.sync.probe_interval_seconds))
    }

    fn validate(&mut self) -> Result<()> {
        let base = self.remote.base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(AppError::Config("remote.base_url must not be empty".into()));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(AppError::Config(
                "remote.base_url must start with http:// or https://".into(),
            ));
        }
        self.remote.base_url = base.to_owned();

        if !self.remote.health_path.starts_with('/') {
            self.remote.health_path = format!("/{}", self.remote.health_path);
        }

        if self.liveness.timeout_ms == 0 {
            return Err(AppError::Config(
                "liveness.timeout_ms must be greater than zero".into(),
            ));
        }

        if self.sync.dispatch_timeout_seconds == 0 {
            return Err(AppError::Config(
                "sync.dispatch_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.sync.initial_backoff_seconds > self.sync.max_backoff_seconds {
            return Err(AppError::Config(
                "sync.initial_backoff_seconds must not exceed sync.max_backoff_seconds".into(),
            ));
        }

        if self.data_dir.as_os_str().is_empty() {
            return Err(AppError::Config("data_dir must not be empty".into()));
        }

        Ok(())
    }
}

/// Load a single optional credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<Option<String>> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(Some(value)),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            debug!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    match env::var(env_key) {
        Ok(value) if !value.is_empty() => Ok(Some(value)),
        _ => {
            warn!(
                key = keyring_key,
                env_key, "no credential found; remote requests will be unauthenticated"
            );
            Ok(None)
        }
    }
}
