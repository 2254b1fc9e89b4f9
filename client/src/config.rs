//! Configuration for the sync client.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tillsync_engine::ConflictPolicy;

/// Sync client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the remote service (e.g. `https://sync.example.com`)
    pub remote_url: String,
    /// Stable identifier of this device
    pub device_id: String,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
    /// Where the local snapshot is persisted; `None` keeps state in memory
    pub state_path: Option<PathBuf>,
    /// Interval between background cycles; `None` disables the timer
    pub sync_interval: Option<Duration>,
    pub sync_on_startup: bool,
    pub sync_on_reconnect: bool,
    pub push_batch_size: usize,
    pub pull_page_size: u32,
    /// Attempts per change before it is marked failed
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Bound on every remote call
    pub request_timeout: Duration,
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: "http://localhost:3000".to_string(),
            device_id: "local-device".to_string(),
            auth_token: None,
            state_path: None,
            sync_interval: Some(Duration::from_secs(60)),
            sync_on_startup: true,
            sync_on_reconnect: true,
            push_batch_size: 50,
            pull_page_size: 200,
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            conflict_policy: ConflictPolicy::Manual,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `TILLSYNC_*` environment variables.
    ///
    /// Unset variables fall back to [`SyncConfig::default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let remote_url = env::var("TILLSYNC_REMOTE_URL").unwrap_or(defaults.remote_url);
        if !(remote_url.starts_with("http://") || remote_url.starts_with("https://")) {
            return Err(ConfigError::InvalidRemoteUrl(remote_url));
        }

        let device_id = env::var("TILLSYNC_DEVICE_ID").unwrap_or(defaults.device_id);
        if device_id.trim().is_empty() {
            return Err(ConfigError::EmptyDeviceId);
        }

        let interval_secs: u64 = parse_var(
            "TILLSYNC_SYNC_INTERVAL_SECS",
            defaults.sync_interval.map_or(0, |d| d.as_secs()),
        )?;

        let conflict_policy = match env::var("TILLSYNC_CONFLICT_POLICY") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue("TILLSYNC_CONFLICT_POLICY"))?,
            Err(_) => defaults.conflict_policy,
        };

        let config = Self {
            remote_url: remote_url.trim_end_matches('/').to_string(),
            device_id,
            auth_token: env::var("TILLSYNC_AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            state_path: env::var("TILLSYNC_STATE_PATH").ok().map(PathBuf::from),
            sync_interval: (interval_secs > 0).then(|| Duration::from_secs(interval_secs)),
            sync_on_startup: parse_var("TILLSYNC_SYNC_ON_STARTUP", defaults.sync_on_startup)?,
            sync_on_reconnect: parse_var("TILLSYNC_SYNC_ON_RECONNECT", defaults.sync_on_reconnect)?,
            push_batch_size: parse_var("TILLSYNC_PUSH_BATCH_SIZE", defaults.push_batch_size)?,
            pull_page_size: parse_var("TILLSYNC_PULL_PAGE_SIZE", defaults.pull_page_size)?,
            max_attempts: parse_var("TILLSYNC_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_base: Duration::from_millis(parse_var(
                "TILLSYNC_BACKOFF_BASE_MS",
                defaults.backoff_base.as_millis() as u64,
            )?),
            backoff_max: Duration::from_millis(parse_var(
                "TILLSYNC_BACKOFF_MAX_MS",
                defaults.backoff_max.as_millis() as u64,
            )?),
            request_timeout: Duration::from_secs(parse_var(
                "TILLSYNC_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            conflict_policy,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.push_batch_size == 0 {
            return Err(ConfigError::InvalidValue("TILLSYNC_PUSH_BATCH_SIZE"));
        }
        if self.pull_page_size == 0 {
            return Err(ConfigError::InvalidValue("TILLSYNC_PULL_PAGE_SIZE"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue("TILLSYNC_MAX_ATTEMPTS"));
        }
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::InvalidValue("TILLSYNC_BACKOFF_BASE_MS"));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TILLSYNC_REMOTE_URL must include http:// or https://, got '{0}'")]
    InvalidRemoteUrl(String),

    #[error("TILLSYNC_DEVICE_ID must not be empty")]
    EmptyDeviceId,

    #[error("Invalid {0} value")]
    InvalidValue(&'static str),
}
