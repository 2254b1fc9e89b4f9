//! Error taxonomy for the sync client.
//!
//! Every failure maps to an [`ErrorKind`]. Only
//! [`ErrorKind::TransientNetwork`] is retried automatically. Conflicts are
//! not errors: they go to the conflict resolver and show up in the status.

use serde::Serialize;
use std::fmt;

/// Classification of a sync failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, connection failures, 5xx, rate limiting
    TransientNetwork,
    /// Client and remote disagree on the schema; needs remote repair
    SchemaMismatch,
    /// Credentials missing or rejected; sync pauses
    AuthRequired,
    /// The remote refused a payload
    Validation,
    /// Local store or persistence failure
    Local,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransientNetwork => "transient-network",
            ErrorKind::SchemaMismatch => "schema-mismatch",
            ErrorKind::AuthRequired => "auth-required",
            ErrorKind::Validation => "validation",
            ErrorKind::Local => "local",
        };
        f.write_str(s)
    }
}

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Transient(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("sync is paused: {0}")]
    Paused(String),

    #[error(transparent)]
    Engine(#[from] tillsync_engine::Error),

    #[error("persistence error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transient(_) => ErrorKind::TransientNetwork,
            SyncError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            SyncError::AuthRequired(_) => ErrorKind::AuthRequired,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Engine(e) if e.is_validation() => ErrorKind::Validation,
            SyncError::Paused(_) | SyncError::Engine(_) | SyncError::Io(_) | SyncError::Serde(_) => {
                ErrorKind::Local
            }
        }
    }

    /// Whether the orchestrator may retry automatically.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientNetwork
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SyncError::SchemaMismatch(format!("unexpected response body: {e}"))
        } else {
            SyncError::Transient(e.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SyncError::Transient("request timed out".to_string())
    }
}

/// Result type alias for the client.
pub type Result<T> = std::result::Result<T, SyncError>;
