//! # TillSync Client
//!
//! Device-side half of TillSync: wraps a [`tillsync_engine::LocalStore`],
//! persists it to disk, and keeps it converging with the remote service.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tillsync_client::{HttpRemote, SyncConfig, SyncOrchestrator};
//! use tillsync_engine::{EntityType, Schema};
//!
//! # async fn run() -> tillsync_client::Result<()> {
//! let config = SyncConfig {
//!     remote_url: "https://sync.example.com".into(),
//!     device_id: "till-1".into(),
//!     ..SyncConfig::default()
//! };
//! let remote = Arc::new(HttpRemote::from_config(&config)?);
//! let sync = SyncOrchestrator::open(config, Schema::business_default(), remote)?;
//!
//! // Writes are local and immediate
//! sync.local().create(EntityType::Customer, serde_json::json!({"name": "Ada"}))?;
//!
//! // Push, pull and reconcile
//! let outcome = sync.manual_sync().await;
//! println!("synced {:?} records", outcome.count);
//! # Ok(())
//! # }
//! ```
//!
//! ## Background sync
//!
//! [`SyncOrchestrator::spawn`] runs cycles on startup, on an interval, and
//! whenever [`SyncOrchestrator::set_online`] reports connectivity coming back.

pub mod backoff;
pub mod config;
pub mod error;
pub mod local;
pub mod orchestrator;
pub mod persist;
pub mod remote;
pub mod status;

pub use backoff::Backoff;
pub use config::{ConfigError, SyncConfig};
pub use error::{ErrorKind, Result, SyncError};
pub use local::LocalHandle;
pub use orchestrator::{CycleReport, OperationOutcome, SyncOrchestrator, SyncPhase, SyncTrigger};
pub use persist::SnapshotFile;
pub use remote::{HttpRemote, InMemoryRemote, RemoteAdapter};
pub use status::{StatusPublisher, SubscriptionId, SyncStatus};

/// Wall clock in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> tillsync_engine::Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
