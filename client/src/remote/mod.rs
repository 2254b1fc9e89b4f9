//! Abstraction over the remote relational service.
//!
//! The orchestrator only talks to a [`RemoteAdapter`]. [`HttpRemote`] speaks
//! the JSON protocol of `tillsync-server`; [`InMemoryRemote`] applies the same
//! admission rules in process and supports fault injection for tests.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::InMemoryRemote;

use crate::error::Result;
use async_trait::async_trait;
use tillsync_engine::{
    PullQuery, PullResponse, PushRequest, PushResponse, SnapshotResponse, SyncLogEntry,
};

/// Bulk push/pull protocol of the remote store.
///
/// Implementations classify failures into [`SyncError`](crate::SyncError)
/// kinds; per-change rejections travel inside [`PushResponse`].
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Send a batch of changes. Idempotent per `change_id`.
    async fn push(&self, request: &PushRequest) -> Result<PushResponse>;

    /// Records written after `query.since`, ordered by server clock.
    async fn pull_since(&self, query: &PullQuery) -> Result<PullResponse>;

    /// Every record the remote holds, for reset-and-resync.
    async fn fetch_snapshot(&self) -> Result<SnapshotResponse>;

    /// Append audit entries to the remote sync log.
    async fn append_logs(&self, entries: &[SyncLogEntry]) -> Result<()>;
}
