//! Observable, process-wide sync status.
//!
//! The publisher is a pure projection: the orchestrator and the connectivity
//! monitor write fields, everyone else reads or subscribes. Async consumers
//! can hold a [`watch::Receiver`]; UI layers register callbacks.

use crate::orchestrator::SyncPhase;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Snapshot of the sync status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub phase: SyncPhase,
    /// Live change queue entries
    pub pending_changes: usize,
    /// Entries that exhausted their retries or were rejected
    pub failed_changes: usize,
    /// Outstanding conflicts awaiting resolution
    pub conflicts: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub auth_paused: bool,
    pub schema_error: bool,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            is_online: true,
            is_syncing: false,
            phase: SyncPhase::Idle,
            pending_changes: 0,
            failed_changes: 0,
            conflicts: 0,
            last_sync_time: None,
            last_error: None,
            auth_paused: false,
            schema_error: false,
        }
    }
}

/// Handle returned by [`StatusPublisher::subscribe`].
pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

/// Publishes [`SyncStatus`] changes to subscribers.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct StatusPublisher {
    inner: Arc<Inner>,
}

struct Inner {
    sender: watch::Sender<SyncStatus>,
    subscribers: DashMap<SubscriptionId, Callback>,
    next_id: AtomicU64,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(SyncStatus::default());
        Self {
            inner: Arc::new(Inner {
                sender,
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current status.
    pub fn snapshot(&self) -> SyncStatus {
        self.inner.sender.borrow().clone()
    }

    /// A receiver that observes every published change.
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.inner.sender.subscribe()
    }

    /// Register a callback invoked after every change.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.insert(id, Arc::new(callback));
        tracing::debug!(subscription = id, "status subscriber registered");
        id
    }

    /// Remove a callback. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Apply `change` and notify subscribers if anything changed.
    pub fn update(&self, change: impl FnOnce(&mut SyncStatus)) {
        let changed = self.inner.sender.send_if_modified(|status| {
            let before = status.clone();
            change(status);
            *status != before
        });
        if changed {
            self.notify();
        }
    }

    pub fn set_online(&self, online: bool) {
        self.update(|s| s.is_online = online);
    }

    pub fn set_phase(&self, phase: SyncPhase) {
        self.update(|s| {
            s.phase = phase;
            s.is_syncing = phase.is_active();
        });
    }

    fn notify(&self) {
        let status = self.snapshot();
        // Collect first so callbacks may (un)subscribe without deadlocking the map.
        let callbacks: Vec<Callback> = self
            .inner
            .subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for callback in callbacks {
            callback(&status);
        }
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPublisher")
            .field("status", &self.snapshot())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
