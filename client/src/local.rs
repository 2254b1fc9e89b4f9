//! Application-facing handle to the local store.
//!
//! Writes never touch the network and never wait for a sync cycle: the
//! shared state lock is only held for the duration of a single record write.

use crate::error::Result;
use crate::persist::SnapshotFile;
use crate::status::StatusPublisher;
use std::sync::{Arc, Mutex, MutexGuard};
use tillsync_engine::{
    ChangeOp, ConflictResolver, EntityRecord, EntityType, LocalStore, StoreSnapshot, WriteResult,
};

/// State shared by the application and the sync task.
#[derive(Debug)]
pub(crate) struct SyncState {
    pub(crate) store: LocalStore,
    pub(crate) conflicts: ConflictResolver,
    /// Bumped on every export; orders snapshot saves.
    generation: u64,
}

impl SyncState {
    pub(crate) fn new(store: LocalStore, conflicts: ConflictResolver) -> Self {
        Self {
            store,
            conflicts,
            generation: 0,
        }
    }

    /// Export the store tagged with its save generation.
    pub(crate) fn export(&mut self) -> (u64, StoreSnapshot) {
        self.generation += 1;
        (self.generation, self.store.export_state())
    }
}

pub(crate) type SharedState = Arc<Mutex<SyncState>>;

/// Lock the shared state, recovering from a poisoned lock.
pub(crate) fn lock(state: &Mutex<SyncState>) -> MutexGuard<'_, SyncState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Queue and conflict counters.
///
/// Read while the state lock is held and published after it is released:
/// subscriber callbacks are free to call back into a [`LocalHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Counts {
    pending: usize,
    failed: usize,
    conflicts: usize,
}

impl Counts {
    pub(crate) fn of(state: &SyncState) -> Self {
        Self {
            pending: state.store.pending_count(),
            failed: state.store.tracker().failed_count(),
            conflicts: state.conflicts.len(),
        }
    }

    pub(crate) fn publish(self, status: &StatusPublisher) {
        status.update(|s| {
            s.pending_changes = self.pending;
            s.failed_changes = self.failed;
            s.conflicts = self.conflicts;
        });
    }
}

/// Save an exported snapshot, surfacing failures on the status.
pub(crate) fn save_snapshot(
    file: &SnapshotFile,
    status: &StatusPublisher,
    (generation, snapshot): (u64, StoreSnapshot),
) {
    match file.save_generation(generation, &snapshot) {
        Ok(true) => {}
        Ok(false) => tracing::trace!(generation, "skipped stale snapshot"),
        Err(e) => {
            // The state stands in memory; surface the durability problem.
            tracing::error!(error = %e, "failed to persist local store");
            status.update(|s| s.last_error = Some(e.to_string()));
        }
    }
}

/// Cheap, cloneable handle for application code.
#[derive(Debug, Clone)]
pub struct LocalHandle {
    state: SharedState,
    status: StatusPublisher,
    persistence: Option<SnapshotFile>,
}

impl LocalHandle {
    pub(crate) fn new(
        state: SharedState,
        status: StatusPublisher,
        persistence: Option<SnapshotFile>,
    ) -> Self {
        Self {
            state,
            status,
            persistence,
        }
    }

    /// Apply a mutation locally and queue it for push.
    pub fn write(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: Option<serde_json::Value>,
        op: ChangeOp,
    ) -> Result<WriteResult> {
        let now = crate::now_ms();
        let (result, counts, exported) = {
            let mut state = lock(&self.state);
            let result = state.store.write(entity_type, id, payload, op, now)?;
            let exported = self.persistence.as_ref().map(|_| state.export());
            (result, Counts::of(&state), exported)
        };
        counts.publish(&self.status);

        if let (Some(file), Some(exported)) = (&self.persistence, exported) {
            save_snapshot(file, &self.status, exported);
        }

        tracing::debug!(
            entity_type = %entity_type,
            entity_id = %id,
            operation = %op,
            "local write queued"
        );
        Ok(result)
    }

    /// Create a record with a generated id.
    pub fn create(&self, entity_type: EntityType, payload: serde_json::Value) -> Result<WriteResult> {
        let id = tillsync_engine::new_entity_id();
        self.write(entity_type, &id, Some(payload), ChangeOp::Create)
    }

    pub fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: serde_json::Value,
    ) -> Result<WriteResult> {
        self.write(entity_type, id, Some(payload), ChangeOp::Update)
    }

    pub fn delete(&self, entity_type: EntityType, id: &str) -> Result<WriteResult> {
        self.write(entity_type, id, None, ChangeOp::Delete)
    }

    /// Current local copy of an active record.
    pub fn read(&self, entity_type: EntityType, id: &str) -> Option<EntityRecord> {
        lock(&self.state).store.read(entity_type, id).cloned()
    }

    /// Active records of one type, oldest first.
    pub fn list(&self, entity_type: EntityType) -> Vec<EntityRecord> {
        lock(&self.state)
            .store
            .list(entity_type)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).store.pending_count()
    }
}
