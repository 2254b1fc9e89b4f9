//! In-process remote with fault injection.

use super::RemoteAdapter;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tillsync_engine::{
    protocol::{admit, AcceptedChange, Admission, RemoteState},
    EntityId, EntityType, PullQuery, PullResponse, PushRequest, PushResponse, RejectReason,
    RejectedChange, RemoteRecord, Schema, ServerClock, SnapshotResponse, SyncLogEntry,
};

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<(EntityType, EntityId), RemoteState>,
    clock: ServerClock,
    logs: Vec<SyncLogEntry>,
}

impl State {
    fn write(
        &mut self,
        entity_type: EntityType,
        id: &str,
        payload: serde_json::Value,
        deleted: bool,
        version: u64,
        change_id: Option<String>,
    ) -> RemoteRecord {
        self.clock += 1;
        let record = RemoteRecord {
            entity_type,
            id: id.to_string(),
            payload,
            deleted,
            version,
            server_clock: self.clock,
        };
        self.records.insert(
            (entity_type, id.to_string()),
            RemoteState {
                record: record.clone(),
                last_change_id: change_id,
            },
        );
        record
    }
}

/// A remote store living in memory.
///
/// Applies the same admission rules as `tillsync-server`. Faults can be
/// switched on to exercise the orchestrator's error paths.
#[derive(Debug)]
pub struct InMemoryRemote {
    schema: Schema,
    state: Mutex<State>,
    offline: AtomicBool,
    auth_required: AtomicBool,
    /// Push calls that fail before touching state
    failing_pushes: AtomicU32,
    /// Push calls that apply but lose the response
    lost_responses: AtomicU32,
    /// Entities whose changes are always rejected as transient
    flaky_entities: Mutex<HashSet<EntityId>>,
    delay: Mutex<Option<Duration>>,
    push_calls: AtomicUsize,
    pull_calls: AtomicUsize,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::with_schema(Schema::business_default())
    }

    pub fn with_schema(schema: Schema) -> Self {
        Self {
            schema,
            state: Mutex::new(State::default()),
            offline: AtomicBool::new(false),
            auth_required: AtomicBool::new(false),
            failing_pushes: AtomicU32::new(0),
            lost_responses: AtomicU32::new(0),
            flaky_entities: Mutex::new(HashSet::new()),
            delay: Mutex::new(None),
            push_calls: AtomicUsize::new(0),
            pull_calls: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuse every call with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Refuse every call with an auth error.
    pub fn set_auth_required(&self, required: bool) {
        self.auth_required.store(required, Ordering::SeqCst);
    }

    /// Fail the next `count` push calls before applying anything.
    pub fn fail_next_pushes(&self, count: u32) {
        self.failing_pushes.store(count, Ordering::SeqCst);
    }

    /// Apply the next `count` push calls but report a timeout.
    pub fn lose_next_responses(&self, count: u32) {
        self.lost_responses.store(count, Ordering::SeqCst);
    }

    /// Reject every change for `id` with a transient reason.
    pub fn make_flaky(&self, id: impl Into<EntityId>) {
        self.flaky_entities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into());
    }

    /// Sleep this long inside every push and pull.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Simulate another device writing `id`.
    pub fn external_write(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: serde_json::Value,
    ) -> RemoteRecord {
        let mut state = self.state();
        let version = state
            .records
            .get(&(entity_type, id.to_string()))
            .map_or(1, |s| s.record.version + 1);
        state.write(entity_type, id, payload, false, version, None)
    }

    /// Simulate another device deleting `id`.
    pub fn external_delete(&self, entity_type: EntityType, id: &str) -> Option<RemoteRecord> {
        let mut state = self.state();
        let current = state.records.get(&(entity_type, id.to_string()))?.record.clone();
        Some(state.write(entity_type, id, current.payload, true, current.version + 1, None))
    }

    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<RemoteRecord> {
        self.state()
            .records
            .get(&(entity_type, id.to_string()))
            .map(|s| s.record.clone())
    }

    /// All records, tombstones included.
    pub fn records(&self) -> Vec<RemoteRecord> {
        self.state().records.values().map(|s| s.record.clone()).collect()
    }

    /// Active records.
    pub fn active_count(&self) -> usize {
        self.state()
            .records
            .values()
            .filter(|s| !s.record.deleted)
            .count()
    }

    pub fn logs(&self) -> Vec<SyncLogEntry> {
        self.state().logs.clone()
    }

    pub fn server_clock(&self) -> ServerClock {
        self.state().clock
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    async fn simulate_network(&self) -> Result<()> {
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Transient("connection refused".into()));
        }
        if self.auth_required.load(Ordering::SeqCst) {
            return Err(SyncError::AuthRequired("token expired (401)".into()));
        }
        Ok(())
    }
}

/// Decrement `counter` if positive; true if it was.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RemoteAdapter for InMemoryRemote {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await?;

        if take_one(&self.failing_pushes) {
            return Err(SyncError::Transient("connection reset by peer".into()));
        }
        if request.schema_version != self.schema.version {
            return Err(SyncError::SchemaMismatch(format!(
                "remote schema is version {}, client sent {}",
                self.schema.version, request.schema_version
            )));
        }

        let flaky = self
            .flaky_entities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut response = PushResponse::default();
        {
            let mut state = self.state();
            for change in &request.changes {
                if flaky.contains(&change.entity_id) {
                    response.rejected.push(RejectedChange {
                        entity_type: change.entity_type,
                        entity_id: change.entity_id.clone(),
                        change_id: change.change_id.clone(),
                        reason: RejectReason::Transient,
                        message: "storage temporarily unavailable".into(),
                        current: None,
                    });
                    continue;
                }

                let key = (change.entity_type, change.entity_id.clone());
                match admit(&self.schema, state.records.get(&key), change) {
                    Admission::Duplicate {
                        version,
                        server_clock,
                    } => response.accepted.push(AcceptedChange {
                        entity_type: change.entity_type,
                        entity_id: change.entity_id.clone(),
                        change_id: change.change_id.clone(),
                        version,
                        server_clock,
                    }),
                    Admission::Apply {
                        version,
                        payload,
                        deleted,
                    } => {
                        let record = state.write(
                            change.entity_type,
                            &change.entity_id,
                            payload,
                            deleted,
                            version,
                            Some(change.change_id.clone()),
                        );
                        response.accepted.push(AcceptedChange {
                            entity_type: change.entity_type,
                            entity_id: change.entity_id.clone(),
                            change_id: change.change_id.clone(),
                            version: record.version,
                            server_clock: record.server_clock,
                        });
                    }
                    Admission::Reject {
                        reason,
                        message,
                        current,
                    } => response.rejected.push(RejectedChange {
                        entity_type: change.entity_type,
                        entity_id: change.entity_id.clone(),
                        change_id: change.change_id.clone(),
                        reason,
                        message,
                        current,
                    }),
                }
            }
            response.server_clock = state.clock;
        }

        if take_one(&self.lost_responses) {
            return Err(SyncError::Transient("request timed out".into()));
        }
        Ok(response)
    }

    async fn pull_since(&self, query: &PullQuery) -> Result<PullResponse> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await?;

        let state = self.state();
        let since = query.since.unwrap_or(0);
        let limit = query.limit.map_or(usize::MAX, |l| l as usize);

        let mut records: Vec<RemoteRecord> = state
            .records
            .values()
            .filter(|s| s.record.server_clock > since)
            .map(|s| s.record.clone())
            .collect();
        records.sort_by_key(|r| r.server_clock);

        let has_more = records.len() > limit;
        records.truncate(limit);
        let server_clock = if has_more {
            records.last().map_or(since, |r| r.server_clock)
        } else {
            state.clock
        };

        Ok(PullResponse {
            records,
            server_clock,
            has_more,
        })
    }

    async fn fetch_snapshot(&self) -> Result<SnapshotResponse> {
        self.simulate_network().await?;
        let state = self.state();
        Ok(SnapshotResponse {
            records: state.records.values().map(|s| s.record.clone()).collect(),
            server_clock: state.clock,
        })
    }

    async fn append_logs(&self, entries: &[SyncLogEntry]) -> Result<()> {
        self.simulate_network().await?;
        self.state().logs.extend_from_slice(entries);
        Ok(())
    }
}
