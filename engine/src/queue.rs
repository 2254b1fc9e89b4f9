//! Change tracker - the queue of pending local mutations.
//!
//! Invariants:
//! - At most one live entry per `(entity_type, entity_id)`. A new mutation for
//!   an id that already has an entry collapses into it and keeps its FIFO
//!   position.
//! - Entries are drained in creation (FIFO) order and are only removed by an
//!   explicit [`ChangeTracker::ack`], so a failed push can be retried.
//! - Every collapse issues a fresh `change_id`; the remote uses it as the
//!   idempotency key, and `ack` only removes the revision that was confirmed.

use crate::{
    error::Result, ChangeOp, EntityId, EntityType, Error, LocalClock, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Local identifier of a queue entry. Monotonic, so it doubles as FIFO order.
pub type EntryId = u64;

/// How many superseded change ids an entry remembers.
const MAX_SUPERSEDED: usize = 8;

/// A pending local mutation awaiting transmission to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    /// Stable entry id (FIFO position)
    pub id: EntryId,
    /// Idempotency key of the current revision
    pub change_id: String,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub operation: ChangeOp,
    /// Snapshot of the payload at the last mutation; `None` for deletes
    pub payload: Option<serde_json::Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Failed transient attempts since the last mutation
    pub retry_count: u32,
    /// Backoff gate: not drained before this time
    pub next_attempt_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Retry budget exhausted or rejected as invalid; surfaced, not drained
    #[serde(default)]
    pub failed: bool,
    /// Blocked behind an outstanding conflict; not drained
    #[serde(default)]
    pub held: bool,
    /// Overwrite the remote regardless of its version (keep-local resolution)
    #[serde(default)]
    pub force: bool,
    /// Earlier revisions that were sent but never acknowledged
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<String>,
}

impl ChangeEntry {
    /// Whether the entry may be sent at `now`.
    pub fn is_drainable(&self, now: Timestamp) -> bool {
        !self.failed && !self.held && self.next_attempt_at <= now
    }

    fn key(&self) -> (EntityType, EntityId) {
        (self.entity_type, self.entity_id.clone())
    }
}

/// Outcome of [`ChangeTracker::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was created
    Queued(EntryId),
    /// The mutation collapsed into an existing entry
    Collapsed(EntryId),
}

impl EnqueueOutcome {
    pub fn entry_id(&self) -> EntryId {
        match self {
            EnqueueOutcome::Queued(id) | EnqueueOutcome::Collapsed(id) => *id,
        }
    }
}

/// Outcome of [`ChangeTracker::ack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The acknowledged revision was current; the entry is gone
    Removed,
    /// A newer mutation collapsed in while the push was in flight; the entry stays
    Superseded,
}

/// Append-only queue of pending local mutations.
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    clock: LocalClock,
    entries: BTreeMap<EntryId, ChangeEntry>,
    index: HashMap<(EntityType, EntityId), EntryId>,
}

impl ChangeTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tracker from persisted entries.
    pub fn from_entries(entries: impl IntoIterator<Item = ChangeEntry>) -> Self {
        let mut tracker = Self::new();
        for mut entry in entries {
            // Conflicts do not survive a restart; the next push re-detects them.
            entry.held = false;
            tracker.clock.merge(entry.id);
            tracker.index.insert(entry.key(), entry.id);
            tracker.entries.insert(entry.id, entry);
        }
        tracker
    }

    /// Record a mutation, collapsing into a live entry for the same entity.
    pub fn enqueue(
        &mut self,
        entity_type: EntityType,
        entity_id: &str,
        operation: ChangeOp,
        payload: Option<serde_json::Value>,
        now: Timestamp,
    ) -> Result<EnqueueOutcome> {
        let key = (entity_type, entity_id.to_string());
        let payload = if operation.carries_payload() { payload } else { None };

        if let Some(&entry_id) = self.index.get(&key) {
            let entry = self
                .entries
                .get_mut(&entry_id)
                .ok_or(Error::QueueEntryNotFound(entry_id))?;

            let collapsed = entry.operation.collapse(operation).ok_or_else(|| {
                if entry.operation == ChangeOp::Delete {
                    Error::OperationOnDeleted {
                        entity_type,
                        id: entity_id.to_string(),
                    }
                } else {
                    Error::EntityAlreadyExists {
                        entity_type,
                        id: entity_id.to_string(),
                    }
                }
            })?;

            let previous = std::mem::replace(&mut entry.change_id, new_change_id());
            entry.supersedes.push(previous);
            if entry.supersedes.len() > MAX_SUPERSEDED {
                entry.supersedes.remove(0);
            }
            entry.operation = collapsed;
            entry.payload = payload;
            entry.updated_at = now;
            entry.retry_count = 0;
            entry.next_attempt_at = 0;
            entry.last_error = None;
            entry.failed = false;

            return Ok(EnqueueOutcome::Collapsed(entry_id));
        }

        let entry_id = self.clock.tick();
        let entry = ChangeEntry {
            id: entry_id,
            change_id: new_change_id(),
            entity_type,
            entity_id: entity_id.to_string(),
            operation,
            payload,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            next_attempt_at: 0,
            last_error: None,
            failed: false,
            held: false,
            force: false,
            supersedes: Vec::new(),
        };
        self.index.insert(key, entry_id);
        self.entries.insert(entry_id, entry);

        Ok(EnqueueOutcome::Queued(entry_id))
    }

    /// Up to `batch_size` drainable entries in FIFO order, without removing them.
    pub fn drain(&self, batch_size: usize, now: Timestamp) -> Vec<ChangeEntry> {
        self.drain_after(None, batch_size, now)
    }

    /// Like [`drain`](Self::drain) but only entries positioned after `cursor`.
    pub fn drain_after(
        &self,
        cursor: Option<EntryId>,
        batch_size: usize,
        now: Timestamp,
    ) -> Vec<ChangeEntry> {
        let start = cursor.map_or(0, |c| c.saturating_add(1));
        self.entries
            .range(start..)
            .map(|(_, e)| e)
            .filter(|e| e.is_drainable(now))
            .take(batch_size)
            .cloned()
            .collect()
    }

    /// Remove an entry whose revision `change_id` was confirmed by the remote.
    pub fn ack(&mut self, entry_id: EntryId, change_id: &str) -> Result<AckOutcome> {
        let entry = self
            .entries
            .get_mut(&entry_id)
            .ok_or(Error::QueueEntryNotFound(entry_id))?;

        if entry.change_id != change_id {
            // The confirmed revision is now known to the remote; drop it from the chain.
            entry.supersedes.retain(|id| id != change_id);
            return Ok(AckOutcome::Superseded);
        }

        if let Some(entry) = self.entries.remove(&entry_id) {
            self.index.remove(&entry.key());
        }
        Ok(AckOutcome::Removed)
    }

    /// Count a failed transient attempt and gate the next one until `retry_at`.
    ///
    /// Returns the new retry count.
    pub fn requeue(
        &mut self,
        entry_id: EntryId,
        error: impl Into<String>,
        retry_at: Timestamp,
    ) -> Result<u32> {
        let entry = self.get_mut(entry_id)?;
        entry.retry_count += 1;
        entry.next_attempt_at = retry_at;
        entry.last_error = Some(error.into());
        Ok(entry.retry_count)
    }

    /// Stop draining an entry until a new mutation or [`retry_failed`](Self::retry_failed).
    pub fn mark_failed(&mut self, entry_id: EntryId, error: impl Into<String>) -> Result<()> {
        let entry = self.get_mut(entry_id)?;
        entry.failed = true;
        entry.last_error = Some(error.into());
        Ok(())
    }

    /// Block an entry behind an outstanding conflict.
    pub fn hold(&mut self, entry_id: EntryId) -> Result<()> {
        self.get_mut(entry_id)?.held = true;
        Ok(())
    }

    /// Unblock a held entry. With `force`, the next push overwrites the remote.
    pub fn release(&mut self, entry_id: EntryId, force: bool) -> Result<()> {
        let entry = self.get_mut(entry_id)?;
        entry.held = false;
        entry.force = force;
        entry.next_attempt_at = 0;
        Ok(())
    }

    /// Drop the live entry for an entity without pushing it.
    pub fn discard(&mut self, entity_type: EntityType, entity_id: &str) -> Option<ChangeEntry> {
        let entry_id = self.index.remove(&(entity_type, entity_id.to_string()))?;
        self.entries.remove(&entry_id)
    }

    /// Re-arm every failed entry with a fresh retry budget.
    pub fn retry_failed(&mut self) -> usize {
        let mut count = 0;
        for entry in self.entries.values_mut().filter(|e| e.failed) {
            entry.failed = false;
            entry.retry_count = 0;
            entry.next_attempt_at = 0;
            count += 1;
        }
        count
    }

    /// Remove everything (used by full reset).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Get an entry by id.
    pub fn get(&self, entry_id: EntryId) -> Option<&ChangeEntry> {
        self.entries.get(&entry_id)
    }

    /// The live entry for an entity, if any.
    pub fn find(&self, entity_type: EntityType, entity_id: &str) -> Option<&ChangeEntry> {
        self.index
            .get(&(entity_type, entity_id.to_string()))
            .and_then(|id| self.entries.get(id))
    }

    /// All entries in FIFO order.
    pub fn iter(&self) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.values()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries surfaced as failed.
    pub fn failed_count(&self) -> usize {
        self.entries.values().filter(|e| e.failed).count()
    }

    /// Highest entry id handed out so far.
    pub fn last_entry_id(&self) -> EntryId {
        self.clock.current()
    }

    fn get_mut(&mut self, entry_id: EntryId) -> Result<&mut ChangeEntry> {
        self.entries
            .get_mut(&entry_id)
            .ok_or(Error::QueueEntryNotFound(entry_id))
    }
}

fn new_change_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enqueue(tracker: &mut ChangeTracker, id: &str, op: ChangeOp, name: &str) -> EnqueueOutcome {
        tracker
            .enqueue(EntityType::Customer, id, op, Some(json!({"name": name})), 1000)
            .unwrap()
    }

    #[test]
    fn three_edits_collapse_into_one_entry() {
        let mut tracker = ChangeTracker::new();
        let first = enqueue(&mut tracker, "c-1", ChangeOp::Create, "A");
        enqueue(&mut tracker, "c-1", ChangeOp::Update, "B");
        let last = enqueue(&mut tracker, "c-1", ChangeOp::Update, "C");

        assert_eq!(tracker.len(), 1);
        assert!(matches!(first, EnqueueOutcome::Queued(_)));
        assert!(matches!(last, EnqueueOutcome::Collapsed(_)));
        assert_eq!(first.entry_id(), last.entry_id());

        let entry = tracker.find(EntityType::Customer, "c-1").unwrap();
        assert_eq!(entry.operation, ChangeOp::Create);
        assert_eq!(entry.payload, Some(json!({"name": "C"})));
        assert_eq!(entry.supersedes.len(), 2);
    }

    #[test]
    fn delete_supersedes_pending_update() {
        let mut tracker = ChangeTracker::new();
        enqueue(&mut tracker, "c-1", ChangeOp::Update, "A");
        enqueue(&mut tracker, "c-1", ChangeOp::Delete, "ignored");

        let entry = tracker.find(EntityType::Customer, "c-1").unwrap();
        assert_eq!(entry.operation, ChangeOp::Delete);
        assert_eq!(entry.payload, None);
    }

    #[test]
    fn update_after_delete_is_rejected() {
        let mut tracker = ChangeTracker::new();
        enqueue(&mut tracker, "c-1", ChangeOp::Delete, "x");
        let result = tracker.enqueue(EntityType::Customer, "c-1", ChangeOp::Update, None, 2000);
        assert!(matches!(result, Err(Error::OperationOnDeleted { .. })));
    }

    #[test]
    fn drain_is_fifo_and_non_destructive() {
        let mut tracker = ChangeTracker::new();
        enqueue(&mut tracker, "c-1", ChangeOp::Create, "A");
        enqueue(&mut tracker, "c-2", ChangeOp::Create, "B");
        enqueue(&mut tracker, "c-3", ChangeOp::Create, "C");
        // Collapsing keeps c-1 at the head.
        enqueue(&mut tracker, "c-1", ChangeOp::Update, "A2");

        let batch = tracker.drain(2, 1000);
        let ids: Vec<_> = batch.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["c-1", "c-2"]);
        assert_eq!(tracker.len(), 3);

        let rest = tracker.drain_after(Some(batch[1].id), 10, 1000);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].entity_id, "c-3");
    }

    #[test]
    fn ack_removes_only_the_confirmed_revision() {
        let mut tracker = ChangeTracker::new();
        let id = enqueue(&mut tracker, "c-1", ChangeOp::Create, "A").entry_id();
        let sent = tracker.get(id).unwrap().change_id.clone();

        // A new edit lands while the push is in flight.
        enqueue(&mut tracker, "c-1", ChangeOp::Update, "B");
        assert_eq!(tracker.ack(id, &sent).unwrap(), AckOutcome::Superseded);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get(id).unwrap().supersedes.is_empty());

        let current = tracker.get(id).unwrap().change_id.clone();
        assert_eq!(tracker.ack(id, &current).unwrap(), AckOutcome::Removed);
        assert!(tracker.is_empty());
        assert!(tracker.find(EntityType::Customer, "c-1").is_none());
    }

    #[test]
    fn requeue_gates_until_retry_time() {
        let mut tracker = ChangeTracker::new();
        let id = enqueue(&mut tracker, "c-1", ChangeOp::Create, "A").entry_id();

        assert_eq!(tracker.requeue(id, "timeout", 5000).unwrap(), 1);
        assert!(tracker.drain(10, 4999).is_empty());
        assert_eq!(tracker.drain(10, 5000).len(), 1);
        assert_eq!(tracker.get(id).unwrap().last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn failed_and_held_entries_are_not_drained() {
        let mut tracker = ChangeTracker::new();
        let a = enqueue(&mut tracker, "c-1", ChangeOp::Create, "A").entry_id();
        let b = enqueue(&mut tracker, "c-2", ChangeOp::Create, "B").entry_id();

        tracker.mark_failed(a, "invalid").unwrap();
        tracker.hold(b).unwrap();
        assert!(tracker.drain(10, 1000).is_empty());
        assert_eq!(tracker.failed_count(), 1);

        tracker.release(b, true).unwrap();
        let batch = tracker.drain(10, 1000);
        assert_eq!(batch.len(), 1);
        assert!(batch[0].force);

        assert_eq!(tracker.retry_failed(), 1);
        assert_eq!(tracker.drain(10, 1000).len(), 2);
    }

    #[test]
    fn new_mutation_revives_failed_entry() {
        let mut tracker = ChangeTracker::new();
        let id = enqueue(&mut tracker, "c-1", ChangeOp::Create, "A").entry_id();
        tracker.requeue(id, "timeout", 0).unwrap();
        tracker.mark_failed(id, "exhausted").unwrap();

        enqueue(&mut tracker, "c-1", ChangeOp::Update, "B");
        let entry = tracker.get(id).unwrap();
        assert!(!entry.failed);
        assert_eq!(entry.retry_count, 0);
    }

    #[test]
    fn rebuild_from_entries_continues_sequence() {
        let mut tracker = ChangeTracker::new();
        enqueue(&mut tracker, "c-1", ChangeOp::Create, "A");
        enqueue(&mut tracker, "c-2", ChangeOp::Create, "B");

        let entries: Vec<_> = tracker.iter().cloned().collect();
        let mut restored = ChangeTracker::from_entries(entries);
        assert_eq!(restored.len(), 2);
        assert!(restored.find(EntityType::Customer, "c-2").is_some());

        let next = enqueue(&mut restored, "c-3", ChangeOp::Create, "C");
        assert_eq!(next.entry_id(), 3);
    }

    #[test]
    fn discard_removes_entry_and_index() {
        let mut tracker = ChangeTracker::new();
        enqueue(&mut tracker, "c-1", ChangeOp::Create, "A");
        assert!(tracker.discard(EntityType::Customer, "c-1").is_some());
        assert!(tracker.is_empty());
        assert!(tracker.discard(EntityType::Customer, "c-1").is_none());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_one_live_entry_per_entity(edits in proptest::collection::vec((0usize..4, 0u32..100), 1..40)) {
                let mut tracker = ChangeTracker::new();
                let mut last_payload: HashMap<usize, u32> = HashMap::new();

                for (entity, value) in &edits {
                    let id = format!("c-{entity}");
                    let op = if last_payload.contains_key(entity) { ChangeOp::Update } else { ChangeOp::Create };
                    tracker
                        .enqueue(EntityType::Customer, &id, op, Some(json!({"name": value.to_string()})), 1000)
                        .unwrap();
                    last_payload.insert(*entity, *value);
                }

                prop_assert_eq!(tracker.len(), last_payload.len());
                for (entity, value) in &last_payload {
                    let entry = tracker.find(EntityType::Customer, &format!("c-{entity}")).unwrap();
                    prop_assert_eq!(entry.payload.clone(), Some(json!({"name": value.to_string()})));
                }
            }
        }
    }
}
