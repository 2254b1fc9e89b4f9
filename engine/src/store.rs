//! Local store - durable, per-entity record storage usable with no network.
//!
//! Every application write goes through [`LocalStore::write`], which applies
//! the mutation, clears `is_synced`, and forwards the mutation to the
//! [`ChangeTracker`]. The `apply_remote`/`confirm_push`/`replace_all` family is
//! reserved for the sync orchestrator.

use crate::{
    error::Result,
    protocol::{AcceptedChange, RemoteRecord},
    queue::{ChangeTracker, EnqueueOutcome},
    snapshot::StoreSnapshot,
    ChangeOp, DeviceId, EntityId, EntityRecord, EntityType, Error, Schema, ServerClock,
    SyncLog, Timestamp, Version,
};
use std::collections::{BTreeMap, HashMap};

/// All records of one entity type.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    records: HashMap<EntityId, EntityRecord>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a record by id (including tombstones).
    pub fn get(&self, id: &str) -> Option<&EntityRecord> {
        self.records.get(id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut EntityRecord> {
        self.records.get_mut(id)
    }

    fn insert(&mut self, record: EntityRecord) {
        self.records.insert(record.id.clone(), record);
    }

    /// Active (non-deleted) records.
    pub fn active_records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values().filter(|r| r.is_active())
    }

    /// All records including tombstones.
    pub fn all_records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    /// Count of active records.
    pub fn len(&self) -> usize {
        self.active_records().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a local write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub queued: EnqueueOutcome,
}

/// What happened when a pulled record was offered to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// The record was overwritten with the remote copy
    Applied,
    /// The remote copy is older than what this device already observed
    Stale,
    /// The record is already synced at this version (e.g. our own push echoed back)
    Current,
}

/// The main local store.
#[derive(Debug, Clone)]
pub struct LocalStore {
    schema: Schema,
    device_id: DeviceId,
    collections: BTreeMap<EntityType, Collection>,
    tracker: ChangeTracker,
    log: SyncLog,
    /// Server clock up to which pull is known complete
    watermark: Option<ServerClock>,
}

impl LocalStore {
    /// Create an empty store.
    pub fn new(schema: Schema, device_id: impl Into<DeviceId>) -> Self {
        let collections = EntityType::ALL
            .into_iter()
            .map(|ty| (ty, Collection::new()))
            .collect();

        Self {
            schema,
            device_id: device_id.into(),
            collections,
            tracker: ChangeTracker::new(),
            log: SyncLog::new(),
            watermark: None,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Apply a local mutation and queue it for push.
    ///
    /// Never needs the network. Validates the payload for create/update,
    /// rejects re-creating an existing id and touching a deleted record.
    pub fn write(
        &mut self,
        entity_type: EntityType,
        id: &str,
        payload: Option<serde_json::Value>,
        op: ChangeOp,
        now: Timestamp,
    ) -> Result<WriteResult> {
        let payload = match (op, payload) {
            (ChangeOp::Delete, _) => None,
            (_, Some(payload)) => {
                self.schema.validate_payload(entity_type, &payload)?;
                Some(payload)
            }
            (_, None) => {
                return Err(Error::InvalidPayload(format!("{op} requires a payload")));
            }
        };

        let collection = self.collection_mut(entity_type);
        match (op, collection.get_mut(id)) {
            (ChangeOp::Create, Some(_)) => {
                return Err(Error::EntityAlreadyExists {
                    entity_type,
                    id: id.to_string(),
                });
            }
            (ChangeOp::Create, None) => {
                let payload = payload.clone().unwrap_or(serde_json::Value::Null);
                collection.insert(EntityRecord::new_local(id, entity_type, payload, now));
            }
            (_, None) => {
                return Err(Error::EntityNotFound {
                    entity_type,
                    id: id.to_string(),
                });
            }
            (_, Some(record)) if record.deleted => {
                return Err(Error::OperationOnDeleted {
                    entity_type,
                    id: id.to_string(),
                });
            }
            (ChangeOp::Update, Some(record)) => {
                let payload = payload.clone().unwrap_or(serde_json::Value::Null);
                record.update_payload(payload, now);
            }
            (ChangeOp::Delete, Some(record)) => record.mark_deleted(now),
        }

        let queued = self.tracker.enqueue(entity_type, id, op, payload, now)?;

        Ok(WriteResult {
            entity_type,
            entity_id: id.to_string(),
            queued,
        })
    }

    /// Create a record with a freshly generated id.
    pub fn create(
        &mut self,
        entity_type: EntityType,
        payload: serde_json::Value,
        now: Timestamp,
    ) -> Result<WriteResult> {
        let id = crate::new_entity_id();
        self.write(entity_type, &id, Some(payload), ChangeOp::Create, now)
    }

    /// Replace the payload of an existing record.
    pub fn update(
        &mut self,
        entity_type: EntityType,
        id: &str,
        payload: serde_json::Value,
        now: Timestamp,
    ) -> Result<WriteResult> {
        self.write(entity_type, id, Some(payload), ChangeOp::Update, now)
    }

    /// Soft-delete a record.
    pub fn delete(&mut self, entity_type: EntityType, id: &str, now: Timestamp) -> Result<WriteResult> {
        self.write(entity_type, id, None, ChangeOp::Delete, now)
    }

    /// Overwrite a record with a caller-supplied merge payload and queue it
    /// as an update. Revives the record if either side had deleted it.
    pub(crate) fn write_merged(
        &mut self,
        entity_type: EntityType,
        id: &str,
        payload: serde_json::Value,
        now: Timestamp,
    ) -> Result<WriteResult> {
        self.schema.validate_payload(entity_type, &payload)?;

        let record = self
            .collection_mut(entity_type)
            .get_mut(id)
            .ok_or_else(|| Error::EntityNotFound {
                entity_type,
                id: id.to_string(),
            })?;
        record.deleted = false;
        record.update_payload(payload.clone(), now);

        let queued = self
            .tracker
            .enqueue(entity_type, id, ChangeOp::Update, Some(payload), now)?;

        Ok(WriteResult {
            entity_type,
            entity_id: id.to_string(),
            queued,
        })
    }

    /// Get an active record.
    pub fn read(&self, entity_type: EntityType, id: &str) -> Option<&EntityRecord> {
        self.read_including_deleted(entity_type, id)
            .filter(|r| r.is_active())
    }

    /// Get a record including tombstones.
    pub fn read_including_deleted(&self, entity_type: EntityType, id: &str) -> Option<&EntityRecord> {
        self.collections.get(&entity_type).and_then(|c| c.get(id))
    }

    /// Active records of one type, oldest first.
    pub fn list(&self, entity_type: EntityType) -> Vec<&EntityRecord> {
        let mut records: Vec<_> = self
            .collections
            .get(&entity_type)
            .map(|c| c.active_records().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Get a collection by type.
    pub fn collection(&self, entity_type: EntityType) -> Option<&Collection> {
        self.collections.get(&entity_type)
    }

    /// Version of `id` this device last observed on the remote.
    pub fn observed_version(&self, entity_type: EntityType, id: &str) -> Option<Version> {
        self.read_including_deleted(entity_type, id)
            .and_then(|r| r.observed_version())
    }

    /// Overwrite a record with the remote's copy and mark it synced.
    ///
    /// Sync-only: application code must go through [`write`](Self::write).
    /// Copies older than the version already observed are ignored.
    pub fn apply_remote(&mut self, remote: &RemoteRecord, now: Timestamp) -> RemoteApply {
        let collection = self.collection_mut(remote.entity_type);
        match collection.get_mut(&remote.id) {
            Some(record) if record.observed.is_some_and(|s| s.version > remote.version) => {
                RemoteApply::Stale
            }
            Some(record)
                if record.is_synced
                    && record.observed.is_some_and(|s| s.version == remote.version) =>
            {
                RemoteApply::Current
            }
            Some(record) => {
                record.apply_remote(remote, now);
                RemoteApply::Applied
            }
            None => {
                collection.insert(EntityRecord::from_remote(remote, now));
                RemoteApply::Applied
            }
        }
    }

    /// Record a push confirmation for the record behind `accepted`.
    ///
    /// `payload_confirmed` is false when a newer local edit is still queued.
    pub fn confirm_push(&mut self, accepted: &AcceptedChange, payload_confirmed: bool) {
        if let Some(record) = self
            .collection_mut(accepted.entity_type)
            .get_mut(&accepted.entity_id)
        {
            record.confirm_remote(accepted.stamp(), payload_confirmed);
        }
    }

    /// Record that the remote version in `remote` has been seen, without
    /// touching the local payload (used when a merge is queued).
    pub fn acknowledge_remote(&mut self, remote: &RemoteRecord) {
        if let Some(record) = self.collection_mut(remote.entity_type).get_mut(&remote.id) {
            record.confirm_remote(remote.stamp(), false);
        }
    }

    /// Throw away every record and pending change and load the remote's
    /// authoritative snapshot. Sync-only (full reset).
    pub fn replace_all(
        &mut self,
        records: &[RemoteRecord],
        server_clock: ServerClock,
        now: Timestamp,
    ) -> usize {
        self.tracker.clear();
        for collection in self.collections.values_mut() {
            collection.records.clear();
        }
        for remote in records {
            self.collection_mut(remote.entity_type)
                .insert(EntityRecord::from_remote(remote, now));
        }
        self.watermark = Some(server_clock);
        records.len()
    }

    /// The change tracker.
    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Mutable access to the change tracker (sync-only).
    pub fn tracker_mut(&mut self) -> &mut ChangeTracker {
        &mut self.tracker
    }

    /// The sync audit log.
    pub fn log(&self) -> &SyncLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut SyncLog {
        &mut self.log
    }

    /// Number of live change-queue entries.
    pub fn pending_count(&self) -> usize {
        self.tracker.len()
    }

    /// Records not yet confirmed by the remote, across all types.
    pub fn unsynced_count(&self) -> usize {
        self.collections
            .values()
            .flat_map(|c| c.all_records())
            .filter(|r| !r.is_synced)
            .count()
    }

    pub fn watermark(&self) -> Option<ServerClock> {
        self.watermark
    }

    pub fn set_watermark(&mut self, server_clock: ServerClock) {
        self.watermark = Some(server_clock);
    }

    fn collection_mut(&mut self, entity_type: EntityType) -> &mut Collection {
        self.collections.entry(entity_type).or_default()
    }

    /// Export the durable state as a snapshot.
    pub fn export_state(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new(self.schema.version, self.device_id.clone());
        snapshot.watermark = self.watermark;

        for collection in self.collections.values() {
            for record in collection.all_records() {
                snapshot.add_record(record.clone());
            }
        }
        snapshot.queue = self.tracker.iter().cloned().collect();
        snapshot.unflushed_log = self.log.unflushed().to_vec();

        snapshot
    }

    /// Replace the current state with a snapshot.
    ///
    /// The schema version and device id must match.
    pub fn import_state(&mut self, snapshot: StoreSnapshot) -> Result<()> {
        snapshot.validate(&self.schema)?;

        if snapshot.device_id != self.device_id {
            return Err(Error::InvalidSnapshot(format!(
                "device ID mismatch: expected '{}', got '{}'",
                self.device_id, snapshot.device_id
            )));
        }

        for collection in self.collections.values_mut() {
            collection.records.clear();
        }
        for records in snapshot.records.into_values() {
            for record in records.into_values() {
                self.collection_mut(record.entity_type).insert(record);
            }
        }

        self.tracker = ChangeTracker::from_entries(snapshot.queue);
        self.log = SyncLog::from_unflushed(snapshot.unflushed_log);
        self.watermark = snapshot.watermark;

        Ok(())
    }
}
