//! Snapshot types for persisting and restoring store state.
//!
//! Snapshots are the bridge between the in-memory [`LocalStore`](crate::LocalStore)
//! and durable storage. They serialize deterministically so two exports of the
//! same state are byte-identical.

use crate::{
    error::Result, queue::ChangeEntry, DeviceId, EntityId, EntityRecord, EntityType, Error,
    Schema, SchemaVersion, ServerClock, SyncLogEntry,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the store state.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version at time of snapshot
    pub schema_version: SchemaVersion,
    pub device_id: DeviceId,
    /// Records by entity type, then by id (tombstones included)
    pub records: BTreeMap<EntityType, BTreeMap<EntityId, EntityRecord>>,
    /// Change queue in FIFO order
    pub queue: Vec<ChangeEntry>,
    /// Audit entries not yet shipped to the remote
    #[serde(default)]
    pub unflushed_log: Vec<SyncLogEntry>,
    #[serde(default)]
    pub watermark: Option<ServerClock>,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion, device_id: impl Into<DeviceId>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            device_id: device_id.into(),
            records: BTreeMap::new(),
            queue: Vec::new(),
            unflushed_log: Vec::new(),
            watermark: None,
        }
    }

    /// Add a record to the snapshot.
    pub fn add_record(&mut self, record: EntityRecord) {
        self.records
            .entry(record.entity_type)
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub fn get_record(&self, entity_type: EntityType, id: &str) -> Option<&EntityRecord> {
        self.records.get(&entity_type)?.get(id)
    }

    /// Count total records, tombstones included.
    pub fn record_count(&self) -> usize {
        self.records.values().map(|c| c.len()).sum()
    }

    /// Count active (non-deleted) records.
    pub fn active_record_count(&self) -> usize {
        self.records
            .values()
            .flat_map(|c| c.values())
            .filter(|r| r.is_active())
            .count()
    }

    /// Validate the snapshot against a schema.
    ///
    /// Only active records are checked; tombstones keep whatever payload
    /// they had when deleted.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        if self.schema_version != schema.version {
            return Err(Error::SchemaVersionMismatch {
                expected: schema.version,
                actual: self.schema_version,
            });
        }

        for (entity_type, records) in &self.records {
            for record in records.values() {
                if record.entity_type != *entity_type {
                    return Err(Error::InvalidSnapshot(format!(
                        "record {} filed under {} but has type {}",
                        record.id, entity_type, record.entity_type
                    )));
                }
                if record.is_active() {
                    schema.validate_payload(record.entity_type, &record.payload)?;
                }
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub device_id: DeviceId,
    pub record_count: usize,
    pub pending_count: usize,
    pub watermark: Option<ServerClock>,
}

impl From<&StoreSnapshot> for SnapshotMetadata {
    fn from(snapshot: &StoreSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            schema_version: snapshot.schema_version,
            device_id: snapshot.device_id.clone(),
            record_count: snapshot.record_count(),
            pending_count: snapshot.queue.len(),
            watermark: snapshot.watermark,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BUSINESS_SCHEMA_VERSION;
    use serde_json::json;

    fn customer(id: &str, name: serde_json::Value) -> EntityRecord {
        EntityRecord::new_local(id, EntityType::Customer, json!({ "name": name }), 1000)
    }

    #[test]
    fn create_empty_snapshot() {
        let snapshot = StoreSnapshot::new(1, "till-1");
        assert_eq!(snapshot.format_version, SNAPSHOT_FORMAT_VERSION);
        assert_eq!(snapshot.device_id, "till-1");
        assert_eq!(snapshot.record_count(), 0);
        assert_eq!(snapshot.watermark, None);
    }

    #[test]
    fn add_and_get_record() {
        let mut snapshot = StoreSnapshot::new(1, "till-1");
        snapshot.add_record(customer("c-1", json!("Ada")));

        assert_eq!(snapshot.record_count(), 1);
        let retrieved = snapshot.get_record(EntityType::Customer, "c-1").unwrap();
        assert_eq!(retrieved.payload, json!({"name": "Ada"}));
    }

    #[test]
    fn json_roundtrip() {
        let mut snapshot = StoreSnapshot::new(1, "till-1");
        snapshot.add_record(customer("c-1", json!("Ada")));
        snapshot.watermark = Some(42);

        let json = snapshot.to_json().unwrap();
        let restored = StoreSnapshot::from_json(&json).unwrap();

        assert_eq!(snapshot, restored);
    }

    #[test]
    fn deterministic_serialization() {
        let mut first = StoreSnapshot::new(1, "till-1");
        let mut second = StoreSnapshot::new(1, "till-1");

        first.add_record(customer("c-a", json!("Ada")));
        first.add_record(customer("c-b", json!("Bob")));
        second.add_record(customer("c-b", json!("Bob")));
        second.add_record(customer("c-a", json!("Ada")));

        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }

    #[test]
    fn validate_snapshot_success() {
        let schema = Schema::business_default();
        let mut snapshot = StoreSnapshot::new(BUSINESS_SCHEMA_VERSION, "till-1");
        snapshot.add_record(customer("c-1", json!("Ada")));

        assert!(snapshot.validate(&schema).is_ok());
    }

    #[test]
    fn validate_schema_version_mismatch() {
        let schema = Schema::business_default();
        let snapshot = StoreSnapshot::new(99, "till-1");

        let result = snapshot.validate(&schema);
        assert!(matches!(result, Err(Error::SchemaVersionMismatch { .. })));
    }

    #[test]
    fn validate_invalid_payload() {
        let schema = Schema::business_default();
        let mut snapshot = StoreSnapshot::new(BUSINESS_SCHEMA_VERSION, "till-1");
        snapshot.add_record(customer("c-1", json!(123)));

        let result = snapshot.validate(&schema);
        assert!(matches!(result, Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn tombstones_skip_validation() {
        let schema = Schema::business_default();
        let mut snapshot = StoreSnapshot::new(BUSINESS_SCHEMA_VERSION, "till-1");
        let mut record = customer("c-1", json!(123));
        record.mark_deleted(2000);
        snapshot.add_record(record);

        assert!(snapshot.validate(&schema).is_ok());
        assert_eq!(snapshot.active_record_count(), 0);
    }

    #[test]
    fn snapshot_metadata() {
        let mut snapshot = StoreSnapshot::new(1, "till-1");
        snapshot.add_record(customer("c-1", json!("Ada")));
        snapshot.watermark = Some(7);

        let metadata: SnapshotMetadata = (&snapshot).into();

        assert_eq!(metadata.device_id, "till-1");
        assert_eq!(metadata.record_count, 1);
        assert_eq!(metadata.pending_count, 0);
        assert_eq!(metadata.watermark, Some(7));
    }

    #[test]
    fn reject_future_format_version() {
        let json = r#"{
            "formatVersion": 999,
            "schemaVersion": 1,
            "deviceId": "till-1",
            "records": {},
            "queue": []
        }"#;

        let result = StoreSnapshot::from_json(json);
        assert!(matches!(result, Err(Error::InvalidSnapshot(_))));
    }

    #[test]
    fn reject_malformed_json() {
        assert!(matches!(
            StoreSnapshot::from_json("{not json"),
            Err(Error::InvalidSnapshot(_))
        ));
    }
}
