//! Entity records held in the local store.

use crate::{protocol::RemoteRecord, EntityId, EntityType, RemoteStamp, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// One row of business data tracked for sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    /// Stable UUID, assigned at creation and never reused
    pub id: EntityId,
    /// Kind of record
    pub entity_type: EntityType,
    /// Entity-specific data (JSON object)
    pub payload: serde_json::Value,
    /// Local wall clock at creation (milliseconds since epoch)
    pub created_at: Timestamp,
    /// Local wall clock at the last write (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// True iff the payload is known identical to the last-fetched remote payload
    pub is_synced: bool,
    /// Soft delete flag (tombstone)
    pub deleted: bool,
    /// Remote version last observed by this device, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<RemoteStamp>,
}

impl EntityRecord {
    /// Create a record born locally. It is unsynced until a push confirms it.
    pub fn new_local(
        id: impl Into<EntityId>,
        entity_type: EntityType,
        payload: serde_json::Value,
        now: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type,
            payload,
            created_at: now,
            updated_at: now,
            is_synced: false,
            deleted: false,
            observed: None,
        }
    }

    /// Create a record from the remote's authoritative copy.
    pub fn from_remote(remote: &RemoteRecord, now: Timestamp) -> Self {
        Self {
            id: remote.id.clone(),
            entity_type: remote.entity_type,
            payload: remote.payload.clone(),
            created_at: now,
            updated_at: now,
            is_synced: true,
            deleted: remote.deleted,
            observed: Some(remote.stamp()),
        }
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Version last observed on the remote, if the remote has ever seen it.
    pub fn observed_version(&self) -> Option<Version> {
        self.observed.map(|s| s.version)
    }

    /// Replace the payload with a local edit.
    pub fn update_payload(&mut self, payload: serde_json::Value, now: Timestamp) {
        self.payload = payload;
        self.updated_at = now;
        self.is_synced = false;
    }

    /// Mark the record deleted locally (tombstone).
    pub fn mark_deleted(&mut self, now: Timestamp) {
        self.deleted = true;
        self.updated_at = now;
        self.is_synced = false;
    }

    /// Overwrite with the remote's copy and mark synced.
    pub fn apply_remote(&mut self, remote: &RemoteRecord, now: Timestamp) {
        self.payload = remote.payload.clone();
        self.deleted = remote.deleted;
        self.updated_at = now;
        self.is_synced = true;
        self.observed = Some(remote.stamp());
    }

    /// Record that the remote now holds `stamp` for this record.
    ///
    /// `payload_confirmed` is false when a newer local edit is still queued, in
    /// which case the record stays unsynced.
    pub fn confirm_remote(&mut self, stamp: RemoteStamp, payload_confirmed: bool) {
        if self.observed.map_or(true, |prev| prev < stamp) {
            self.observed = Some(stamp);
        }
        if payload_confirmed {
            self.is_synced = true;
        }
    }
}
