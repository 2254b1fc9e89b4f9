//! Wire protocol shared by the device and the remote service.
//!
//! Push (`POST /sync/push`) sends a [`PushRequest`] and receives a
//! [`PushResponse`]; pull (`GET /sync/pull?since=`) returns a [`PullResponse`].
//! Both are idempotent per entity id: every [`Change`] carries a `change_id`
//! and re-sending an already applied change is a no-op.
//!
//! [`admit`] holds the remote's acceptance rules so that the reference server
//! and the in-memory remote behave identically.

use crate::{
    queue::ChangeEntry, ChangeOp, DeviceId, EntityId, EntityType, RemoteStamp, Schema,
    SchemaVersion, ServerClock, Timestamp, Version,
};
use serde::{Deserialize, Serialize};

/// A single mutation as sent to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Idempotency key
    pub change_id: String,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub operation: ChangeOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Remote version this change was based on (`None` if never observed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<Version>,
    /// Earlier unacknowledged revisions from the same device
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<String>,
    /// Overwrite regardless of the remote version
    #[serde(default)]
    pub force: bool,
    pub client_timestamp: Timestamp,
}

impl Change {
    /// Build the wire form of a queue entry.
    pub fn from_entry(entry: &ChangeEntry, base_version: Option<Version>) -> Self {
        Self {
            change_id: entry.change_id.clone(),
            entity_type: entry.entity_type,
            entity_id: entry.entity_id.clone(),
            operation: entry.operation,
            payload: entry.payload.clone(),
            base_version,
            supersedes: entry.supersedes.clone(),
            force: entry.force,
            client_timestamp: entry.updated_at,
        }
    }
}

/// Request body for push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub device_id: DeviceId,
    pub schema_version: SchemaVersion,
    pub changes: Vec<Change>,
}

/// A change the remote applied (or had already applied).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedChange {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub change_id: String,
    /// Record version after the change
    pub version: Version,
    /// Server clock at which that version was written
    pub server_clock: ServerClock,
}

impl AcceptedChange {
    pub fn stamp(&self) -> RemoteStamp {
        RemoteStamp::new(self.version, self.server_clock)
    }
}

/// Why the remote refused a single change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Payload failed validation; never retried
    Validation,
    /// The remote holds a newer version than the change was based on
    Conflict,
    /// Temporary failure on the remote; retry later
    Transient,
}

impl RejectReason {
    pub fn is_transient(&self) -> bool {
        matches!(self, RejectReason::Transient)
    }
}

/// A change the remote refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedChange {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub change_id: String,
    pub reason: RejectReason,
    pub message: String,
    /// The remote's current copy, included for conflicts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<RemoteRecord>,
}

/// Response for push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub accepted: Vec<AcceptedChange>,
    pub rejected: Vec<RejectedChange>,
    pub server_clock: ServerClock,
}

/// Query parameters for pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    /// Watermark from the previous pull (absent for the first sync)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<ServerClock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// The remote's authoritative copy of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub entity_type: EntityType,
    pub id: EntityId,
    pub payload: serde_json::Value,
    pub deleted: bool,
    pub version: Version,
    pub server_clock: ServerClock,
}

impl RemoteRecord {
    pub fn stamp(&self) -> RemoteStamp {
        RemoteStamp::new(self.version, self.server_clock)
    }
}

/// Response for pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Records written after `since`, ordered by server clock
    pub records: Vec<RemoteRecord>,
    /// Clock value to use as the next `since`
    pub server_clock: ServerClock,
    /// Whether another page is available
    pub has_more: bool,
}

/// Full authoritative snapshot used by reset-and-resync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub records: Vec<RemoteRecord>,
    pub server_clock: ServerClock,
}

/// What the remote currently stores for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteState {
    pub record: RemoteRecord,
    /// `change_id` of the last change applied to this record
    pub last_change_id: Option<String>,
}

/// The remote's decision for one incoming change.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Already applied (re-send); accept without writing
    Duplicate { version: Version, server_clock: ServerClock },
    /// Write this state with the next server clock value
    Apply {
        version: Version,
        payload: serde_json::Value,
        deleted: bool,
    },
    /// Refuse the change
    Reject {
        reason: RejectReason,
        message: String,
        current: Option<RemoteRecord>,
    },
}

/// Decide whether the remote accepts `change` given its `current` state.
pub fn admit(schema: &Schema, current: Option<&RemoteState>, change: &Change) -> Admission {
    if let Some(state) = current {
        if state.last_change_id.as_deref() == Some(change.change_id.as_str()) {
            return Admission::Duplicate {
                version: state.record.version,
                server_clock: state.record.server_clock,
            };
        }
    }

    let payload = if change.operation.carries_payload() {
        let Some(payload) = change.payload.as_ref() else {
            return reject_validation(format!("{} without payload", change.operation));
        };
        if let Err(e) = schema.validate_payload(change.entity_type, payload) {
            return reject_validation(e.to_string());
        }
        Some(payload.clone())
    } else {
        None
    };

    let Some(state) = current else {
        return Admission::Apply {
            version: 1,
            payload: payload.unwrap_or(serde_json::Value::Null),
            deleted: change.operation == ChangeOp::Delete,
        };
    };

    let cur = &state.record;
    if !change.force {
        let own_previous = state
            .last_change_id
            .as_ref()
            .is_some_and(|last| change.supersedes.contains(last));
        if change.base_version != Some(cur.version) && !own_previous {
            return Admission::Reject {
                reason: RejectReason::Conflict,
                message: format!(
                    "remote version {} is newer than base {}",
                    cur.version,
                    change
                        .base_version
                        .map_or_else(|| "none".to_string(), |v| v.to_string())
                ),
                current: Some(cur.clone()),
            };
        }
        if cur.deleted && change.operation != ChangeOp::Delete {
            return Admission::Reject {
                reason: RejectReason::Conflict,
                message: "record was deleted on the remote".to_string(),
                current: Some(cur.clone()),
            };
        }
    }

    if cur.deleted && change.operation == ChangeOp::Delete {
        return Admission::Duplicate {
            version: cur.version,
            server_clock: cur.server_clock,
        };
    }

    match payload {
        Some(payload) => Admission::Apply {
            version: cur.version + 1,
            payload,
            deleted: false,
        },
        None => Admission::Apply {
            version: cur.version + 1,
            payload: cur.payload.clone(),
            deleted: true,
        },
    }
}

fn reject_validation(message: String) -> Admission {
    Admission::Reject {
        reason: RejectReason::Validation,
        message,
        current: None,
    }
}
