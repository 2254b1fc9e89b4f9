//! Append-only audit trail of remote operations.
//!
//! One entry is appended per attempted remote operation. Entries are never
//! mutated; the log only tracks how many of them were already shipped to the
//! remote `sync_logs` table.

use crate::{ChangeOp, DeviceId, EntityId, EntityType, Error, Timestamp};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Flushed entries kept in memory for local inspection.
const RETAINED_FLUSHED: usize = 1000;

/// Unflushed entries kept while the remote is unreachable; the oldest go first.
pub const MAX_UNFLUSHED: usize = 10_000;

/// Which sync activity produced a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Push,
    Pull,
    Reset,
    Resolve,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Push => "push",
            SyncType::Pull => "pull",
            SyncType::Reset => "reset",
            SyncType::Resolve => "resolve",
        }
    }
}

impl FromStr for SyncType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(SyncType::Push),
            "pull" => Ok(SyncType::Pull),
            "reset" => Ok(SyncType::Reset),
            "resolve" => Ok(SyncType::Resolve),
            other => Err(Error::InvalidPayload(format!("unknown sync type: {other}"))),
        }
    }
}

/// Outcome of a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Failed => "failed",
        }
    }
}

impl FromStr for LogStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(LogStatus::Success),
            "failed" => Ok(LogStatus::Failed),
            other => Err(Error::InvalidPayload(format!("unknown log status: {other}"))),
        }
    }
}

/// Immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub device_id: DeviceId,
    pub sync_type: SyncType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<ChangeOp>,
    pub status: LogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: Timestamp,
}

impl SyncLogEntry {
    /// Entry for an operation on a single record.
    pub fn for_record(
        device_id: impl Into<DeviceId>,
        sync_type: SyncType,
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        operation: Option<ChangeOp>,
        outcome: std::result::Result<(), String>,
        created_at: Timestamp,
    ) -> Self {
        let (status, error_message) = match outcome {
            Ok(()) => (LogStatus::Success, None),
            Err(e) => (LogStatus::Failed, Some(e)),
        };
        Self {
            device_id: device_id.into(),
            sync_type,
            entity_type: Some(entity_type),
            entity_id: Some(entity_id.into()),
            operation,
            status,
            error_message,
            created_at,
        }
    }

    /// Entry for a whole-store activity such as a reset.
    pub fn for_store(
        device_id: impl Into<DeviceId>,
        sync_type: SyncType,
        outcome: std::result::Result<(), String>,
        created_at: Timestamp,
    ) -> Self {
        let (status, error_message) = match outcome {
            Ok(()) => (LogStatus::Success, None),
            Err(e) => (LogStatus::Failed, Some(e)),
        };
        Self {
            device_id: device_id.into(),
            sync_type,
            entity_type: None,
            entity_id: None,
            operation: None,
            status,
            error_message,
            created_at,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == LogStatus::Failed
    }

    /// Same operation and outcome, ignoring when it happened.
    pub fn same_event(&self, other: &SyncLogEntry) -> bool {
        self.device_id == other.device_id
            && self.sync_type == other.sync_type
            && self.entity_type == other.entity_type
            && self.entity_id == other.entity_id
            && self.operation == other.operation
            && self.status == other.status
            && self.error_message == other.error_message
    }
}

/// In-memory append-only log with a flush cursor.
#[derive(Debug, Clone, Default)]
pub struct SyncLog {
    entries: Vec<SyncLogEntry>,
    flushed: usize,
}

impl SyncLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a log whose entries have not been flushed yet.
    pub fn from_unflushed(mut entries: Vec<SyncLogEntry>) -> Self {
        let excess = entries.len().saturating_sub(MAX_UNFLUSHED);
        entries.drain(..excess);
        Self {
            entries,
            flushed: 0,
        }
    }

    /// Append an entry, dropping the oldest unflushed one past [`MAX_UNFLUSHED`].
    pub fn append(&mut self, entry: SyncLogEntry) {
        self.entries.push(entry);
        if self.entries.len() - self.flushed > MAX_UNFLUSHED {
            self.entries.remove(self.flushed);
        }
    }

    /// Whether the newest unflushed entry records the same event as `entry`.
    pub fn repeats_unflushed(&self, entry: &SyncLogEntry) -> bool {
        self.unflushed()
            .last()
            .is_some_and(|last| last.same_event(entry))
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> &[SyncLogEntry] {
        &self.entries
    }

    /// Entries not yet shipped to the remote.
    pub fn unflushed(&self) -> &[SyncLogEntry] {
        &self.entries[self.flushed..]
    }

    /// Record that the first `count` unflushed entries reached the remote.
    pub fn mark_flushed(&mut self, count: usize) {
        self.flushed = (self.flushed + count).min(self.entries.len());
        if self.flushed > RETAINED_FLUSHED {
            let drop = self.flushed - RETAINED_FLUSHED;
            self.entries.drain(..drop);
            self.flushed -= drop;
        }
    }

    /// Failed entries, oldest first.
    pub fn failures(&self) -> impl Iterator<Item = &SyncLogEntry> {
        self.entries.iter().filter(|e| e.is_failure())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
