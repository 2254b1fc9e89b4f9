//! # Tillsync Engine
//!
//! The deterministic core of an offline-first sync engine for a booking and
//! point-of-sale application.
//!
//! This crate owns everything about synchronization that can be decided
//! without I/O: the local record store, the queue of pending mutations,
//! conflict detection and resolution, the sync audit log, the wire protocol,
//! and the remote's push admission rules. Network, timers, and persistence
//! live in `tillsync-client`.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine has no knowledge of files, network, or platform
//! - **Deterministic**: same inputs always produce the same outputs
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! An [`EntityRecord`] is one row of business data (booking, customer,
//! inventory item, transaction, transaction line, staff member) with a UUID,
//! a JSON payload, a soft-delete flag, and `is_synced`, which is true iff the
//! local payload is known to match the remote.
//!
//! ### Change queue
//!
//! Every local write goes through [`LocalStore::write`] and lands in the
//! [`ChangeTracker`]. There is at most one live entry per entity; later
//! mutations collapse into it (see [`ChangeOp::collapse`]).
//!
//! ### Versions
//!
//! The remote assigns each record a monotonic version and a global server
//! clock ([`RemoteStamp`]). A pulled record conflicts with local state iff a
//! live queue entry exists and the remote version is newer than the one this
//! device last observed ([`conflict::detect`]).
//!
//! ## Quick Start
//!
//! ```rust
//! use tillsync_engine::{EntityType, LocalStore, Schema};
//! use serde_json::json;
//!
//! let mut store = LocalStore::new(Schema::business_default(), "till-1");
//!
//! let written = store
//!     .create(EntityType::Customer, json!({"name": "Ada"}), 1706745600000)
//!     .unwrap();
//!
//! let record = store.read(EntityType::Customer, &written.entity_id).unwrap();
//! assert!(!record.is_synced);
//! assert_eq!(store.pending_count(), 1);
//! ```
//!
//! ## Persistence
//!
//! Use [`LocalStore::export_state`] and [`LocalStore::import_state`] with
//! [`StoreSnapshot`]. Snapshots serialize to JSON with deterministic ordering.

pub mod clock;
pub mod conflict;
pub mod entity;
pub mod error;
pub mod operation;
pub mod protocol;
pub mod queue;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod sync_log;

// Re-export main types at crate root
pub use clock::{LocalClock, RemoteStamp};
pub use conflict::{
    ConflictPolicy, ConflictRecord, ConflictResolver, PullDecision, Resolution, Side,
};
pub use entity::{new_entity_id, EntityType};
pub use error::Error;
pub use operation::ChangeOp;
pub use protocol::{
    AcceptedChange, Change, PullQuery, PullResponse, PushRequest, PushResponse, RejectReason,
    RejectedChange, RemoteRecord, SnapshotResponse,
};
pub use queue::{AckOutcome, ChangeEntry, ChangeTracker, EnqueueOutcome, EntryId};
pub use record::EntityRecord;
pub use schema::{EntitySchema, FieldDef, FieldType, Schema, BUSINESS_SCHEMA_VERSION};
pub use snapshot::{SnapshotMetadata, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{Collection, LocalStore, RemoteApply, WriteResult};
pub use sync_log::{LogStatus, SyncLog, SyncLogEntry, SyncType};

/// Type aliases for clarity
pub type EntityId = String;
pub type DeviceId = String;
/// Milliseconds since the Unix epoch on the device
pub type Timestamp = u64;
/// Per-record version assigned by the remote
pub type Version = u64;
/// Value of the remote's global write counter
pub type ServerClock = u64;
pub type SchemaVersion = u32;
