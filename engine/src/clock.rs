//! Clocks used for ordering.
//!
//! Two clocks exist and they never mix:
//! - [`LocalClock`] is a per-device monotonic counter that orders change-queue
//!   entries (FIFO) independently of wall-clock jumps.
//! - [`RemoteStamp`] captures the remote's per-record version and the server
//!   clock at which that version was written. Conflict detection only ever
//!   compares versions issued by the remote, so device clock drift cannot
//!   misclassify concurrent edits.

use crate::{ServerClock, Version};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A monotonically increasing local counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalClock {
    counter: u64,
}

impl LocalClock {
    /// Create a new clock starting at 0.
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Create a clock with a specific counter value.
    pub fn with_counter(counter: u64) -> Self {
        Self { counter }
    }

    /// Increment the clock and return the new value.
    pub fn tick(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Current value without advancing.
    pub fn current(&self) -> u64 {
        self.counter
    }

    /// Advance to at least `seen`, so the next tick is strictly greater.
    pub fn merge(&mut self, seen: u64) {
        self.counter = self.counter.max(seen);
    }
}

/// The remote version of a record as last observed by this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStamp {
    /// Per-record version, incremented by the remote on every accepted write
    pub version: Version,
    /// Server clock value at which this version was written
    pub server_clock: ServerClock,
}

impl RemoteStamp {
    pub fn new(version: Version, server_clock: ServerClock) -> Self {
        Self {
            version,
            server_clock,
        }
    }

    /// True if `version` is strictly newer than this stamp.
    pub fn is_older_than(&self, version: Version) -> bool {
        self.version < version
    }
}

impl Ord for RemoteStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.version.cmp(&other.version) {
            Ordering::Equal => self.server_clock.cmp(&other.server_clock),
            other => other,
        }
    }
}

impl PartialOrd for RemoteStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
