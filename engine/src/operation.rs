//! Mutation kinds and the rules for collapsing them.
//!
//! The change queue keeps at most one live entry per entity. When a new local
//! mutation arrives for an entity that already has a pending entry, the two
//! operations collapse into one according to [`ChangeOp::collapse`].

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A local mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Create => "create",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }

    /// Whether this operation ships a payload to the remote.
    pub fn carries_payload(&self) -> bool {
        !matches!(self, ChangeOp::Delete)
    }

    /// Collapse a newer operation into this pending one.
    ///
    /// Returns `None` for sequences the local store never produces
    /// (re-creating an existing id, or touching a deleted record).
    ///
    /// | pending | next   | result |
    /// |---------|--------|--------|
    /// | create  | update | create |
    /// | update  | update | update |
    /// | any     | delete | delete |
    pub fn collapse(self, next: ChangeOp) -> Option<ChangeOp> {
        match (self, next) {
            (ChangeOp::Delete, _) => None,
            (_, ChangeOp::Delete) => Some(ChangeOp::Delete),
            (_, ChangeOp::Create) => None,
            (ChangeOp::Create, ChangeOp::Update) => Some(ChangeOp::Create),
            (ChangeOp::Update, ChangeOp::Update) => Some(ChangeOp::Update),
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeOp::Create),
            "update" => Ok(ChangeOp::Update),
            "delete" => Ok(ChangeOp::Delete),
            other => Err(Error::InvalidPayload(format!("unknown operation: {other}"))),
        }
    }
}
