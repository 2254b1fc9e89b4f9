//! The business entity types tracked for sync.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of business record.
///
/// Serialized in `snake_case`, which is also the collection/table name used
/// by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Booking,
    Customer,
    InventoryItem,
    Transaction,
    TransactionItem,
    Staff,
}

impl EntityType {
    /// Every entity type, in a stable order.
    pub const ALL: [EntityType; 6] = [
        EntityType::Booking,
        EntityType::Customer,
        EntityType::InventoryItem,
        EntityType::Transaction,
        EntityType::TransactionItem,
        EntityType::Staff,
    ];

    /// Wire/table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Booking => "booking",
            EntityType::Customer => "customer",
            EntityType::InventoryItem => "inventory_item",
            EntityType::Transaction => "transaction",
            EntityType::TransactionItem => "transaction_item",
            EntityType::Staff => "staff",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownEntityType(s.to_string()))
    }
}

/// Generate a fresh, globally unique entity id.
pub fn new_entity_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
