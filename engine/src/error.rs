//! Error types for the TillSync engine.

use crate::{EntityId, EntityType, SchemaVersion};
use thiserror::Error;

/// All possible errors from the TillSync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Mutation errors
    #[error("{entity_type} not found: {id}")]
    EntityNotFound { entity_type: EntityType, id: EntityId },

    #[error("{entity_type} already exists: {id}")]
    EntityAlreadyExists { entity_type: EntityType, id: EntityId },

    #[error("operation on deleted {entity_type}: {id}")]
    OperationOnDeleted { entity_type: EntityType, id: EntityId },

    // Queue and conflict bookkeeping
    #[error("change queue entry not found: {0}")]
    QueueEntryNotFound(u64),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },
}

impl Error {
    /// Whether this error was caused by a payload failing schema validation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidPayload(_) | Error::MissingRequiredField(_) | Error::TypeMismatch { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::EntityNotFound {
            entity_type: EntityType::Customer,
            id: "c-1".into(),
        };
        assert_eq!(err.to_string(), "customer not found: c-1");

        let err = Error::SchemaVersionMismatch {
            expected: 1,
            actual: 2,
        };
        assert_eq!(err.to_string(), "schema version mismatch: expected 1, got 2");

        let err = Error::TypeMismatch {
            field: "quantity".into(),
            expected: "Int".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'quantity': expected Int, got String"
        );
    }

    #[test]
    fn validation_classification() {
        assert!(Error::MissingRequiredField("name".into()).is_validation());
        assert!(Error::InvalidPayload("not an object".into()).is_validation());
        assert!(!Error::ConflictNotFound("x".into()).is_validation());
    }
}
