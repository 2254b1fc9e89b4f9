//! Schema definition and payload validation.
//!
//! Every entity type has a set of typed fields. Payloads are validated on
//! local writes and again by the remote before a change is admitted.

use crate::{error::Result, EntityType, Error, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of [`Schema::business_default`].
pub const BUSINESS_SCHEMA_VERSION: SchemaVersion = 1;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None | Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64() || value.is_string(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Field definitions for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    pub entity_type: EntityType,
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    pub fn new(entity_type: EntityType, fields: Vec<FieldDef>) -> Self {
        Self {
            entity_type,
            fields,
        }
    }

    /// Validate a payload. Fields not declared in the schema are allowed.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }
}

/// Versioned schema for all entity types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub version: SchemaVersion,
    pub entities: BTreeMap<EntityType, EntitySchema>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            entities: BTreeMap::new(),
        }
    }

    /// Builder-style method to add an entity schema.
    pub fn with_entity(mut self, entity: EntitySchema) -> Self {
        self.entities.insert(entity.entity_type, entity);
        self
    }

    /// The schema of the booking/POS application.
    pub fn business_default() -> Self {
        Schema::new(BUSINESS_SCHEMA_VERSION)
            .with_entity(EntitySchema::new(
                EntityType::Booking,
                vec![
                    FieldDef::required("customer_id", FieldType::String),
                    FieldDef::required("service", FieldType::String),
                    FieldDef::required("starts_at", FieldType::Timestamp),
                    FieldDef::optional("status", FieldType::String),
                    FieldDef::optional("notes", FieldType::String),
                ],
            ))
            .with_entity(EntitySchema::new(
                EntityType::Customer,
                vec![
                    FieldDef::required("name", FieldType::String),
                    FieldDef::optional("email", FieldType::String),
                    FieldDef::optional("phone", FieldType::String),
                ],
            ))
            .with_entity(EntitySchema::new(
                EntityType::InventoryItem,
                vec![
                    FieldDef::required("name", FieldType::String),
                    FieldDef::required("quantity", FieldType::Int),
                    FieldDef::optional("sku", FieldType::String),
                    FieldDef::optional("unit_price", FieldType::Float),
                ],
            ))
            .with_entity(EntitySchema::new(
                EntityType::Transaction,
                vec![
                    FieldDef::required("total", FieldType::Float),
                    FieldDef::optional("customer_id", FieldType::String),
                    FieldDef::optional("payment_method", FieldType::String),
                    FieldDef::optional("status", FieldType::String),
                ],
            ))
            .with_entity(EntitySchema::new(
                EntityType::TransactionItem,
                vec![
                    FieldDef::required("transaction_id", FieldType::String),
                    FieldDef::required("item_id", FieldType::String),
                    FieldDef::required("quantity", FieldType::Int),
                    FieldDef::required("unit_price", FieldType::Float),
                ],
            ))
            .with_entity(EntitySchema::new(
                EntityType::Staff,
                vec![
                    FieldDef::required("name", FieldType::String),
                    FieldDef::optional("role", FieldType::String),
                    FieldDef::optional("email", FieldType::String),
                ],
            ))
    }

    /// Get the schema for an entity type.
    pub fn entity(&self, entity_type: EntityType) -> Option<&EntitySchema> {
        self.entities.get(&entity_type)
    }

    /// Validate a payload for an entity type.
    ///
    /// Entity types without a declared schema accept any JSON object.
    pub fn validate_payload(
        &self,
        entity_type: EntityType,
        payload: &serde_json::Value,
    ) -> Result<()> {
        match self.entities.get(&entity_type) {
            Some(entity) => entity.validate_payload(payload),
            None if payload.is_object() => Ok(()),
            None => Err(Error::InvalidPayload("payload must be an object".into())),
        }
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::business_default()
    }
}
