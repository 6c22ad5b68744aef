//! Model registry and payload validation.
//!
//! The registry describes every model the engine syncs: its fields, which of
//! them are required, and which point at a parent model. It is built by the
//! caller and handed to the engine at construction.

use crate::{error::Result, Error, ModelName, MutationEvent, MutationKind, SchemaVersion};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Type of a model field, as carried in JSON payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Milliseconds since the Unix epoch; never negative
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl FieldType {
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Json => "Json",
        }
    }

    /// Whether a non-null value has this type.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64(),
            FieldType::Json => true,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A declared field of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// A required field may be neither absent nor null in a full payload
    pub required: bool,
}

impl FieldDef {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }
}

/// Type check of one payload value; null counts as absent.
fn check_value(field: &str, expected: FieldType, value: Option<&Value>, required: bool) -> Result<()> {
    match value.filter(|v| !v.is_null()) {
        None if required => Err(Error::MissingRequiredField(field.to_string())),
        None => Ok(()),
        Some(v) if expected.accepts(v) => Ok(()),
        Some(v) => Err(Error::TypeMismatch {
            field: field.to_string(),
            expected: expected.to_string(),
            got: json_type_name(v).to_string(),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// A `belongs_to` relationship: `field` holds the id of a `target` record.
///
/// Ids are strings, so a relationship field is typed `String` whether or not
/// it is also declared in [`ModelSchema::fields`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub field: String,
    pub target: ModelName,
}

/// Schema for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSchema {
    pub name: ModelName,
    pub fields: Vec<FieldDef>,
    /// Parent relationships
    #[serde(default)]
    pub belongs_to: Vec<Relationship>,
}

impl ModelSchema {
    pub fn new(name: impl Into<ModelName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            belongs_to: Vec::new(),
        }
    }

    /// Declare that `field` references a record of `target`.
    pub fn belongs_to(mut self, field: impl Into<String>, target: impl Into<ModelName>) -> Self {
        self.belongs_to.push(Relationship {
            field: field.into(),
            target: target.into(),
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a full payload: required fields must be set.
    pub fn validate_payload(&self, payload: &Value) -> Result<()> {
        self.check_object(payload, true)
    }

    /// Validate a partial payload: only the fields present are checked.
    pub fn validate_patch(&self, patch: &Value) -> Result<()> {
        self.check_object(patch, false)
    }

    fn check_object(&self, payload: &Value, full: bool) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            let value = obj.get(&field.name);
            if full || value.is_some() {
                check_value(&field.name, field.field_type, value, field.required)?;
            }
        }
        // A reference may be unset, but when set it is an id.
        for rel in &self.belongs_to {
            check_value(&rel.field, FieldType::String, obj.get(&rel.field), false)?;
        }

        Ok(())
    }
}

/// Registry of every model the engine knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRegistry {
    /// Schema version for migrations
    pub version: SchemaVersion,
    /// Model schemas by name
    pub models: BTreeMap<ModelName, ModelSchema>,
}

impl ModelRegistry {
    /// Create an empty registry.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            models: BTreeMap::new(),
        }
    }

    /// Register a model.
    pub fn register(&mut self, model: ModelSchema) -> &mut Self {
        self.models.insert(model.name.clone(), model);
        self
    }

    /// Builder-style method to register a model.
    pub fn with_model(mut self, model: ModelSchema) -> Self {
        self.register(model);
        self
    }

    /// Get a model schema by name.
    pub fn get(&self, name: &str) -> Option<&ModelSchema> {
        self.models.get(name)
    }

    /// Get a model schema or fail with [`Error::ModelNotFound`].
    pub fn require(&self, name: &str) -> Result<&ModelSchema> {
        self.models
            .get(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }

    /// Validate a mutation against the registry.
    ///
    /// Creates must carry a full payload; updates are field patches.
    pub fn validate_mutation(&self, mutation: &MutationEvent) -> Result<()> {
        let schema = self.require(&mutation.model)?;

        match mutation.kind {
            MutationKind::Create => schema.validate_payload(&mutation.payload),
            MutationKind::Update => schema.validate_patch(&mutation.payload),
            MutationKind::Delete => Ok(()),
        }
    }

    /// Model names ordered so that parents come before their children.
    ///
    /// Relationships to unregistered models are ignored, and cycles fall back
    /// to name order for the models involved.
    pub fn sync_order(&self) -> Vec<ModelName> {
        let mut ordered = Vec::with_capacity(self.models.len());
        let mut placed = BTreeSet::new();

        while ordered.len() < self.models.len() {
            let next: Vec<_> = self
                .models
                .values()
                .filter(|m| !placed.contains(&m.name))
                .filter(|m| {
                    m.belongs_to.iter().all(|rel| {
                        rel.target == m.name
                            || placed.contains(&rel.target)
                            || !self.models.contains_key(&rel.target)
                    })
                })
                .map(|m| m.name.clone())
                .collect();

            if next.is_empty() {
                // Cycle: take the remaining models in name order.
                let rest: Vec<_> = self
                    .models
                    .keys()
                    .filter(|name| !placed.contains(*name))
                    .cloned()
                    .collect();
                ordered.extend(rest);
                break;
            }

            for name in next {
                placed.insert(name.clone());
                ordered.push(name);
            }
        }

        ordered
    }
}
