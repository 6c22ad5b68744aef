//! Mutation events describing local changes.
//!
//! Local writes are never sent as raw records. Each save or delete produces a
//! [`MutationEvent`] that is queued, coalesced and eventually sent to the
//! server, which answers with the authoritative record.

use crate::{ModelName, RecordId, RecordKey, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// Unique identifier for a mutation.
pub type MutationId = String;

/// What a mutation does to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationKind::Create => write!(f, "create"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

/// A pending local change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    /// Mutation ID
    pub id: MutationId,
    /// Target model
    pub model: ModelName,
    /// Target record
    pub record_id: RecordId,
    /// Create, update or delete
    pub kind: MutationKind,
    /// Full payload for creates, changed fields for updates, empty for deletes
    pub payload: serde_json::Value,
    /// Server version this change was made against
    pub version: Version,
    /// When the change was made locally
    pub created_at: Timestamp,
}

impl MutationEvent {
    /// A create of a record that does not exist on the server yet.
    pub fn create(
        id: impl Into<MutationId>,
        model: impl Into<ModelName>,
        record_id: impl Into<RecordId>,
        payload: serde_json::Value,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            record_id: record_id.into(),
            kind: MutationKind::Create,
            payload,
            version: 0,
            created_at,
        }
    }

    /// An update of the given fields against `version`.
    pub fn update(
        id: impl Into<MutationId>,
        model: impl Into<ModelName>,
        record_id: impl Into<RecordId>,
        payload: serde_json::Value,
        version: Version,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            record_id: record_id.into(),
            kind: MutationKind::Update,
            payload,
            version,
            created_at,
        }
    }

    /// A delete against `version`.
    pub fn delete(
        id: impl Into<MutationId>,
        model: impl Into<ModelName>,
        record_id: impl Into<RecordId>,
        version: Version,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            record_id: record_id.into(),
            kind: MutationKind::Delete,
            payload: serde_json::Value::Object(serde_json::Map::new()),
            version,
            created_at,
        }
    }

    /// Key of the record this mutation targets.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.model.clone(), self.record_id.clone())
    }

    /// Whether this mutation targets the given record.
    pub fn targets(&self, key: &RecordKey) -> bool {
        self.model == key.model && self.record_id == key.id
    }
}
