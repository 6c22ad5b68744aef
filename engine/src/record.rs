//! Record types for storing model data.

use crate::{ModelName, RecordId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a record: the model it belongs to and its id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    pub model: ModelName,
    pub id: RecordId,
}

impl RecordKey {
    pub fn new(model: impl Into<ModelName>, id: impl Into<RecordId>) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.id)
    }
}

/// A model record in the local store.
///
/// `version` is the last version acknowledged by the server. A record that
/// only exists locally has version 0 until its create is acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique identifier within the model
    pub id: RecordId,
    /// Model this record belongs to
    pub model: ModelName,
    /// Server version
    pub version: Version,
    /// Last change time (milliseconds since epoch)
    pub last_changed_at: Timestamp,
    /// The field values (JSON object)
    pub payload: serde_json::Value,
    /// Tombstone flag
    pub deleted: bool,
}

impl Record {
    /// Create a new, never-synced record.
    pub fn new(
        id: impl Into<RecordId>,
        model: impl Into<ModelName>,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            version: 0,
            last_changed_at: timestamp,
            payload,
            deleted: false,
        }
    }

    /// Builder-style setter for the version, used for server-provided records.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Key identifying this record.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.model.clone(), self.id.clone())
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Mark record as deleted (tombstone). The version is left untouched:
    /// only the server assigns versions.
    pub fn mark_deleted(&mut self, timestamp: Timestamp) {
        self.deleted = true;
        self.last_changed_at = timestamp;
    }

    /// Merge a partial payload into this record's fields.
    pub fn merge_payload(&mut self, patch: &serde_json::Value, timestamp: Timestamp) {
        merge_fields(&mut self.payload, patch);
        self.last_changed_at = timestamp;
    }
}

/// Merge the top-level fields of `patch` into `target`; later fields win.
///
/// A non-object on either side replaces the target wholesale.
pub fn merge_fields(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (field, value) in patch {
                target.insert(field.clone(), value.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}
