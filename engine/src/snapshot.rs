//! Snapshot types for persisting and restoring store and queue state.
//!
//! Snapshots are the bridge between the in-memory [`LocalStore`] /
//! [`MutationQueue`] pair and persistent storage. They are designed for
//! deterministic serialization to ensure consistency.

use crate::{
    error::Result, journal::ChangeSet, queue::QueuedMutation, store::SyncCursor, Error,
    LocalStore, ModelName, ModelRegistry, MutationQueue, Record, RecordId, SchemaVersion,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the store state.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version at time of snapshot
    pub schema_version: SchemaVersion,
    /// Node that wrote the snapshot
    pub node_id: String,
    /// All records organized by model, then by record ID
    pub records: BTreeMap<ModelName, BTreeMap<RecordId, Record>>,
    /// Sync cursor per model
    #[serde(default)]
    pub cursors: BTreeMap<ModelName, SyncCursor>,
    /// Queued mutations in enqueue order
    #[serde(default)]
    pub mutations: Vec<QueuedMutation>,
    /// Next queue sequence number
    #[serde(default)]
    pub next_sequence: u64,
    /// Last journaled change already contained in this snapshot
    #[serde(default)]
    pub journal_position: u64,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion, node_id: impl Into<String>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            node_id: node_id.into(),
            records: BTreeMap::new(),
            cursors: BTreeMap::new(),
            mutations: Vec::new(),
            next_sequence: 0,
            journal_position: 0,
        }
    }

    /// Capture the full state of a store and its queue.
    pub fn capture(node_id: impl Into<String>, store: &LocalStore, queue: &MutationQueue) -> Self {
        let mut snapshot = Self::new(store.registry().version, node_id);
        for record in store.records() {
            snapshot.add_record(record.clone());
        }
        snapshot.cursors = store.cursors().clone();
        snapshot.mutations = queue.iter().cloned().collect();
        snapshot.next_sequence = queue.next_sequence();
        snapshot
    }

    /// Rebuild a store and queue after validating against `registry`.
    ///
    /// In-flight flags are not persisted, so every restored mutation is
    /// sendable again.
    pub fn restore(self, registry: Arc<ModelRegistry>) -> Result<(LocalStore, MutationQueue)> {
        self.validate(&registry)?;

        let mut store = LocalStore::new(registry);
        store.load(
            self.records.into_values().flat_map(|records| records.into_values()),
            self.cursors,
        );

        let mut queue = MutationQueue::new();
        queue.load(self.mutations, self.next_sequence);

        Ok((store, queue))
    }

    /// Replay a journaled change on top of this snapshot.
    ///
    /// Changes at or below `journal_position` are already contained and are
    /// skipped; returns whether `changes` was applied.
    pub fn apply(&mut self, changes: &ChangeSet) -> bool {
        if changes.position <= self.journal_position {
            return false;
        }

        for key in &changes.removed_records {
            if let Some(records) = self.records.get_mut(&key.model) {
                records.remove(&key.id);
                if records.is_empty() {
                    self.records.remove(&key.model);
                }
            }
        }
        for record in &changes.records {
            self.add_record(record.clone());
        }

        for model in &changes.removed_cursors {
            self.cursors.remove(model);
        }
        self.cursors
            .extend(changes.cursors.iter().map(|(m, c)| (m.clone(), c.clone())));

        if !changes.mutations.is_empty() || !changes.removed_mutations.is_empty() {
            let mut entries: BTreeMap<u64, QueuedMutation> = self
                .mutations
                .drain(..)
                .map(|e| (e.sequence, e))
                .collect();
            for sequence in &changes.removed_mutations {
                entries.remove(sequence);
            }
            for entry in &changes.mutations {
                entries.insert(entry.sequence, entry.clone());
            }
            self.mutations = entries.into_values().collect();
        }

        self.next_sequence = self.next_sequence.max(changes.next_sequence);
        self.journal_position = changes.position;
        true
    }

    /// Add a record to the snapshot.
    pub fn add_record(&mut self, record: Record) {
        self.records
            .entry(record.model.clone())
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Get a record from the snapshot.
    pub fn get_record(&self, model: &str, id: &str) -> Option<&Record> {
        self.records.get(model)?.get(id)
    }

    /// Count total records across all models.
    pub fn record_count(&self) -> usize {
        self.records.values().map(|m| m.len()).sum()
    }

    /// Count active (non-deleted) records.
    pub fn active_record_count(&self) -> usize {
        self.records
            .values()
            .flat_map(|m| m.values())
            .filter(|r| r.is_active())
            .count()
    }

    /// Validate the snapshot against a registry.
    pub fn validate(&self, registry: &ModelRegistry) -> Result<()> {
        if self.schema_version != registry.version {
            return Err(Error::SchemaVersionMismatch {
                expected: registry.version,
                actual: self.schema_version,
            });
        }

        for (model, records) in &self.records {
            let schema = registry.require(model)?;
            for record in records.values().filter(|r| r.is_active()) {
                schema.validate_payload(&record.payload)?;
            }
        }

        for queued in &self.mutations {
            registry.validate_mutation(&queued.mutation)?;
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub node_id: String,
    pub record_count: usize,
    pub active_record_count: usize,
    pub pending_count: usize,
}

impl From<&StoreSnapshot> for SnapshotMetadata {
    fn from(snapshot: &StoreSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            schema_version: snapshot.schema_version,
            node_id: snapshot.node_id.clone(),
            record_count: snapshot.record_count(),
            active_record_count: snapshot.active_record_count(),
            pending_count: snapshot.mutations.len(),
        }
    }
}
