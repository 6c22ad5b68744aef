//! Local store - the transactional record container.
//!
//! The store holds every record (including tombstones) and the per-model sync
//! cursors. Local writes go through [`LocalStore::transaction`], which stages
//! all puts and deletes and commits them together after the relationship
//! checks pass. Server records go through [`LocalStore::apply_remote`], which
//! skips versions that are not newer than the stored one, or through
//! [`LocalStore::overwrite`] when a conflict resolution decides the state.
//!
//! Writes to records and cursors can be journaled; see [`crate::journal`].

use crate::journal::{ChangeSet, JournaledMap};
use crate::{error::Result, Error, ModelName, ModelRegistry, Record, RecordKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Opaque position in a model's remote change stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(pub String);

impl SyncCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of applying a remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyOutcome {
    /// The record replaced the stored state
    Applied,
    /// The stored version was equal or newer; nothing changed
    Stale,
}

/// Counts for an applied remote batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub applied: usize,
    pub stale: usize,
}

/// First key of a model in the `(model, id)` ordering.
fn model_start(model: &str) -> RecordKey {
    RecordKey::new(model, "")
}

/// The local record store.
#[derive(Debug, Clone)]
pub struct LocalStore {
    registry: Arc<ModelRegistry>,
    records: JournaledMap<RecordKey, Record>,
    cursors: JournaledMap<ModelName, SyncCursor>,
}

impl LocalStore {
    /// Create an empty store for the given registry.
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            records: JournaledMap::new(),
            cursors: JournaledMap::new(),
        }
    }

    /// Get the registry.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Get an active record.
    pub fn get(&self, model: &str, id: &str) -> Option<&Record> {
        self.get_including_deleted(model, id)
            .filter(|r| r.is_active())
    }

    /// Get a record including tombstones.
    pub fn get_including_deleted(&self, model: &str, id: &str) -> Option<&Record> {
        self.records.get(&RecordKey::new(model, id))
    }

    /// Lazily iterate the active records of a model that match `predicate`.
    pub fn query_all<'a, F>(
        &'a self,
        model: &'a str,
        predicate: F,
    ) -> impl Iterator<Item = &'a Record> + 'a
    where
        F: Fn(&Record) -> bool + 'a,
    {
        self.model_records(model)
            .filter(|r| r.is_active())
            .filter(move |r| predicate(*r))
    }

    /// Iterate all records of a model, tombstones included.
    pub fn model_records<'a>(&'a self, model: &'a str) -> impl Iterator<Item = &'a Record> + 'a {
        self.records
            .range(model_start(model)..)
            .take_while(move |(key, _)| key.model == model)
            .map(|(_, record)| record)
    }

    /// Iterate every record in key order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Number of stored records, tombstones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the store holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Run `body` as one atomic transaction.
    ///
    /// Either every write made through the [`Transaction`] becomes visible or
    /// none does. The transaction aborts if `body` fails or if the
    /// post-transaction state breaks a `belongs_to` relationship.
    pub fn transaction<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let (value, writes) = {
            let mut tx = Transaction::new(&self.registry, &self.records);
            let value = body(&mut tx)?;
            tx.check_relationships()?;
            (value, tx.writes)
        };

        self.records.extend(writes);
        Ok(value)
    }

    /// Write a record in its own transaction.
    pub fn put(&mut self, record: Record) -> Result<()> {
        self.transaction(|tx| tx.put(record))
    }

    /// Tombstone a record in its own transaction.
    pub fn delete(&mut self, model: &str, id: &str, timestamp: Timestamp) -> Result<Record> {
        self.transaction(|tx| tx.delete(model, id, timestamp))
    }

    /// Apply one server record if it is newer than the stored state.
    pub fn apply_remote(&mut self, record: Record) -> Result<ApplyOutcome> {
        self.registry.require(&record.model)?;
        Ok(self.apply_remote_unchecked(record))
    }

    /// Apply a batch of server records atomically.
    ///
    /// Every record is checked against the registry before anything is
    /// written. Records whose version is not newer than the stored one are
    /// skipped, so re-applying a batch leaves the store unchanged.
    pub fn apply_remote_batch(&mut self, records: &[Record]) -> Result<BatchReport> {
        for record in records {
            self.registry.require(&record.model)?;
        }

        let mut report = BatchReport::default();
        for record in records {
            match self.apply_remote_unchecked(record.clone()) {
                ApplyOutcome::Applied => report.applied += 1,
                ApplyOutcome::Stale => report.stale += 1,
            }
        }

        Ok(report)
    }

    fn apply_remote_unchecked(&mut self, record: Record) -> ApplyOutcome {
        let key = record.key();
        match self.records.get(&key) {
            Some(existing) if existing.version >= record.version => ApplyOutcome::Stale,
            _ => {
                self.records.insert(key, record);
                ApplyOutcome::Applied
            }
        }
    }

    /// Replace a record regardless of version. Used when a conflict
    /// resolution decides the authoritative state.
    pub fn overwrite(&mut self, record: Record) -> Result<()> {
        self.registry.require(&record.model)?;
        self.records.insert(record.key(), record);
        Ok(())
    }

    /// Get the sync cursor of a model.
    pub fn cursor(&self, model: &str) -> Option<&SyncCursor> {
        self.cursors.get(model)
    }

    /// All cursors by model.
    pub fn cursors(&self) -> &BTreeMap<ModelName, SyncCursor> {
        &self.cursors
    }

    /// Advance a model's sync cursor.
    pub fn set_cursor(&mut self, model: impl Into<ModelName>, cursor: SyncCursor) {
        self.cursors.insert(model.into(), cursor);
    }

    /// Physically remove tombstones older than `retention_ms`.
    ///
    /// `is_pending` protects tombstones that still have queued mutations.
    pub fn compact_tombstones<F>(&mut self, now: Timestamp, retention_ms: u64, is_pending: F) -> usize
    where
        F: Fn(&RecordKey) -> bool,
    {
        let before = self.records.len();
        self.records.retain(|key, record| {
            !(record.deleted
                && now.saturating_sub(record.last_changed_at) >= retention_ms
                && !is_pending(key))
        });
        before - self.records.len()
    }

    /// Remove every record and cursor.
    pub fn clear(&mut self) {
        self.records.clear();
        self.cursors.clear();
    }

    pub(crate) fn load(
        &mut self,
        records: impl IntoIterator<Item = Record>,
        cursors: BTreeMap<ModelName, SyncCursor>,
    ) {
        self.records = records.into_iter().map(|r| (r.key(), r)).collect();
        self.cursors = cursors.into_iter().collect();
    }

    /// Start journaling record and cursor writes.
    pub fn begin_changes(&mut self) {
        self.records.begin();
        self.cursors.begin();
    }

    /// Undo every write since [`begin_changes`](Self::begin_changes).
    pub fn rollback_changes(&mut self) {
        self.records.rollback();
        self.cursors.rollback();
    }

    /// Keep the journaled writes and stop journaling.
    pub fn settle_changes(&mut self) {
        self.records.settle();
        self.cursors.settle();
    }

    /// Add the current state of every journaled record and cursor.
    pub fn collect_changes(&self, changes: &mut ChangeSet) {
        for (key, record) in self.records.changes() {
            match record {
                Some(record) => changes.records.push(record.clone()),
                None => changes.removed_records.push(key.clone()),
            }
        }
        for (model, cursor) in self.cursors.changes() {
            match cursor {
                Some(cursor) => {
                    changes.cursors.insert(model.clone(), cursor.clone());
                }
                None => changes.removed_cursors.push(model.clone()),
            }
        }
    }
}

/// Staged writes of one [`LocalStore::transaction`].
///
/// Reads see the transaction's own writes first, then the committed state.
#[derive(Debug)]
pub struct Transaction<'a> {
    registry: &'a ModelRegistry,
    committed: &'a BTreeMap<RecordKey, Record>,
    writes: BTreeMap<RecordKey, Record>,
}

impl<'a> Transaction<'a> {
    fn new(registry: &'a ModelRegistry, committed: &'a BTreeMap<RecordKey, Record>) -> Self {
        Self {
            registry,
            committed,
            writes: BTreeMap::new(),
        }
    }

    /// Get an active record as seen by this transaction.
    pub fn get(&self, model: &str, id: &str) -> Option<&Record> {
        self.get_including_deleted(model, id)
            .filter(|r| r.is_active())
    }

    /// Get a record including tombstones as seen by this transaction.
    pub fn get_including_deleted(&self, model: &str, id: &str) -> Option<&Record> {
        let key = RecordKey::new(model, id);
        self.writes.get(&key).or_else(|| self.committed.get(&key))
    }

    /// Stage a record write. Active records are validated against their model.
    pub fn put(&mut self, record: Record) -> Result<()> {
        let schema = self.registry.require(&record.model)?;
        if record.is_active() {
            schema.validate_payload(&record.payload)?;
        }
        self.writes.insert(record.key(), record);
        Ok(())
    }

    /// Stage a tombstone for an active record and return it.
    pub fn delete(&mut self, model: &str, id: &str, timestamp: Timestamp) -> Result<Record> {
        self.registry.require(model)?;
        let mut record = self
            .get_including_deleted(model, id)
            .cloned()
            .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;

        if record.deleted {
            return Err(Error::OperationOnDeleted(id.to_string()));
        }

        record.mark_deleted(timestamp);
        self.writes.insert(record.key(), record.clone());
        Ok(record)
    }

    /// Active records of a model as seen by this transaction.
    fn visible_records(&self, model: &str) -> Vec<&Record> {
        let committed = self
            .committed
            .range(model_start(model)..)
            .take_while(|(key, _)| key.model == model)
            .filter(|(key, _)| !self.writes.contains_key(*key))
            .map(|(_, record)| record);
        let staged = self
            .writes
            .range(model_start(model)..)
            .take_while(|(key, _)| key.model == model)
            .map(|(_, record)| record);

        committed
            .chain(staged)
            .filter(|r| r.is_active())
            .collect()
    }

    fn check_relationships(&self) -> Result<()> {
        for record in self.writes.values() {
            if record.is_active() {
                self.check_parents(record)?;
            } else {
                self.check_children(record)?;
            }
        }
        Ok(())
    }

    /// Every parent an active record points at must be active.
    fn check_parents(&self, record: &Record) -> Result<()> {
        let Some(schema) = self.registry.get(&record.model) else {
            return Ok(());
        };

        for rel in &schema.belongs_to {
            let Some(parent_id) = record.payload.get(&rel.field).and_then(|v| v.as_str()) else {
                continue;
            };
            if self.get(&rel.target, parent_id).is_none() {
                return Err(Error::ConstraintViolation {
                    model: record.model.clone(),
                    id: record.id.clone(),
                    field: rel.field.clone(),
                    target: rel.target.clone(),
                });
            }
        }
        Ok(())
    }

    /// A tombstoned record must not leave active children behind.
    fn check_children(&self, parent: &Record) -> Result<()> {
        for child_model in self.registry.models.values() {
            for rel in child_model.belongs_to.iter().filter(|r| r.target == parent.model) {
                let orphan = self.visible_records(&child_model.name).into_iter().find(|child| {
                    child.payload.get(&rel.field).and_then(|v| v.as_str())
                        == Some(parent.id.as_str())
                });
                if let Some(child) = orphan {
                    return Err(Error::ConstraintViolation {
                        model: child.model.clone(),
                        id: child.id.clone(),
                        field: rel.field.clone(),
                        target: parent.model.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
