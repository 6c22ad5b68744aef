//! The local replica: store and outbox under one lock.
//!
//! Every method here is synchronous and runs while the runtime holds the
//! replica mutex, so store and queue never disagree about a record.

use crate::error::Result;
use drift_engine::{
    record::merge_fields, ChangeSet, ConflictReport, ConflictResolver, EnqueueOutcome,
    LocalStore, ModelName, ModelRegistry, MutationEvent, MutationId, MutationKind,
    MutationQueue, Record, RetryOutcome, RetryPolicy, StoreSnapshot, SyncCursor, Timestamp,
};
use std::sync::Arc;

/// Result of a local save or delete.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalWrite {
    pub record: Record,
    pub mutation: MutationEvent,
    pub outcome: EnqueueOutcome,
}

/// What the outbox worker should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Send this mutation
    Mutation(MutationEvent),
    /// Nothing sendable; wake up at the deadline or on the next enqueue
    Idle { next_deadline: Option<Timestamp> },
}

/// Counts for a batch of remote records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Integration {
    pub applied: usize,
    pub stale: usize,
    /// Applied over an in-flight mutation; its answer will settle the record
    pub deferred: usize,
    pub conflicts: Vec<ConflictReport>,
    /// Records of models this replica does not know; left unapplied
    pub rejected: Vec<Record>,
}

impl Integration {
    /// Whether every record of `model` in the batch was taken.
    pub fn complete_for(&self, model: &str) -> bool {
        !self.rejected.iter().any(|record| record.model == model)
    }
}

#[derive(Debug, Clone)]
pub struct Replica {
    pub(crate) store: LocalStore,
    pub(crate) queue: MutationQueue,
}

impl Replica {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            store: LocalStore::new(registry),
            queue: MutationQueue::new(),
        }
    }

    pub fn restore(snapshot: StoreSnapshot, registry: Arc<ModelRegistry>) -> Result<Self> {
        let (store, queue) = snapshot.restore(registry)?;
        Ok(Self { store, queue })
    }

    pub fn capture(&self, node_id: &str) -> StoreSnapshot {
        StoreSnapshot::capture(node_id, &self.store, &self.queue)
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Start journaling writes to the store and the queue.
    pub fn begin_changes(&mut self) {
        self.store.begin_changes();
        self.queue.begin_changes();
    }

    /// Undo everything written since [`begin_changes`](Self::begin_changes).
    pub fn rollback_changes(&mut self) {
        self.store.rollback_changes();
        self.queue.rollback_changes();
    }

    pub fn settle_changes(&mut self) {
        self.store.settle_changes();
        self.queue.settle_changes();
    }

    /// What the journaled writes changed, positioned at `position`.
    pub fn changes(&self, position: u64) -> ChangeSet {
        let mut changes = ChangeSet {
            position,
            ..ChangeSet::default()
        };
        self.store.collect_changes(&mut changes);
        self.queue.collect_changes(&mut changes);
        changes
    }

    /// Create a record or merge fields into an existing one, and queue the
    /// change.
    pub fn save(
        &mut self,
        model: &str,
        id: &str,
        payload: serde_json::Value,
        mutation_id: MutationId,
        now: Timestamp,
    ) -> Result<LocalWrite> {
        let (record, mutation) = self.store.transaction(|tx| {
            match tx.get_including_deleted(model, id).cloned() {
                Some(existing) if existing.deleted => {
                    Err(drift_engine::Error::OperationOnDeleted(id.to_string()))
                }
                Some(mut existing) => {
                    existing.merge_payload(&payload, now);
                    let mutation =
                        MutationEvent::update(mutation_id, model, id, payload, existing.version, now);
                    tx.put(existing.clone())?;
                    Ok((existing, mutation))
                }
                None => {
                    let record = Record::new(id, model, payload.clone(), now);
                    tx.put(record.clone())?;
                    Ok((record, MutationEvent::create(mutation_id, model, id, payload, now)))
                }
            }
        })?;

        let outcome = self.queue.enqueue(mutation.clone());
        Ok(LocalWrite {
            record,
            mutation,
            outcome,
        })
    }

    /// Tombstone a record and queue the delete.
    pub fn delete(
        &mut self,
        model: &str,
        id: &str,
        mutation_id: MutationId,
        now: Timestamp,
    ) -> Result<LocalWrite> {
        let record = self.store.delete(model, id, now)?;
        let mutation = MutationEvent::delete(mutation_id, model, id, record.version, now);
        let outcome = self.queue.enqueue(mutation.clone());
        Ok(LocalWrite {
            record,
            mutation,
            outcome,
        })
    }

    /// Claim the oldest sendable mutation.
    pub fn claim_next(&mut self, now: Timestamp) -> Claim {
        let next = self.queue.ready(now).next().map(|m| m.id.clone());
        match next.and_then(|id| self.queue.claim(&id).ok()) {
            Some(mutation) => Claim::Mutation(mutation),
            None => Claim::Idle {
                next_deadline: self.queue.next_deadline(),
            },
        }
    }

    /// The server accepted a mutation. Returns false if it was no longer
    /// queued.
    pub fn acknowledge(&mut self, mutation_id: &str, record: Record) -> Result<bool> {
        if self.queue.acknowledge(mutation_id).is_none() {
            return Ok(false);
        }
        self.queue.rebase_record(&record.key(), record.version);
        self.store_server_record(record)?;
        Ok(true)
    }

    /// The server rejected a mutation because it holds a newer version.
    pub fn settle_conflict(
        &mut self,
        mutation_id: &str,
        remote: Record,
        resolver: &ConflictResolver,
    ) -> Result<Option<ConflictReport>> {
        let Some(local) = self.queue.get(mutation_id).map(|e| e.mutation.clone()) else {
            return Ok(None);
        };

        let resolution = resolver.resolve(&local, &remote, self.store.registry());
        match resolution.resubmit {
            Some(resubmit) => self.queue.replace(mutation_id, resubmit)?,
            None => {
                self.queue.remove(mutation_id);
            }
        }
        if let Some(record) = resolution.apply {
            let view = self.with_pending_changes(record);
            self.store.overwrite(view)?;
        }

        Ok(Some(resolution.report))
    }

    /// Record a failed send. `None` if the mutation is gone.
    pub fn retry(
        &mut self,
        mutation_id: &str,
        now: Timestamp,
        policy: &RetryPolicy,
    ) -> Option<RetryOutcome> {
        self.queue.schedule_retry(mutation_id, now, policy).ok()
    }

    /// Apply server records, settling conflicts with pending local changes.
    ///
    /// Records of unknown models are skipped and returned in
    /// [`Integration::rejected`]; the rest of the batch is applied.
    pub fn integrate_remote(
        &mut self,
        records: &[Record],
        resolver: &ConflictResolver,
    ) -> Result<Integration> {
        let mut integration = Integration::default();
        for remote in records {
            if self.store.registry().get(&remote.model).is_none() {
                integration.rejected.push(remote.clone());
                continue;
            }

            let key = remote.key();
            let stored = self
                .store
                .get_including_deleted(&remote.model, &remote.id)
                .map(|r| r.version);
            if stored.is_some_and(|version| version >= remote.version) {
                integration.stale += 1;
                continue;
            }

            let head = self.queue.pending_for(&key).next().cloned();
            match head {
                None => {
                    self.store.apply_remote(remote.clone())?;
                    integration.applied += 1;
                }
                Some(entry) if entry.in_flight => {
                    let view = self.with_pending_changes(remote.clone());
                    self.store.overwrite(view)?;
                    integration.deferred += 1;
                }
                Some(entry) if ConflictResolver::detects(&entry.mutation, remote) => {
                    if let Some(report) =
                        self.settle_conflict(&entry.mutation.id, remote.clone(), resolver)?
                    {
                        integration.conflicts.push(report);
                    }
                }
                Some(_) => {
                    let view = self.with_pending_changes(remote.clone());
                    self.store.overwrite(view)?;
                    integration.applied += 1;
                }
            }
        }

        Ok(integration)
    }

    pub fn set_cursors<'a>(
        &mut self,
        cursors: impl IntoIterator<Item = (&'a ModelName, &'a SyncCursor)>,
    ) {
        for (model, cursor) in cursors {
            self.store.set_cursor(model.clone(), cursor.clone());
        }
    }

    /// Purge old tombstones that have nothing queued.
    pub fn compact(&mut self, now: Timestamp, retention_ms: u64) -> usize {
        let Replica { store, queue } = self;
        store.compact_tombstones(now, retention_ms, |key| queue.has_pending(key))
    }

    pub fn clear(&mut self) {
        self.store.clear();
        self.queue.clear();
    }

    /// Store a server record unless the store already holds a newer version.
    fn store_server_record(&mut self, record: Record) -> Result<()> {
        let newer = self
            .store
            .get_including_deleted(&record.model, &record.id)
            .map_or(true, |stored| stored.version < record.version);
        if newer {
            let view = self.with_pending_changes(record);
            self.store.overwrite(view)?;
        }
        Ok(())
    }

    /// The local view of a server record: queued changes replayed on top.
    fn with_pending_changes(&self, mut record: Record) -> Record {
        if record.deleted {
            return record;
        }
        for entry in self.queue.pending_for(&record.key()) {
            let mutation = &entry.mutation;
            match mutation.kind {
                MutationKind::Create => record.payload = mutation.payload.clone(),
                MutationKind::Update => merge_fields(&mut record.payload, &mutation.payload),
                MutationKind::Delete => record.deleted = true,
            }
            record.last_changed_at = record.last_changed_at.max(mutation.created_at);
        }
        record
    }
}
