//! The application-facing data store.
//!
//! Reads and writes go straight to the local replica and never wait on the
//! network. `start()` spawns the sync runtime on the current tokio runtime;
//! `stop()` shuts it down again.

use crate::auth::{AuthTokenProvider, StaticTokenProvider};
use crate::channel::RemoteSyncChannel;
use crate::config::SyncConfig;
use crate::coordinator;
use crate::error::{Result, SyncError};
use crate::events::{EventHub, EventName, EventSubscription, SyncEvent};
use crate::now_ms;
use crate::replica::{LocalWrite, Replica};
use crate::storage::{FileStorage, MemoryStorage, StorageAdapter};
use drift_engine::{
    ConflictResolver, EnqueueOutcome, ModelRegistry, MutationEvent, Record, StoreSnapshot,
    SyncState,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// State shared by the store handle and the runtime tasks.
pub(crate) struct Shared {
    pub config: SyncConfig,
    pub registry: Arc<ModelRegistry>,
    pub replica: Mutex<Replica>,
    pub storage: Arc<dyn StorageAdapter>,
    pub channel: Arc<dyn RemoteSyncChannel>,
    pub auth: Arc<dyn AuthTokenProvider>,
    pub events: Arc<EventHub>,
    pub resolver: ConflictResolver,
    pub state: watch::Sender<SyncState>,
    /// Wakes the outbox worker when new work may be sendable
    pub outbox_wake: Notify,
    /// Only locked while holding the replica lock
    pub journal: Mutex<JournalState>,
}

/// Where the persisted journal stands.
#[derive(Debug, Default)]
pub(crate) struct JournalState {
    /// Position of the last persisted commit
    pub position: u64,
    /// Commits appended since the last checkpoint
    pub since_checkpoint: usize,
    /// Whether storage holds a checkpoint to append to
    pub has_checkpoint: bool,
}

impl JournalState {
    fn restored(snapshot: Option<&StoreSnapshot>) -> Self {
        Self {
            position: snapshot.map_or(0, |s| s.journal_position),
            since_checkpoint: 0,
            has_checkpoint: snapshot.is_some(),
        }
    }
}

impl Shared {
    /// Change the replica and persist what changed.
    ///
    /// Only the records and mutations `change` touched are written, as one
    /// journal entry. If `change` fails or the entry cannot be persisted,
    /// those writes are undone.
    pub fn commit<T>(&self, change: impl FnOnce(&mut Replica) -> Result<T>) -> Result<T> {
        let mut replica = self.replica.lock();
        replica.begin_changes();

        let result = change(&mut replica).and_then(|value| self.persist(&replica).map(|()| value));

        match result {
            Ok(_) => replica.settle_changes(),
            Err(_) => replica.rollback_changes(),
        }
        result
    }

    /// Append the journaled changes, or write a checkpoint when one is due.
    fn persist(&self, replica: &Replica) -> Result<()> {
        let mut journal = self.journal.lock();
        let changes = replica.changes(journal.position + 1);
        if changes.is_empty() {
            return Ok(());
        }

        if !journal.has_checkpoint || journal.since_checkpoint >= self.config.checkpoint_every {
            let mut snapshot = replica.capture(&self.config.node_id);
            snapshot.journal_position = changes.position;
            self.storage.persist(&snapshot)?;
            journal.has_checkpoint = true;
            journal.since_checkpoint = 0;
            tracing::debug!(
                position = changes.position,
                records = snapshot.record_count(),
                "Checkpoint written"
            );
        } else {
            self.storage.append(&changes)?;
            journal.since_checkpoint += 1;
        }
        journal.position = changes.position;
        Ok(())
    }

    /// Change the replica without persisting. Only for state that is never
    /// persisted, such as in-flight claims.
    pub fn update<T>(&self, change: impl FnOnce(&mut Replica) -> T) -> T {
        change(&mut self.replica.lock())
    }

    pub fn read<T>(&self, view: impl FnOnce(&Replica) -> T) -> T {
        view(&self.replica.lock())
    }

    pub fn emit(&self, event: SyncEvent) {
        self.events.emit(event);
    }

    pub fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }

    pub fn outbox_is_empty(&self) -> bool {
        self.read(|replica| replica.queue().is_empty())
    }
}

/// Handle to a running sync task.
struct Runtime {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A local-first data store.
///
/// Cloning is not supported; share it behind an `Arc`.
pub struct DataStore {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
}

impl DataStore {
    pub fn builder(registry: ModelRegistry) -> DataStoreBuilder {
        DataStoreBuilder::new(registry)
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Create a record, or merge `payload`'s fields into an existing one.
    ///
    /// The write is visible immediately and queued for the server.
    pub fn save(&self, model: &str, id: &str, payload: serde_json::Value) -> Result<Record> {
        let mutation_id = uuid::Uuid::new_v4().to_string();
        let write = self
            .shared
            .commit(|replica| replica.save(model, id, payload, mutation_id, now_ms()))?;
        Ok(self.queued(write))
    }

    /// Tombstone a record and queue the delete.
    pub fn delete(&self, model: &str, id: &str) -> Result<Record> {
        let mutation_id = uuid::Uuid::new_v4().to_string();
        let write = self
            .shared
            .commit(|replica| replica.delete(model, id, mutation_id, now_ms()))?;
        Ok(self.queued(write))
    }

    fn queued(&self, write: LocalWrite) -> Record {
        tracing::debug!(
            model = %write.mutation.model,
            record_id = %write.mutation.record_id,
            kind = ?write.mutation.kind,
            outcome = ?write.outcome,
            "Local write queued"
        );

        if write.outcome != EnqueueOutcome::Cancelled {
            self.shared.emit(SyncEvent::OutboxMutationEnqueued {
                mutation: write.mutation,
            });
        }
        self.shared.emit(SyncEvent::OutboxStatus {
            empty: self.shared.outbox_is_empty(),
        });
        self.shared.outbox_wake.notify_one();

        write.record
    }

    /// An active record.
    pub fn get(&self, model: &str, id: &str) -> Option<Record> {
        self.shared
            .read(|replica| replica.store().get(model, id).cloned())
    }

    /// Active records of a model matching `predicate`.
    pub fn query<F>(&self, model: &str, predicate: F) -> Vec<Record>
    where
        F: Fn(&Record) -> bool,
    {
        self.shared.read(|replica| {
            replica
                .store()
                .query_all(model, |record| predicate(record))
                .cloned()
                .collect()
        })
    }

    /// Mutations waiting for the server, oldest first.
    pub fn pending_mutations(&self) -> Vec<MutationEvent> {
        self.shared.read(|replica| {
            replica
                .queue()
                .iter()
                .map(|entry| entry.mutation.clone())
                .collect()
        })
    }

    pub fn state(&self) -> SyncState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.shared.events.subscribe()
    }

    pub fn subscribe_to(&self, names: &[EventName]) -> EventSubscription {
        self.shared.events.subscribe_to(names)
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// Start syncing. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(SyncError::InvalidState("sync is already running".into()));
        }

        let (cancel, signal) = watch::channel(false);
        let task = tokio::spawn(coordinator::run(Arc::clone(&self.shared), signal));
        *runtime = Some(Runtime { cancel, task });

        tracing::info!(node_id = %self.shared.config.node_id, "Sync started");
        Ok(())
    }

    /// Stop syncing and wait for the runtime to quiesce.
    ///
    /// In-flight sends are cancelled and their mutations stay queued. If the
    /// runtime does not finish within the configured grace period it is
    /// aborted. Stopping a stopped store does nothing.
    pub async fn stop(&self) -> Result<()> {
        let Some(Runtime { cancel, mut task }) = self.runtime.lock().take() else {
            return Ok(());
        };
        if task.is_finished() {
            return Ok(());
        }

        let _ = cancel.send(true);
        let grace = self.shared.config.stop_grace;

        if tokio::time::timeout(grace, &mut task).await.is_err() {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "Sync runtime did not stop in time, aborting"
            );
            task.abort();
            self.shared.update(|replica| replica.queue.release_all());
            self.shared.set_state(SyncState::Stopped);
            self.shared.emit(SyncEvent::Stopped);
        }

        tracing::info!("Sync stopped");
        Ok(())
    }

    /// Wipe every record, cursor and queued mutation. Only while stopped.
    pub fn clear(&self) -> Result<()> {
        let running = self
            .runtime
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished());
        if running || self.state() != SyncState::Stopped {
            return Err(SyncError::InvalidState(
                "clear requires a stopped store".into(),
            ));
        }

        self.shared.storage.wipe()?;
        self.shared.update(Replica::clear);
        *self.shared.journal.lock() = JournalState::default();
        self.shared.emit(SyncEvent::OutboxStatus { empty: true });

        tracing::info!("Local data cleared");
        Ok(())
    }

    /// Purge tombstones older than the configured retention that have no
    /// queued mutations. Also runs on every start.
    pub fn compact_tombstones(&self) -> Result<usize> {
        let retention = self.shared.config.tombstone_retention.as_millis() as u64;
        self.shared
            .commit(|replica| Ok(replica.compact(now_ms(), retention)))
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            let _ = runtime.cancel.send(true);
        }
    }
}

/// Builder for [`DataStore`].
pub struct DataStoreBuilder {
    registry: ModelRegistry,
    config: SyncConfig,
    channel: Option<Arc<dyn RemoteSyncChannel>>,
    auth: Option<Arc<dyn AuthTokenProvider>>,
    storage: Option<Arc<dyn StorageAdapter>>,
    events: Option<Arc<EventHub>>,
}

impl DataStoreBuilder {
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry,
            config: SyncConfig::default(),
            channel: None,
            auth: None,
            storage: None,
            events: None,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Required.
    pub fn channel(mut self, channel: Arc<dyn RemoteSyncChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Defaults to an empty static token.
    pub fn auth(mut self, auth: Arc<dyn AuthTokenProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Defaults to a [`FileStorage`] when `store_path` is configured and to
    /// [`MemoryStorage`] otherwise.
    pub fn storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Share an event hub with other components.
    pub fn events(mut self, events: Arc<EventHub>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the store, restoring the last persisted snapshot if there is one.
    pub fn build(self) -> Result<DataStore> {
        let channel = self
            .channel
            .ok_or_else(|| SyncError::InvalidState("no remote channel configured".into()))?;
        let auth = self
            .auth
            .unwrap_or_else(|| Arc::new(StaticTokenProvider::new("")));
        let storage: Arc<dyn StorageAdapter> = match (self.storage, &self.config.store_path) {
            (Some(storage), _) => storage,
            (None, Some(path)) => Arc::new(FileStorage::new(path)),
            (None, None) => Arc::new(MemoryStorage::new()),
        };

        let registry = Arc::new(self.registry);
        let restored = storage.load()?;
        let journal = JournalState::restored(restored.as_ref());
        let replica = match restored {
            Some(snapshot) => {
                let replica = Replica::restore(snapshot, Arc::clone(&registry))?;
                tracing::info!(
                    records = replica.store().len(),
                    pending = replica.queue().len(),
                    "Restored local snapshot"
                );
                replica
            }
            None => Replica::new(Arc::clone(&registry)),
        };

        let (state, _) = watch::channel(SyncState::Stopped);
        let shared = Shared {
            resolver: ConflictResolver::new(self.config.strategy.clone()),
            config: self.config,
            registry,
            replica: Mutex::new(replica),
            storage,
            channel,
            auth,
            events: self.events.unwrap_or_else(EventHub::new_shared),
            state,
            outbox_wake: Notify::new(),
            journal: Mutex::new(journal),
        };

        Ok(DataStore {
            shared: Arc::new(shared),
            runtime: Mutex::new(None),
        })
    }
}
