//! # Drift Engine
//!
//! The deterministic core of a local-first sync engine.
//!
//! This crate holds the data model and decision logic for keeping a local
//! record store in sync with a server: the transactional store, the outbox of
//! local mutations, conflict resolution and the sync state machine. The
//! runtime that talks to the network lives in `drift-sync`.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine has no knowledge of files, network or tasks
//! - **Deterministic**: time is always passed in, never read
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] belongs to a model, carries a JSON payload, the last version
//! acknowledged by the server and a tombstone flag. Models are described by a
//! [`ModelSchema`] in a [`ModelRegistry`], including `belongs_to`
//! relationships that local transactions must respect.
//!
//! ### Mutations
//!
//! Local writes produce [`MutationEvent`]s that wait in the
//! [`MutationQueue`]. The queue keeps per-record FIFO order, coalesces unsent
//! changes of the same record and schedules retries with a [`RetryPolicy`].
//!
//! ### Conflicts
//!
//! When the server holds a newer version than a pending mutation was based
//! on, the [`ConflictResolver`] settles it with a [`ConflictStrategy`]:
//! remote wins (default), local wins or a user merge function.
//!
//! ### Lifecycle
//!
//! [`SyncState`] and [`Lifecycle`] describe the
//! `stopped -> baseSyncing -> deltaSyncing -> ready` progression.
//!
//! ## Quick Start
//!
//! ```rust
//! use drift_engine::{
//!     FieldDef, FieldType, LocalStore, ModelRegistry, ModelSchema, MutationEvent,
//!     MutationQueue, Record,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! // 1. Register models
//! let registry = ModelRegistry::new(1).with_model(ModelSchema::new(
//!     "Post",
//!     vec![FieldDef::required("title", FieldType::String)],
//! ));
//!
//! // 2. Create a store and an outbox
//! let mut store = LocalStore::new(Arc::new(registry));
//! let mut queue = MutationQueue::new();
//!
//! // 3. Write locally and queue the change
//! let payload = json!({"title": "Hello"});
//! store.put(Record::new("post-1", "Post", payload.clone(), 1000)).unwrap();
//! queue.enqueue(MutationEvent::create("m-1", "Post", "post-1", payload, 1000));
//!
//! // 4. Hand the change to the network
//! let next = queue.ready(1000).next().unwrap();
//! assert_eq!(next.record_id, "post-1");
//! ```
//!
//! ## Persistence
//!
//! [`StoreSnapshot::capture`] and [`StoreSnapshot::restore`] move the store
//! and queue to and from a deterministic JSON representation.
//! Between full snapshots, the store and queue can record what a commit
//! touched: `begin_changes`, then either `rollback_changes` or
//! `collect_changes` into a [`ChangeSet`] and `settle_changes`. Change sets
//! replay on top of a snapshot with [`StoreSnapshot::apply`].

pub mod conflict;
pub mod error;
pub mod journal;
pub mod lifecycle;
pub mod mutation;
pub mod queue;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use conflict::{
    ConflictOutcome, ConflictReport, ConflictResolver, ConflictStrategy, MergeFn, Resolution,
    StrategyKind,
};
pub use error::Error;
pub use journal::ChangeSet;
pub use lifecycle::{Lifecycle, LifecycleInput, ReadyLatch, SyncState, Transition};
pub use mutation::{MutationEvent, MutationId, MutationKind};
pub use queue::{EnqueueOutcome, MutationQueue, QueuedMutation, RetryOutcome, RetryPolicy};
pub use record::{Record, RecordKey};
pub use schema::{FieldDef, FieldType, ModelRegistry, ModelSchema, Relationship};
pub use snapshot::{SnapshotMetadata, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{ApplyOutcome, BatchReport, LocalStore, SyncCursor, Transaction};

/// Type aliases for clarity
pub type RecordId = String;
pub type ModelName = String;
pub type Version = u64;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
