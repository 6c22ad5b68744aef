//! # Drift Sync
//!
//! Async runtime around the [`drift_engine`] core: a [`DataStore`] that
//! accepts local writes, pushes them through an outbox, pulls the server's
//! state with a paginated base sync and keeps it current through a live
//! subscription.
//!
//! The network sits behind [`RemoteSyncChannel`], credentials behind
//! [`AuthTokenProvider`] and durability behind [`StorageAdapter`].
//! [`testing::InMemoryRemote`] is a complete in-process server for tests
//! and demos.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use drift_engine::{FieldDef, FieldType, ModelRegistry, ModelSchema};
//! use drift_sync::{testing::InMemoryRemote, DataStore, EventName};
//! use serde_json::json;
//!
//! # async fn demo() -> drift_sync::Result<()> {
//! let registry = ModelRegistry::new(1).with_model(ModelSchema::new(
//!     "Todo",
//!     vec![FieldDef::required("title", FieldType::String)],
//! ));
//!
//! let store = DataStore::builder(registry)
//!     .channel(InMemoryRemote::new_shared())
//!     .build()?;
//!
//! let mut events = store.subscribe_to(&[EventName::Ready]);
//! store.start()?;
//! events.recv().await;
//!
//! store.save("Todo", "todo-1", json!({"title": "Buy milk"}))?;
//! store.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod config;
mod coordinator;
pub mod datastore;
pub mod error;
pub mod events;
pub mod replica;
pub mod storage;
pub mod telemetry;
pub mod testing;
mod workers;

pub use auth::{AuthTokenProvider, RotatingTokenProvider, StaticTokenProvider};
pub use channel::{ChangeBatch, Page, RemoteSyncChannel, SendOutcome};
pub use config::{ConfigError, ReconnectPolicy, SyncConfig};
pub use datastore::{DataStore, DataStoreBuilder};
pub use error::{ErrorKind, Result, SyncError};
pub use events::{EventHub, EventName, EventSubscription, SyncEvent};
pub use replica::{Claim, Integration, LocalWrite, Replica};
pub use storage::{FileStorage, MemoryStorage, StorageAdapter};

pub use drift_engine::SyncState;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> drift_engine::Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
