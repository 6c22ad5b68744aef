//! The remote side of synchronization.
//!
//! [`RemoteSyncChannel`] is the seam to the server: sending local mutations,
//! paging through a model during base sync and subscribing to live changes.
//! The transport is up to the implementation.

use crate::error::Result;
use async_trait::async_trait;
use drift_engine::{ModelName, MutationEvent, Record, SyncCursor};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Server answer to a sent mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "record", rename_all = "camelCase")]
pub enum SendOutcome {
    /// Accepted; the authoritative record with its new version
    Ack(Record),
    /// Rejected because the server holds a newer version
    Conflict(Record),
}

/// One page of a base sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub records: Vec<Record>,
    /// Token for the next page; `None` on the last page
    pub next_token: Option<String>,
    /// Stream position of the model as of this page
    pub cursor: SyncCursor,
}

impl Page {
    pub fn is_last(&self) -> bool {
        self.next_token.is_none()
    }
}

/// A batch of remote changes delivered by the subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub changes: Vec<Record>,
    /// Cursor per model after this batch
    pub cursors: BTreeMap<ModelName, SyncCursor>,
}

/// Transport to the sync server.
#[async_trait]
pub trait RemoteSyncChannel: Send + Sync {
    /// Send one mutation.
    async fn send(&self, mutation: &MutationEvent, token: String) -> Result<SendOutcome>;

    /// Fetch a page of a model's records changed after `since`.
    async fn sync_page(
        &self,
        model: &str,
        since: Option<SyncCursor>,
        next_token: Option<String>,
        limit: usize,
        token: String,
    ) -> Result<Page>;

    /// Subscribe to changes after the given cursors.
    ///
    /// The stream never ends on its own; an `Err` item or the end of the
    /// stream means the connection was lost.
    async fn subscribe(
        &self,
        cursors: BTreeMap<ModelName, SyncCursor>,
        token: String,
    ) -> Result<BoxStream<'static, Result<ChangeBatch>>>;
}
