//! An in-process sync server.
//!
//! [`InMemoryRemote`] implements [`RemoteSyncChannel`] with the same version
//! rules a real server applies, and adds knobs for injecting failures. It
//! backs the demo binary and the integration tests.
//!
//! Cursors are the server's change sequence number, rendered as a string.

use crate::channel::{ChangeBatch, Page, RemoteSyncChannel, SendOutcome};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use drift_engine::{
    ModelName, MutationEvent, MutationKind, Record, RecordKey, SyncCursor, Timestamp,
};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// What the live feed carries.
#[derive(Debug, Clone)]
enum Feed {
    Batch(ChangeBatch),
    /// Drop every open subscription
    Disconnect,
}

#[derive(Debug, Default)]
struct ServerState {
    /// Record and the sequence number of its last change
    records: BTreeMap<RecordKey, (Record, u64)>,
    sequence: u64,
    accepted: Vec<MutationEvent>,
    send_attempts: usize,
    fail_sends: u32,
    fail_all_sends: bool,
    reject_sends: u32,
    fail_pages: u32,
    fail_subscribes: u32,
    send_delay: Option<Duration>,
    required_token: Option<String>,
}

impl ServerState {
    fn check_token(&self, token: &str) -> Result<()> {
        match &self.required_token {
            Some(required) if required != token => {
                Err(SyncError::Auth("token rejected".into()))
            }
            _ => Ok(()),
        }
    }

    /// Store a record as the next change and return the batch to broadcast.
    fn commit(&mut self, record: Record) -> ChangeBatch {
        self.sequence += 1;
        let cursor = SyncCursor::new(self.sequence.to_string());
        let cursors = BTreeMap::from([(record.model.clone(), cursor)]);
        self.records
            .insert(record.key(), (record.clone(), self.sequence));
        ChangeBatch {
            changes: vec![record],
            cursors,
        }
    }

    /// Changes after the given cursors, oldest first.
    fn changes_since(&self, cursors: &BTreeMap<ModelName, SyncCursor>) -> ChangeBatch {
        let mut changed: Vec<&(Record, u64)> = self
            .records
            .values()
            .filter(|(record, sequence)| *sequence > position(cursors.get(&record.model)))
            .collect();
        changed.sort_by_key(|(_, sequence)| *sequence);

        let current = SyncCursor::new(self.sequence.to_string());
        let mut batch_cursors: BTreeMap<ModelName, SyncCursor> = cursors
            .keys()
            .map(|model| (model.clone(), current.clone()))
            .collect();
        for (record, _) in &changed {
            batch_cursors.insert(record.model.clone(), current.clone());
        }

        ChangeBatch {
            changes: changed.into_iter().map(|(r, _)| r.clone()).collect(),
            cursors: batch_cursors,
        }
    }
}

fn position(cursor: Option<&SyncCursor>) -> u64 {
    cursor.and_then(|c| c.as_str().parse().ok()).unwrap_or(0)
}

fn take(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

/// In-memory implementation of [`RemoteSyncChannel`].
#[derive(Debug)]
pub struct InMemoryRemote {
    state: Mutex<ServerState>,
    feed: broadcast::Sender<Feed>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(ServerState::default()),
            feed,
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Load records as they are, without notifying subscribers.
    pub fn seed(&self, records: impl IntoIterator<Item = Record>) {
        let mut state = self.state.lock();
        for record in records {
            state.commit(record);
        }
    }

    /// Another client changes a record: its fields are merged, the version
    /// is bumped and subscribers are notified.
    pub fn remote_write(
        &self,
        model: &str,
        id: &str,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> Record {
        let batch = {
            let mut state = self.state.lock();
            let record = match state.records.get(&RecordKey::new(model, id)) {
                Some((existing, _)) => {
                    let mut record = existing.clone();
                    record.merge_payload(&payload, timestamp);
                    record.deleted = false;
                    record.with_version(existing.version + 1)
                }
                None => Record::new(id, model, payload, timestamp).with_version(1),
            };
            state.commit(record)
        };
        self.publish(batch)
    }

    /// Another client deletes a record.
    pub fn remote_delete(&self, model: &str, id: &str, timestamp: Timestamp) -> Option<Record> {
        let batch = {
            let mut state = self.state.lock();
            let (existing, _) = state.records.get(&RecordKey::new(model, id))?;
            let mut record = existing.clone();
            record.mark_deleted(timestamp);
            record.version += 1;
            state.commit(record)
        };
        Some(self.publish(batch))
    }

    fn publish(&self, batch: ChangeBatch) -> Record {
        let record = batch.changes[0].clone();
        let _ = self.feed.send(Feed::Batch(batch));
        record
    }

    /// Server copy of a record, tombstones included.
    pub fn record(&self, model: &str, id: &str) -> Option<Record> {
        self.state
            .lock()
            .records
            .get(&RecordKey::new(model, id))
            .map(|(record, _)| record.clone())
    }

    /// Mutations the server accepted, in order.
    pub fn accepted(&self) -> Vec<MutationEvent> {
        self.state.lock().accepted.clone()
    }

    /// Every send that reached the server, failed or not.
    pub fn send_attempts(&self) -> usize {
        self.state.lock().send_attempts
    }

    /// Fail the next `count` sends with a network error.
    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().fail_sends = count;
    }

    /// Fail every send with a network error until switched off.
    pub fn fail_all_sends(&self, fail: bool) {
        self.state.lock().fail_all_sends = fail;
    }

    /// Reject the next `count` sends as invalid.
    pub fn reject_next_sends(&self, count: u32) {
        self.state.lock().reject_sends = count;
    }

    /// Fail the next `count` page requests with a network error.
    pub fn fail_next_pages(&self, count: u32) {
        self.state.lock().fail_pages = count;
    }

    /// Fail the next `count` subscribe attempts with a network error.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.state.lock().fail_subscribes = count;
    }

    /// Hold every send for `delay` before answering.
    pub fn delay_sends(&self, delay: Duration) {
        self.state.lock().send_delay = Some(delay);
    }

    /// Reject every call whose token differs from `token`.
    pub fn require_token(&self, token: impl Into<String>) {
        self.state.lock().required_token = Some(token.into());
    }

    /// Drop every open subscription.
    pub fn disconnect_subscribers(&self) {
        let _ = self.feed.send(Feed::Disconnect);
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }
}

#[async_trait]
impl RemoteSyncChannel for InMemoryRemote {
    async fn send(&self, mutation: &MutationEvent, token: String) -> Result<SendOutcome> {
        let delay = self.state.lock().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let batch = {
            let mut state = self.state.lock();
            state.check_token(&token)?;
            state.send_attempts += 1;
            if state.fail_all_sends || take(&mut state.fail_sends) {
                return Err(SyncError::TransientNetwork("connection reset".into()));
            }
            if take(&mut state.reject_sends) {
                return Err(SyncError::SchemaValidation(format!(
                    "server rejected {}",
                    mutation.key()
                )));
            }

            let current = state
                .records
                .get(&mutation.key())
                .map(|(record, _)| record.clone());
            let record = match (mutation.kind, current) {
                (MutationKind::Create, Some(existing)) => {
                    return Ok(SendOutcome::Conflict(existing))
                }
                (MutationKind::Create, None) => Record::new(
                    mutation.record_id.clone(),
                    mutation.model.clone(),
                    mutation.payload.clone(),
                    mutation.created_at,
                )
                .with_version(1),
                (_, None) => {
                    return Err(SyncError::SchemaValidation(format!(
                        "{} does not exist",
                        mutation.key()
                    )))
                }
                (_, Some(existing)) if existing.deleted || existing.version != mutation.version => {
                    return Ok(SendOutcome::Conflict(existing))
                }
                (MutationKind::Update, Some(mut existing)) => {
                    existing.merge_payload(&mutation.payload, mutation.created_at);
                    existing.version += 1;
                    existing
                }
                (MutationKind::Delete, Some(mut existing)) => {
                    existing.mark_deleted(mutation.created_at);
                    existing.version += 1;
                    existing
                }
            };

            state.accepted.push(mutation.clone());
            state.commit(record)
        };

        Ok(SendOutcome::Ack(self.publish(batch)))
    }

    async fn sync_page(
        &self,
        model: &str,
        since: Option<SyncCursor>,
        next_token: Option<String>,
        limit: usize,
        token: String,
    ) -> Result<Page> {
        let mut state = self.state.lock();
        state.check_token(&token)?;
        if take(&mut state.fail_pages) {
            return Err(SyncError::TransientNetwork("page request timed out".into()));
        }

        // The token pins the sequence the first page was served at.
        let (offset, upto) = match next_token.as_deref().and_then(|t| t.split_once(':')) {
            Some((offset, upto)) => (
                offset.parse().unwrap_or(0),
                upto.parse().unwrap_or(state.sequence),
            ),
            None => (0usize, state.sequence),
        };
        let after = position(since.as_ref());

        let mut matching: Vec<&(Record, u64)> = state
            .records
            .values()
            .filter(|(record, sequence)| {
                record.model == model && *sequence > after && *sequence <= upto
            })
            .collect();
        matching.sort_by_key(|(_, sequence)| *sequence);

        let records: Vec<Record> = matching
            .iter()
            .skip(offset)
            .take(limit.max(1))
            .map(|(record, _)| record.clone())
            .collect();
        let served = offset + records.len();
        let next_token = (served < matching.len()).then(|| format!("{}:{}", served, upto));

        Ok(Page {
            records,
            next_token,
            cursor: SyncCursor::new(upto.to_string()),
        })
    }

    async fn subscribe(
        &self,
        cursors: BTreeMap<ModelName, SyncCursor>,
        token: String,
    ) -> Result<BoxStream<'static, Result<ChangeBatch>>> {
        let (catch_up, receiver) = {
            let mut state = self.state.lock();
            state.check_token(&token)?;
            if take(&mut state.fail_subscribes) {
                return Err(SyncError::TransientNetwork("subscribe refused".into()));
            }
            // Subscribing under the lock means no change falls between the
            // catch-up batch and the live feed.
            (state.changes_since(&cursors), self.feed.subscribe())
        };

        let catch_up = (!catch_up.changes.is_empty()).then_some(Ok(catch_up));
        let live = stream::unfold(receiver, |mut receiver| async move {
            let item = match receiver.recv().await {
                Ok(Feed::Batch(batch)) => Ok(batch),
                Ok(Feed::Disconnect) => Err(SyncError::TransientNetwork("connection dropped".into())),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Err(
                    SyncError::TransientNetwork(format!("subscriber lagged by {} changes", skipped)),
                ),
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            Some((item, receiver))
        });

        Ok(stream::iter(catch_up).chain(live).boxed())
    }
}
