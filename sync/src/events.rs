//! Lifecycle events and their subscribers.
//!
//! The [`EventHub`] keeps one unbounded channel per subscriber. Each
//! subscriber may restrict itself to a set of event names; events reach every
//! subscriber in emission order. Nothing is persisted: a subscriber only sees
//! events emitted while it is subscribed.

use crate::error::ErrorKind;
use dashmap::DashMap;
use drift_engine::{ConflictReport, ModelName, MutationEvent, MutationId, Record};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events emitted by the sync runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// `start()` was called and the runtime is up
    SyncStarted,
    /// A model finished its base sync
    #[serde(rename_all = "camelCase")]
    ModelSynced { model: ModelName, count: usize },
    /// Every model finished its base sync
    SyncQueriesReady,
    /// The change subscription is live
    SubscriptionsEstablished,
    /// Base sync done and subscription live; once per start
    Ready,
    /// The subscription connection went up or down
    #[serde(rename_all = "camelCase")]
    NetworkStatus { active: bool },
    /// A local change entered the outbox
    #[serde(rename_all = "camelCase")]
    OutboxMutationEnqueued { mutation: MutationEvent },
    /// The server accepted a mutation
    #[serde(rename_all = "camelCase")]
    OutboxMutationProcessed {
        mutation_id: MutationId,
        record: Record,
    },
    /// The outbox became empty or non-empty
    #[serde(rename_all = "camelCase")]
    OutboxStatus { empty: bool },
    /// A conflict was settled
    #[serde(rename_all = "camelCase")]
    ConflictResolved { report: ConflictReport },
    /// Something failed; `mutation` is set when a local change was dropped
    #[serde(rename_all = "camelCase")]
    SyncFailed {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mutation: Option<MutationEvent>,
    },
    /// The runtime has quiesced
    Stopped,
}

impl SyncEvent {
    pub fn name(&self) -> EventName {
        match self {
            SyncEvent::SyncStarted => EventName::SyncStarted,
            SyncEvent::ModelSynced { .. } => EventName::ModelSynced,
            SyncEvent::SyncQueriesReady => EventName::SyncQueriesReady,
            SyncEvent::SubscriptionsEstablished => EventName::SubscriptionsEstablished,
            SyncEvent::Ready => EventName::Ready,
            SyncEvent::NetworkStatus { .. } => EventName::NetworkStatus,
            SyncEvent::OutboxMutationEnqueued { .. } => EventName::OutboxMutationEnqueued,
            SyncEvent::OutboxMutationProcessed { .. } => EventName::OutboxMutationProcessed,
            SyncEvent::OutboxStatus { .. } => EventName::OutboxStatus,
            SyncEvent::ConflictResolved { .. } => EventName::ConflictResolved,
            SyncEvent::SyncFailed { .. } => EventName::SyncFailed,
            SyncEvent::Stopped => EventName::Stopped,
        }
    }
}

/// Event names used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventName {
    SyncStarted,
    ModelSynced,
    SyncQueriesReady,
    SubscriptionsEstablished,
    Ready,
    NetworkStatus,
    OutboxMutationEnqueued,
    OutboxMutationProcessed,
    OutboxStatus,
    ConflictResolved,
    SyncFailed,
    Stopped,
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventName::SyncStarted => "syncStarted",
            EventName::ModelSynced => "modelSynced",
            EventName::SyncQueriesReady => "syncQueriesReady",
            EventName::SubscriptionsEstablished => "subscriptionsEstablished",
            EventName::Ready => "ready",
            EventName::NetworkStatus => "networkStatus",
            EventName::OutboxMutationEnqueued => "outboxMutationEnqueued",
            EventName::OutboxMutationProcessed => "outboxMutationProcessed",
            EventName::OutboxStatus => "outboxStatus",
            EventName::ConflictResolved => "conflictResolved",
            EventName::SyncFailed => "syncFailed",
            EventName::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Sender half of a subscriber channel.
pub type EventSender = mpsc::UnboundedSender<SyncEvent>;

/// A registered subscriber.
#[derive(Debug)]
struct Subscriber {
    filter: Option<HashSet<EventName>>,
    sender: EventSender,
}

impl Subscriber {
    fn wants(&self, name: EventName) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |names| names.contains(&name))
    }
}

/// Receiving end handed to a subscriber.
#[derive(Debug)]
pub struct EventSubscription {
    id: String,
    receiver: mpsc::UnboundedReceiver<SyncEvent>,
}

impl EventSubscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event; `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.receiver.recv().await
    }

    /// Next event if one is already waiting.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.receiver.try_recv().ok()
    }

    /// Everything received so far, without waiting.
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Wait for the first event with the given name, discarding the rest.
    pub async fn wait_for(&mut self, name: EventName) -> Option<SyncEvent> {
        while let Some(event) = self.recv().await {
            if event.name() == name {
                return Some(event);
            }
        }
        None
    }
}

/// Fan-out of [`SyncEvent`]s to subscribers.
///
/// Thread-safe and can be shared across tasks via `Arc`.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: DashMap<String, Subscriber>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a subscriber for every event.
    pub fn subscribe(&self) -> EventSubscription {
        self.register(None)
    }

    /// Register a subscriber for the given event names only.
    pub fn subscribe_to(&self, names: &[EventName]) -> EventSubscription {
        self.register(Some(names.iter().copied().collect()))
    }

    fn register(&self, filter: Option<HashSet<EventName>>) -> EventSubscription {
        let id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();

        self.subscribers
            .insert(id.clone(), Subscriber { filter, sender });

        tracing::debug!(subscription_id = %id, "Event subscriber registered");

        EventSubscription { id, receiver }
    }

    /// Remove a subscriber. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            tracing::debug!(subscription_id = %id, "Event subscriber removed");
        }
        removed
    }

    /// Deliver an event to every interested subscriber.
    ///
    /// Subscribers whose receiver was dropped are removed. Returns the number
    /// of subscribers that received the event.
    pub fn emit(&self, event: SyncEvent) -> usize {
        let name = event.name();
        let mut delivered = 0;

        self.subscribers.retain(|_, subscriber| {
            if !subscriber.wants(name) {
                return true;
            }
            match subscriber.sender.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });

        tracing::trace!(event = %name, recipients = delivered, "Emitted event");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
