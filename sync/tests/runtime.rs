//! The data store running against the in-memory server.

use drift_engine::{
    ConflictOutcome, ConflictStrategy, FieldDef, FieldType, ModelRegistry, ModelSchema, Record,
    RetryPolicy, SyncState,
};
use drift_sync::testing::InMemoryRemote;
use drift_sync::{
    DataStore, ErrorKind, EventName, EventSubscription, MemoryStorage, ReconnectPolicy,
    RotatingTokenProvider, SyncConfig, SyncError, SyncEvent,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn registry() -> ModelRegistry {
    ModelRegistry::new(1).with_model(ModelSchema::new(
        "Post",
        vec![
            FieldDef::required("title", FieldType::String),
            FieldDef::optional("rating", FieldType::Int),
        ],
    ))
}

fn config() -> SyncConfig {
    SyncConfig::new()
        .with_node_id("test-node")
        .with_retry(RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 10,
            multiplier: 2,
            max_delay_ms: 50,
        })
        .with_reconnect(ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2,
        })
        .with_stop_grace(Duration::from_secs(1))
}

fn post(id: &str, title: &str, version: u64) -> Record {
    Record::new(id, "Post", json!({"title": title}), 1_000).with_version(version)
}

fn store(remote: &Arc<InMemoryRemote>, storage: &Arc<MemoryStorage>) -> DataStore {
    store_with(remote, storage, config())
}

fn store_with(remote: &Arc<InMemoryRemote>, storage: &Arc<MemoryStorage>, config: SyncConfig) -> DataStore {
    DataStore::builder(registry())
        .config(config)
        .channel(remote.clone())
        .storage(storage.clone())
        .build()
        .unwrap()
}

async fn expect(events: &mut EventSubscription, name: EventName) -> SyncEvent {
    tokio::time::timeout(WAIT, events.wait_for(name))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", name))
        .unwrap_or_else(|| panic!("event stream closed before {}", name))
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn start_ready(store: &DataStore) -> EventSubscription {
    let mut events = store.subscribe();
    store.start().unwrap();
    expect(&mut events, EventName::Ready).await;
    events
}

#[tokio::test]
async fn paged_base_sync_emits_ready_once() {
    let remote = InMemoryRemote::new_shared();
    remote.seed((0..300).map(|i| post(&format!("p{:03}", i), "seeded", 1)));
    let store = store(&remote, &Arc::new(MemoryStorage::new()));

    let mut events = store.subscribe();
    store.start().unwrap();

    let synced = expect(&mut events, EventName::ModelSynced).await;
    assert_eq!(
        synced,
        SyncEvent::ModelSynced {
            model: "Post".into(),
            count: 300
        }
    );
    expect(&mut events, EventName::Ready).await;
    assert_eq!(store.query("Post", |_| true).len(), 300);
    assert_eq!(store.state(), SyncState::Ready);

    remote.remote_write("Post", "p000", json!({"title": "edited"}), 2_000);
    eventually(|| store.get("Post", "p000").is_some_and(|r| r.version == 2)).await;
    eventually(|| store.state() == SyncState::Ready).await;

    let names: Vec<_> = events.drain().iter().map(SyncEvent::name).collect();
    assert!(!names.contains(&EventName::Ready));

    store.stop().await.unwrap();
}

#[tokio::test]
async fn local_writes_reach_the_server() {
    let remote = InMemoryRemote::new_shared();
    let store = store(&remote, &Arc::new(MemoryStorage::new()));
    let mut events = start_ready(&store).await;

    store.save("Post", "1", json!({"title": "hello"})).unwrap();
    let processed = expect(&mut events, EventName::OutboxMutationProcessed).await;
    let SyncEvent::OutboxMutationProcessed { record, .. } = processed else {
        unreachable!();
    };
    assert_eq!(record.version, 1);
    expect(&mut events, EventName::OutboxStatus).await;

    store.delete("Post", "1").unwrap();
    eventually(|| remote.record("Post", "1").is_some_and(|r| r.deleted)).await;
    eventually(|| store.pending_mutations().is_empty()).await;
    assert!(store.get("Post", "1").is_none());

    store.stop().await.unwrap();
}

#[tokio::test]
async fn create_then_update_is_sent_once() {
    let remote = InMemoryRemote::new_shared();
    let store = store(&remote, &Arc::new(MemoryStorage::new()));

    store.save("Post", "1", json!({"title": "draft"})).unwrap();
    store.save("Post", "1", json!({"rating": 3})).unwrap();

    let mut events = start_ready(&store).await;
    expect(&mut events, EventName::OutboxMutationProcessed).await;

    assert_eq!(remote.accepted().len(), 1);
    assert_eq!(
        remote.record("Post", "1").unwrap().payload,
        json!({"title": "draft", "rating": 3})
    );

    store.stop().await.unwrap();
}

#[tokio::test]
async fn remote_wins_reports_discarded_local_change() {
    let remote = InMemoryRemote::new_shared();
    remote.seed([post("p", "v3", 3)]);
    let store = store(&remote, &Arc::new(MemoryStorage::new()));
    start_ready(&store).await;
    store.stop().await.unwrap();

    // The server moves on while this client edits offline.
    remote.remote_write("Post", "p", json!({"title": "v4"}), 2_000);
    remote.remote_write("Post", "p", json!({"title": "v5"}), 3_000);
    store.save("Post", "p", json!({"title": "mine"})).unwrap();

    let mut events = store.subscribe();
    store.start().unwrap();
    let resolved = expect(&mut events, EventName::ConflictResolved).await;
    let SyncEvent::ConflictResolved { report } = resolved else {
        unreachable!();
    };

    assert_eq!(report.outcome, ConflictOutcome::RemoteApplied);
    assert_eq!(report.local_version, 3);
    assert_eq!(report.remote_version, 5);
    assert_eq!(report.discarded_local_payload, Some(json!({"title": "mine"})));

    let stored = store.get("Post", "p").unwrap();
    assert_eq!(stored.version, 5);
    assert_eq!(stored.payload, json!({"title": "v5"}));
    assert!(store.pending_mutations().is_empty());

    store.stop().await.unwrap();
}

#[tokio::test]
async fn conflict_on_send_is_resolved() {
    let remote = InMemoryRemote::new_shared();
    remote.seed([post("p", "v3", 3)]);
    let store = store(&remote, &Arc::new(MemoryStorage::new()));
    let mut events = start_ready(&store).await;

    remote.delay_sends(Duration::from_millis(100));
    store.save("Post", "p", json!({"rating": 1})).unwrap();
    remote.remote_write("Post", "p", json!({"title": "v4"}), 2_000);

    let SyncEvent::ConflictResolved { report } =
        expect(&mut events, EventName::ConflictResolved).await
    else {
        unreachable!();
    };
    assert_eq!(report.remote_version, 4);
    eventually(|| store.pending_mutations().is_empty()).await;
    assert_eq!(store.get("Post", "p").unwrap().payload, json!({"title": "v4"}));
    assert!(remote.accepted().is_empty());

    store.stop().await.unwrap();
}

#[tokio::test]
async fn local_wins_resubmits_against_new_version() {
    let remote = InMemoryRemote::new_shared();
    remote.seed([post("p", "v3", 3)]);
    let config = config().with_strategy(ConflictStrategy::LocalWins);
    let store = store_with(&remote, &Arc::new(MemoryStorage::new()), config);
    start_ready(&store).await;
    store.stop().await.unwrap();

    remote.remote_write("Post", "p", json!({"title": "server"}), 2_000);
    remote.remote_write("Post", "p", json!({"title": "server"}), 3_000);
    store.save("Post", "p", json!({"rating": 4})).unwrap();

    let mut events = store.subscribe();
    store.start().unwrap();
    let SyncEvent::ConflictResolved { report } =
        expect(&mut events, EventName::ConflictResolved).await
    else {
        unreachable!();
    };
    assert_eq!(report.outcome, ConflictOutcome::LocalResubmitted);

    expect(&mut events, EventName::OutboxMutationProcessed).await;
    let server = remote.record("Post", "p").unwrap();
    assert_eq!(server.version, 6);
    assert_eq!(server.payload, json!({"title": "server", "rating": 4}));
    eventually(|| store.get("Post", "p").is_some_and(|r| r.version == 6)).await;

    store.stop().await.unwrap();
}

fn merge_config<F>(merge: F) -> SyncConfig
where
    F: Fn(&serde_json::Value, &serde_json::Value) -> Result<serde_json::Value, String>
        + Send
        + Sync
        + 'static,
{
    config().with_strategy(ConflictStrategy::merge(merge))
}

/// Edits `p` offline while the server moves it to version 5.
async fn offline_edit_against_newer_server(store: &DataStore, remote: &InMemoryRemote) {
    start_ready(store).await;
    store.stop().await.unwrap();

    remote.remote_write("Post", "p", json!({"title": "server"}), 2_000);
    remote.remote_write("Post", "p", json!({"title": "server"}), 3_000);
    store.save("Post", "p", json!({"rating": 4})).unwrap();
}

#[tokio::test]
async fn merge_combines_both_sides() {
    let remote = InMemoryRemote::new_shared();
    remote.seed([post("p", "v3", 3)]);
    let config = merge_config(|local, remote| {
        let mut merged = remote.clone();
        if let (Some(merged), Some(local)) = (merged.as_object_mut(), local.as_object()) {
            merged.extend(local.clone());
        }
        Ok(merged)
    });
    let store = store_with(&remote, &Arc::new(MemoryStorage::new()), config);
    offline_edit_against_newer_server(&store, &remote).await;

    let mut events = store.subscribe();
    store.start().unwrap();
    let SyncEvent::ConflictResolved { report } =
        expect(&mut events, EventName::ConflictResolved).await
    else {
        unreachable!();
    };
    assert_eq!(report.outcome, ConflictOutcome::Merged);
    assert_eq!(report.remote_version, 5);
    assert_eq!(report.fallback_error, None);

    expect(&mut events, EventName::OutboxMutationProcessed).await;
    let server = remote.record("Post", "p").unwrap();
    assert_eq!(server.version, 6);
    assert_eq!(server.payload, json!({"title": "server", "rating": 4}));
    eventually(|| store.get("Post", "p").is_some_and(|r| r.version == 6)).await;

    let names: Vec<_> = events.drain().iter().map(SyncEvent::name).collect();
    assert!(!names.contains(&EventName::SyncFailed));
    store.stop().await.unwrap();
}

#[tokio::test]
async fn invalid_merge_keeps_server_record_and_reports_failure() {
    let remote = InMemoryRemote::new_shared();
    remote.seed([post("p", "v3", 3)]);
    let config = merge_config(|_, _| Ok(json!({"title": 5})));
    let store = store_with(&remote, &Arc::new(MemoryStorage::new()), config);
    offline_edit_against_newer_server(&store, &remote).await;

    let mut events = store.subscribe();
    store.start().unwrap();
    let SyncEvent::ConflictResolved { report } =
        expect(&mut events, EventName::ConflictResolved).await
    else {
        unreachable!();
    };
    assert_eq!(report.outcome, ConflictOutcome::MergeFallback);
    assert!(report.fallback_error.is_some());
    assert_eq!(report.discarded_local_payload, Some(json!({"rating": 4})));

    let SyncEvent::SyncFailed { kind, message, mutation } =
        expect(&mut events, EventName::SyncFailed).await
    else {
        unreachable!();
    };
    assert_eq!(kind, ErrorKind::SchemaValidation);
    assert!(message.contains("Post/p"));
    assert!(mutation.is_none());

    let stored = store.get("Post", "p").unwrap();
    assert_eq!(stored.version, 5);
    assert_eq!(stored.payload, json!({"title": "server"}));
    assert!(store.pending_mutations().is_empty());
    assert!(remote.accepted().is_empty());
    store.stop().await.unwrap();
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let remote = InMemoryRemote::new_shared();
    let store = store(&remote, &Arc::new(MemoryStorage::new()));
    let mut events = start_ready(&store).await;

    remote.fail_next_sends(2);
    store.save("Post", "1", json!({"title": "retry me"})).unwrap();
    expect(&mut events, EventName::OutboxMutationProcessed).await;

    assert_eq!(remote.send_attempts(), 3);
    store.stop().await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_drop_the_mutation() {
    let remote = InMemoryRemote::new_shared();
    let store = store(&remote, &Arc::new(MemoryStorage::new()));
    let mut events = start_ready(&store).await;

    remote.fail_all_sends(true);
    store.save("Post", "1", json!({"title": "doomed"})).unwrap();

    let SyncEvent::SyncFailed { kind, mutation, .. } =
        expect(&mut events, EventName::SyncFailed).await
    else {
        unreachable!();
    };
    assert_eq!(kind, ErrorKind::TransientNetwork);
    assert_eq!(mutation.unwrap().record_id, "1");
    assert_eq!(remote.send_attempts(), 3);
    assert!(store.pending_mutations().is_empty());
    assert_eq!(store.state(), SyncState::Ready);

    store.stop().await.unwrap();
}

#[tokio::test]
async fn rejected_mutation_is_dropped() {
    let remote = InMemoryRemote::new_shared();
    let store = store(&remote, &Arc::new(MemoryStorage::new()));
    let mut events = start_ready(&store).await;

    remote.reject_next_sends(1);
    store.save("Post", "1", json!({"title": "bad"})).unwrap();

    let SyncEvent::SyncFailed { kind, .. } = expect(&mut events, EventName::SyncFailed).await else {
        unreachable!();
    };
    assert_eq!(kind, ErrorKind::SchemaValidation);
    assert!(store.pending_mutations().is_empty());

    store.stop().await.unwrap();
}

#[tokio::test]
async fn expired_token_is_refreshed_once() {
    let remote = InMemoryRemote::new_shared();
    remote.require_token("fresh");
    let auth = Arc::new(RotatingTokenProvider::new(["stale", "fresh"]));
    let store = DataStore::builder(registry())
        .config(config())
        .channel(remote.clone())
        .auth(auth.clone())
        .build()
        .unwrap();

    let mut events = start_ready(&store).await;
    store.save("Post", "1", json!({"title": "authorized"})).unwrap();
    expect(&mut events, EventName::OutboxMutationProcessed).await;

    assert_eq!(auth.refreshes(), 1);
    store.stop().await.unwrap();
}

#[tokio::test]
async fn second_auth_failure_stops_sync() {
    let remote = InMemoryRemote::new_shared();
    remote.require_token("never");
    let store = DataStore::builder(registry())
        .config(config())
        .channel(remote.clone())
        .auth(Arc::new(RotatingTokenProvider::new(["a", "b"])))
        .build()
        .unwrap();
    store.save("Post", "1", json!({"title": "kept"})).unwrap();

    let mut events = store.subscribe();
    store.start().unwrap();

    let SyncEvent::SyncFailed { kind, mutation, .. } =
        expect(&mut events, EventName::SyncFailed).await
    else {
        unreachable!();
    };
    assert_eq!(kind, ErrorKind::Auth);
    assert!(mutation.is_none());
    expect(&mut events, EventName::Stopped).await;

    assert_eq!(store.state(), SyncState::Stopped);
    assert_eq!(store.pending_mutations().len(), 1);
}

#[tokio::test]
async fn stop_keeps_in_flight_mutation_queued() {
    let remote = InMemoryRemote::new_shared();
    let store = store(&remote, &Arc::new(MemoryStorage::new()));
    let mut events = start_ready(&store).await;

    remote.delay_sends(Duration::from_secs(30));
    store.save("Post", "1", json!({"title": "slow"})).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    store.stop().await.unwrap();
    expect(&mut events, EventName::Stopped).await;
    assert_eq!(store.state(), SyncState::Stopped);
    assert_eq!(store.pending_mutations().len(), 1);

    remote.delay_sends(Duration::ZERO);
    store.start().unwrap();
    expect(&mut events, EventName::Ready).await;
    expect(&mut events, EventName::OutboxMutationProcessed).await;

    store.stop().await.unwrap();
}

#[tokio::test]
async fn start_twice_is_rejected_and_restart_works() {
    let remote = InMemoryRemote::new_shared();
    let store = store(&remote, &Arc::new(MemoryStorage::new()));
    let mut events = start_ready(&store).await;

    assert!(matches!(store.start(), Err(SyncError::InvalidState(_))));
    assert!(matches!(store.clear(), Err(SyncError::InvalidState(_))));

    store.stop().await.unwrap();
    store.stop().await.unwrap();
    store.start().unwrap();
    expect(&mut events, EventName::Ready).await;
    store.stop().await.unwrap();
}

#[tokio::test]
async fn clear_resets_and_resyncs() {
    let remote = InMemoryRemote::new_shared();
    remote.seed([post("1", "server", 1)]);
    let storage = Arc::new(MemoryStorage::new());
    let store = store(&remote, &storage);
    start_ready(&store).await;
    store.stop().await.unwrap();

    store.save("Post", "2", json!({"title": "local only"})).unwrap();
    store.clear().unwrap();
    assert!(store.get("Post", "1").is_none());
    assert!(store.pending_mutations().is_empty());
    assert!(storage.snapshot().is_none());

    start_ready(&store).await;
    assert!(store.get("Post", "1").is_some());
    assert!(store.get("Post", "2").is_none());
    store.stop().await.unwrap();
}

#[tokio::test]
async fn filtered_subscribers_and_unsubscribe() {
    let remote = InMemoryRemote::new_shared();
    let store = store(&remote, &Arc::new(MemoryStorage::new()));
    let mut all = store.subscribe();
    let mut ready = store.subscribe_to(&[EventName::Ready]);

    store.start().unwrap();
    expect(&mut all, EventName::Ready).await;
    assert_eq!(
        tokio::time::timeout(WAIT, ready.recv()).await.unwrap(),
        Some(SyncEvent::Ready)
    );
    assert!(ready.try_recv().is_none());

    assert!(store.unsubscribe(ready.id()));
    store.stop().await.unwrap();
    expect(&mut all, EventName::Stopped).await;
    assert_eq!(ready.recv().await, None);
}

#[tokio::test]
async fn subscription_reconnects_without_second_ready() {
    let remote = InMemoryRemote::new_shared();
    let store = store(&remote, &Arc::new(MemoryStorage::new()));
    let mut events = start_ready(&store).await;

    remote.fail_next_subscribes(1);
    remote.disconnect_subscribers();
    assert_eq!(
        expect(&mut events, EventName::NetworkStatus).await,
        SyncEvent::NetworkStatus { active: false }
    );
    expect(&mut events, EventName::SubscriptionsEstablished).await;

    remote.remote_write("Post", "late", json!({"title": "after reconnect"}), 2_000);
    eventually(|| store.get("Post", "late").is_some()).await;

    let names: Vec<_> = events.drain().iter().map(SyncEvent::name).collect();
    assert!(!names.contains(&EventName::Ready));
    store.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_model_records_do_not_hold_back_known_ones() {
    let remote = InMemoryRemote::new_shared();
    remote.seed([
        post("a", "seeded", 1),
        Record::new("g", "Ghost", json!({}), 1_000).with_version(1),
    ]);
    let storage = Arc::new(MemoryStorage::new());
    {
        let store = store(&remote, &storage);
        let mut events = start_ready(&store).await;

        remote.fail_next_subscribes(1);
        remote.disconnect_subscribers();
        remote.remote_write("Post", "p", json!({"title": "while reconnecting"}), 2_000);
        eventually(|| store.get("Post", "p").is_some()).await;

        let SyncEvent::SyncFailed { kind, message, .. } =
            expect(&mut events, EventName::SyncFailed).await
        else {
            unreachable!();
        };
        assert_eq!(kind, ErrorKind::SchemaValidation);
        assert!(message.contains("Ghost"));
        assert_eq!(store.state(), SyncState::Ready);
        store.stop().await.unwrap();
    }

    // The known record survived the restart with the Ghost record still skipped.
    let store = store(&remote, &storage);
    assert_eq!(
        store.get("Post", "p").unwrap().payload,
        json!({"title": "while reconnecting"})
    );
    assert!(store.get("Post", "a").is_some());
    assert!(store.query("Ghost", |_| true).is_empty());
}

#[tokio::test]
async fn restart_resumes_from_persisted_state() {
    let remote = InMemoryRemote::new_shared();
    let storage = Arc::new(MemoryStorage::new());
    {
        let store = store(&remote, &storage);
        store.save("Post", "1", json!({"title": "offline"})).unwrap();
        store.save("Post", "2", json!({"title": "also offline"})).unwrap();
    }

    let store = store(&remote, &storage);
    assert_eq!(store.pending_mutations().len(), 2);
    let mut events = start_ready(&store).await;
    expect(&mut events, EventName::OutboxMutationProcessed).await;
    expect(&mut events, EventName::OutboxMutationProcessed).await;

    assert_eq!(remote.accepted().len(), 2);
    assert!(store.pending_mutations().is_empty());
    store.stop().await.unwrap();
}

#[tokio::test]
async fn crash_after_server_accepted_does_not_duplicate() {
    let remote = InMemoryRemote::new_shared();
    let storage = Arc::new(MemoryStorage::new());
    {
        let store = store(&remote, &storage);
        store.save("Post", "1", json!({"title": "sent"})).unwrap();
        // The server applies the create but the ack never makes it back.
        let pending = store.pending_mutations();
        drift_sync::RemoteSyncChannel::send(remote.as_ref(), &pending[0], String::new())
            .await
            .unwrap();
    }

    let store = store(&remote, &storage);
    let mut events = store.subscribe();
    store.start().unwrap();
    let SyncEvent::ConflictResolved { report } =
        expect(&mut events, EventName::ConflictResolved).await
    else {
        unreachable!();
    };
    assert_eq!(report.outcome, ConflictOutcome::RemoteApplied);
    expect(&mut events, EventName::Ready).await;

    assert_eq!(remote.accepted().len(), 1);
    assert_eq!(store.get("Post", "1").unwrap().version, 1);
    assert!(store.pending_mutations().is_empty());
    store.stop().await.unwrap();
}

#[tokio::test]
async fn storage_failure_is_fatal() {
    let remote = InMemoryRemote::new_shared();
    let storage = Arc::new(MemoryStorage::new());
    let store = store(&remote, &storage);
    let mut events = start_ready(&store).await;

    storage.fail_persist(true);
    assert!(matches!(
        store.save("Post", "1", json!({"title": "nope"})),
        Err(SyncError::Storage(_))
    ));
    assert!(store.get("Post", "1").is_none());

    remote.remote_write("Post", "2", json!({"title": "incoming"}), 2_000);
    let SyncEvent::SyncFailed { kind, .. } = expect(&mut events, EventName::SyncFailed).await
    else {
        unreachable!();
    };
    assert_eq!(kind, ErrorKind::Storage);
    expect(&mut events, EventName::Stopped).await;
    assert_eq!(store.state(), SyncState::Stopped);
    assert!(store.get("Post", "2").is_none());
}
