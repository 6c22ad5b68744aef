//! Drift demo - runs a data store against an in-process server.
//!
//! Configuration comes from `DRIFT_*` environment variables (a `.env` file
//! is honored), logging from `RUST_LOG`.

use drift_engine::{FieldDef, FieldType, ModelRegistry, ModelSchema, Record};
use drift_sync::testing::InMemoryRemote;
use drift_sync::{now_ms, telemetry, DataStore, EventName, SyncConfig, SyncEvent};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing("drift_sync=debug,drift_demo=info");

    let config = SyncConfig::from_env()?;
    tracing::info!("Starting Drift demo as node {}", config.node_id);

    let registry = ModelRegistry::new(1)
        .with_model(ModelSchema::new(
            "Project",
            vec![FieldDef::required("name", FieldType::String)],
        ))
        .with_model(
            ModelSchema::new(
                "Task",
                vec![
                    FieldDef::required("title", FieldType::String),
                    FieldDef::optional("done", FieldType::Bool),
                    FieldDef::required("project_id", FieldType::String),
                ],
            )
            .belongs_to("project_id", "Project"),
        );

    // Seed the server with data another client already wrote.
    let remote = InMemoryRemote::new_shared();
    let now = now_ms();
    remote.seed([
        Record::new("inbox", "Project", json!({"name": "Inbox"}), now).with_version(1),
        Record::new(
            "welcome",
            "Task",
            json!({"title": "Read the docs", "project_id": "inbox"}),
            now,
        )
        .with_version(1),
    ]);

    let store = DataStore::builder(registry)
        .config(config)
        .channel(remote.clone())
        .build()?;

    let mut events = store.subscribe();
    store.start()?;
    events.wait_for(EventName::Ready).await;
    tracing::info!(
        tasks = store.query("Task", |_| true).len(),
        "Initial sync complete"
    );

    let task_id = uuid::Uuid::new_v4().to_string();
    store.save(
        "Task",
        &task_id,
        json!({"title": "Try Drift", "project_id": "inbox"}),
    )?;
    store.save("Task", &task_id, json!({"done": true}))?;

    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::OutboxMutationProcessed { record, .. } => {
                tracing::info!(
                    record_id = %record.id,
                    version = record.version,
                    "Server accepted local change"
                );
            }
            SyncEvent::OutboxStatus { empty: true } => break,
            SyncEvent::SyncFailed { kind, message, .. } => {
                tracing::error!(%kind, "Sync failed: {}", message);
                break;
            }
            _ => {}
        }
    }

    // A change made elsewhere arrives over the subscription.
    remote.remote_write("Task", "welcome", json!({"done": true}), now_ms());
    let arrived = tokio::time::timeout(Duration::from_secs(5), async {
        while store
            .get("Task", "welcome")
            .map_or(true, |task| task.payload["done"] != json!(true))
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok();
    tracing::info!(arrived, "Remote change received");

    store.stop().await?;
    tracing::info!(
        pending = store.pending_mutations().len(),
        "Demo finished"
    );
    Ok(())
}
