//! The sync coordinator.
//!
//! One task per `start()`. It runs the base sync, then spawns the outbox and
//! subscription workers and applies everything they report, one message at
//! a time. The lifecycle state machine is only ever driven from here.

use crate::auth::with_token;
use crate::channel::{ChangeBatch, SendOutcome};
use crate::datastore::Shared;
use crate::error::{ErrorKind, Result, SyncError};
use crate::events::SyncEvent;
use crate::now_ms;
use crate::replica::{Claim, Integration};
use crate::workers::{self, cancelled, or_cancel};
use drift_engine::{
    ConflictOutcome, ConflictReport, Lifecycle, LifecycleInput, MutationEvent, RetryOutcome,
    SyncState, Transition,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Messages from the workers.
pub(crate) enum CoordinatorMsg {
    /// The outbox worker asks for its next mutation
    ClaimReady { reply: oneshot::Sender<Claim> },
    /// The answer to a sent mutation
    SendResult {
        mutation: MutationEvent,
        result: Result<SendOutcome>,
    },
    SubscriptionEstablished,
    /// A batch from the subscription; `applied` answers once it is handled,
    /// with `false` if it could not be stored
    RemoteBatch {
        batch: ChangeBatch,
        applied: oneshot::Sender<bool>,
    },
    /// The subscription dropped and is reconnecting
    Disconnected { error: SyncError },
    /// A worker hit an unrecoverable error
    Fatal(SyncError),
}

enum Exit {
    Stopped,
    Failed(SyncError),
}

pub(crate) async fn run(shared: Arc<Shared>, cancel: watch::Receiver<bool>) {
    let mut coordinator = Coordinator::new(shared, cancel);
    let exit = coordinator.drive().await;
    coordinator.shutdown(exit).await;
}

struct Coordinator {
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
    cancel: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<CoordinatorMsg>,
    rx: mpsc::UnboundedReceiver<CoordinatorMsg>,
    stop_workers: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Coordinator {
    fn new(shared: Arc<Shared>, cancel: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_workers, _) = watch::channel(false);
        Self {
            shared,
            lifecycle: Lifecycle::new(),
            cancel,
            tx,
            rx,
            stop_workers,
            workers: Vec::new(),
        }
    }

    async fn drive(&mut self) -> Exit {
        if let Err(e) = self.transition(LifecycleInput::Start) {
            return Exit::Failed(e);
        }
        self.shared.emit(SyncEvent::SyncStarted);
        self.compact();

        match self.base_sync().await {
            Ok(()) => {}
            Err(SyncError::Cancelled) => return Exit::Stopped,
            Err(e) => return Exit::Failed(e),
        }

        self.shared.emit(SyncEvent::SyncQueriesReady);
        if let Err(e) = self.transition(LifecycleInput::BaseSyncComplete) {
            return Exit::Failed(e);
        }
        self.spawn_workers();
        self.shared.emit(SyncEvent::OutboxStatus {
            empty: self.shared.outbox_is_empty(),
        });

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return Exit::Stopped,
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { return Exit::Stopped };
                    if let Err(e) = self.handle(msg) {
                        return Exit::Failed(e);
                    }
                }
            }
        }
    }

    fn compact(&self) {
        let retention = self.shared.config.tombstone_retention.as_millis() as u64;
        match self
            .shared
            .commit(|replica| Ok(replica.compact(now_ms(), retention)))
        {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(purged, "Compacted tombstones"),
            Err(e) => tracing::warn!(error = %e, "Tombstone compaction failed"),
        }
    }

    /// Page through every model, parents first.
    ///
    /// Each page is applied in its own commit. A model's cursor advances with
    /// its last page, so an interrupted sync starts that model over.
    async fn base_sync(&mut self) -> Result<()> {
        let channel = self.shared.channel.as_ref();
        let auth = self.shared.auth.as_ref();
        let limit = self.shared.config.page_size;

        for model in self.shared.registry.sync_order() {
            let since = self.shared.read(|r| r.store().cursor(&model).cloned());
            let mut next_token: Option<String> = None;
            let mut count = 0;

            loop {
                let model_name = model.as_str();
                let since_ref = &since;
                let page_token = next_token.take();
                let token_ref = &page_token;

                let page = or_cancel(
                    &mut self.cancel,
                    with_token(auth, move |token| {
                        channel.sync_page(
                            model_name,
                            since_ref.clone(),
                            token_ref.clone(),
                            limit,
                            token,
                        )
                    }),
                )
                .await?;

                let last = page.is_last();
                count += page.records.len();
                let cursor = page.cursor;
                let records = page.records;
                let resolver = &self.shared.resolver;

                let integration = self.shared.commit(|replica| {
                    let integration = replica.integrate_remote(&records, resolver)?;
                    if last && integration.complete_for(&model) {
                        replica.store.set_cursor(model.clone(), cursor);
                    }
                    Ok(integration)
                })?;
                self.report(integration);

                if last {
                    break;
                }
                next_token = page.next_token;
            }

            tracing::info!(model = %model, count, "Base sync of model complete");
            self.shared.emit(SyncEvent::ModelSynced { model, count });
        }

        Ok(())
    }

    fn spawn_workers(&mut self) {
        let outbox = tokio::spawn(workers::run_outbox(
            Arc::clone(&self.shared),
            self.tx.clone(),
            self.stop_workers.subscribe(),
        ));
        let subscription = tokio::spawn(workers::run_subscription(
            Arc::clone(&self.shared),
            self.tx.clone(),
            self.stop_workers.subscribe(),
        ));
        self.workers = vec![outbox, subscription];
    }

    /// Handle one worker message. An error ends the sync cycle.
    fn handle(&mut self, msg: CoordinatorMsg) -> Result<()> {
        match msg {
            CoordinatorMsg::ClaimReady { reply } => {
                let claim = self.shared.update(|replica| replica.claim_next(now_ms()));
                if let Err(Claim::Mutation(mutation)) = reply.send(claim) {
                    self.shared.update(|replica| replica.queue.release(&mutation.id));
                }
            }

            CoordinatorMsg::SendResult { mutation, result } => {
                self.on_send_result(mutation, result)?;
                self.shared.outbox_wake.notify_one();
            }

            CoordinatorMsg::SubscriptionEstablished => {
                let transition = self.transition(LifecycleInput::SubscriptionEstablished)?;
                self.shared.emit(SyncEvent::SubscriptionsEstablished);
                self.shared.emit(SyncEvent::NetworkStatus { active: true });
                if transition.emit_ready {
                    tracing::info!("Sync ready");
                    self.shared.emit(SyncEvent::Ready);
                }
            }

            CoordinatorMsg::RemoteBatch { batch, applied } => {
                self.transition(LifecycleInput::BatchReceived)?;
                let stored = self.apply_batch(batch)?;
                self.transition(LifecycleInput::BatchApplied)?;
                let _ = applied.send(stored);
            }

            CoordinatorMsg::Disconnected { error } => {
                tracing::warn!(error = %error, "Subscription lost");
                self.transition(LifecycleInput::ConnectionLost)?;
                self.shared.emit(SyncEvent::NetworkStatus { active: false });
            }

            CoordinatorMsg::Fatal(error) => return Err(error),
        }
        Ok(())
    }

    /// Store a remote batch. Returns whether it was stored.
    ///
    /// A model's cursor only moves when all of its records in the batch were
    /// taken, so skipped records come back with the next catch-up.
    fn apply_batch(&mut self, batch: ChangeBatch) -> Result<bool> {
        let resolver = &self.shared.resolver;
        let result = self.shared.commit(|replica| {
            let integration = replica.integrate_remote(&batch.changes, resolver)?;
            replica.set_cursors(
                batch
                    .cursors
                    .iter()
                    .filter(|(model, _)| integration.complete_for(model)),
            );
            Ok(integration)
        });

        match result {
            Ok(integration) => {
                tracing::debug!(
                    applied = integration.applied,
                    stale = integration.stale,
                    deferred = integration.deferred,
                    skipped = integration.rejected.len(),
                    "Remote batch applied"
                );
                self.report(integration);
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, changes = batch.changes.len(), "Remote batch not stored");
                self.shared.emit(SyncEvent::SyncFailed {
                    kind: e.kind(),
                    message: e.to_string(),
                    mutation: None,
                });
                Ok(false)
            }
        }
    }

    fn on_send_result(&mut self, mutation: MutationEvent, result: Result<SendOutcome>) -> Result<()> {
        let id = mutation.id.as_str();

        match result {
            Ok(SendOutcome::Ack(record)) => {
                let acked = self
                    .shared
                    .commit(|replica| replica.acknowledge(id, record.clone()))?;
                if acked {
                    tracing::debug!(
                        mutation_id = %id,
                        version = record.version,
                        "Mutation acknowledged"
                    );
                    self.shared.emit(SyncEvent::OutboxMutationProcessed {
                        mutation_id: mutation.id.clone(),
                        record,
                    });
                    self.emit_outbox_drained();
                }
            }

            Ok(SendOutcome::Conflict(remote)) => {
                let resolver = &self.shared.resolver;
                let report = self
                    .shared
                    .commit(|replica| replica.settle_conflict(id, remote, resolver))?;
                if let Some(report) = report {
                    self.report_conflict(report);
                    self.emit_outbox_drained();
                }
            }

            Err(SyncError::Cancelled) => {
                self.shared.update(|replica| replica.queue.release(id));
            }

            Err(e) if e.is_fatal() => {
                self.shared.update(|replica| replica.queue.release(id));
                return Err(e);
            }

            Err(e) if e.is_transient() => {
                let policy = self.shared.config.retry;
                let outcome = self
                    .shared
                    .commit(|replica| Ok(replica.retry(id, now_ms(), &policy)))?;
                match outcome {
                    Some(RetryOutcome::Scheduled { attempt, delay_ms }) => {
                        tracing::debug!(mutation_id = %id, attempt, delay_ms, error = %e, "Send failed, retrying");
                    }
                    Some(RetryOutcome::Exhausted(dropped)) => {
                        tracing::warn!(
                            mutation_id = %id,
                            attempts = policy.max_attempts,
                            error = %e,
                            "Giving up on mutation"
                        );
                        self.shared.emit(SyncEvent::SyncFailed {
                            kind: e.kind(),
                            message: format!(
                                "gave up after {} attempts: {}",
                                policy.max_attempts, e
                            ),
                            mutation: Some(dropped),
                        });
                        self.emit_outbox_drained();
                    }
                    None => {}
                }
            }

            Err(e) => {
                let dropped = self.shared.commit(|replica| Ok(replica.queue.remove(id)))?;
                if let Some(dropped) = dropped {
                    tracing::warn!(mutation_id = %id, error = %e, "Mutation rejected by server");
                    self.shared.emit(SyncEvent::SyncFailed {
                        kind: e.kind(),
                        message: e.to_string(),
                        mutation: Some(dropped),
                    });
                    self.emit_outbox_drained();
                }
            }
        }

        Ok(())
    }

    fn emit_outbox_drained(&self) {
        if self.shared.outbox_is_empty() {
            self.shared.emit(SyncEvent::OutboxStatus { empty: true });
        }
    }

    fn report(&self, integration: Integration) {
        let unknown: BTreeSet<&str> = integration
            .rejected
            .iter()
            .map(|record| record.model.as_str())
            .collect();
        for model in unknown {
            let skipped = integration
                .rejected
                .iter()
                .filter(|record| record.model == model)
                .count();
            let error = SyncError::from(drift_engine::Error::ModelNotFound(model.to_string()));
            tracing::warn!(model, skipped, "Skipped remote records of an unknown model");
            self.shared.emit(SyncEvent::SyncFailed {
                kind: error.kind(),
                message: format!("skipped {} remote record(s): {}", skipped, error),
                mutation: None,
            });
        }

        for report in integration.conflicts {
            self.report_conflict(report);
        }
    }

    /// A merge that failed validation also counts as a sync failure.
    fn report_conflict(&self, report: ConflictReport) {
        tracing::info!(
            model = %report.model,
            record_id = %report.record_id,
            outcome = ?report.outcome,
            "Conflict resolved"
        );
        let fallback = (report.outcome == ConflictOutcome::MergeFallback).then(|| {
            format!(
                "merge of {}/{} rejected, kept server version {}: {}",
                report.model,
                report.record_id,
                report.remote_version,
                report.fallback_error.as_deref().unwrap_or("invalid merge result")
            )
        });

        self.shared.emit(SyncEvent::ConflictResolved { report });
        if let Some(message) = fallback {
            tracing::warn!(%message, "Merge fell back to the server record");
            self.shared.emit(SyncEvent::SyncFailed {
                kind: ErrorKind::SchemaValidation,
                message,
                mutation: None,
            });
        }
    }

    fn transition(&mut self, input: LifecycleInput) -> Result<Transition> {
        let transition = self.lifecycle.apply(input)?;
        if transition.changed() {
            tracing::debug!(from = %transition.from, to = %transition.to, %input, "Sync state changed");
            self.shared.set_state(transition.to);
        }
        Ok(transition)
    }

    /// Stop the workers, release their claims and settle on `stopped`.
    async fn shutdown(mut self, exit: Exit) {
        let _ = self.stop_workers.send(true);
        let grace = self.shared.config.stop_grace / 2;
        for mut worker in self.workers.drain(..) {
            if tokio::time::timeout(grace.max(Duration::from_millis(1)), &mut worker)
                .await
                .is_err()
            {
                tracing::warn!("Worker did not stop in time, aborting");
                worker.abort();
            }
        }

        // Messages still queued carry results of sends that finished.
        while let Ok(msg) = self.rx.try_recv() {
            if let CoordinatorMsg::SendResult { mutation, result } = msg {
                if let Err(e) = self.on_send_result(mutation, result) {
                    tracing::warn!(error = %e, "Dropping send result during shutdown");
                }
            }
        }
        self.shared.update(|replica| replica.queue.release_all());

        let input = match &exit {
            Exit::Stopped => LifecycleInput::Stop,
            Exit::Failed(error) => {
                tracing::error!(error = %error, "Sync failed");
                self.shared.emit(SyncEvent::SyncFailed {
                    kind: error.kind(),
                    message: error.to_string(),
                    mutation: None,
                });
                LifecycleInput::Fatal
            }
        };
        if self.transition(input).is_err() {
            self.shared.set_state(SyncState::Stopped);
        }
        self.shared.emit(SyncEvent::Stopped);
    }
}
