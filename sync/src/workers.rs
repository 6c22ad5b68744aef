//! Network workers spawned by the coordinator.
//!
//! Workers only talk to the network. Every change to the replica goes
//! through a [`CoordinatorMsg`], so the coordinator sees results in the
//! order they arrive.

use crate::auth::with_token;
use crate::channel::ChangeBatch;
use crate::coordinator::CoordinatorMsg;
use crate::datastore::Shared;
use crate::error::{Result, SyncError};
use crate::now_ms;
use crate::replica::Claim;
use futures::stream::{BoxStream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

type CoordinatorTx = mpsc::UnboundedSender<CoordinatorMsg>;

/// Resolves once `signal` turns true or its sender is gone.
pub(crate) async fn cancelled(signal: &mut watch::Receiver<bool>) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}

/// Run `work` unless `signal` fires first.
pub(crate) async fn or_cancel<T>(
    signal: &mut watch::Receiver<bool>,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancelled(signal) => Err(SyncError::Cancelled),
        result = work => result,
    }
}

async fn sleep_until_deadline(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

/// Sends queued mutations one at a time, oldest first.
pub(crate) async fn run_outbox(shared: Arc<Shared>, tx: CoordinatorTx, mut stop: watch::Receiver<bool>) {
    let channel = shared.channel.as_ref();
    let auth = shared.auth.as_ref();

    loop {
        let (reply, claimed) = oneshot::channel();
        if tx.send(CoordinatorMsg::ClaimReady { reply }).is_err() {
            return;
        }
        let claim = tokio::select! {
            biased;
            _ = cancelled(&mut stop) => return,
            claim = claimed => match claim {
                Ok(claim) => claim,
                Err(_) => return,
            },
        };

        match claim {
            Claim::Mutation(mutation) => {
                tracing::debug!(
                    mutation_id = %mutation.id,
                    model = %mutation.model,
                    record_id = %mutation.record_id,
                    version = mutation.version,
                    "Sending mutation"
                );

                let sent = &mutation;
                let result = or_cancel(
                    &mut stop,
                    with_token(auth, move |token| channel.send(sent, token)),
                )
                .await;

                let stopping = matches!(result, Err(SyncError::Cancelled));
                if tx.send(CoordinatorMsg::SendResult { mutation, result }).is_err() || stopping {
                    return;
                }
            }
            Claim::Idle { next_deadline } => {
                let delay = next_deadline
                    .map(|at| Duration::from_millis(at.saturating_sub(now_ms())));
                tokio::select! {
                    biased;
                    _ = cancelled(&mut stop) => return,
                    _ = shared.outbox_wake.notified() => {}
                    _ = sleep_until_deadline(delay) => {}
                }
            }
        }
    }
}

/// Keeps the change subscription alive, reconnecting with backoff.
pub(crate) async fn run_subscription(
    shared: Arc<Shared>,
    tx: CoordinatorTx,
    mut stop: watch::Receiver<bool>,
) {
    let channel = shared.channel.as_ref();
    let auth = shared.auth.as_ref();
    let mut attempt: u32 = 0;

    loop {
        let cursors = shared.read(|replica| replica.store().cursors().clone());
        let cursors = &cursors;
        let connected = or_cancel(
            &mut stop,
            with_token(auth, move |token| channel.subscribe(cursors.clone(), token)),
        )
        .await;

        let error = match connected {
            Ok(mut stream) => {
                attempt = 0;
                tracing::info!("Subscription established");
                if tx.send(CoordinatorMsg::SubscriptionEstablished).is_err() {
                    return;
                }
                match forward_batches(&mut stream, &tx, &mut stop).await {
                    Some(error) => error,
                    None => return,
                }
            }
            Err(SyncError::Cancelled) => return,
            Err(error) => error,
        };

        if !error.is_transient() {
            let _ = tx.send(CoordinatorMsg::Fatal(error));
            return;
        }
        if tx.send(CoordinatorMsg::Disconnected { error }).is_err() {
            return;
        }

        attempt = attempt.saturating_add(1);
        let delay = shared.config.reconnect.delay_for(attempt);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting subscription");
        tokio::select! {
            biased;
            _ = cancelled(&mut stop) => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Hand batches to the coordinator until the stream fails.
///
/// Waits for each batch to be handled before reading the next. Returns `None`
/// when stopped.
async fn forward_batches(
    stream: &mut BoxStream<'static, Result<ChangeBatch>>,
    tx: &CoordinatorTx,
    stop: &mut watch::Receiver<bool>,
) -> Option<SyncError> {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancelled(stop) => return None,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(batch)) => {
                tracing::trace!(changes = batch.changes.len(), "Remote batch received");
                let (applied, done) = oneshot::channel();
                if tx.send(CoordinatorMsg::RemoteBatch { batch, applied }).is_err() {
                    return None;
                }
                tokio::select! {
                    biased;
                    _ = cancelled(stop) => return None,
                    result = done => match result {
                        Ok(true) => {}
                        // Resubscribe from the stored cursors.
                        Ok(false) => {
                            return Some(SyncError::TransientNetwork(
                                "remote batch was not stored".into(),
                            ))
                        }
                        Err(_) => return None,
                    },
                }
            }
            Some(Err(error)) => return Some(error),
            None => {
                return Some(SyncError::TransientNetwork(
                    "subscription stream ended".into(),
                ))
            }
        }
    }
}
