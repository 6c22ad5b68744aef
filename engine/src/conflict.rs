//! Conflict resolution between a pending local mutation and a newer server
//! record.
//!
//! A conflict exists when the server holds a version newer than the one a
//! local mutation was made against. The [`ConflictResolver`] turns each
//! conflict into exactly one [`Resolution`]: the record to store, an optional
//! rewritten mutation to send again, and a [`ConflictReport`] for the
//! `conflictResolved` event.
//!
//! Resolution rules:
//! - a remote tombstone always wins, whatever the strategy
//! - `RemoteWins` stores the server record and drops the local change
//! - `LocalWins` keeps the local change and resubmits it against the server
//!   version
//! - `Merge` calls a user function; its result must pass schema validation,
//!   otherwise the resolver falls back to `RemoteWins` and reports the error

use crate::{
    record::merge_fields, ModelName, ModelRegistry, MutationEvent, MutationKind, Record, RecordId,
    Version,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// User merge function: `(local, remote) -> merged payload`.
///
/// `local` is the pending mutation's payload (full for creates, changed fields
/// for updates), `remote` the server record's payload.
pub type MergeFn = dyn Fn(&Value, &Value) -> Result<Value, String> + Send + Sync;

/// How conflicts are settled. One strategy per engine.
#[derive(Clone, Default)]
pub enum ConflictStrategy {
    /// The server record replaces the local change (default)
    #[default]
    RemoteWins,
    /// The local change is resubmitted on top of the server version
    LocalWins,
    /// A user function combines both sides
    Merge(Arc<MergeFn>),
}

impl ConflictStrategy {
    /// Build a `Merge` strategy from a closure.
    pub fn merge<F>(merge: F) -> Self
    where
        F: Fn(&Value, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        ConflictStrategy::Merge(Arc::new(merge))
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            ConflictStrategy::RemoteWins => StrategyKind::RemoteWins,
            ConflictStrategy::LocalWins => StrategyKind::LocalWins,
            ConflictStrategy::Merge(_) => StrategyKind::Merge,
        }
    }
}

impl fmt::Debug for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::RemoteWins => write!(f, "RemoteWins"),
            ConflictStrategy::LocalWins => write!(f, "LocalWins"),
            ConflictStrategy::Merge(_) => write!(f, "Merge(<fn>)"),
        }
    }
}

/// Serializable name of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StrategyKind {
    RemoteWins,
    LocalWins,
    Merge,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::RemoteWins => write!(f, "remoteWins"),
            StrategyKind::LocalWins => write!(f, "localWins"),
            StrategyKind::Merge => write!(f, "merge"),
        }
    }
}

/// What a resolution ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictOutcome {
    /// Server record stored, local change dropped
    RemoteApplied,
    /// Local change kept and queued again
    LocalResubmitted,
    /// Merged payload stored and queued again
    Merged,
    /// Merge failed; server record stored instead
    MergeFallback,
}

/// Details of one settled conflict, carried by the `conflictResolved` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub model: ModelName,
    pub record_id: RecordId,
    pub strategy: StrategyKind,
    pub outcome: ConflictOutcome,
    /// Kind of the local mutation
    pub local_kind: MutationKind,
    /// Version the local mutation was based on
    pub local_version: Version,
    /// Server version that caused the conflict
    pub remote_version: Version,
    /// Local data that did not survive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discarded_local_payload: Option<Value>,
    /// Server data overwritten by the local side
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discarded_remote_payload: Option<Value>,
    /// Why a merge fell back to the server record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_error: Option<String>,
}

/// The single outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Record to store locally
    pub apply: Option<Record>,
    /// Mutation to send again, replacing the conflicting one
    pub resubmit: Option<MutationEvent>,
    pub report: ConflictReport,
}

/// Settles conflicts with a fixed strategy.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &ConflictStrategy {
        &self.strategy
    }

    /// Whether `remote` conflicts with a pending mutation of the same record.
    pub fn detects(pending: &MutationEvent, remote: &Record) -> bool {
        pending.targets(&remote.key()) && remote.version > pending.version
    }

    /// Resolve a local mutation against a newer server record.
    pub fn resolve(
        &self,
        local: &MutationEvent,
        remote: &Record,
        registry: &ModelRegistry,
    ) -> Resolution {
        if remote.deleted {
            return self.remote_wins(local, remote, None);
        }

        match &self.strategy {
            ConflictStrategy::RemoteWins => self.remote_wins(local, remote, None),
            ConflictStrategy::LocalWins => self.local_wins(local, remote),
            ConflictStrategy::Merge(_) if local.kind == MutationKind::Delete => {
                self.remote_wins(local, remote, None)
            }
            ConflictStrategy::Merge(merge) => {
                let merged = merge(&local.payload, &remote.payload).and_then(|payload| {
                    registry
                        .require(&remote.model)
                        .and_then(|schema| schema.validate_payload(&payload))
                        .map(|()| payload)
                        .map_err(|e| e.to_string())
                });
                match merged {
                    Ok(payload) => self.merged(local, remote, payload),
                    Err(reason) => self.remote_wins(local, remote, Some(reason)),
                }
            }
        }
    }

    fn report(&self, local: &MutationEvent, remote: &Record, outcome: ConflictOutcome) -> ConflictReport {
        ConflictReport {
            model: remote.model.clone(),
            record_id: remote.id.clone(),
            strategy: self.strategy.kind(),
            outcome,
            local_kind: local.kind,
            local_version: local.version,
            remote_version: remote.version,
            discarded_local_payload: None,
            discarded_remote_payload: None,
            fallback_error: None,
        }
    }

    fn remote_wins(&self, local: &MutationEvent, remote: &Record, fallback: Option<String>) -> Resolution {
        let outcome = if fallback.is_some() {
            ConflictOutcome::MergeFallback
        } else {
            ConflictOutcome::RemoteApplied
        };
        let mut report = self.report(local, remote, outcome);
        report.discarded_local_payload = Some(local.payload.clone());
        report.fallback_error = fallback;

        Resolution {
            apply: Some(remote.clone()),
            resubmit: None,
            report,
        }
    }

    fn local_wins(&self, local: &MutationEvent, remote: &Record) -> Resolution {
        let mut report = self.report(local, remote, ConflictOutcome::LocalResubmitted);
        report.discarded_remote_payload = Some(remote.payload.clone());

        let mut record = remote.clone();
        let resubmit = match local.kind {
            MutationKind::Delete => {
                record.mark_deleted(local.created_at);
                MutationEvent::delete(
                    local.id.clone(),
                    local.model.clone(),
                    local.record_id.clone(),
                    remote.version,
                    local.created_at,
                )
            }
            MutationKind::Create | MutationKind::Update => {
                if local.kind == MutationKind::Create {
                    record.payload = local.payload.clone();
                } else {
                    merge_fields(&mut record.payload, &local.payload);
                }
                record.last_changed_at = local.created_at;
                // A create that lost the race for its id becomes a full update.
                MutationEvent::update(
                    local.id.clone(),
                    local.model.clone(),
                    local.record_id.clone(),
                    local.payload.clone(),
                    remote.version,
                    local.created_at,
                )
            }
        };

        Resolution {
            apply: Some(record),
            resubmit: Some(resubmit),
            report,
        }
    }

    fn merged(&self, local: &MutationEvent, remote: &Record, payload: Value) -> Resolution {
        let mut report = self.report(local, remote, ConflictOutcome::Merged);
        report.discarded_remote_payload = Some(remote.payload.clone());

        let mut record = remote.clone();
        record.payload = payload.clone();
        record.last_changed_at = local.created_at.max(remote.last_changed_at);

        let resubmit = MutationEvent::update(
            local.id.clone(),
            local.model.clone(),
            local.record_id.clone(),
            payload,
            remote.version,
            local.created_at,
        );

        Resolution {
            apply: Some(record),
            resubmit: Some(resubmit),
            report,
        }
    }
}
