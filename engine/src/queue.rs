//! Mutation queue - the ordered outbox of local changes.
//!
//! Entries are kept in enqueue order. Mutations of the same record leave the
//! queue strictly first-in first-out; mutations of different records are
//! independent. Unsent entries of a record are coalesced so that the queue
//! carries at most one net change per record behind whatever is in flight.

use crate::journal::{ChangeSet, JournaledMap};
use crate::{
    error::Result, record::merge_fields, Error, MutationEvent, MutationId, MutationKind,
    RecordKey, Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Exponential backoff for failed sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Attempts before a mutation is given up on
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay_ms: u64,
    /// Growth factor per further failure
    pub multiplier: u32,
    /// Upper bound for a single delay
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Create a policy with the default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (0 = first send, no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let factor = u64::from(self.multiplier).saturating_pow(attempt - 1);
        self.initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            multiplier: 2,
            max_delay_ms: 30_000,
        }
    }
}

/// A queued mutation with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    pub mutation: MutationEvent,
    /// Enqueue order
    pub sequence: u64,
    /// Failed send attempts so far
    pub attempts: u32,
    /// Earliest time the next send may happen
    pub next_attempt_at: Timestamp,
    /// Handed to the network and not answered yet. Not persisted: after a
    /// restart every entry is sendable again.
    #[serde(skip)]
    pub in_flight: bool,
}

/// What [`MutationQueue::enqueue`] did with a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Added as a new entry
    Appended(MutationId),
    /// Folded into an existing unsent entry with this id
    Coalesced(MutationId),
    /// The mutation cancelled out unsent entries and nothing is left to send
    Cancelled,
}

/// What [`MutationQueue::schedule_retry`] decided.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Will be sent again after `delay_ms`
    Scheduled { attempt: u32, delay_ms: u64 },
    /// Out of attempts; removed from the queue
    Exhausted(MutationEvent),
}

/// The durable outbox of local mutations.
#[derive(Debug, Clone, Default)]
pub struct MutationQueue {
    entries: JournaledMap<u64, QueuedMutation>,
    next_sequence: u64,
    /// `next_sequence` when journaling began
    sequence_before: Option<u64>,
}

impl MutationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mutation, coalescing with unsent entries of the same record.
    pub fn enqueue(&mut self, mutation: MutationEvent) -> EnqueueOutcome {
        let key = mutation.key();
        let unsent: Vec<u64> = self
            .entries
            .values()
            .filter(|e| !e.in_flight && e.mutation.targets(&key))
            .map(|e| e.sequence)
            .collect();

        match mutation.kind {
            MutationKind::Delete if !unsent.is_empty() => self.coalesce_delete(mutation, &unsent),
            MutationKind::Update => {
                let last = unsent.last().and_then(|seq| self.entries.get_mut(seq));
                match last {
                    Some(entry) if entry.mutation.kind != MutationKind::Delete => {
                        merge_fields(&mut entry.mutation.payload, &mutation.payload);
                        entry.mutation.version = entry.mutation.version.min(mutation.version);
                        EnqueueOutcome::Coalesced(entry.mutation.id.clone())
                    }
                    _ => self.append(mutation),
                }
            }
            _ => self.append(mutation),
        }
    }

    fn coalesce_delete(&mut self, mut mutation: MutationEvent, unsent: &[u64]) -> EnqueueOutcome {
        let removed: Vec<QueuedMutation> = unsent
            .iter()
            .filter_map(|seq| self.entries.remove(seq))
            .collect();

        // The record never reached the server: nothing to delete remotely.
        if removed
            .iter()
            .any(|e| e.mutation.kind == MutationKind::Create)
        {
            return EnqueueOutcome::Cancelled;
        }

        if let Some(base) = removed.iter().map(|e| e.mutation.version).min() {
            mutation.version = mutation.version.min(base);
        }

        // Take over the slot of the oldest removed entry so the record keeps
        // its place relative to other records.
        let sequence = removed
            .first()
            .map(|e| e.sequence)
            .unwrap_or_else(|| self.bump_sequence());
        let id = mutation.id.clone();
        self.entries.insert(
            sequence,
            QueuedMutation {
                mutation,
                sequence,
                attempts: 0,
                next_attempt_at: 0,
                in_flight: false,
            },
        );
        EnqueueOutcome::Coalesced(id)
    }

    fn append(&mut self, mutation: MutationEvent) -> EnqueueOutcome {
        let sequence = self.bump_sequence();
        let id = mutation.id.clone();
        self.entries.insert(
            sequence,
            QueuedMutation {
                mutation,
                sequence,
                attempts: 0,
                next_attempt_at: 0,
                in_flight: false,
            },
        );
        EnqueueOutcome::Appended(id)
    }

    fn bump_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Mutations that may be sent at `now`, oldest first.
    ///
    /// Only the head entry of each record is considered; records whose head
    /// is in flight or still backing off yield nothing. The iterator borrows
    /// the queue and can simply be requested again to restart.
    pub fn ready(&self, now: Timestamp) -> impl Iterator<Item = &MutationEvent> + '_ {
        let mut seen = HashSet::new();
        self.entries
            .values()
            .filter(move |e| seen.insert(e.mutation.key()))
            .filter(move |e| !e.in_flight && e.next_attempt_at <= now)
            .map(|e| &e.mutation)
    }

    /// Earliest backoff deadline among entries that are waiting.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.entries
            .values()
            .filter(|e| !e.in_flight && e.attempts > 0)
            .map(|e| e.next_attempt_at)
            .min()
    }

    /// Mark a mutation as handed to the network.
    pub fn claim(&mut self, id: &str) -> Result<MutationEvent> {
        let entry = self.entry_mut(id)?;
        entry.in_flight = true;
        Ok(entry.mutation.clone())
    }

    /// Return a claimed mutation to the sendable set without counting an attempt.
    pub fn release(&mut self, id: &str) {
        if let Ok(entry) = self.entry_mut(id) {
            entry.in_flight = false;
        }
    }

    /// Release every claim, e.g. when the network tasks are stopped.
    pub fn release_all(&mut self) {
        let claimed: Vec<u64> = self
            .entries
            .values()
            .filter(|e| e.in_flight)
            .map(|e| e.sequence)
            .collect();
        for sequence in &claimed {
            if let Some(entry) = self.entries.get_mut(sequence) {
                entry.in_flight = false;
            }
        }
    }

    /// Remove a mutation the server has accepted.
    pub fn acknowledge(&mut self, id: &str) -> Option<MutationEvent> {
        self.remove(id)
    }

    /// Record a failed send and decide whether to try again.
    pub fn schedule_retry(
        &mut self,
        id: &str,
        now: Timestamp,
        policy: &RetryPolicy,
    ) -> Result<RetryOutcome> {
        let entry = self.entry_mut(id)?;
        entry.in_flight = false;
        entry.attempts += 1;

        if entry.attempts >= policy.max_attempts {
            let exhausted = self
                .remove(id)
                .ok_or_else(|| Error::MutationNotFound(id.to_string()))?;
            return Ok(RetryOutcome::Exhausted(exhausted));
        }

        let attempt = entry.attempts;
        let delay_ms = policy.delay_for_attempt(attempt);
        entry.next_attempt_at = now.saturating_add(delay_ms);
        Ok(RetryOutcome::Scheduled { attempt, delay_ms })
    }

    /// Swap a queued mutation for a rewritten one, keeping its position.
    ///
    /// Used when a conflict resolution resubmits local data against a newer
    /// server version. Attempts and claims are reset.
    pub fn replace(&mut self, id: &str, mutation: MutationEvent) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.mutation = mutation;
        entry.attempts = 0;
        entry.next_attempt_at = 0;
        entry.in_flight = false;
        Ok(())
    }

    /// Point a queued mutation at a newer server version with new data.
    pub fn rebase(&mut self, id: &str, version: Version, payload: serde_json::Value) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.mutation.version = version;
        entry.mutation.payload = payload;
        entry.attempts = 0;
        entry.next_attempt_at = 0;
        entry.in_flight = false;
        Ok(())
    }

    /// Move queued mutations of a record onto a newly acknowledged version.
    ///
    /// Called after the server accepts an earlier mutation of the same
    /// record, so the ones behind it are not rejected for a stale base.
    pub fn rebase_record(&mut self, key: &RecordKey, version: Version) -> usize {
        let stale: Vec<u64> = self
            .entries
            .values()
            .filter(|e| !e.in_flight && e.mutation.targets(key) && e.mutation.version < version)
            .map(|e| e.sequence)
            .collect();
        for sequence in &stale {
            if let Some(entry) = self.entries.get_mut(sequence) {
                entry.mutation.version = version;
            }
        }
        stale.len()
    }

    /// Remove a mutation.
    pub fn remove(&mut self, id: &str) -> Option<MutationEvent> {
        let sequence = self.sequence_of(id)?;
        self.entries.remove(&sequence).map(|e| e.mutation)
    }

    /// Remove every mutation of a record.
    pub fn discard_record(&mut self, key: &RecordKey) -> Vec<MutationEvent> {
        let sequences: Vec<u64> = self
            .entries
            .values()
            .filter(|e| e.mutation.targets(key))
            .map(|e| e.sequence)
            .collect();
        sequences
            .iter()
            .filter_map(|seq| self.entries.remove(seq))
            .map(|e| e.mutation)
            .collect()
    }

    /// Pending mutations of a record, oldest first.
    pub fn pending_for<'a>(&'a self, key: &'a RecordKey) -> impl Iterator<Item = &'a QueuedMutation> + 'a {
        self.entries.values().filter(move |e| e.mutation.targets(key))
    }

    /// Whether a record has any pending mutation.
    pub fn has_pending(&self, key: &RecordKey) -> bool {
        self.pending_for(key).next().is_some()
    }

    /// Whether a record's head mutation is currently in flight.
    pub fn is_in_flight(&self, key: &RecordKey) -> bool {
        self.pending_for(key).next().is_some_and(|e| e.in_flight)
    }

    /// Get a queued mutation by id.
    pub fn get(&self, id: &str) -> Option<&QueuedMutation> {
        self.entries.values().find(|e| e.mutation.id == id)
    }

    /// Iterate all entries in enqueue order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMutation> {
        self.entries.values()
    }

    /// Number of queued mutations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every queued mutation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Next sequence number, persisted so restored queues keep ordering.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub(crate) fn load(&mut self, entries: Vec<QueuedMutation>, next_sequence: u64) {
        let max_seen = entries.iter().map(|e| e.sequence + 1).max().unwrap_or(0);
        self.entries = entries.into_iter().map(|e| (e.sequence, e)).collect();
        self.next_sequence = next_sequence.max(max_seen);
    }

    /// Start journaling entry writes.
    pub fn begin_changes(&mut self) {
        self.entries.begin();
        self.sequence_before = Some(self.next_sequence);
    }

    /// Undo every write since [`begin_changes`](Self::begin_changes).
    pub fn rollback_changes(&mut self) {
        self.entries.rollback();
        if let Some(sequence) = self.sequence_before.take() {
            self.next_sequence = sequence;
        }
    }

    /// Keep the journaled writes and stop journaling.
    pub fn settle_changes(&mut self) {
        self.entries.settle();
        self.sequence_before = None;
    }

    /// Add the current state of every journaled entry.
    pub fn collect_changes(&self, changes: &mut ChangeSet) {
        for (sequence, entry) in self.entries.changes() {
            match entry {
                Some(entry) => changes.mutations.push(entry.clone()),
                None => changes.removed_mutations.push(*sequence),
            }
        }
        changes.next_sequence = self.next_sequence;
    }

    fn sequence_of(&self, id: &str) -> Option<u64> {
        self.get(id).map(|e| e.sequence)
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut QueuedMutation> {
        let sequence = self
            .sequence_of(id)
            .ok_or_else(|| Error::MutationNotFound(id.to_string()))?;
        self.entries
            .get_mut(&sequence)
            .ok_or_else(|| Error::MutationNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids<'a>(mutations: impl Iterator<Item = &'a MutationEvent>) -> Vec<String> {
        mutations.map(|m| m.id.clone()).collect()
    }

    #[test]
    fn create_then_update_coalesces_into_create() {
        let mut queue = MutationQueue::new();
        queue.enqueue(MutationEvent::create("m-1", "Post", "1", json!({"title": "A"}), 1000));
        let outcome = queue.enqueue(MutationEvent::update(
            "m-2",
            "Post",
            "1",
            json!({"title": "P"}),
            0,
            1001,
        ));

        assert_eq!(outcome, EnqueueOutcome::Coalesced("m-1".into()));
        let ready: Vec<_> = queue.ready(2000).collect();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].kind, MutationKind::Create);
        assert_eq!(ready[0].payload, json!({"title": "P"}));
    }

    #[test]
    fn updates_merge_fields_and_keep_lowest_version() {
        let mut queue = MutationQueue::new();
        queue.enqueue(MutationEvent::update("m-1", "Post", "1", json!({"title": "A"}), 3, 1000));
        queue.enqueue(MutationEvent::update("m-2", "Post", "1", json!({"rating": 4}), 4, 1001));

        assert_eq!(queue.len(), 1);
        let head = queue.get("m-1").unwrap();
        assert_eq!(head.mutation.payload, json!({"title": "A", "rating": 4}));
        assert_eq!(head.mutation.version, 3);
    }

    #[test]
    fn delete_after_create_cancels_everything() {
        let mut queue = MutationQueue::new();
        queue.enqueue(MutationEvent::create("m-1", "Post", "1", json!({"title": "A"}), 1000));
        queue.enqueue(MutationEvent::update("m-2", "Post", "1", json!({"title": "B"}), 0, 1001));

        let outcome = queue.enqueue(MutationEvent::delete("m-3", "Post", "1", 0, 1002));
        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert!(queue.is_empty());
    }

    #[test]
    fn delete_after_update_replaces_it() {
        let mut queue = MutationQueue::new();
        queue.enqueue(MutationEvent::create("m-0", "Post", "0", json!({"title": "Z"}), 999));
        queue.enqueue(MutationEvent::update("m-1", "Post", "1", json!({"title": "A"}), 2, 1000));

        let outcome = queue.enqueue(MutationEvent::delete("m-2", "Post", "1", 3, 1001));
        assert_eq!(outcome, EnqueueOutcome::Coalesced("m-2".into()));

        let ready: Vec<_> = queue.ready(2000).collect();
        assert_eq!(ids(ready.iter().copied()), vec!["m-0", "m-2"]);
        assert_eq!(ready[1].kind, MutationKind::Delete);
        assert_eq!(ready[1].version, 2);
    }

    #[test]
    fn in_flight_entries_are_not_coalesced() {
        let mut queue = MutationQueue::new();
        queue.enqueue(MutationEvent::create("m-1", "Post", "1", json!({"title": "A"}), 1000));
        queue.claim("m-1").unwrap();

        let outcome =
            queue.enqueue(MutationEvent::update("m-2", "Post", "1", json!({"title": "B"}), 0, 1001));
        assert_eq!(outcome, EnqueueOutcome::Appended("m-2".into()));
        assert_eq!(queue.len(), 2);

        // The record is blocked until its head is answered.
        assert_eq!(queue.ready(2000).count(), 0);
        assert!(queue.is_in_flight(&RecordKey::new("Post", "1")));

        queue.acknowledge("m-1");
        assert_eq!(ids(queue.ready(2000)), vec!["m-2"]);
    }

    #[test]
    fn ready_is_fifo_per_record_and_ordered_across_records() {
        let mut queue = MutationQueue::new();
        queue.enqueue(MutationEvent::create("m-1", "Post", "a", json!({"title": "A"}), 1000));
        queue.enqueue(MutationEvent::create("m-2", "Post", "b", json!({"title": "B"}), 1001));
        queue.claim("m-1").unwrap();
        queue.enqueue(MutationEvent::update("m-3", "Post", "a", json!({"title": "A2"}), 0, 1002));
        queue.enqueue(MutationEvent::create("m-4", "Post", "c", json!({"title": "C"}), 1003));

        assert_eq!(ids(queue.ready(2000)), vec!["m-2", "m-4"]);

        queue.release("m-1");
        assert_eq!(ids(queue.ready(2000)), vec!["m-1", "m-2", "m-4"]);
    }

    #[test]
    fn retry_backs_off_then_exhausts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 100,
            multiplier: 2,
            max_delay_ms: 1000,
        };
        let mut queue = MutationQueue::new();
        queue.enqueue(MutationEvent::create("m-1", "Post", "1", json!({"title": "A"}), 1000));

        queue.claim("m-1").unwrap();
        let outcome = queue.schedule_retry("m-1", 1000, &policy).unwrap();
        assert_eq!(outcome, RetryOutcome::Scheduled { attempt: 1, delay_ms: 100 });
        assert_eq!(queue.ready(1050).count(), 0);
        assert_eq!(queue.next_deadline(), Some(1100));
        assert_eq!(queue.ready(1100).count(), 1);

        queue.claim("m-1").unwrap();
        let outcome = queue.schedule_retry("m-1", 1100, &policy).unwrap();
        assert_eq!(outcome, RetryOutcome::Scheduled { attempt: 2, delay_ms: 200 });

        queue.claim("m-1").unwrap();
        let outcome = queue.schedule_retry("m-1", 1300, &policy).unwrap();
        assert!(matches!(outcome, RetryOutcome::Exhausted(m) if m.id == "m-1"));
        assert!(queue.is_empty());
    }

    #[test]
    fn backoff_delays() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 100,
            multiplier: 2,
            max_delay_ms: 500,
        };
        assert_eq!(policy.delay_for_attempt(0), 0);
        assert_eq!(policy.delay_for_attempt(1), 100);
        assert_eq!(policy.delay_for_attempt(2), 200);
        assert_eq!(policy.delay_for_attempt(3), 400);
        assert_eq!(policy.delay_for_attempt(4), 500);
        assert_eq!(policy.delay_for_attempt(60), 500);
    }

    #[test]
    fn replace_keeps_position() {
        let mut queue = MutationQueue::new();
        queue.enqueue(MutationEvent::update("m-1", "Post", "1", json!({"title": "A"}), 3, 1000));
        queue.enqueue(MutationEvent::create("m-2", "Post", "2", json!({"title": "B"}), 1001));
        queue.claim("m-1").unwrap();

        let rebased = MutationEvent::update("m-1", "Post", "1", json!({"title": "A"}), 5, 1000);
        queue.replace("m-1", rebased).unwrap();

        let ready: Vec<_> = queue.ready(2000).collect();
        assert_eq!(ready[0].id, "m-1");
        assert_eq!(ready[0].version, 5);
        let stray = ready[0].clone();
        assert!(queue.replace("missing", stray).is_err());
    }

    #[test]
    fn rebase_resets_attempts() {
        let mut queue = MutationQueue::new();
        queue.enqueue(MutationEvent::update("m-1", "Post", "1", json!({"title": "A"}), 3, 1000));
        queue.claim("m-1").unwrap();
        queue
            .schedule_retry("m-1", 1000, &RetryPolicy::default())
            .unwrap();

        queue.rebase("m-1", 5, json!({"title": "merged"})).unwrap();

        let entry = queue.get("m-1").unwrap();
        assert_eq!(entry.mutation.version, 5);
        assert_eq!(entry.mutation.payload, json!({"title": "merged"}));
        assert_eq!(entry.attempts, 0);
        assert_eq!(ids(queue.ready(1000)), vec!["m-1"]);
    }

    #[test]
    fn discard_record_only_touches_that_record() {
        let mut queue = MutationQueue::new();
        queue.enqueue(MutationEvent::update("m-1", "Post", "1", json!({"title": "A"}), 3, 1000));
        queue.enqueue(MutationEvent::update("m-2", "Post", "2", json!({"title": "B"}), 1, 1001));

        let discarded = queue.discard_record(&RecordKey::new("Post", "1"));
        assert_eq!(discarded.len(), 1);
        assert_eq!(ids(queue.ready(2000)), vec!["m-2"]);
        assert!(!queue.has_pending(&RecordKey::new("Post", "1")));
    }

    #[test]
    fn rebase_after_acknowledged_head() {
        let mut queue = MutationQueue::new();
        queue.enqueue(MutationEvent::create("m-1", "Post", "1", json!({"title": "A"}), 1000));
        queue.claim("m-1").unwrap();
        queue.enqueue(MutationEvent::update("m-2", "Post", "1", json!({"title": "B"}), 0, 1001));

        queue.acknowledge("m-1");
        let rebased = queue.rebase_record(&RecordKey::new("Post", "1"), 1);

        assert_eq!(rebased, 1);
        assert_eq!(queue.get("m-2").unwrap().mutation.version, 1);
    }

    #[test]
    fn release_all_clears_claims() {
        let mut queue = MutationQueue::new();
        queue.enqueue(MutationEvent::create("m-1", "Post", "1", json!({"title": "A"}), 1000));
        queue.claim("m-1").unwrap();
        queue.release_all();
        assert_eq!(queue.ready(1000).count(), 1);
    }

    #[test]
    fn unknown_ids_are_errors() {
        let mut queue = MutationQueue::new();
        assert!(matches!(queue.claim("nope"), Err(Error::MutationNotFound(_))));
        assert!(queue
            .schedule_retry("nope", 0, &RetryPolicy::default())
            .is_err());
        assert!(queue.acknowledge("nope").is_none());
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeMap;

        /// Server-side effect of sending `mutations` in order.
        fn replay<'a>(
            initial: Option<serde_json::Value>,
            mutations: impl Iterator<Item = &'a MutationEvent>,
        ) -> Option<serde_json::Value> {
            let mut state = initial;
            for mutation in mutations {
                match mutation.kind {
                    MutationKind::Create => state = Some(mutation.payload.clone()),
                    MutationKind::Update => {
                        if let Some(current) = state.as_mut() {
                            merge_fields(current, &mutation.payload);
                        }
                    }
                    MutationKind::Delete => state = None,
                }
            }
            state
        }

        fn arb_patch() -> impl Strategy<Value = serde_json::Value> {
            prop::collection::btree_map("[abc]", 0i64..100, 1..3)
                .prop_map(|fields: BTreeMap<String, i64>| json!(fields))
        }

        proptest! {
            #[test]
            fn prop_coalesced_queue_matches_sequential_send(
                starts_with_create in any::<bool>(),
                patches in prop::collection::vec(arb_patch(), 1..8),
                ends_with_delete in any::<bool>(),
                base_version in 1u64..10,
            ) {
                let (initial, version) = if starts_with_create {
                    (None, 0)
                } else {
                    (Some(json!({"a": -1, "b": -1, "c": -1})), base_version)
                };

                let mut sequence = Vec::new();
                for (i, patch) in patches.into_iter().enumerate() {
                    let id = format!("m-{}", i);
                    sequence.push(if i == 0 && starts_with_create {
                        MutationEvent::create(id, "Post", "1", patch, i as u64)
                    } else {
                        MutationEvent::update(id, "Post", "1", patch, version, i as u64)
                    });
                }
                if ends_with_delete {
                    sequence.push(MutationEvent::delete("m-del", "Post", "1", version, 100));
                }

                let mut queue = MutationQueue::new();
                for mutation in &sequence {
                    queue.enqueue(mutation.clone());
                }

                prop_assert!(queue.len() <= 1);
                for entry in queue.iter() {
                    prop_assert_eq!(entry.mutation.version, version);
                }
                prop_assert_eq!(
                    replay(initial.clone(), queue.iter().map(|e| &e.mutation)),
                    replay(initial, sequence.iter())
                );
            }

            #[test]
            fn prop_ready_never_yields_two_of_one_record(
                records in prop::collection::vec(0u8..4, 1..20),
            ) {
                let mut queue = MutationQueue::new();
                for (i, record) in records.iter().enumerate() {
                    let id = format!("m-{}", i);
                    let mutation = MutationEvent::update(id.clone(), "Post", record.to_string(), json!({"a": i}), 1, 0);
                    queue.enqueue(mutation);
                    if i % 3 == 0 {
                        let _ = queue.claim(&id);
                    }
                }

                let mut seen = std::collections::HashSet::new();
                for mutation in queue.ready(0) {
                    prop_assert!(seen.insert(mutation.key()));
                    prop_assert!(!queue.is_in_flight(&mutation.key()));
                }
            }
        }
    }
}
