//! Change tracking for the store and the queue.
//!
//! Between `begin_changes` and `settle_changes` every key the store or queue
//! writes is remembered together with its prior value. That gives two things
//! without copying the whole state: a rollback that only touches the written
//! keys, and a [`ChangeSet`] of the new values that storage can append to a
//! journal instead of rewriting a full snapshot.

use crate::{
    error::Result, queue::QueuedMutation, store::SyncCursor, Error, ModelName, Record, RecordKey,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Deref;

/// A `BTreeMap` that can record the prior value of every key it changes.
///
/// Reads go through `Deref`; writes go through the methods below so they can
/// be journaled.
#[derive(Debug, Clone)]
pub(crate) struct JournaledMap<K, V> {
    map: BTreeMap<K, V>,
    undo: Option<BTreeMap<K, Option<V>>>,
}

impl<K, V> Default for JournaledMap<K, V> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
            undo: None,
        }
    }
}

impl<K: Ord + Clone, V: Clone> JournaledMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording prior values. Drops anything recorded before.
    pub fn begin(&mut self) {
        self.undo = Some(BTreeMap::new());
    }

    /// Put every key changed since [`begin`](Self::begin) back.
    pub fn rollback(&mut self) {
        let Some(undo) = self.undo.take() else {
            return;
        };
        for (key, before) in undo {
            match before {
                Some(value) => {
                    self.map.insert(key, value);
                }
                None => {
                    self.map.remove(&key);
                }
            }
        }
    }

    /// Keep the changes and stop recording.
    pub fn settle(&mut self) {
        self.undo = None;
    }

    /// Keys changed since [`begin`](Self::begin) with their current value;
    /// `None` means the key is gone.
    pub fn changes(&self) -> impl Iterator<Item = (&K, Option<&V>)> + '_ {
        self.undo
            .iter()
            .flat_map(BTreeMap::keys)
            .map(|key| (key, self.map.get(key)))
    }

    fn touch(&mut self, key: &K) {
        if let Some(undo) = self.undo.as_mut() {
            if !undo.contains_key(key) {
                undo.insert(key.clone(), self.map.get(key).cloned());
            }
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.touch(&key);
        self.map.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.touch(key);
        self.map.remove(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.touch(key);
        self.map.get_mut(key)
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = (K, V)>) {
        for (key, value) in entries {
            self.insert(key, value);
        }
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        let dropped: Vec<K> = self
            .map
            .iter()
            .filter(|(key, value)| !keep(key, value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &dropped {
            self.remove(key);
        }
    }

    pub fn clear(&mut self) {
        if self.undo.is_some() {
            let keys: Vec<K> = self.map.keys().cloned().collect();
            for key in &keys {
                self.touch(key);
            }
        }
        self.map.clear();
    }
}

impl<K, V> Deref for JournaledMap<K, V> {
    type Target = BTreeMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.map
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for JournaledMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().collect(),
            undo: None,
        }
    }
}

/// The new state of everything one commit touched.
///
/// Applied in `position` order on top of a [`StoreSnapshot`](crate::StoreSnapshot)
/// whose `journal_position` is lower, change sets rebuild the current state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    /// Position of this commit in the journal
    pub position: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<Record>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_records: Vec<RecordKey>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cursors: BTreeMap<ModelName, SyncCursor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_cursors: Vec<ModelName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutations: Vec<QueuedMutation>,
    /// Queue sequence numbers of removed mutations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_mutations: Vec<u64>,
    /// Next queue sequence number after the commit
    #[serde(default)]
    pub next_sequence: u64,
}

impl ChangeSet {
    /// Whether the commit changed nothing that is persisted.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
            && self.removed_records.is_empty()
            && self.cursors.is_empty()
            && self.removed_cursors.is_empty()
            && self.mutations.is_empty()
            && self.removed_mutations.is_empty()
    }

    /// Number of touched records, cursors and mutations.
    pub fn len(&self) -> usize {
        self.records.len()
            + self.removed_records.len()
            + self.cursors.len()
            + self.removed_cursors.len()
            + self.mutations.len()
            + self.removed_mutations.len()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }
}
