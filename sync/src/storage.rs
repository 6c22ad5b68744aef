//! Durable storage for the replica.
//!
//! Storage holds a checkpoint, a full [`StoreSnapshot`], followed by a
//! journal of [`ChangeSet`]s. Every committed change appends one change set;
//! every so often the runtime writes a new checkpoint, which truncates the
//! journal. Loading replays the journal on top of the checkpoint.

use crate::error::{Result, SyncError};
use drift_engine::{ChangeSet, StoreSnapshot};
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Where the replica is persisted.
pub trait StorageAdapter: Send + Sync {
    /// The last checkpoint with every later journal entry applied, if any.
    fn load(&self) -> Result<Option<StoreSnapshot>>;

    /// Write a new checkpoint and drop the journal.
    fn persist(&self, snapshot: &StoreSnapshot) -> Result<()>;

    /// Append one commit to the journal.
    fn append(&self, changes: &ChangeSet) -> Result<()>;

    /// Delete everything.
    fn wipe(&self) -> Result<()>;
}

/// Replay journal lines on top of a checkpoint.
///
/// A final line that does not parse was torn by a crash mid-append and is
/// ignored; a bad line anywhere else is an error.
fn replay<'a>(
    mut snapshot: StoreSnapshot,
    lines: impl IntoIterator<Item = &'a str>,
) -> Result<StoreSnapshot> {
    let lines: Vec<&str> = lines
        .into_iter()
        .filter(|line| !line.trim().is_empty())
        .collect();
    let last = lines.len().saturating_sub(1);

    for (index, line) in lines.iter().enumerate() {
        match ChangeSet::from_json(line) {
            Ok(changes) => {
                snapshot.apply(&changes);
            }
            Err(e) if index == last => {
                tracing::warn!(error = %e, "Ignoring torn journal entry");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(snapshot)
}

#[derive(Debug, Default)]
struct Persisted {
    checkpoint: Option<String>,
    journal: Vec<String>,
}

/// Keeps the checkpoint and journal in memory as JSON.
///
/// Sharing one instance between two runtimes simulates a process restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    persisted: Mutex<Persisted>,
    fail_persist: AtomicBool,
    checkpoints: AtomicUsize,
    appends: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail (or succeed again).
    pub fn fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    /// Number of checkpoints written.
    pub fn persist_count(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }

    /// Number of journal entries appended.
    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    /// Journal entries since the last checkpoint.
    pub fn journal_len(&self) -> usize {
        self.persisted.lock().journal.len()
    }

    /// The stored state, decoded.
    pub fn snapshot(&self) -> Option<StoreSnapshot> {
        self.load().ok().flatten()
    }

    fn check_failing(&self) -> Result<()> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("memory storage is failing".into()));
        }
        Ok(())
    }
}

impl StorageAdapter for MemoryStorage {
    fn load(&self) -> Result<Option<StoreSnapshot>> {
        let persisted = self.persisted.lock();
        let Some(checkpoint) = persisted.checkpoint.as_deref() else {
            return Ok(None);
        };
        let snapshot = StoreSnapshot::from_json(checkpoint)?;
        replay(snapshot, persisted.journal.iter().map(String::as_str)).map(Some)
    }

    fn persist(&self, snapshot: &StoreSnapshot) -> Result<()> {
        self.check_failing()?;
        let json = snapshot.to_json()?;
        let mut persisted = self.persisted.lock();
        persisted.checkpoint = Some(json);
        persisted.journal.clear();
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn append(&self, changes: &ChangeSet) -> Result<()> {
        self.check_failing()?;
        let json = changes.to_json()?;
        self.persisted.lock().journal.push(json);
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wipe(&self) -> Result<()> {
        *self.persisted.lock() = Persisted::default();
        Ok(())
    }
}

/// Stores the checkpoint in a JSON file and the journal next to it as
/// newline-delimited JSON.
///
/// Checkpoints go to a sibling temp file which is then renamed over the
/// target, so a crash never leaves a half-written checkpoint behind.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    /// Path of the journal file.
    pub fn journal_path(&self) -> PathBuf {
        self.sibling(".journal")
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl StorageAdapter for FileStorage {
    fn load(&self) -> Result<Option<StoreSnapshot>> {
        let snapshot = match fs::read_to_string(&self.path) {
            Ok(json) => StoreSnapshot::from_json(&json)?,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let journal = match fs::read_to_string(self.journal_path()) {
            Ok(journal) => journal,
            Err(e) if e.kind() == IoErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        replay(snapshot, journal.lines()).map(Some)
    }

    fn persist(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let json = snapshot.to_json()?;
        self.ensure_parent()?;
        let temp = self.temp_path();
        fs::write(&temp, json)?;
        fs::rename(&temp, &self.path)?;
        // Entries left behind by a crash here are skipped on load: the
        // checkpoint records the journal position it contains.
        remove_if_present(&self.journal_path())?;
        tracing::trace!(path = %self.path.display(), "Checkpoint written");
        Ok(())
    }

    fn append(&self, changes: &ChangeSet) -> Result<()> {
        let mut line = changes.to_json()?;
        line.push('\n');
        self.ensure_parent()?;
        let mut journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())?;
        journal.write_all(line.as_bytes())?;
        journal.flush()?;
        tracing::trace!(position = changes.position, touched = changes.len(), "Journal entry appended");
        Ok(())
    }

    fn wipe(&self) -> Result<()> {
        remove_if_present(&self.path)?;
        remove_if_present(&self.journal_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_engine::{Record, SyncCursor};
    use serde_json::json;

    fn checkpoint(node: &str) -> StoreSnapshot {
        StoreSnapshot::new(1, node)
    }

    fn change(position: u64, id: &str, title: &str) -> ChangeSet {
        ChangeSet {
            position,
            records: vec![Record::new(id, "Post", json!({"title": title}), 10).with_version(1)],
            cursors: [("Post".to_string(), SyncCursor::new(position.to_string()))].into(),
            ..ChangeSet::default()
        }
    }

    #[test]
    fn memory_round_trip_and_failure() {
        let storage = MemoryStorage::new();
        assert!(storage.load().unwrap().is_none());

        storage.persist(&checkpoint("node-1")).unwrap();
        assert_eq!(storage.snapshot().unwrap().node_id, "node-1");
        assert_eq!(storage.persist_count(), 1);

        storage.fail_persist(true);
        let err = storage.persist(&checkpoint("node-2")).unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
        assert!(storage.append(&change(1, "a", "A")).is_err());
        assert_eq!(storage.snapshot().unwrap().node_id, "node-1");
        assert_eq!(storage.append_count(), 0);

        storage.wipe().unwrap();
        assert!(storage.snapshot().is_none());
    }

    #[test]
    fn memory_journal_replays_and_checkpoint_truncates() {
        let storage = MemoryStorage::new();
        storage.persist(&checkpoint("node-1")).unwrap();
        storage.append(&change(1, "a", "A")).unwrap();
        storage.append(&change(2, "a", "A2")).unwrap();

        let loaded = storage.snapshot().unwrap();
        assert_eq!(loaded.get_record("Post", "a").unwrap().payload, json!({"title": "A2"}));
        assert_eq!(loaded.cursors["Post"], SyncCursor::new("2"));
        assert_eq!(loaded.journal_position, 2);
        assert_eq!(storage.journal_len(), 2);

        storage.persist(&loaded).unwrap();
        assert_eq!(storage.journal_len(), 0);
        assert_eq!(storage.snapshot().unwrap(), loaded);
    }

    #[test]
    fn file_storage_persists_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested").join("drift.json"));

        assert!(storage.load().unwrap().is_none());
        storage.persist(&checkpoint("node-1")).unwrap();
        storage.persist(&checkpoint("node-2")).unwrap();

        assert_eq!(storage.load().unwrap().unwrap().node_id, "node-2");
        assert!(!storage.temp_path().exists());

        storage.wipe().unwrap();
        storage.wipe().unwrap();
        assert!(storage.load().unwrap().is_none());
    }

    #[test]
    fn file_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift.json");
        let storage = FileStorage::new(&path);
        storage.persist(&checkpoint("node-1")).unwrap();
        storage.append(&change(1, "a", "A")).unwrap();
        storage.append(&change(2, "b", "B")).unwrap();

        let loaded = FileStorage::new(&path).load().unwrap().unwrap();
        assert_eq!(loaded.record_count(), 2);
        assert_eq!(loaded.journal_position, 2);

        storage.persist(&loaded).unwrap();
        assert!(!storage.journal_path().exists());
        storage.wipe().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn torn_last_entry_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("drift.json"));
        storage.persist(&checkpoint("node-1")).unwrap();
        storage.append(&change(1, "a", "A")).unwrap();

        let mut journal = OpenOptions::new()
            .append(true)
            .open(storage.journal_path())
            .unwrap();
        journal.write_all(br#"{"position":2,"rec"#).unwrap();

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.record_count(), 1);
        assert_eq!(loaded.journal_position, 1);
    }

    #[test]
    fn entries_older_than_checkpoint_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("drift.json"));
        storage.append(&change(1, "a", "stale")).unwrap();

        // A checkpoint written after entry 1 whose journal was not removed.
        let mut newer = checkpoint("node-1");
        newer.add_record(Record::new("a", "Post", json!({"title": "fresh"}), 20).with_version(2));
        newer.journal_position = 1;
        fs::write(storage.path(), newer.to_json().unwrap()).unwrap();

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.get_record("Post", "a").unwrap().payload, json!({"title": "fresh"}));
    }

    #[test]
    fn corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift.json");
        fs::write(&path, "{ nope").unwrap();

        let err = FileStorage::new(&path).load().unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
    }
}
