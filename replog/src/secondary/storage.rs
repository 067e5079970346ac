//! Durable storage for a secondary's applied entries.
//!
//! The [`LogStorage`] trait abstracts the two things a secondary persists:
//! the entries it accepted, in the order it accepted them, and the ids it has
//! seen. Implementations must make an append durable before returning.
//!
//! ## On-disk layout ([`FileLogStorage`])
//!
//! ```text
//! {data_dir}/{replica}_log.jsonl   one LogEntry per line, append-only, fsynced
//! {data_dir}/{replica}_seen.jsonl  one id per line, best effort
//! ```
//!
//! The entry log is authoritative. The seen-id journal is written after the
//! entry is durable, so a crash between the two is repaired on reload by
//! deriving seen ids from the log itself.
//!
//! ## Recovery rules
//!
//! - Bytes after the last newline are a torn append (crash mid-write). The
//!   entry was never acknowledged, so the tail is truncated away.
//! - An unreadable line before the tail is corruption: loading fails with
//!   [`StorageError::Corrupted`] and the secondary halts.
//! - A failed append is truncated back to the last good length. If that
//!   truncation fails too, the storage is poisoned: every later append
//!   returns [`StorageError::Poisoned`] so nothing is acknowledged after a
//!   partial record.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, warn};

use crate::error::StorageError;
use crate::types::LogEntry;

/// State recovered from durable storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    /// Every persisted entry, in append order.
    pub entries: Vec<LogEntry>,
    /// Every id recorded as seen.
    pub seen_ids: HashSet<String>,
}

/// Persistent state of a secondary.
pub trait LogStorage: Send + 'static {
    /// Read everything persisted so far, repairing a torn tail if present.
    fn load(&mut self) -> Result<PersistedState, StorageError>;

    /// Durably append `entry` and record its id as seen.
    ///
    /// On error nothing must remain that a later [`load`](Self::load) would
    /// return.
    fn append(&mut self, entry: &LogEntry) -> Result<(), StorageError>;
}

/// File-backed [`LogStorage`]: append-only JSON lines plus a seen-id journal.
#[derive(Debug)]
pub struct FileLogStorage {
    log_path: PathBuf,
    log: File,
    seen: File,
    poisoned: Option<String>,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl FileLogStorage {
    /// Open (creating if needed) the log and journal files.
    pub fn open(
        log_path: impl AsRef<Path>,
        seen_path: impl AsRef<Path>,
    ) -> Result<Self, StorageError> {
        let log_path = log_path.as_ref().to_path_buf();
        for path in [log_path.as_path(), seen_path.as_ref()] {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
        }
        let log = open_append(&log_path)?;
        let seen = open_append(seen_path.as_ref())?;
        info!(path = %log_path.display(), "opened secondary log");
        Ok(Self {
            log_path,
            log,
            seen,
            poisoned: None,
            #[cfg(test)]
            fail_next_sync: false,
        })
    }

    /// Whether a failed append left the log in an unknown state.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    fn write_record(&mut self, record: &[u8]) -> std::io::Result<()> {
        self.log.write_all(record)?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(std::io::Error::other("injected sync failure"));
        }
        self.log.sync_data()
    }

    /// Cut the log back to `good_len` after a failed append.
    fn roll_back(&mut self, good_len: u64, cause: std::io::Error) -> StorageError {
        match self.log.set_len(good_len).and_then(|()| self.log.sync_data()) {
            Ok(()) => cause.into(),
            Err(truncate) => {
                let reason = format!("append failed ({cause}) and rollback failed ({truncate})");
                error!(path = %self.log_path.display(), %reason, "secondary log poisoned");
                self.poisoned = Some(reason.clone());
                StorageError::Poisoned(reason)
            }
        }
    }

    fn load_entries(&mut self) -> Result<Vec<LogEntry>, StorageError> {
        let bytes = read_all(&mut self.log)?;
        let (complete, torn) = split_tail(&bytes);
        if torn > 0 {
            warn!(
                path = %self.log_path.display(),
                bytes = torn,
                "dropping torn record at end of log"
            );
            self.log.set_len(complete.len() as u64)?;
            self.log.sync_data()?;
        }

        let mut entries = Vec::new();
        for (idx, line) in complete.split(|b| *b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            let entry = serde_json::from_slice::<LogEntry>(line).map_err(|e| {
                StorageError::Corrupted {
                    line: idx + 1,
                    reason: e.to_string(),
                }
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn load_seen(&mut self) -> Result<HashSet<String>, StorageError> {
        let bytes = read_all(&mut self.seen)?;
        let (complete, torn) = split_tail(&bytes);
        if torn > 0 {
            self.seen.set_len(complete.len() as u64)?;
        }
        let mut seen = HashSet::new();
        for line in complete.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            match serde_json::from_slice::<String>(line) {
                Ok(id) => {
                    seen.insert(id);
                }
                // The log is authoritative; a bad journal line loses nothing
                Err(e) => warn!(error = %e, "skipping unreadable seen-id record"),
            }
        }
        Ok(seen)
    }
}

impl LogStorage for FileLogStorage {
    fn load(&mut self) -> Result<PersistedState, StorageError> {
        let entries = self.load_entries()?;
        let mut seen_ids = self.load_seen()?;
        seen_ids.extend(entries.iter().map(|e| e.id.clone()));
        debug!(
            entries = entries.len(),
            seen = seen_ids.len(),
            "loaded persisted state"
        );
        Ok(PersistedState { entries, seen_ids })
    }

    fn append(&mut self, entry: &LogEntry) -> Result<(), StorageError> {
        if let Some(reason) = &self.poisoned {
            return Err(StorageError::Poisoned(reason.clone()));
        }
        let mut record = serde_json::to_vec(entry)?;
        record.push(b'\n');

        let good_len = self.log.metadata()?.len();
        if let Err(e) = self.write_record(&record) {
            return Err(self.roll_back(good_len, e));
        }

        let mut id = serde_json::to_vec(&entry.id)?;
        id.push(b'\n');
        if let Err(e) = self.seen.write_all(&id) {
            warn!(seq = entry.seq, error = %e, "seen-id journal append failed");
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
}

fn read_all(file: &mut File) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Split `bytes` into the newline-terminated prefix and the torn tail length.
fn split_tail(bytes: &[u8]) -> (&[u8], usize) {
    let complete = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    (&bytes[..complete], bytes.len() - complete)
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: Vec<LogEntry>,
    seen_ids: HashSet<String>,
    failing_appends: usize,
    poisoned: Option<String>,
}

/// In-memory [`LogStorage`] for tests and embedding.
///
/// Clones share the same state, so a test can keep a handle, "restart" a
/// secondary by opening a new store on a clone, and inject append failures.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl InMemoryLogStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a storage pre-populated with `entries`.
    pub fn with_entries(entries: impl IntoIterator<Item = LogEntry>) -> Self {
        let storage = Self::new();
        {
            let mut inner = storage.lock();
            for entry in entries {
                inner.seen_ids.insert(entry.id.clone());
                inner.entries.push(entry);
            }
        }
        storage
    }

    /// Make the next `count` appends fail with an I/O error.
    pub fn fail_next_appends(&self, count: usize) {
        self.lock().failing_appends = count;
    }

    /// Make every later append fail with [`StorageError::Poisoned`].
    pub fn poison(&self, reason: impl Into<String>) {
        self.lock().poisoned = Some(reason.into());
    }

    /// Number of persisted entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether nothing was persisted.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LogStorage for InMemoryLogStorage {
    fn load(&mut self) -> Result<PersistedState, StorageError> {
        let inner = self.lock();
        Ok(PersistedState {
            entries: inner.entries.clone(),
            seen_ids: inner.seen_ids.clone(),
        })
    }

    fn append(&mut self, entry: &LogEntry) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.poisoned {
            return Err(StorageError::Poisoned(reason.clone()));
        }
        if inner.failing_appends > 0 {
            inner.failing_appends -= 1;
            let injected = std::io::Error::other("injected append failure");
            return Err(StorageError::Io(injected));
        }
        inner.seen_ids.insert(entry.id.clone());
        inner.entries.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(dir: &TempDir) -> (PathBuf, PathBuf) {
        (
            dir.path().join("s1_log.jsonl"),
            dir.path().join("s1_seen.jsonl"),
        )
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let (log, seen) = paths(&dir);
        {
            let mut storage = FileLogStorage::open(&log, &seen).expect("open");
            assert_eq!(storage.load().expect("load"), PersistedState::default());
            storage.append(&LogEntry::new(1, "a", "hello")).expect("append");
            storage.append(&LogEntry::new(3, "c", "later")).expect("append");
        }

        let mut storage = FileLogStorage::open(&log, &seen).expect("reopen");
        let state = storage.load().expect("load");
        let seqs: Vec<u64> = state.entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 3]);
        assert!(state.seen_ids.contains("a"));
        assert!(state.seen_ids.contains("c"));
    }

    #[test]
    fn test_seen_ids_rebuilt_from_log_when_journal_is_lost() {
        let dir = TempDir::new().expect("tempdir");
        let (log, seen) = paths(&dir);
        {
            let mut storage = FileLogStorage::open(&log, &seen).expect("open");
            storage.append(&LogEntry::new(1, "a", "x")).expect("append");
        }
        fs::write(&seen, b"").expect("wipe journal");

        let mut storage = FileLogStorage::open(&log, &seen).expect("reopen");
        let state = storage.load().expect("load");
        assert_eq!(state.seen_ids, HashSet::from(["a".to_string()]));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().expect("tempdir");
        let (log, seen) = paths(&dir);
        {
            let mut storage = FileLogStorage::open(&log, &seen).expect("open");
            storage.append(&LogEntry::new(1, "a", "x")).expect("append");
        }
        let good_len = fs::metadata(&log).expect("metadata").len();
        let mut file = OpenOptions::new().append(true).open(&log).expect("open raw");
        file.write_all(br#"{"seq":2,"id":"b","pay"#).expect("torn write");
        drop(file);

        let mut storage = FileLogStorage::open(&log, &seen).expect("reopen");
        let state = storage.load().expect("load");
        assert_eq!(state.entries, vec![LogEntry::new(1, "a", "x")]);
        assert_eq!(fs::metadata(&log).expect("metadata").len(), good_len);

        // Appends continue cleanly after the repaired tail
        storage.append(&LogEntry::new(2, "b", "y")).expect("append");
        assert_eq!(storage.load().expect("load").entries.len(), 2);
    }

    #[test]
    fn test_corruption_in_the_middle_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let (log, seen) = paths(&dir);
        fs::write(
            &log,
            concat!(
                r#"{"seq":1,"id":"a","payload":"x"}"#,
                "\n",
                "not json\n",
                r#"{"seq":2,"id":"b","payload":"y"}"#,
                "\n"
            ),
        )
        .expect("seed log");

        let mut storage = FileLogStorage::open(&log, &seen).expect("open");
        let err = storage.load().expect_err("corrupted");
        assert!(err.is_corruption());
        assert!(matches!(err, StorageError::Corrupted { line: 2, .. }));
    }

    #[test]
    fn test_failed_append_truncates_back_to_last_good_length() {
        let dir = TempDir::new().expect("tempdir");
        let (log, seen) = paths(&dir);
        let mut storage = FileLogStorage::open(&log, &seen).expect("open");
        storage.append(&LogEntry::new(1, "a", "x")).expect("append");
        let good_len = fs::metadata(&log).expect("metadata").len();

        // The record reaches the file, then the fsync fails
        storage.fail_next_sync = true;
        let err = storage
            .append(&LogEntry::new(2, "b", "y"))
            .expect_err("sync failure");
        assert!(matches!(err, StorageError::Io(_)));
        assert!(!err.is_corruption());
        assert!(!storage.is_poisoned());
        assert_eq!(fs::metadata(&log).expect("metadata").len(), good_len);

        let mut reopened = FileLogStorage::open(&log, &seen).expect("reopen");
        assert_eq!(
            reopened.load().expect("load").entries,
            vec![LogEntry::new(1, "a", "x")]
        );

        // The retry lands right after the last good record
        storage.append(&LogEntry::new(2, "b", "y")).expect("retry");
        let seqs: Vec<u64> = reopened
            .load()
            .expect("load")
            .entries
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_failed_rollback_poisons_the_log() {
        let dir = TempDir::new().expect("tempdir");
        let (log, seen) = paths(&dir);
        let mut storage = FileLogStorage::open(&log, &seen).expect("open");
        storage.append(&LogEntry::new(1, "a", "x")).expect("append");

        // A read-only handle fails both the write and the truncate
        storage.log = File::open(&log).expect("read-only handle");
        let err = storage
            .append(&LogEntry::new(2, "b", "y"))
            .expect_err("read-only");
        assert!(matches!(err, StorageError::Poisoned(_)));
        assert!(err.is_corruption());
        assert!(storage.is_poisoned());

        // Even with a healthy handle back, nothing is appended after the failure
        storage.log = open_append(&log).expect("writable handle");
        let err = storage
            .append(&LogEntry::new(3, "c", "z"))
            .expect_err("still poisoned");
        assert!(matches!(err, StorageError::Poisoned(_)));

        let mut reopened = FileLogStorage::open(&log, &seen).expect("reopen");
        assert_eq!(
            reopened.load().expect("load").entries,
            vec![LogEntry::new(1, "a", "x")]
        );
    }

    #[test]
    fn test_open_creates_missing_directories() {
        let dir = TempDir::new().expect("tempdir");
        let nested = dir.path().join("a").join("b");
        let mut storage = FileLogStorage::open(nested.join("log.jsonl"), nested.join("seen.jsonl"))
            .expect("open");
        storage.append(&LogEntry::new(1, "a", "x")).expect("append");
        assert!(nested.join("log.jsonl").exists());
    }

    #[test]
    fn test_in_memory_fault_injection() {
        let storage = InMemoryLogStorage::new();
        let mut handle = storage.clone();
        storage.fail_next_appends(1);

        let err = handle.append(&LogEntry::new(1, "a", "x")).expect_err("injected");
        assert!(!err.is_corruption());
        assert!(storage.is_empty());

        handle.append(&LogEntry::new(1, "a", "x")).expect("append");
        assert_eq!(storage.len(), 1);
        assert!(handle.load().expect("load").seen_ids.contains("a"));
    }
}
