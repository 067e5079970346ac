//! Secondary store: idempotent apply with an out-of-order buffer.
//!
//! ```text
//! apply(entry)
//!   id seen?            → Duplicate (ack, nothing changes)
//!   seq held by other?  → Conflict
//!   persist             → error: nothing changes, caller retries
//!   buffer[seq] = entry
//!   while buffer has cursor+1: move it to applied, cursor += 1
//! ```
//!
//! Entries at or below the apply cursor form `applied`, which is always
//! `1..=cursor` with no gaps. Everything above the cursor waits in the
//! buffer until the hole below it is filled.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info};

use super::storage::LogStorage;
use crate::error::{SecondaryError, StorageError};
use crate::types::{LogEntry, NodeId, SecondaryStatus};

/// Result of [`SecondaryStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The id was already seen; nothing changed.
    Duplicate,
    /// The entry was persisted and the cursor advanced to `cursor`.
    Applied {
        /// Apply cursor after this entry.
        cursor: u64,
    },
    /// The entry was persisted but waits behind a gap.
    Buffered,
}

/// Applied log, apply cursor, seen ids and out-of-order buffer of one secondary.
#[derive(Debug)]
pub struct SecondaryStore<S: LogStorage> {
    storage: S,
    applied: Vec<LogEntry>,
    buffer: BTreeMap<u64, LogEntry>,
    seen_ids: HashSet<String>,
}

impl<S: LogStorage> SecondaryStore<S> {
    /// Load persisted state and rebuild the cursor and buffer from it.
    pub fn open(mut storage: S) -> Result<Self, StorageError> {
        let state = storage.load()?;

        let mut by_seq: BTreeMap<u64, LogEntry> = BTreeMap::new();
        for (idx, entry) in state.entries.into_iter().enumerate() {
            if entry.seq == 0 {
                return Err(StorageError::Corrupted {
                    line: idx + 1,
                    reason: "sequence number 0".into(),
                });
            }
            if let Some(existing) = by_seq.get(&entry.seq) {
                if existing.id != entry.id {
                    return Err(StorageError::Corrupted {
                        line: idx + 1,
                        reason: format!(
                            "seq {} stored under ids {} and {}",
                            entry.seq, existing.id, entry.id
                        ),
                    });
                }
                continue;
            }
            by_seq.insert(entry.seq, entry);
        }

        let mut seen_ids = state.seen_ids;
        seen_ids.extend(by_seq.values().map(|e| e.id.clone()));

        let mut store = Self {
            storage,
            applied: Vec::new(),
            buffer: by_seq,
            seen_ids,
        };
        store.advance();
        info!(
            cursor = store.apply_cursor(),
            buffered = store.buffer.len(),
            seen = store.seen_ids.len(),
            "secondary state loaded"
        );
        Ok(store)
    }

    /// Apply one replicated entry. Idempotent by id.
    pub fn apply(&mut self, entry: LogEntry) -> Result<ApplyOutcome, SecondaryError> {
        if entry.seq == 0 {
            return Err(SecondaryError::Validation("seq must be at least 1".into()));
        }
        if entry.id.is_empty() {
            return Err(SecondaryError::Validation("id must not be empty".into()));
        }
        if self.seen_ids.contains(&entry.id) {
            debug!(seq = entry.seq, id = %entry.id, "duplicate delivery");
            return Ok(ApplyOutcome::Duplicate);
        }
        if let Some(existing) = self.held(entry.seq) {
            return Err(SecondaryError::Conflict {
                seq: entry.seq,
                existing_id: existing.id.clone(),
                incoming_id: entry.id,
            });
        }

        self.storage.append(&entry)?;
        let seq = entry.seq;
        self.seen_ids.insert(entry.id.clone());
        self.buffer.insert(seq, entry);

        let before = self.apply_cursor();
        self.advance();
        let cursor = self.apply_cursor();
        if cursor > before {
            debug!(seq, cursor, "entry applied");
            Ok(ApplyOutcome::Applied { cursor })
        } else {
            debug!(seq, cursor, "entry buffered behind gap");
            Ok(ApplyOutcome::Buffered)
        }
    }

    /// Entries `1..=apply_cursor`, ascending.
    pub fn applied(&self) -> &[LogEntry] {
        &self.applied
    }

    /// Highest `n` such that `1..=n` are all applied.
    pub fn apply_cursor(&self) -> u64 {
        self.applied.len() as u64
    }

    /// Sequence numbers waiting above the cursor, ascending.
    pub fn buffered_seqs(&self) -> Vec<u64> {
        self.buffer.keys().copied().collect()
    }

    /// Number of distinct ids seen.
    pub fn seen_count(&self) -> usize {
        self.seen_ids.len()
    }

    /// Whether `id` was already persisted.
    pub fn has_seen(&self, id: &str) -> bool {
        self.seen_ids.contains(id)
    }

    /// Snapshot for the status endpoint.
    pub fn status(&self, replica_id: &NodeId) -> SecondaryStatus {
        SecondaryStatus {
            replica_id: replica_id.clone(),
            apply_cursor: self.apply_cursor(),
            buffered_seqs: self.buffered_seqs(),
            seen_count: self.seen_count(),
        }
    }

    fn held(&self, seq: u64) -> Option<&LogEntry> {
        if seq <= self.apply_cursor() {
            let idx = usize::try_from(seq - 1).ok()?;
            self.applied.get(idx)
        } else {
            self.buffer.get(&seq)
        }
    }

    fn advance(&mut self) {
        while let Some(entry) = self.buffer.remove(&(self.apply_cursor() + 1)) {
            self.applied.push(entry);
        }
    }
}
