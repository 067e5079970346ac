//! Sequencer, deduplication index and master log store.
//!
//! All three live in one [`MasterLog`] so that assigning a sequence number,
//! appending the entry and recording its id happen under a single `&mut`
//! borrow. The owner wraps it in one mutex; nothing else can observe a
//! sequence number without its entry.
//!
//! ## Invariants
//!
//! - `entries[i].seq == i + 1`: sequence numbers start at 1 and have no holes.
//! - `index[id] == seq` never changes once recorded.
//! - A dedup hit consumes no sequence number.

use std::collections::HashMap;

use tracing::debug;

use crate::types::LogEntry;

/// Outcome of [`MasterLog::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// A new entry was appended.
    Appended(LogEntry),
    /// The id was already in the log at this sequence number.
    Duplicate(u64),
}

impl Submission {
    /// The sequence number of the (new or existing) entry.
    pub fn seq(&self) -> u64 {
        match self {
            Submission::Appended(entry) => entry.seq,
            Submission::Duplicate(seq) => *seq,
        }
    }
}

/// The master's append-only log with its id index.
#[derive(Debug, Default)]
pub struct MasterLog {
    entries: Vec<LogEntry>,
    index: HashMap<String, u64>,
}

impl MasterLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, or return the existing sequence number for a known id.
    ///
    /// An absent id is replaced by a freshly generated one.
    pub fn submit(&mut self, id: Option<String>, payload: String) -> Submission {
        if let Some(seq) = id.as_deref().and_then(|id| self.lookup_id(id)) {
            debug!(seq, "duplicate submission");
            return Submission::Duplicate(seq);
        }

        let id = match id {
            Some(id) => id,
            None => self.generate_id(),
        };
        let entry = LogEntry {
            seq: self.next_seq(),
            id,
            payload,
        };
        self.index.insert(entry.id.clone(), entry.seq);
        self.entries.push(entry.clone());
        debug!(seq = entry.seq, id = %entry.id, "entry appended");
        Submission::Appended(entry)
    }

    /// The sequence number the next appended entry will get.
    pub fn next_seq(&self) -> u64 {
        self.last_seq() + 1
    }

    /// Highest assigned sequence number, 0 when empty.
    pub fn last_seq(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Look up an entry by sequence number.
    pub fn get(&self, seq: u64) -> Option<&LogEntry> {
        let idx = usize::try_from(seq.checked_sub(1)?).ok()?;
        self.entries.get(idx)
    }

    /// Sequence number assigned to a client id.
    pub fn lookup_id(&self, id: &str) -> Option<u64> {
        self.index.get(id).copied()
    }

    /// Every entry, ascending by sequence number.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Up to `limit` entries with `seq >= from_seq`, ascending.
    pub fn range(&self, from_seq: u64, limit: usize) -> Vec<LogEntry> {
        let start = usize::try_from(from_seq.max(1) - 1).unwrap_or(usize::MAX);
        self.entries
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn generate_id(&self) -> String {
        loop {
            let id = format!("{:032x}", rand::random::<u128>());
            if !self.index.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_starts_at_one_without_holes() {
        let mut log = MasterLog::new();
        assert!(log.is_empty());
        for i in 1..=5 {
            let sub = log.submit(Some(format!("m{i}")), format!("p{i}"));
            assert_eq!(sub.seq(), i);
        }
        let seqs: Vec<u64> = log.entries().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(log.last_seq(), 5);
    }

    #[test]
    fn test_duplicate_id_returns_existing_seq() {
        let mut log = MasterLog::new();
        assert!(matches!(
            log.submit(Some("a".into()), "hello".into()),
            Submission::Appended(_)
        ));
        log.submit(Some("b".into()), "world".into());

        let dup = log.submit(Some("a".into()), "different payload".into());
        assert_eq!(dup, Submission::Duplicate(1));
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(1).map(|e| e.payload.as_str()), Some("hello"));

        // The duplicate consumed no sequence number
        assert_eq!(log.submit(Some("c".into()), "x".into()).seq(), 3);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let mut log = MasterLog::new();
        for _ in 0..100 {
            log.submit(None, "p".into());
        }
        let mut ids: Vec<&str> = log.entries().iter().map(|e| e.id.as_str()).collect();
        assert!(ids.iter().all(|id| id.len() == 32));
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_get_out_of_range() {
        let mut log = MasterLog::new();
        log.submit(None, "p".into());
        assert!(log.get(0).is_none());
        assert!(log.get(1).is_some());
        assert!(log.get(2).is_none());
    }

    #[test]
    fn test_range_read() {
        let mut log = MasterLog::new();
        for i in 0..8 {
            log.submit(None, format!("p{i}"));
        }

        let page: Vec<u64> = log.range(6, 1000).iter().map(|e| e.seq).collect();
        assert_eq!(page, vec![6, 7, 8]);

        let page: Vec<u64> = log.range(2, 3).iter().map(|e| e.seq).collect();
        assert_eq!(page, vec![2, 3, 4]);

        // from_seq 0 reads from the start
        assert_eq!(log.range(0, 2).len(), 2);
        assert!(log.range(9, 10).is_empty());
        assert!(log.range(u64::MAX, 10).is_empty());
    }
}
