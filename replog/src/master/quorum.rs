//! Quorum coordinator: per-write acknowledgement tracking.
//!
//! A [`PendingWrite`] exists for every in-flight sequence number whose write
//! concern is above 1. Its acknowledgement set lives in a `watch` channel:
//! the dispatcher workers add to it, the submitting request waits on it with
//! a deadline. No polling.
//!
//! ```text
//! submit ──register(seq, w)──▶ PendingWrite { acks: {master} }
//! worker ──acknowledge(seq, s1)──▶ acks ∪ {s1} ──▶ |acks| >= w ? release + remove
//! submit ◀──QuorumWaiter::wait(deadline)── Ok(acks) | Err(QuorumTimeout)
//! ```
//!
//! Acknowledgements for sequence numbers with no pending write (already
//! satisfied, timed out, or registered with `w = 1`) are ignored.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::MasterError;
use crate::time::TimeProvider;
use crate::types::NodeId;

struct PendingWrite {
    required: usize,
    acks: watch::Sender<BTreeSet<NodeId>>,
}

/// Tracks which nodes acknowledged each in-flight write.
pub struct QuorumCoordinator {
    master_id: NodeId,
    pending: Mutex<HashMap<u64, PendingWrite>>,
}

impl QuorumCoordinator {
    /// Create a coordinator; `master_id` is pre-acknowledged on every write.
    pub fn new(master_id: NodeId) -> Self {
        Self {
            master_id,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking `seq`, which needs `required` acknowledgements.
    ///
    /// Must be called before the entry is handed to the dispatcher so that
    /// no acknowledgement can be missed.
    pub fn register(self: &Arc<Self>, seq: u64, required: usize) -> QuorumWaiter {
        let initial = BTreeSet::from([self.master_id.clone()]);
        let (tx, rx) = watch::channel(initial);
        self.lock().insert(seq, PendingWrite { required, acks: tx });
        QuorumWaiter {
            seq,
            required,
            acks: rx,
            coordinator: Arc::clone(self),
        }
    }

    /// Record that `node` holds `seq`.
    ///
    /// Returns `false` when nothing is waiting on `seq`. When the set reaches
    /// the required size all waiters are released and the write is dropped
    /// from the pending table.
    pub fn acknowledge(&self, seq: u64, node: &NodeId) -> bool {
        let mut pending = self.lock();
        let Some(write) = pending.get(&seq) else {
            return false;
        };
        write.acks.send_modify(|acks| {
            acks.insert(node.clone());
        });
        let count = write.acks.borrow().len();
        if count >= write.required {
            debug!(seq, acks = count, required = write.required, "quorum reached");
            pending.remove(&seq);
        }
        true
    }

    /// Number of writes still waiting for acknowledgements.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn forget(&self, seq: u64) {
        self.lock().remove(&seq);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingWrite>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle held by the submitting request while it waits for its quorum.
///
/// Dropping the waiter (after success, timeout, or cancellation) removes the
/// pending write; later acknowledgements become no-ops.
pub struct QuorumWaiter {
    seq: u64,
    required: usize,
    acks: watch::Receiver<BTreeSet<NodeId>>,
    coordinator: Arc<QuorumCoordinator>,
}

impl QuorumWaiter {
    /// Current acknowledgement set, sorted.
    pub fn acked_by(&self) -> Vec<NodeId> {
        self.acks.borrow().iter().cloned().collect()
    }

    /// Block until `required` nodes acknowledged or `deadline` passes.
    pub async fn wait<P: TimeProvider>(
        mut self,
        time: &P,
        deadline: Duration,
    ) -> Result<Vec<NodeId>, MasterError> {
        let required = self.required;
        let acks = &mut self.acks;
        let outcome = time
            .timeout(deadline, async move {
                acks.wait_for(|acks| acks.len() >= required)
                    .await
                    .map(|_| ())
            })
            .await;

        let acked_by = self.acked_by();
        match outcome {
            Ok(Ok(())) => Ok(acked_by),
            // Sender gone: either it was satisfied and removed, or the
            // coordinator shut down. The last value tells which.
            Ok(Err(_)) if acked_by.len() >= required => Ok(acked_by),
            Ok(Err(_)) | Err(_) => {
                warn!(
                    seq = self.seq,
                    required,
                    acks = acked_by.len(),
                    "quorum not reached before deadline"
                );
                Err(MasterError::QuorumTimeout {
                    seq: self.seq,
                    required,
                    acked_by,
                })
            }
        }
    }
}

impl Drop for QuorumWaiter {
    fn drop(&mut self) {
        self.coordinator.forget(self.seq);
    }
}
