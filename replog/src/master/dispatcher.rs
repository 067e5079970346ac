//! Replication dispatcher: one ordered queue and one worker per secondary.
//!
//! ```text
//!                       ┌─▶ queue s1 ──▶ worker s1 ──replicate──▶ secondary s1
//! submit ──enqueue(seq)─┤
//!                       └─▶ queue s2 ──▶ worker s2 ──replicate──▶ secondary s2
//!                                           │
//!                                           └─ on ack: quorum.acknowledge(seq, id)
//! ```
//!
//! Each worker owns its queue and its replica's [`ReplicaStatus`]; nobody
//! else mutates them. A worker has at most one request in flight and never
//! moves past a sequence number until the secondary acknowledged it, so
//! delivery order per secondary is the enqueue order. Failures are retried
//! forever with exponential backoff; a slow or dead secondary only delays
//! itself.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{BackoffConfig, ReplicaEndpoint};
use crate::error::TransportError;
use crate::master::log::MasterLog;
use crate::master::quorum::QuorumCoordinator;
use crate::time::TimeProvider;
use crate::transport::ReplicaTransport;
use crate::types::{LogEntry, NodeId, ReplicaStatus};

/// Shared dependencies of every replication worker.
pub struct DispatchContext<T, P> {
    /// The master's log, read to fetch queued entries.
    pub log: Arc<Mutex<MasterLog>>,
    /// Where successful deliveries are reported.
    pub quorum: Arc<QuorumCoordinator>,
    /// Network seam to the secondaries.
    pub transport: Arc<T>,
    /// Sleeps and deadlines.
    pub time: P,
    /// Delay schedule between failed attempts.
    pub backoff: BackoffConfig,
    /// Deadline for one replicate call.
    pub request_timeout: Duration,
}

impl<T, P> DispatchContext<T, P> {
    fn entry(&self, seq: u64) -> Option<LogEntry> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(seq)
            .cloned()
    }
}

struct ReplicaHandle {
    id: NodeId,
    queue: mpsc::UnboundedSender<u64>,
    state: watch::Receiver<ReplicaStatus>,
}

/// Fan-out of accepted sequence numbers to the per-replica workers.
pub struct ReplicationDispatcher {
    replicas: Vec<ReplicaHandle>,
}

impl ReplicationDispatcher {
    /// Spawn one worker per replica on the current tokio runtime.
    pub fn start<T, P>(replicas: &[ReplicaEndpoint], ctx: DispatchContext<T, P>) -> Self
    where
        T: ReplicaTransport,
        P: TimeProvider,
    {
        let ctx = Arc::new(ctx);
        let replicas = replicas
            .iter()
            .map(|replica| {
                let (queue_tx, queue_rx) = mpsc::unbounded_channel();
                let (state_tx, state_rx) = watch::channel(ReplicaStatus {
                    id: replica.id.clone(),
                    endpoint: replica.url.clone(),
                    last_acknowledged_seq: 0,
                    alive: true,
                });
                let worker = ReplicaWorker {
                    replica: replica.clone(),
                    queue: queue_rx,
                    state: state_tx,
                    ctx: Arc::clone(&ctx),
                };
                tokio::spawn(worker.run());
                ReplicaHandle {
                    id: replica.id.clone(),
                    queue: queue_tx,
                    state: state_rx,
                }
            })
            .collect();
        Self { replicas }
    }

    /// Queue `seq` for every replica.
    ///
    /// Callers must enqueue in ascending sequence order; the master does so
    /// while still holding the log lock.
    pub fn enqueue(&self, seq: u64) {
        for replica in &self.replicas {
            if replica.queue.send(seq).is_err() {
                error!(replica = %replica.id, seq, "replication worker is gone");
            }
        }
    }

    /// Snapshot of every replica's status, in configuration order.
    pub fn status(&self) -> Vec<ReplicaStatus> {
        self.replicas
            .iter()
            .map(|replica| replica.state.borrow().clone())
            .collect()
    }

    /// Replicas that have acknowledged `seq` (and therefore everything before it).
    pub fn acknowledged(&self, seq: u64) -> Vec<NodeId> {
        self.replicas
            .iter()
            .filter(|replica| replica.state.borrow().last_acknowledged_seq >= seq)
            .map(|replica| replica.id.clone())
            .collect()
    }

    /// Watch a replica's status as its worker updates it.
    pub fn subscribe(&self, id: &NodeId) -> Option<watch::Receiver<ReplicaStatus>> {
        self.replicas
            .iter()
            .find(|replica| &replica.id == id)
            .map(|replica| replica.state.clone())
    }
}

struct ReplicaWorker<T, P> {
    replica: ReplicaEndpoint,
    queue: mpsc::UnboundedReceiver<u64>,
    state: watch::Sender<ReplicaStatus>,
    ctx: Arc<DispatchContext<T, P>>,
}

impl<T: ReplicaTransport, P: TimeProvider> ReplicaWorker<T, P> {
    async fn run(mut self) {
        info!(
            replica = %self.replica.id,
            endpoint = %self.replica.url,
            "replication worker started"
        );
        while let Some(seq) = self.queue.recv().await {
            self.deliver(seq).await;
        }
        debug!(replica = %self.replica.id, "replication queue closed, worker exiting");
    }

    /// Deliver one entry, retrying until the secondary acknowledges it.
    async fn deliver(&mut self, seq: u64) {
        let Some(entry) = self.ctx.entry(seq) else {
            error!(replica = %self.replica.id, seq, "queued seq missing from master log");
            return;
        };

        let mut attempts: u32 = 0;
        loop {
            match self.attempt(&entry).await {
                Ok(()) => {
                    self.on_ack(seq, attempts);
                    return;
                }
                Err(e) => {
                    attempts = attempts.saturating_add(1);
                    self.mark_down();
                    let delay = self.ctx.backoff.delay(attempts);
                    warn!(
                        replica = %self.replica.id,
                        seq,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "replication attempt failed, retrying"
                    );
                    self.ctx.time.sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(&self, entry: &LogEntry) -> Result<(), TransportError> {
        let ack = self
            .ctx
            .time
            .timeout(
                self.ctx.request_timeout,
                self.ctx.transport.replicate(&self.replica, entry),
            )
            .await
            .map_err(|_| TransportError::Timeout)??;

        if ack.acknowledges(entry.seq) {
            Ok(())
        } else {
            Err(TransportError::Rejected(format!(
                "expected ack for seq {}, got {:?}",
                entry.seq, ack
            )))
        }
    }

    fn on_ack(&self, seq: u64, failed_attempts: u32) {
        self.ctx.quorum.acknowledge(seq, &self.replica.id);
        let mut revived = false;
        self.state.send_modify(|state| {
            state.last_acknowledged_seq = state.last_acknowledged_seq.max(seq);
            revived = !state.alive;
            state.alive = true;
        });
        if revived {
            info!(replica = %self.replica.id, seq, failed_attempts, "replica is reachable again");
        }
        debug!(replica = %self.replica.id, seq, "entry acknowledged");
    }

    fn mark_down(&self) {
        let went_down = self.state.send_if_modified(|state| {
            let was_alive = state.alive;
            state.alive = false;
            was_alive
        });
        if went_down {
            warn!(replica = %self.replica.id, "replica marked down");
        }
    }
}
