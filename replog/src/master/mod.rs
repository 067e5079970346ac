//! Master side: sequencing, quorum waits and replication fan-out.
//!
//! ## Write path
//!
//! ```text
//! 1. validate w (1 ≤ w ≤ 1 + secondaries)
//! 2. under the log lock:
//!      dedup hit  → return existing seq (no new entry, no re-dispatch)
//!      otherwise  → assign seq, append, register PendingWrite (w > 1),
//!                   enqueue seq on every replica queue
//! 3. w = 1 → answer {seq, [master]}
//!    w > 1 → wait for w acknowledgements or the quorum deadline
//! ```
//!
//! Assigning the sequence number, appending and enqueueing share one critical
//! section, so every replica queue receives sequence numbers in ascending
//! order and the log never has holes. A quorum timeout fails the request but
//! never rolls the write back; the workers keep delivering it.

pub mod dispatcher;
pub mod log;
pub mod quorum;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{ConfigError, MasterConfig, WriteConcernDefault};
use crate::error::{MasterError, TransportError};
use crate::time::TimeProvider;
use crate::transport::{MasterSource, ReplicaTransport};
use crate::types::{
    LogEntry, NodeId, RangeQuery, ReplicaStatus, SubmitRequest, SubmitResponse,
};

use self::dispatcher::{DispatchContext, ReplicationDispatcher};
use self::log::{MasterLog, Submission};
use self::quorum::{QuorumCoordinator, QuorumWaiter};

/// The master node.
pub struct Master<P: TimeProvider> {
    config: MasterConfig,
    log: Arc<Mutex<MasterLog>>,
    quorum: Arc<QuorumCoordinator>,
    dispatcher: ReplicationDispatcher,
    time: P,
}

impl<P: TimeProvider> Master<P> {
    /// Create the master and spawn one replication worker per configured
    /// secondary on the current tokio runtime.
    ///
    /// Fails if a replica id is duplicated or equal to the master's own id.
    pub fn start<T: ReplicaTransport>(
        config: MasterConfig,
        transport: T,
        time: P,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let log = Arc::new(Mutex::new(MasterLog::new()));
        let quorum = Arc::new(QuorumCoordinator::new(config.node_id.clone()));
        let dispatcher = ReplicationDispatcher::start(
            &config.replicas,
            DispatchContext {
                log: Arc::clone(&log),
                quorum: Arc::clone(&quorum),
                transport: Arc::new(transport),
                time: time.clone(),
                backoff: config.backoff.clone(),
                request_timeout: config.request_timeout,
            },
        );
        info!(
            node = %config.node_id,
            replicas = config.replicas.len(),
            default_w = ?config.default_write_concern,
            "master started"
        );
        Ok(Self {
            config,
            log,
            quorum,
            dispatcher,
            time,
        })
    }

    /// Accept a client write and answer once its write concern is met.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, MasterError> {
        let required = self.required_acks(request.w)?;
        if request.id.as_deref() == Some("") {
            return Err(MasterError::Validation("id must not be empty".into()));
        }

        let accepted = {
            let mut log = self.lock_log();
            match log.submit(request.id, request.payload) {
                Submission::Duplicate(seq) => Accepted::Duplicate(seq),
                Submission::Appended(entry) => {
                    let waiter = (required > 1).then(|| self.quorum.register(entry.seq, required));
                    self.dispatcher.enqueue(entry.seq);
                    Accepted::New(entry.seq, waiter)
                }
            }
        };

        match accepted {
            Accepted::Duplicate(seq) => Ok(SubmitResponse {
                seq,
                acked_by: self.known_acks(seq),
            }),
            Accepted::New(seq, None) => Ok(SubmitResponse {
                seq,
                acked_by: vec![self.config.node_id.clone()],
            }),
            Accepted::New(seq, Some(waiter)) => {
                debug!(seq, required, "waiting for quorum");
                let acked_by = waiter.wait(&self.time, self.config.quorum_timeout).await?;
                Ok(SubmitResponse { seq, acked_by })
            }
        }
    }

    /// Every entry, ascending by sequence number.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock_log().entries().to_vec()
    }

    /// Range read for catch-up.
    pub fn entries_from(&self, query: RangeQuery) -> Vec<LogEntry> {
        self.lock_log().range(query.from_seq, query.limit)
    }

    /// Highest assigned sequence number.
    pub fn last_seq(&self) -> u64 {
        self.lock_log().last_seq()
    }

    /// Per-secondary delivery status.
    pub fn replica_status(&self) -> Vec<ReplicaStatus> {
        self.dispatcher.status()
    }

    /// Watch one secondary's delivery status.
    pub fn subscribe_replica(&self, id: &NodeId) -> Option<watch::Receiver<ReplicaStatus>> {
        self.dispatcher.subscribe(id)
    }

    /// Writes still waiting for their quorum.
    pub fn pending_writes(&self) -> usize {
        self.quorum.pending_count()
    }

    /// Validate `w` and turn it into a required acknowledgement count.
    fn required_acks(&self, w: Option<u32>) -> Result<usize, MasterError> {
        let total = self.config.total_nodes();
        let w = match w {
            Some(w) => usize::try_from(w).unwrap_or(usize::MAX),
            None => match self.config.default_write_concern {
                WriteConcernDefault::One => 1,
                WriteConcernDefault::All => total,
            },
        };
        if w == 0 || w > total {
            return Err(MasterError::Validation(format!(
                "w must be between 1 and {total}, got {w}"
            )));
        }
        Ok(w)
    }

    /// Master plus every replica that has acknowledged `seq`.
    fn known_acks(&self, seq: u64) -> Vec<NodeId> {
        let mut acked = vec![self.config.node_id.clone()];
        acked.extend(self.dispatcher.acknowledged(seq));
        acked.sort();
        acked
    }

    fn lock_log(&self) -> MutexGuard<'_, MasterLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Accepted {
    Duplicate(u64),
    New(u64, Option<QuorumWaiter>),
}

#[async_trait]
impl<P: TimeProvider> MasterSource for Master<P> {
    async fn fetch_entries(&self, query: RangeQuery) -> Result<Vec<LogEntry>, TransportError> {
        Ok(self.entries_from(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicaEndpoint;
    use crate::time::TokioTimeProvider;
    use crate::transport::InProcessTransport;
    use std::collections::HashSet;
    use std::time::Duration;

    fn master(replicas: &[&str]) -> Arc<Master<TokioTimeProvider>> {
        let endpoints = replicas
            .iter()
            .map(|id| ReplicaEndpoint::new(*id, format!("local://{id}")))
            .collect();
        let config = MasterConfig::new(endpoints).with_quorum_timeout(Duration::from_millis(200));
        let master = Master::start(config, InProcessTransport::new(), TokioTimeProvider::new())
            .expect("start");
        Arc::new(master)
    }

    #[tokio::test(start_paused = true)]
    async fn test_replica_with_master_id_is_rejected() {
        let endpoints = vec![
            ReplicaEndpoint::new("s1", "local://s1"),
            ReplicaEndpoint::new("master", "local://master"),
        ];
        let result = Master::start(
            MasterConfig::new(endpoints),
            InProcessTransport::new(),
            TokioTimeProvider::new(),
        );
        assert!(matches!(result, Err(ConfigError::ReplicaIsMaster(id)) if id == "master"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_w1_answers_without_any_secondary() {
        // No routes: both secondaries are unreachable
        let master = master(&["s1", "s2"]);
        let resp = master
            .submit(SubmitRequest::new("hello").with_w(1))
            .await
            .expect("submit");
        assert_eq!(resp.seq, 1);
        assert_eq!(resp.acked_by, vec![NodeId::from("master")]);
        assert_eq!(master.pending_writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_write_concern_has_no_side_effects() {
        let master = master(&["s1"]);
        for w in [0, 3] {
            let err = master
                .submit(SubmitRequest::new("x").with_w(w))
                .await
                .expect_err("invalid w");
            assert!(matches!(err, MasterError::Validation(_)));
        }
        let err = master
            .submit(SubmitRequest::new("x").with_id(""))
            .await
            .expect_err("empty id");
        assert!(matches!(err, MasterError::Validation(_)));
        assert_eq!(master.last_seq(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quorum_timeout_keeps_the_write() {
        let master = master(&["s1"]);
        let err = master
            .submit(SubmitRequest::new("x").with_id("a").with_w(2))
            .await
            .expect_err("no secondary reachable");
        match err {
            MasterError::QuorumTimeout { seq, acked_by, .. } => {
                assert_eq!(seq, 1);
                assert_eq!(acked_by, vec![NodeId::from("master")]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(master.entries().len(), 1);
        assert_eq!(master.pending_writes(), 0);

        // Resubmitting the same id is a dedup hit, not a second entry
        let resp = master
            .submit(SubmitRequest::new("x").with_id("a").with_w(2))
            .await
            .expect("duplicate");
        assert_eq!(resp.seq, 1);
        assert_eq!(master.entries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_write_concern_all() {
        let endpoints = vec![ReplicaEndpoint::new("s1", "local://s1")];
        let config = MasterConfig::new(endpoints)
            .with_default_write_concern(WriteConcernDefault::All)
            .with_quorum_timeout(Duration::from_millis(100));
        let master = Master::start(config, InProcessTransport::new(), TokioTimeProvider::new())
            .expect("start");
        let err = master
            .submit(SubmitRequest::new("x"))
            .await
            .expect_err("waits for s1");
        assert!(matches!(err, MasterError::QuorumTimeout { required: 2, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submits_have_no_gaps() {
        let master = master(&[]);
        let mut tasks = Vec::new();
        for i in 0..200 {
            let master = Arc::clone(&master);
            tasks.push(tokio::spawn(async move {
                master
                    .submit(SubmitRequest::new(format!("p{i}")).with_id(format!("id-{}", i % 50)))
                    .await
                    .expect("submit")
                    .seq
            }));
        }
        let mut seqs = HashSet::new();
        for task in tasks {
            seqs.insert(task.await.expect("task"));
        }

        // 50 distinct ids → exactly 50 entries numbered 1..=50
        assert_eq!(seqs, (1..=50).collect::<HashSet<u64>>());
        let entries = master.entries();
        assert_eq!(entries.len(), 50);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.seq, i as u64 + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_read_through_master_source() {
        let master = master(&[]);
        for i in 0..8 {
            master
                .submit(SubmitRequest::new(format!("p{i}")))
                .await
                .expect("submit");
        }
        let page = master
            .fetch_entries(RangeQuery {
                from_seq: 6,
                limit: 10,
            })
            .await
            .expect("fetch");
        assert_eq!(page.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![6, 7, 8]);
    }
}
