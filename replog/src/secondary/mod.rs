//! Secondary side: durable apply, catch-up and status.
//!
//! A [`Secondary`] owns one [`SecondaryStore`] behind a single lock, so live
//! replicate calls and catch-up observe cursor and buffer updates atomically.
//! If the persisted log is corrupted, at load time or by an append that
//! could not be rolled back, the secondary halts: every call fails with
//! [`SecondaryError::Halted`] until an operator repairs the data directory.

pub mod catchup;
pub mod storage;
pub mod store;

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::SecondaryConfig;
use crate::error::{SecondaryError, StorageError};
use crate::time::TimeProvider;
use crate::transport::{MasterSource, ReplicateHandler};
use crate::types::{LogEntry, NodeId, ReplicateAck, SecondaryStatus};

use self::catchup::{CatchUpReport, CatchUpSync};
use self::storage::{FileLogStorage, LogStorage};
use self::store::{ApplyOutcome, SecondaryStore};

enum State<S: LogStorage> {
    Ready(SecondaryStore<S>),
    Halted(String),
}

/// A secondary replica.
pub struct Secondary<S: LogStorage, P: TimeProvider> {
    config: SecondaryConfig,
    state: Mutex<State<S>>,
    time: P,
}

impl<P: TimeProvider> Secondary<FileLogStorage, P> {
    /// Open the file-backed store under `config.data_dir`.
    pub fn open_in_data_dir(config: SecondaryConfig, time: P) -> Result<Self, StorageError> {
        let storage = FileLogStorage::open(config.log_path(), config.seen_path())?;
        Self::open(config, storage, time)
    }
}

impl<S: LogStorage, P: TimeProvider> Secondary<S, P> {
    /// Load persisted state from `storage`.
    ///
    /// Corruption does not fail the call; the secondary comes up halted.
    pub fn open(config: SecondaryConfig, storage: S, time: P) -> Result<Self, StorageError> {
        let state = match SecondaryStore::open(storage) {
            Ok(store) => State::Ready(store),
            Err(e) if e.is_corruption() => {
                error!(
                    replica = %config.replica_id,
                    error = %e,
                    "persisted log is corrupted, halting apply path"
                );
                State::Halted(e.to_string())
            }
            Err(e) => return Err(e),
        };
        info!(replica = %config.replica_id, "secondary ready");
        Ok(Self {
            config,
            state: Mutex::new(state),
            time,
        })
    }

    /// This replica's id.
    pub fn replica_id(&self) -> &NodeId {
        &self.config.replica_id
    }

    /// Whether the apply path stopped on corruption.
    pub fn is_halted(&self) -> bool {
        matches!(*self.lock(), State::Halted(_))
    }

    /// Apply one entry pushed by the master.
    pub async fn replicate(&self, entry: LogEntry) -> Result<ReplicateAck, SecondaryError> {
        if !self.config.process_delay.is_zero() {
            self.time.sleep(self.config.process_delay).await;
        }

        let seq = entry.seq;
        let outcome = self.apply(entry).inspect_err(|e| {
            warn!(replica = %self.config.replica_id, seq, error = %e, "replicate rejected");
        })?;

        if outcome != ApplyOutcome::Duplicate && self.inject_failure() {
            warn!(replica = %self.config.replica_id, seq, "injected failure after persist");
            return Err(SecondaryError::InjectedFailure { seq });
        }
        Ok(ReplicateAck::ok(seq))
    }

    /// Entries `1..=apply_cursor`, ascending.
    pub fn messages(&self) -> Result<Vec<LogEntry>, SecondaryError> {
        match &*self.lock() {
            State::Ready(store) => Ok(store.applied().to_vec()),
            State::Halted(reason) => Err(SecondaryError::Halted(reason.clone())),
        }
    }

    /// Cursor, buffered sequence numbers and seen-id count.
    pub fn status(&self) -> Result<SecondaryStatus, SecondaryError> {
        match &*self.lock() {
            State::Ready(store) => Ok(store.status(&self.config.replica_id)),
            State::Halted(reason) => Err(SecondaryError::Halted(reason.clone())),
        }
    }

    /// Current apply cursor.
    pub fn apply_cursor(&self) -> Result<u64, SecondaryError> {
        self.status().map(|s| s.apply_cursor)
    }

    /// Backfill everything above the apply cursor from `source`.
    pub async fn catch_up<M>(&self, source: &M) -> Result<CatchUpReport, SecondaryError>
    where
        M: MasterSource + ?Sized,
    {
        let sync = CatchUpSync::new(
            self.config.catch_up_page_size,
            self.config.catch_up_attempts,
            self.config.catch_up_backoff.clone(),
            self.time.clone(),
        );
        let cursor = self.apply_cursor()?;
        let report = sync.run(source, cursor, |entry| self.apply(entry)).await?;
        debug!(replica = %self.config.replica_id, cursor = self.apply_cursor()?, "caught up");
        Ok(report)
    }

    fn apply(&self, entry: LogEntry) -> Result<ApplyOutcome, SecondaryError> {
        let mut state = self.lock();
        let result = match &mut *state {
            State::Ready(store) => store.apply(entry),
            State::Halted(reason) => return Err(SecondaryError::Halted(reason.clone())),
        };
        match result {
            Err(SecondaryError::Storage(e)) if e.is_corruption() => {
                error!(
                    replica = %self.config.replica_id,
                    error = %e,
                    "durable log corrupted, halting apply path"
                );
                let reason = e.to_string();
                *state = State::Halted(reason.clone());
                Err(SecondaryError::Halted(reason))
            }
            other => other,
        }
    }

    fn inject_failure(&self) -> bool {
        let rate = self.config.fail_after_persist_rate;
        rate > 0.0 && rand::random_bool(rate.min(1.0))
    }

    fn lock(&self) -> MutexGuard<'_, State<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<S: LogStorage, P: TimeProvider> ReplicateHandler for Secondary<S, P> {
    async fn handle_replicate(&self, entry: LogEntry) -> Result<ReplicateAck, SecondaryError> {
        self.replicate(entry).await
    }
}
