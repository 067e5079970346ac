//! Error types for the replicated log.
//!
//! | Error | Raised by | Handling |
//! |-------|-----------|----------|
//! | [`MasterError::Validation`] | malformed write | rejected, no side effects |
//! | [`MasterError::QuorumTimeout`] | quorum wait | surfaced, write is kept |
//! | [`TransportError`] | network calls | retried by the dispatcher |
//! | [`SecondaryError::Storage`] | secondary persistence | master retries delivery |
//! | [`StorageError::Corrupted`] | secondary reload | halts the secondary |
//! | [`StorageError::Poisoned`] | failed append rollback | halts the secondary |

use crate::types::NodeId;

/// Errors returned by the master's client-facing operations.
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    /// The write request is malformed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Not enough nodes acknowledged the write before the deadline.
    ///
    /// The entry stays in the log and replication continues.
    #[error("insufficient acknowledgements for seq {seq}: got {} of {required}", .acked_by.len())]
    QuorumTimeout {
        /// Sequence number assigned to the write.
        seq: u64,
        /// Write concern requested by the client.
        required: usize,
        /// Nodes that acknowledged before the deadline.
        acked_by: Vec<NodeId>,
    },
}

/// Errors returned by a secondary's apply path.
#[derive(Debug, thiserror::Error)]
pub enum SecondaryError {
    /// The replicate request is malformed.
    #[error("invalid entry: {0}")]
    Validation(String),

    /// The entry could not be made durable.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// An unseen id arrived for a sequence number already held under another id.
    #[error("conflicting entry for seq {seq}: have id {existing_id}, got {incoming_id}")]
    Conflict {
        /// The contested sequence number.
        seq: u64,
        /// Id already stored at `seq`.
        existing_id: String,
        /// Id carried by the rejected request.
        incoming_id: String,
    },

    /// Chaos hook: the entry was persisted but the acknowledgement is withheld.
    #[error("injected failure after persisting seq {seq}")]
    InjectedFailure {
        /// The persisted sequence number.
        seq: u64,
    },

    /// The apply path stopped after unrecoverable storage corruption.
    #[error("apply path halted: {0}")]
    Halted(String),

    /// Catch-up could not reach the master.
    #[error("catch-up failed: {0}")]
    CatchUp(#[source] TransportError),
}

impl SecondaryError {
    /// Whether redelivering the same entry may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SecondaryError::Storage(e) => !e.is_corruption(),
            SecondaryError::InjectedFailure { .. } | SecondaryError::CatchUp(_) => true,
            SecondaryError::Validation(_)
            | SecondaryError::Conflict { .. }
            | SecondaryError::Halted(_) => false,
        }
    }
}

/// Errors from the secondary's durable log.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A record in the middle of the log is unreadable.
    #[error("corrupted log at line {line}: {reason}")]
    Corrupted {
        /// 1-based line number of the bad record.
        line: usize,
        /// Decoder message.
        reason: String,
    },

    /// A failed append could not be rolled back; the log may end in a
    /// partial record and accepts no further appends.
    #[error("log poisoned: {0}")]
    Poisoned(String),
}

impl StorageError {
    /// Whether this error requires operator intervention.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::Corrupted { .. } | StorageError::Poisoned(_)
        )
    }
}

/// Errors talking to another node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer could not be reached.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The call exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// The peer answered with a non-success status.
    #[error("peer returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The peer answered but refused the request.
    #[error("peer rejected request: {0}")]
    Rejected(String),

    /// A body could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Malformed URL or protocol failure.
    #[error("http error: {0}")]
    Http(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}
