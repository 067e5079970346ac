//! # replog: a primary-backup replicated append-only log
//!
//! One master accepts writes, assigns them gap-free sequence numbers and
//! fans them out to N secondaries. A client chooses a write concern `w`:
//! the master answers once `w` nodes (itself included) hold the entry.
//!
//! ## Architecture
//!
//! ```text
//!               client
//!                 │ submit {id?, payload, w?}
//!                 ▼
//! ┌──────────────────────────────────────────────┐
//! │                   Master                      │
//! │  MasterLog: seq counter + id index + entries  │
//! │  QuorumCoordinator: PendingWrite per seq      │
//! │  ReplicationDispatcher: one queue per replica │
//! └───────┬───────────────────────────┬──────────┘
//!         │ replicate(seq, id, p)     │ replicate(...)
//!         ▼                           ▼
//! ┌────────────────┐          ┌────────────────┐
//! │  Secondary s1  │          │  Secondary s2  │
//! │ dedup → persist│          │ dedup → persist│
//! │ → buffer → cur │          │ → buffer → cur │
//! └────────────────┘          └────────────────┘
//!         ▲ catch-up: range read from cursor+1
//! ```
//!
//! Consistency comes from idempotent retries and monotonic cursors: the
//! master redelivers until acknowledged, the secondary turns redelivery into
//! a no-op, and its apply cursor only moves over contiguous entries.
//!
//! ## Crate Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | `LogEntry`, `NodeId`, wire and status structs |
//! | [`error`] | Error enums per area |
//! | [`config`] | Master, secondary and backoff configuration |
//! | [`time`] | `TimeProvider` seam over tokio time |
//! | [`transport`] | Master ↔ secondary traits and the in-process transport |
//! | [`master`] | Sequencer, quorum coordinator, replication dispatcher |
//! | [`secondary`] | Durable store, apply path, catch-up |
//! | [`http`] | HTTP/1.1 routers, servers and clients |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod error;
pub mod http;
pub mod master;
pub mod secondary;
pub mod time;
pub mod transport;
pub mod types;

// Re-export key types at crate root for convenience
pub use config::{
    BackoffConfig, ConfigError, MasterConfig, ReplicaEndpoint, SecondaryConfig,
    WriteConcernDefault,
};
pub use error::{MasterError, SecondaryError, StorageError, TransportError};
pub use master::Master;
pub use secondary::Secondary;
pub use secondary::storage::{FileLogStorage, InMemoryLogStorage, LogStorage};
pub use time::{TimeProvider, TokioTimeProvider};
pub use transport::{InProcessTransport, MasterSource, ReplicaTransport, ReplicateHandler};
pub use types::{
    LogEntry, NodeId, RangeQuery, ReplicaStatus, ReplicateAck, SecondaryStatus, SubmitRequest,
    SubmitResponse,
};
