//! Seams between the master and the secondaries.
//!
//! ```text
//!  Master ── ReplicaTransport::replicate ──▶ Secondary (ReplicateHandler)
//!  Master ◀── MasterSource::fetch_entries ── Secondary catch-up
//! ```
//!
//! The HTTP implementations live in [`crate::http`]. [`InProcessTransport`]
//! wires a master to secondaries living in the same process.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::config::ReplicaEndpoint;
use crate::error::{SecondaryError, TransportError};
use crate::types::{LogEntry, NodeId, RangeQuery, ReplicateAck};

/// Delivers log entries from the master to a secondary.
#[async_trait]
pub trait ReplicaTransport: Send + Sync + 'static {
    /// Send `entry` to `replica`'s replicate endpoint.
    ///
    /// `Ok` only carries what the secondary answered; the caller still checks
    /// [`ReplicateAck::acknowledges`].
    async fn replicate(
        &self,
        replica: &ReplicaEndpoint,
        entry: &LogEntry,
    ) -> Result<ReplicateAck, TransportError>;
}

/// Range reads against the master's log, used by catch-up.
#[async_trait]
pub trait MasterSource: Send + Sync {
    /// Entries with `seq >= query.from_seq`, ascending, at most `query.limit`.
    async fn fetch_entries(&self, query: RangeQuery) -> Result<Vec<LogEntry>, TransportError>;
}

/// Server side of the replicate call.
#[async_trait]
pub trait ReplicateHandler: Send + Sync {
    /// Apply one replicated entry.
    async fn handle_replicate(&self, entry: LogEntry) -> Result<ReplicateAck, SecondaryError>;
}

struct Route {
    handler: Arc<dyn ReplicateHandler>,
    up: bool,
}

/// In-process [`ReplicaTransport`]: routes by replica id to local handlers.
///
/// A replica with no route, or whose route is marked down, is unreachable.
#[derive(Default, Clone)]
pub struct InProcessTransport {
    routes: Arc<RwLock<HashMap<NodeId, Route>>>,
}

impl InProcessTransport {
    /// Create a transport with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route calls for `id` to `handler`, replacing any previous route.
    pub fn connect(&self, id: impl Into<NodeId>, handler: Arc<dyn ReplicateHandler>) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), Route { handler, up: true });
    }

    /// Remove the route for `id`.
    pub fn disconnect(&self, id: &NodeId) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Mark the route for `id` up or down without dropping its handler.
    pub fn set_up(&self, id: &NodeId, up: bool) {
        if let Some(route) = self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(id)
        {
            route.up = up;
        }
    }

    fn handler(&self, id: &NodeId) -> Option<Arc<dyn ReplicateHandler>> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .get(id)
            .filter(|route| route.up)
            .map(|route| Arc::clone(&route.handler))
    }
}

#[async_trait]
impl ReplicaTransport for InProcessTransport {
    async fn replicate(
        &self,
        replica: &ReplicaEndpoint,
        entry: &LogEntry,
    ) -> Result<ReplicateAck, TransportError> {
        let handler = self
            .handler(&replica.id)
            .ok_or_else(|| TransportError::Unreachable(replica.id.to_string()))?;
        handler
            .handle_replicate(entry.clone())
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl ReplicateHandler for Recorder {
        async fn handle_replicate(
            &self,
            entry: LogEntry,
        ) -> Result<ReplicateAck, SecondaryError> {
            self.seen.lock().expect("lock").push(entry.seq);
            Ok(ReplicateAck::ok(entry.seq))
        }
    }

    #[tokio::test]
    async fn test_routes_by_replica_id() {
        let transport = InProcessTransport::new();
        let recorder = Arc::new(Recorder::default());
        transport.connect("s1", recorder.clone());

        let replica = ReplicaEndpoint::new("s1", "local://s1");
        let ack = transport
            .replicate(&replica, &LogEntry::new(1, "a", "x"))
            .await
            .expect("replicate");
        assert!(ack.acknowledges(1));
        assert_eq!(*recorder.seen.lock().expect("lock"), vec![1]);
    }

    #[tokio::test]
    async fn test_down_or_missing_route_is_unreachable() {
        let transport = InProcessTransport::new();
        transport.connect("s1", Arc::new(Recorder::default()));
        let s1 = ReplicaEndpoint::new("s1", "local://s1");
        let s2 = ReplicaEndpoint::new("s2", "local://s2");
        let entry = LogEntry::new(1, "a", "x");

        assert_eq!(
            transport.replicate(&s2, &entry).await,
            Err(TransportError::Unreachable("s2".into()))
        );

        transport.set_up(&s1.id, false);
        assert!(transport.replicate(&s1, &entry).await.is_err());

        transport.set_up(&s1.id, true);
        assert!(transport.replicate(&s1, &entry).await.is_ok());

        transport.disconnect(&s1.id);
        assert!(transport.replicate(&s1, &entry).await.is_err());
    }
}
