//! Core types shared by the master and the secondaries.
//!
//! - [`LogEntry`]: one immutable record of the replicated log
//! - [`NodeId`]: identity of a node (the master or a secondary)
//! - Wire structs for the submit, range read, replicate and status calls

use serde::{Deserialize, Serialize};

/// Identity of a node in the cluster.
///
/// The master is conventionally `"master"`, secondaries are `"s1"`, `"s2"`, …
/// unless configured otherwise. Ordering is lexicographic, which is the order
/// acknowledgement sets are reported in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A single entry in the replicated log.
///
/// Immutable once created. `seq` is assigned by the master, starts at 1 and
/// has no holes. `id` is the client-supplied (or generated) deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Global sequence number.
    pub seq: u64,
    /// Deduplication key.
    pub id: String,
    /// Opaque message body.
    pub payload: String,
}

impl LogEntry {
    /// Create a new entry.
    pub fn new(seq: u64, id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            seq,
            id: id.into(),
            payload: payload.into(),
        }
    }
}

/// Client write submitted to the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Client message id; generated by the master when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Message body.
    pub payload: String,
    /// Write concern: how many nodes (master included) must hold the entry
    /// before the master answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<u32>,
}

impl SubmitRequest {
    /// A write with a generated id and the default write concern.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            id: None,
            payload: payload.into(),
            w: None,
        }
    }

    /// Set the client message id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the write concern.
    pub fn with_w(mut self, w: u32) -> Self {
        self.w = Some(w);
        self
    }
}

/// Master's answer to a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Sequence number of the entry (the existing one for a duplicate id).
    pub seq: u64,
    /// Nodes known to hold the entry, sorted.
    pub acked_by: Vec<NodeId>,
}

/// Range read used by the catch-up synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeQuery {
    /// First sequence number to return (inclusive).
    pub from_seq: u64,
    /// Maximum number of entries to return.
    pub limit: usize,
}

impl Default for RangeQuery {
    fn default() -> Self {
        Self {
            from_seq: 1,
            limit: 1000,
        }
    }
}

/// Acknowledgement returned by a secondary's replicate endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateAck {
    /// Always `true` on the success path.
    pub ack: bool,
    /// The acknowledged sequence number.
    pub seq: u64,
}

impl ReplicateAck {
    /// A positive acknowledgement for `seq`.
    pub fn ok(seq: u64) -> Self {
        Self { ack: true, seq }
    }

    /// Whether this acknowledges exactly `seq`.
    pub fn acknowledges(&self, seq: u64) -> bool {
        self.ack && self.seq == seq
    }
}

/// Per-secondary replication status as seen by the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    /// Replica id.
    pub id: NodeId,
    /// Base URL of the replica.
    pub endpoint: String,
    /// Highest sequence number the replica acknowledged (0 if none).
    pub last_acknowledged_seq: u64,
    /// Whether the last delivery attempt succeeded.
    pub alive: bool,
}

/// Status reported by a secondary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryStatus {
    /// This replica's id.
    pub replica_id: NodeId,
    /// Highest contiguously applied sequence number.
    pub apply_cursor: u64,
    /// Sequence numbers held in the out-of-order buffer, ascending.
    pub buffered_seqs: Vec<u64>,
    /// Number of distinct message ids seen.
    pub seen_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_request_optional_fields() {
        let req: SubmitRequest =
            serde_json::from_str(r#"{"payload":"hello"}"#).expect("deserialize");
        assert_eq!(req, SubmitRequest::new("hello"));

        let req: SubmitRequest =
            serde_json::from_str(r#"{"id":"a","payload":"hello","w":3}"#).expect("deserialize");
        assert_eq!(req, SubmitRequest::new("hello").with_id("a").with_w(3));
    }

    #[test]
    fn test_submit_request_requires_payload() {
        let res: Result<SubmitRequest, _> = serde_json::from_str(r#"{"id":"a"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_node_id_is_a_plain_string_on_the_wire() {
        let resp = SubmitResponse {
            seq: 1,
            acked_by: vec![NodeId::from("master"), NodeId::from("s1")],
        };
        let json = serde_json::to_string(&resp).expect("serialize");
        assert_eq!(json, r#"{"seq":1,"acked_by":["master","s1"]}"#);
    }

    #[test]
    fn test_node_id_ordering() {
        let mut ids = vec![NodeId::from("s2"), NodeId::from("master"), NodeId::from("s1")];
        ids.sort();
        assert_eq!(ids, vec!["master".into(), "s1".into(), NodeId::from("s2")]);
    }

    #[test]
    fn test_replicate_ack_matches_seq() {
        assert!(ReplicateAck::ok(4).acknowledges(4));
        assert!(!ReplicateAck::ok(4).acknowledges(5));
        assert!(!ReplicateAck { ack: false, seq: 4 }.acknowledges(4));
    }
}
