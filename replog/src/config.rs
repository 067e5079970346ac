//! Configuration structures for the master and the secondaries.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::types::NodeId;

/// Exponential backoff between delivery attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay unit; the n-th retry waits `base_delay * 2^n`.
    pub base_delay: Duration,

    /// Ceiling for a single delay.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffConfig {
    /// Create a backoff with the given base and ceiling.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay to wait after `attempts` failed attempts:
    /// `min(max_delay, base_delay * 2^attempts)`.
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// A configured secondary: its id and base URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaEndpoint {
    /// Replica id used in acknowledgement sets.
    pub id: NodeId,
    /// Base URL, e.g. `http://secondary-1:8000`.
    pub url: String,
}

impl ReplicaEndpoint {
    /// Create an endpoint.
    pub fn new(id: impl Into<NodeId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }

    /// Parse a comma-separated replica list.
    ///
    /// Items are either a bare URL, which gets the positional id `s{n}`
    /// (1-based), or `id=url`. Blank items are skipped.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, ConfigError> {
        let mut replicas: Vec<Self> = Vec::new();
        for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let replica = match item.split_once('=') {
                Some((id, url)) => {
                    let (id, url) = (id.trim(), url.trim());
                    if id.is_empty() || url.is_empty() {
                        return Err(ConfigError::InvalidReplica(item.to_string()));
                    }
                    Self::new(id, url)
                }
                None => Self::new(format!("s{}", replicas.len() + 1), item),
            };
            if replicas.iter().any(|r| r.id == replica.id) {
                return Err(ConfigError::DuplicateReplica(replica.id.to_string()));
            }
            replicas.push(replica);
        }
        Ok(replicas)
    }
}

/// Write concern applied when a client omits `w`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteConcernDefault {
    /// Answer after the local append.
    #[default]
    One,
    /// Wait for the master and every secondary.
    All,
}

impl FromStr for WriteConcernDefault {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "one" => Ok(Self::One),
            "all" => Ok(Self::All),
            other => Err(ConfigError::InvalidWriteConcern(other.to_string())),
        }
    }
}

/// Master configuration.
#[derive(Clone, Debug)]
pub struct MasterConfig {
    /// The master's own id in acknowledgement sets.
    pub node_id: NodeId,

    /// Secondaries to replicate to, one dispatcher worker each.
    pub replicas: Vec<ReplicaEndpoint>,

    /// Retry backoff for failed deliveries.
    pub backoff: BackoffConfig,

    /// Deadline for a single replicate call.
    pub request_timeout: Duration,

    /// How long a client may block waiting for its write concern.
    pub quorum_timeout: Duration,

    /// Write concern used when the client omits `w`.
    pub default_write_concern: WriteConcernDefault,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("master"),
            replicas: Vec::new(),
            backoff: BackoffConfig::default(),
            request_timeout: Duration::from_secs(5),
            quorum_timeout: Duration::from_secs(30),
            default_write_concern: WriteConcernDefault::One,
        }
    }
}

impl MasterConfig {
    /// Default configuration replicating to `replicas`.
    pub fn new(replicas: Vec<ReplicaEndpoint>) -> Self {
        Self {
            replicas,
            ..Self::default()
        }
    }

    /// Set the retry backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the per-request network timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the quorum wait deadline.
    pub fn with_quorum_timeout(mut self, timeout: Duration) -> Self {
        self.quorum_timeout = timeout;
        self
    }

    /// Set the default write concern.
    pub fn with_default_write_concern(mut self, w: WriteConcernDefault) -> Self {
        self.default_write_concern = w;
        self
    }

    /// Master plus every secondary.
    pub fn total_nodes(&self) -> usize {
        1 + self.replicas.len()
    }

    /// Check that every node in the acknowledgement set has its own id.
    ///
    /// A replica sharing the master's id would have its acks folded into the
    /// master's, so `w = total_nodes()` could never be met.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (idx, replica) in self.replicas.iter().enumerate() {
            if replica.id == self.node_id {
                return Err(ConfigError::ReplicaIsMaster(replica.id.to_string()));
            }
            if self.replicas[..idx].iter().any(|r| r.id == replica.id) {
                return Err(ConfigError::DuplicateReplica(replica.id.to_string()));
            }
        }
        Ok(())
    }
}

/// Secondary configuration.
#[derive(Clone, Debug)]
pub struct SecondaryConfig {
    /// This replica's id.
    pub replica_id: NodeId,

    /// Base URL of the master, used for catch-up.
    pub master_url: String,

    /// Directory holding the durable log.
    pub data_dir: PathBuf,

    /// Artificial delay before handling each replicate call.
    pub process_delay: Duration,

    /// Delay before loading state, for staged bring-up.
    pub start_delay: Duration,

    /// Deadline for a single catch-up page request.
    pub request_timeout: Duration,

    /// Entries requested per catch-up page.
    pub catch_up_page_size: usize,

    /// Fetch attempts per catch-up page before giving up.
    pub catch_up_attempts: u32,

    /// Backoff between failed catch-up fetches.
    pub catch_up_backoff: BackoffConfig,

    /// Probability of failing a replicate call after persisting (chaos hook).
    pub fail_after_persist_rate: f64,
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            replica_id: NodeId::from("s1"),
            master_url: "http://master:8000".to_string(),
            data_dir: PathBuf::from("/data"),
            process_delay: Duration::ZERO,
            start_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
            catch_up_page_size: 1000,
            catch_up_attempts: 5,
            catch_up_backoff: BackoffConfig::new(
                Duration::from_millis(200),
                Duration::from_secs(5),
            ),
            fail_after_persist_rate: 0.0,
        }
    }
}

impl SecondaryConfig {
    /// Default configuration for `replica_id`.
    pub fn new(replica_id: impl Into<NodeId>) -> Self {
        Self {
            replica_id: replica_id.into(),
            ..Self::default()
        }
    }

    /// Set the master URL.
    pub fn with_master_url(mut self, url: impl Into<String>) -> Self {
        self.master_url = url.into();
        self
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the artificial per-request delay.
    pub fn with_process_delay(mut self, delay: Duration) -> Self {
        self.process_delay = delay;
        self
    }

    /// Set the per-request deadline for catch-up reads.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the catch-up page size.
    pub fn with_catch_up_page_size(mut self, page_size: usize) -> Self {
        self.catch_up_page_size = page_size;
        self
    }

    /// Set the post-persist failure probability.
    pub fn with_fail_after_persist_rate(mut self, rate: f64) -> Self {
        self.fail_after_persist_rate = rate;
        self
    }

    /// Path of the append-only entry log.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}_log.jsonl", self.replica_id))
    }

    /// Path of the seen-id journal.
    pub fn seen_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}_seen.jsonl", self.replica_id))
    }
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A replica list item could not be parsed.
    #[error("invalid replica entry: {0:?}")]
    InvalidReplica(String),

    /// Two replicas share an id.
    #[error("duplicate replica id: {0}")]
    DuplicateReplica(String),

    /// A replica uses the master's node id.
    #[error("replica id {0:?} is the master's node id")]
    ReplicaIsMaster(String),

    /// Unknown default write concern.
    #[error("invalid write concern {0:?}, expected \"one\" or \"all\"")]
    InvalidWriteConcern(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_ceiling() {
        let backoff = BackoffConfig::new(Duration::from_millis(50), Duration::from_secs(5));
        assert_eq!(backoff.delay(0), Duration::from_millis(50));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(7), Duration::from_secs(5));
        // Shift and multiply overflow both clamp to the ceiling
        assert_eq!(backoff.delay(40), Duration::from_secs(5));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_replica_list_positional_ids() {
        let replicas =
            ReplicaEndpoint::parse_list("http://s-a:8000, http://s-b:8000,").expect("parse");
        assert_eq!(
            replicas,
            vec![
                ReplicaEndpoint::new("s1", "http://s-a:8000"),
                ReplicaEndpoint::new("s2", "http://s-b:8000"),
            ]
        );
        assert!(ReplicaEndpoint::parse_list("").expect("parse").is_empty());
    }

    #[test]
    fn test_parse_replica_list_explicit_ids() {
        let replicas =
            ReplicaEndpoint::parse_list("east=http://e:8000,http://w:8000").expect("parse");
        assert_eq!(replicas[0], ReplicaEndpoint::new("east", "http://e:8000"));
        assert_eq!(replicas[1], ReplicaEndpoint::new("s2", "http://w:8000"));
    }

    #[test]
    fn test_parse_replica_list_rejects_bad_items() {
        assert_eq!(
            ReplicaEndpoint::parse_list("=http://e:8000"),
            Err(ConfigError::InvalidReplica("=http://e:8000".into()))
        );
        assert_eq!(
            ReplicaEndpoint::parse_list("s1=http://a:1,http://b:2,s1=http://c:3"),
            Err(ConfigError::DuplicateReplica("s1".into()))
        );
    }

    #[test]
    fn test_master_config_rejects_replica_named_like_master() {
        let replicas = ReplicaEndpoint::parse_list("master=http://x:1").expect("parse");
        assert_eq!(
            MasterConfig::new(replicas).validate(),
            Err(ConfigError::ReplicaIsMaster("master".into()))
        );

        let duplicated = vec![
            ReplicaEndpoint::new("s1", "http://a:1"),
            ReplicaEndpoint::new("s1", "http://b:1"),
        ];
        assert_eq!(
            MasterConfig::new(duplicated).validate(),
            Err(ConfigError::DuplicateReplica("s1".into()))
        );

        let ok = vec![ReplicaEndpoint::new("s1", "http://a:1")];
        assert_eq!(MasterConfig::new(ok).validate(), Ok(()));
    }

    #[test]
    fn test_write_concern_default_parse() {
        assert_eq!("one".parse::<WriteConcernDefault>(), Ok(WriteConcernDefault::One));
        assert_eq!("ALL".parse::<WriteConcernDefault>(), Ok(WriteConcernDefault::All));
        assert!("two".parse::<WriteConcernDefault>().is_err());
    }

    #[test]
    fn test_secondary_paths() {
        let config = SecondaryConfig::new("s2").with_data_dir("/tmp/replog");
        assert_eq!(config.log_path(), PathBuf::from("/tmp/replog/s2_log.jsonl"));
        assert_eq!(config.seen_path(), PathBuf::from("/tmp/replog/s2_seen.jsonl"));
    }
}
