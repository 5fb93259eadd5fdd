//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

/// Default election timeout minimum, in milliseconds.
const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default heartbeat interval, in milliseconds.
const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default threshold for when to trigger a snapshot.
const DEFAULT_LOGS_SINCE_LAST: u64 = 5000;
/// Default maximum number of entries per replication payload.
const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default replication lag threshold.
const DEFAULT_REPLICATION_LAG_THRESHOLD: u64 = 1000;
/// Default snapshot chunksize.
const DEFAULT_SNAPSHOT_CHUNKSIZE: u64 = 1024 * 1024 * 3;
/// Default timeout for sending a snapshot segment, in milliseconds.
const DEFAULT_INSTALL_SNAPSHOT_TIMEOUT: u64 = 200;
/// Default session timeout granted on register, in milliseconds.
const DEFAULT_SESSION_TIMEOUT: u64 = 5000;
/// Default bound on the number of cached command results retained per session.
const DEFAULT_SESSION_RESULT_CACHE: u64 = 1024;

/// Log compaction and snapshot policy.
///
/// This governs when periodic snapshots will be taken, and also governs the conditions which
/// would cause a leader to send an `InstallSnapshot` RPC to a follower based on replication lag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified number of logs since
    /// the last snapshot.
    LogsSinceLast(u64),
}

/// A configuration error.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    /// The given values for election timeout min & max are invalid. Max must be greater than min.
    #[error("given values for election timeout min & max are invalid, max must be greater than min")]
    InvalidElectionTimeoutMinMax,
    /// The given value for max_payload_entries is too small, must be > 0.
    #[error("the given value for max_payload_entries is too small, must be > 0")]
    MaxPayloadEntriesTooSmall,
    /// The given value for session_timeout is too small to survive a heartbeat round.
    #[error("the given value for session_timeout must be greater than the heartbeat interval")]
    SessionTimeoutTooSmall,
}

/// The runtime configuration for a Raft node.
///
/// When building the Raft configuration for your application, remember this inequality from the
/// Raft spec: `broadcastTime ≪ electionTimeout ≪ MTBF`. Keep the election timeout high enough
/// that the performance of your network will not cause election timeouts, but don't keep it so
/// high that a real leader crash would cause prolonged downtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The heartbeat interval in milliseconds at which leaders will send heartbeats to followers.
    pub heartbeat_interval: u64,
    /// The maximum number of entries per payload allowed to be transmitted during replication.
    ///
    /// If this is too low, it will take longer for the nodes to be brought up to
    /// consistency with the rest of the cluster.
    pub max_payload_entries: u64,
    /// The distance behind in log replication a follower must fall before it is considered "lagging".
    pub replication_lag_threshold: u64,
    /// The snapshot policy to use for a Raft node.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum snapshot chunk size allowed when transmitting snapshots (in bytes).
    pub snapshot_max_chunk_size: u64,
    /// The timeout for sending then installing a snapshot segment, in milliseconds.
    pub install_snapshot_timeout: u64,
    /// The timeout granted to a client session when its register request names none, in milliseconds.
    ///
    /// A session which has not been heard from for twice its timeout is expired by the leader.
    pub session_timeout: u64,
    /// The maximum number of command results cached per session for retry deduplication.
    ///
    /// Results below `command_sequence - max_session_result_cache` are evicted even before the
    /// owning client acknowledges them, bounding worst case memory.
    pub max_session_result_cache: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    ///
    /// The directory where the log snapshots are to be kept for a Raft node is required and must
    /// be specified to start the config builder process.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
            snapshot_policy: None,
            snapshot_max_chunk_size: None,
            install_snapshot_timeout: None,
            session_timeout: None,
            max_session_result_cache: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Debug)]
pub struct ConfigBuilder {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: Option<u64>,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: Option<u64>,
    /// The interval at which leaders will send heartbeats to followers to avoid election timeout.
    pub heartbeat_interval: Option<u64>,
    /// The maximum number of entries per payload allowed to be transmitted during replication.
    pub max_payload_entries: Option<u64>,
    /// The distance behind in log replication a follower must fall before it is considered "lagging".
    pub replication_lag_threshold: Option<u64>,
    /// The snapshot policy.
    pub snapshot_policy: Option<SnapshotPolicy>,
    /// The maximum snapshot chunk size.
    pub snapshot_max_chunk_size: Option<u64>,
    /// The timeout for sending then installing a snapshot segment.
    pub install_snapshot_timeout: Option<u64>,
    /// The default timeout granted to client sessions.
    pub session_timeout: Option<u64>,
    /// The bound on cached command results per session.
    pub max_session_result_cache: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `max_payload_entries`.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the desired value for `replication_lag_threshold`.
    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = Some(val);
        self
    }

    /// Set the desired value for `snapshot_policy`.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the desired value for `snapshot_max_chunk_size`.
    pub fn snapshot_max_chunk_size(mut self, val: u64) -> Self {
        self.snapshot_max_chunk_size = Some(val);
        self
    }

    /// Set the desired value for `install_snapshot_timeout`.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Set the desired value for `session_timeout`.
    pub fn session_timeout(mut self, val: u64) -> Self {
        self.session_timeout = Some(val);
        self
    }

    /// Set the desired value for `max_session_result_cache`.
    pub fn max_session_result_cache(mut self, val: u64) -> Self {
        self.max_session_result_cache = Some(val);
        self
    }

    /// Validate the state of this builder, returning a Config on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        // Roll a random election time out based on the configured min & max or their respective defaults.
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        let replication_lag_threshold = self.replication_lag_threshold.unwrap_or(DEFAULT_REPLICATION_LAG_THRESHOLD);
        let snapshot_policy = self.snapshot_policy.unwrap_or(SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST));
        let snapshot_max_chunk_size = self.snapshot_max_chunk_size.unwrap_or(DEFAULT_SNAPSHOT_CHUNKSIZE);
        let install_snapshot_timeout = self.install_snapshot_timeout.unwrap_or(DEFAULT_INSTALL_SNAPSHOT_TIMEOUT);
        let session_timeout = self.session_timeout.unwrap_or(DEFAULT_SESSION_TIMEOUT);
        if session_timeout <= heartbeat_interval {
            return Err(ConfigError::SessionTimeoutTooSmall);
        }
        let max_session_result_cache = self.max_session_result_cache.unwrap_or(DEFAULT_SESSION_RESULT_CACHE);
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            max_payload_entries,
            replication_lag_threshold,
            snapshot_policy,
            snapshot_max_chunk_size,
            install_snapshot_timeout,
            session_timeout,
            max_session_result_cache,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();
        assert_eq!(cfg.cluster_name, "cluster0");
        assert_eq!(cfg.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(cfg.election_timeout_max, DEFAULT_ELECTION_TIMEOUT_MAX);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(cfg.session_timeout, DEFAULT_SESSION_TIMEOUT);
    }

    #[test]
    fn test_invalid_election_timeout_config_produces_expected_error() {
        let res = Config::build("cluster0".into())
            .election_timeout_min(1000)
            .election_timeout_max(700)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidElectionTimeoutMinMax);
    }

    #[test]
    fn test_session_timeout_must_exceed_heartbeat_interval() {
        let res = Config::build("cluster0".into())
            .heartbeat_interval(100)
            .session_timeout(50)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::SessionTimeoutTooSmall);
    }

    #[test]
    fn test_rand_election_timeout_is_within_bounds() {
        let cfg = Config::build("cluster0".into())
            .election_timeout_min(100)
            .election_timeout_max(200)
            .validate()
            .unwrap();
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!((100..200).contains(&t), "timeout {} out of bounds", t);
        }
    }
}
