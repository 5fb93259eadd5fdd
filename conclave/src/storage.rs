//! The Raft storage interface and data types.
//!
//! Storage owns the durable log, the node's hard state, and the snapshot store. Applying
//! committed entries is *not* a storage concern here: committed entries flow through the
//! session-aware state machine executor, which also produces and restores the snapshot image
//! that storage persists.

use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;

use crate::raft::Entry;
use crate::raft::MembershipConfig;
use crate::raft_types::SnapshotId;
use crate::AppData;
use crate::LogId;
use crate::NodeId;

/// Metadata of a snapshot.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SnapshotMeta {
    /// Log entries upto which this snapshot includes, inclusive.
    pub last_log_id: LogId,

    /// The latest membership configuration covered by the snapshot.
    pub membership: MembershipConfig,

    /// To identify a snapshot when transferring.
    /// Caveat: even when two snapshots are built with the same `last_log_id`, they still could
    /// be different in bytes.
    pub snapshot_id: SnapshotId,
}

/// The data associated with the current snapshot.
pub struct Snapshot<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    /// metadata of a snapshot
    pub meta: SnapshotMeta,

    /// A read handle to the associated snapshot.
    pub snapshot: Box<S>,
}

/// A record holding the hard state of a Raft node.
///
/// This model derives serde's traits for easily (de)serializing this
/// model for storage & retrieval.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The last entry.
    pub last_log_id: LogId,

    /// The LogId of the last log applied to the state machine.
    pub last_applied_log: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The latest cluster membership configuration found in the log, else a new initial
    /// membership config consisting only of this node's ID.
    pub membership: MembershipConfig,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    ///
    /// ### `id`
    /// The ID of the Raft node.
    ///
    /// ### `address`
    /// The address at which the node's transport is reachable; recorded in the initial
    /// single-member config.
    pub fn new_initial(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            last_log_id: LogId { term: 0, index: 0 },
            last_applied_log: LogId { term: 0, index: 0 },
            hard_state: HardState {
                current_term: 0,
                voted_for: None,
            },
            membership: MembershipConfig::new_initial(id, address),
        }
    }
}

/// A trait defining the interface for a Raft log and snapshot storage system.
#[async_trait]
pub trait RaftStorage<D>: Send + Sync + 'static
where D: AppData
{
    /// The storage engine's associated type used for exposing a snapshot for reading & writing.
    type SnapshotData: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static;

    /// Get the latest membership config found in the log.
    ///
    /// This must always be implemented as a reverse search through the log to find the most
    /// recent membership config to be appended to the log.
    ///
    /// If a purged marker is encountered, then the membership config embedded in the current
    /// snapshot should be used.
    ///
    /// If the system is pristine, then it should return the value of calling
    /// `MembershipConfig::new_initial(node_id, address)`. It is required that the storage engine
    /// persist the node's ID so that it is consistent across restarts.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_membership_config(&self) -> Result<MembershipConfig>;

    /// Get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface on the storage system to
    /// fetch the last known state from stable storage. If no such entry exists due to being the
    /// first time the node has come online, then `InitialState::new_initial` should be used.
    ///
    /// **Pro tip:** the storage impl may need to look in a few different places to accurately
    /// respond to this request: the last entry in the log for `last_log_id`; the node's hard
    /// state record; and the index of the last log applied to the state machine.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save Raft's hard-state.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Get a series of log entries from storage.
    ///
    /// The start value is inclusive in the search and the stop value is non-inclusive: `[start, stop)`.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<D>>>;

    /// Try to get a log entry.
    ///
    /// It does not return an error if the log entry at `log_index` is not found.
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<D>>>;

    /// Returns the last known log id.
    ///
    /// It could be the id of the last entry in log, or the last applied id that is saved in the
    /// snapshot. When there is no log or snapshot, it returns (0,0).
    async fn get_last_log_id(&self) -> Result<LogId>;

    /// Delete all logs in a `range`.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()>;

    /// Append a payload of entries to the log.
    ///
    /// Though the entries will always be presented in order, each entry's index should be used to
    /// determine its location to be written in the log.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn append_to_log(&self, entries: &[&Entry<D>]) -> Result<()>;

    /// Open a new writable snapshot handle, returning its assigned id.
    ///
    /// The executor's serialized image (sessions + user state machine) will be written through
    /// the handle, after which `finalize_snapshot_creation` is called.
    ///
    /// Errors returned from this method will be logged and the compaction retried.
    async fn create_snapshot(&self) -> Result<(SnapshotId, Box<Self::SnapshotData>)>;

    /// Seal a locally created snapshot as the current snapshot.
    ///
    /// Delete all entries in the log through `meta.last_log_id.index` and write a purged marker
    /// at that index via `Entry::new_purged_marker`. All other snapshots should be deleted at
    /// this point.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn finalize_snapshot_creation(&self, meta: &SnapshotMeta, snapshot: Box<Self::SnapshotData>) -> Result<()>;

    /// Create a new blank snapshot, returning a writable handle to the snapshot object.
    ///
    /// Raft will use this handle to receive snapshot data streamed from the leader.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>>;

    /// Finalize the installation of a snapshot which has finished streaming from the cluster leader.
    ///
    /// Delete all entries in the log through `meta.last_log_id.index`, write a purged marker at
    /// the given `meta.last_log_id.index`, and record the snapshot as current.
    ///
    /// By the time ownership of the snapshot object is returned here, its
    /// `AsyncWriteExt.shutdown()` method will have been called, so no additional writes should
    /// be made to the snapshot.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()>;

    /// Get a readable handle to the current snapshot, along with its metadata.
    ///
    /// ### implementation algorithm
    /// Implementing this method should be straightforward. Check the configured snapshot
    /// directory for any snapshot files. A proper implementation will only ever have one
    /// active snapshot, though another may exist while it is being created. As such, it is
    /// recommended to use a file naming pattern which will allow for easily distinguishing
    /// between the current live snapshot, and any new snapshot which is being created.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>>;
}

/// APIs for debugging a store.
#[async_trait]
pub trait RaftStorageDebug {
    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState>;
}
