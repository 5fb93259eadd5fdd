//! The Raft network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConfigureRequest;
use crate::raft::ConfigureResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::PollRequest;
use crate::raft::PollResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface for a Raft network between cluster members.
///
/// Typically, the network implementation as such will be hidden behind a `Box<T>` or `Arc<T>`
/// and this interface implemented on the `Box<T>` or `Arc<T>`.
#[async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where D: AppData
{
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send a pre-vote Poll RPC to the target Raft node.
    async fn send_poll(&self, target: NodeId, rpc: PollRequest) -> Result<PollResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn send_install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse>;

    /// Send a Configure RPC to the target Raft node.
    ///
    /// Only sent to Reserve members, which receive membership updates out of band of the log.
    async fn send_configure(&self, target: NodeId, rpc: ConfigureRequest) -> Result<ConfigureResponse>;
}
