//! Error types exposed by this crate.

use crate::protocol::ErrorKind;
use crate::raft_types::SnapshotSegmentId;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `RaftStorage` layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// An error which has come from the state machine executor.
    #[error("{0}")]
    StateMachine(anyhow::Error),
    /// An internal Raft error indicating that Raft is shutting down.
    #[error("Raft is shutting down")]
    ShuttingDown,
    /// The node received a snapshot segment out of order.
    #[error("snapshot segment id mismatch, expect: {expect}, got: {got}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },
    /// An IO error from tokio.
    #[error("{0}")]
    IO(#[from] tokio::io::Error),
}

/// An error related to a client session operation handled by the local node.
///
/// Most session failures travel inside responses as [`ErrorKind`]; this type covers the cases
/// where no response could be produced at all.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The client iterated every known cluster address without establishing a connection.
    #[error("failed to connect to the cluster")]
    NoConnection,
    /// The cluster answered the operation with an error response.
    #[error("cluster error: {0:?}")]
    Cluster(ErrorKind),
    /// The client session has been closed or expired.
    #[error("the client session is closed")]
    SessionClosed,
    /// A transport level failure which exhausted the client's retry budget.
    #[error("{0}")]
    Transport(anyhow::Error),
}

impl ClientError {
    /// Check if the error is fatal to the session itself.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            ClientError::SessionClosed => true,
            ClientError::Cluster(kind) => {
                matches!(kind, ErrorKind::UnknownSession | ErrorKind::ClosedSession)
            }
            _ => false,
        }
    }
}

/// An error related to an `initialize` operation.
#[derive(Debug, thiserror::Error)]
pub enum InitializeError {
    /// An internal error has taken place.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The requested action is not allowed due to the node's current state.
    #[error("the requested action is not allowed due to the node's current state")]
    NotAllowed,
}

/// The set of errors which may take place when requesting to propose a config change.
#[derive(Debug, thiserror::Error)]
pub enum ChangeConfigError {
    /// An error related to the processing of the config change request.
    ///
    /// Errors of this type will only come about from the internals of applying the config change
    /// to the Raft log and the process related to that workflow.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The cluster is already undergoing a configuration change.
    #[error("the cluster is already undergoing a configuration change")]
    ConfigChangeInProgress,
    /// The given config would leave the cluster in an inoperable state.
    ///
    /// This error will be returned if the full set of changes, once fully applied, would leave
    /// the cluster with less than two members.
    #[error("the given config would leave the cluster in an inoperable state")]
    InoperableConfig,
    /// The node the config change proposal was sent to was not the leader of the cluster.
    #[error("this node is not the Raft leader")]
    NodeNotLeader(Option<NodeId>),
    /// The proposed config changes would make no difference to the current config.
    #[error("the proposed config change would have no effect, this is a no-op")]
    Noop,
}

/// Error variants which may arise while responding to an admin request.
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("{0}")]
    ChangeConfig(#[from] ChangeConfigError),
    #[error("{0}")]
    Raft(#[from] RaftError),
}
