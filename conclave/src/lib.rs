//! A Raft consensus library with linearizable client sessions.

pub mod client;
pub mod config;
mod core;
pub mod error;
pub mod metrics;
pub mod network;
pub mod protocol;
pub mod quorum;
pub mod raft;
mod raft_types;
mod replication;
pub mod sessions;
pub mod state_machine;
pub mod storage;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use async_trait;
pub use crate::config::Config;
pub use crate::config::ConfigError;
pub use crate::config::SnapshotPolicy;
pub use crate::core::State;
pub use crate::error::ClientError;
pub use crate::error::InitializeError;
pub use crate::error::RaftError;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::protocol::ErrorKind;
pub use crate::protocol::Event;
pub use crate::raft::Member;
pub use crate::raft::MemberKind;
pub use crate::raft::MembershipConfig;
pub use crate::raft::Raft;
pub use crate::raft_types::LogId;
pub use crate::raft_types::SnapshotId;
pub use crate::raft_types::SnapshotSegmentId;
pub use crate::replication::ReplicationMetrics;
pub use crate::state_machine::Registry;
pub use crate::state_machine::StateMachine;
pub use crate::storage::RaftStorage;
pub use crate::storage::RaftStorageDebug;

/// A Raft node's ID.
pub type NodeId = u64;

/// The ID of a client session; always the index of the log entry which registered it.
pub type SessionId = u64;

/// A trait defining application specific data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types throughout their application without having to serialize and
/// deserialize their data as it goes through Raft. Instead, applications can present their data
/// models as-is to Raft, Raft will present it to the application's `StateMachine` when ready, and
/// the application may then deal with the data directly in the state machine without having to
/// do a preliminary deserialization.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Automatically impl AppData for all types which satisfy its supertraits.
impl<T> AppData for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types for returning response data from the state machine when an
/// entry is applied to it.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Automatically impl AppDataResponse for all types which satisfy its supertraits.
impl<T> AppDataResponse for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A condensed, single-line summary of a message, for tracing.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

impl<T: MessageSummary> MessageSummary for Option<T> {
    fn summary(&self) -> String {
        match self {
            None => "None".to_string(),
            Some(x) => format!("Some({})", x.summary()),
        }
    }
}

/// A struct describing whether a value should be updated or left as is.
#[derive(Debug)]
pub enum Update<T> {
    Update(T),
    Ignore,
}
