//! Wire types of the client session protocol.
//!
//! These are the request/response shapes exchanged between a session client and the cluster.
//! Byte level framing is the transport's concern; everything here is plain serde data.

use serde::Deserialize;
use serde::Serialize;

use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::SessionId;

/// The disposition of a protocol response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Error kinds which travel inside protocol responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The receiving node knows of no elected leader.
    NoLeader,
    /// The command's sequence number left a gap at the leader; the client must resubmit.
    CommandError,
    /// The query's sequence number is ahead of the session's applied commands.
    QueryError,
    /// The user state machine raised while applying the operation.
    ApplicationError,
    /// The receiving node's role cannot serve the request.
    IllegalMemberState,
    /// The named client is not known to the cluster.
    UnknownClient,
    /// The named session is not registered (or no longer registered).
    UnknownSession,
    /// The named state machine is not present in the registry.
    UnknownStateMachine,
    /// An unclassified server side failure.
    Internal,
    /// The session was closed by the client or expired by the cluster.
    ClosedSession,
}

impl ErrorKind {
    /// Check whether this kind is delivered to the caller as a response rather than triggering
    /// the client's reconnect path.
    pub fn is_response_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::CommandError
                | ErrorKind::QueryError
                | ErrorKind::ApplicationError
                | ErrorKind::UnknownClient
                | ErrorKind::UnknownSession
                | ErrorKind::UnknownStateMachine
                | ErrorKind::Internal
                | ErrorKind::ClosedSession
        )
    }
}

/// The consistency level requested for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Observe state as of commit up to a heartbeat-confirmed instant.
    Linearizable,
    /// Observe committed state without confirming current leadership.
    Sequential,
}

/// An event published by the state machine during a command apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// The application defined event name; clients subscribe by name.
    pub name: String,
    /// The opaque event payload.
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A request to register a new session with the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// A client supplied identity, stable across reconnects.
    pub client: String,
    /// The requested session timeout in milliseconds; `None` accepts the cluster default.
    pub timeout: Option<u64>,
}

/// The response to a `RegisterRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
    /// The id assigned to the session: the index of its register entry.
    pub session: SessionId,
    /// The granted session timeout in milliseconds.
    pub timeout: u64,
    /// The address of the current leader, if known.
    pub leader: Option<String>,
    /// The addresses of all voting members.
    pub members: Vec<String>,
}

/// A periodic liveness and acknowledgement request for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session: SessionId,
    /// The highest command sequence number for which the client has received a response.
    pub command_sequence: u64,
    /// The highest event index the client has received and processed.
    pub event_index: u64,
}

/// The response to a `KeepAliveRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
    pub leader: Option<String>,
    pub members: Vec<String>,
}

/// A request to close a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub session: SessionId,
}

/// The response to an `UnregisterRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
}

/// A request binding a session to the receiving server for event delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub client: String,
    /// The session to bind; `0` when the client has not yet registered.
    pub session: SessionId,
}

/// The response to a `ConnectRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub status: ResponseStatus,
    /// The address of the current leader, if known to the receiving server.
    pub leader: Option<String>,
    /// The addresses of all voting members.
    pub members: Vec<String>,
}

/// A session command submitted for replicated, exactly-once application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest<D: AppData> {
    pub session: SessionId,
    /// The client assigned, per-session sequence number; dense from 1 upward.
    pub sequence: u64,
    /// The command payload; `None` is a no-op submitted to fill an abandoned sequence slot.
    #[serde(bound = "D: AppData")]
    pub command: Option<D>,
}

impl<D: AppData> MessageSummary for CommandRequest<D> {
    fn summary(&self) -> String {
        format!("session={}, sequence={}, noop={}", self.session, self.sequence, self.command.is_none())
    }
}

/// The response to a `CommandRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse<R: AppDataResponse> {
    pub status: ResponseStatus,
    /// The log index at which the command was applied.
    pub index: u64,
    /// The index of the last event published to the session at the time of apply.
    pub event_index: u64,
    /// The session's highest accepted sequence number; meaningful on `CommandError`.
    pub last_sequence: u64,
    /// Application specific response data.
    #[serde(bound = "R: AppDataResponse")]
    pub result: Option<R>,
    pub error: Option<ErrorKind>,
}

impl<R: AppDataResponse> CommandResponse<R> {
    /// Build an error response carrying no apply result.
    pub fn error(kind: ErrorKind, last_sequence: u64) -> Self {
        Self {
            status: ResponseStatus::Error,
            index: 0,
            event_index: 0,
            last_sequence,
            result: None,
            error: Some(kind),
        }
    }
}

/// A session query executed against committed state without being logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest<D: AppData> {
    pub session: SessionId,
    /// The session's current command sequence number, used to order the query after writes.
    pub sequence: u64,
    /// The highest log index the client has observed through responses.
    pub index: u64,
    #[serde(bound = "D: AppData")]
    pub query: D,
    pub consistency: Consistency,
}

impl<D: AppData> MessageSummary for QueryRequest<D> {
    fn summary(&self) -> String {
        format!(
            "session={}, sequence={}, index={}, consistency={:?}",
            self.session, self.sequence, self.index, self.consistency
        )
    }
}

/// The response to a `QueryRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse<R: AppDataResponse> {
    pub status: ResponseStatus,
    /// The applied index the query observed.
    pub index: u64,
    /// The index of the last event published to the session.
    pub event_index: u64,
    #[serde(bound = "R: AppDataResponse")]
    pub result: Option<R>,
    pub error: Option<ErrorKind>,
}

impl<R: AppDataResponse> QueryResponse<R> {
    pub fn error(kind: ErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            index: 0,
            event_index: 0,
            result: None,
            error: Some(kind),
        }
    }
}

/// A batch of events pushed from a server to a session client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub session: SessionId,
    /// The log index of the command whose apply produced this batch.
    pub event_index: u64,
    /// The event index of the previous batch; `0` for the session's first batch.
    pub previous_index: u64,
    pub events: Vec<Event>,
}

impl MessageSummary for PublishRequest {
    fn summary(&self) -> String {
        format!(
            "session={}, event_index={}, previous_index={}, n={}",
            self.session,
            self.event_index,
            self.previous_index,
            self.events.len()
        )
    }
}

/// A client request forcing the server to re-send events from the given index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRequest {
    pub session: SessionId,
    /// The highest event index the client has actually received.
    pub index: u64,
}
