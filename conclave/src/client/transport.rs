//! The client side transport interface.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::CommandRequest;
use crate::protocol::CommandResponse;
use crate::protocol::ConnectRequest;
use crate::protocol::ConnectResponse;
use crate::protocol::KeepAliveRequest;
use crate::protocol::KeepAliveResponse;
use crate::protocol::PublishRequest;
use crate::protocol::QueryRequest;
use crate::protocol::QueryResponse;
use crate::protocol::RegisterRequest;
use crate::protocol::RegisterResponse;
use crate::protocol::ResetRequest;
use crate::protocol::UnregisterRequest;
use crate::protocol::UnregisterResponse;
use crate::AppData;
use crate::AppDataResponse;

/// A trait defining how a session client reaches cluster members.
///
/// Wire framing, TLS, and connection lifecycle are entirely the implementation's concern; the
/// session layer only asks for a channel to an address.
#[async_trait]
pub trait ClientTransport<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// The channel type produced by a successful connect.
    type Channel: ClientChannel<D, R>;

    /// Open (or reuse) a channel to the server at the given address.
    async fn connect(&self, address: &str) -> Result<std::sync::Arc<Self::Channel>>;
}

/// A single established channel to one server.
#[async_trait]
pub trait ClientChannel<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Bind a session to the connected server for event delivery.
    ///
    /// `publish_tx` is the pipe the server side will use to push `PublishRequest` batches for
    /// the session bound by `rpc`.
    async fn connect_session(
        &self,
        rpc: ConnectRequest,
        publish_tx: mpsc::UnboundedSender<PublishRequest>,
    ) -> Result<ConnectResponse>;

    async fn register(&self, rpc: RegisterRequest) -> Result<RegisterResponse>;

    async fn keep_alive(&self, rpc: KeepAliveRequest) -> Result<KeepAliveResponse>;

    async fn unregister(&self, rpc: UnregisterRequest) -> Result<UnregisterResponse>;

    async fn command(&self, rpc: CommandRequest<D>) -> Result<CommandResponse<R>>;

    async fn query(&self, rpc: QueryRequest<D>) -> Result<QueryResponse<R>>;

    async fn reset_events(&self, rpc: ResetRequest) -> Result<()>;
}
