//! The leader seeking client connection and its per-address channel cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::future::FutureExt;
use futures::future::Shared;
use tokio::sync::mpsc;

use crate::client::selector::AddressSelector;
use crate::client::transport::ClientChannel;
use crate::client::transport::ClientTransport;
use crate::error::ClientError;
use crate::protocol::CommandRequest;
use crate::protocol::CommandResponse;
use crate::protocol::ConnectRequest;
use crate::protocol::ErrorKind;
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

/// A per-address cache of established channels.
pub(crate) struct ConnectionManager<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
{
    transport: Arc<T>,
    channels: Mutex<HashMap<String, Arc<T::Channel>>>,
    marker: std::marker::PhantomData<(D, R)>,
}

impl<D, R, T> ConnectionManager<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
{
    pub(crate) fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            channels: Mutex::new(HashMap::new()),
            marker: std::marker::PhantomData,
        }
    }

    /// Get the cached channel for an address, connecting if absent.
    pub(crate) async fn get(&self, address: &str) -> anyhow::Result<Arc<T::Channel>> {
        if let Some(chan) = self.channels.lock().unwrap().get(address) {
            return Ok(chan.clone());
        }
        let chan = self.transport.connect(address).await?;
        self.channels.lock().unwrap().insert(address.to_string(), chan.clone());
        Ok(chan)
    }

    /// Drop the cached channel for an address after a failure.
    pub(crate) fn evict(&self, address: &str) {
        self.channels.lock().unwrap().remove(address);
    }
}

type ConnectOutput<C> = Option<(String, Arc<C>)>;

/// The ordering-insensitive view of a protocol response needed by the retry loop.
pub(crate) trait ProtocolResponse {
    fn error_kind(&self) -> Option<ErrorKind>;

    /// The leader/membership hint carried by the response, if the message type has one.
    fn leader_hint(&self) -> Option<(Option<String>, Vec<String>)> {
        None
    }
}

impl<R: AppDataResponse> ProtocolResponse for CommandResponse<R> {
    fn error_kind(&self) -> Option<ErrorKind> {
        self.error
    }
}

impl<R: AppDataResponse> ProtocolResponse for QueryResponse<R> {
    fn error_kind(&self) -> Option<ErrorKind> {
        self.error
    }
}

impl ProtocolResponse for RegisterResponse {
    fn error_kind(&self) -> Option<ErrorKind> {
        self.error
    }

    fn leader_hint(&self) -> Option<(Option<String>, Vec<String>)> {
        Some((self.leader.clone(), self.members.clone()))
    }
}

impl ProtocolResponse for KeepAliveResponse {
    fn error_kind(&self) -> Option<ErrorKind> {
        self.error
    }

    fn leader_hint(&self) -> Option<(Option<String>, Vec<String>)> {
        Some((self.leader.clone(), self.members.clone()))
    }
}

impl ProtocolResponse for UnregisterResponse {
    fn error_kind(&self) -> Option<ErrorKind> {
        self.error
    }
}

/// A client's routing layer: holds the active channel and locates a live leader by iterating
/// cluster members.
///
/// All session RPCs route through `connect()` first. Concurrent requests piggyback on a single
/// in-flight connect future; network failures clear the active channel so the next request
/// re-runs leader location from the selector.
pub(crate) struct ClientConnection<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
{
    manager: ConnectionManager<D, R, T>,
    selector: Mutex<AddressSelector>,
    /// The established channel, if any.
    current: Mutex<ConnectOutput<T::Channel>>,
    /// The shared in-flight connect future, if one is running.
    connect_future: Mutex<Option<Shared<BoxFuture<'static, ConnectOutput<T::Channel>>>>>,
    /// The client's stable identity.
    client_id: String,
    /// The bound session id; 0 before registration.
    session: AtomicU64,
    /// The pipe handed to each server for pushing session events.
    publish_tx: mpsc::UnboundedSender<PublishRequest>,
}

impl<D, R, T> ClientConnection<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
{
    pub(crate) fn new(
        transport: Arc<T>,
        members: Vec<String>,
        client_id: String,
        publish_tx: mpsc::UnboundedSender<PublishRequest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager: ConnectionManager::new(transport),
            selector: Mutex::new(AddressSelector::new(members)),
            current: Mutex::new(None),
            connect_future: Mutex::new(None),
            client_id,
            session: AtomicU64::new(0),
            publish_tx,
        })
    }

    /// Bind the registered session id; subsequent connects carry it in a `ConnectRequest`.
    pub(crate) fn bind_session(&self, session: u64) {
        self.session.store(session, Ordering::SeqCst);
        // Force the next request to re-run connect, which binds the session on the server.
        *self.current.lock().unwrap() = None;
    }

    pub(crate) fn session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Merge a leader/membership hint into the selector.
    pub(crate) fn update_hint(&self, leader: Option<String>, members: Vec<String>) {
        self.selector.lock().unwrap().reset_with(leader, members);
    }

    /// Get the established channel, or run leader location to produce one.
    ///
    /// Returns `None` when every known address has been tried without success.
    pub(crate) async fn connect(self: &Arc<Self>) -> ConnectOutput<T::Channel> {
        if let Some(current) = self.current.lock().unwrap().clone() {
            return Some(current);
        }
        let fut = {
            let mut guard = self.connect_future.lock().unwrap();
            match guard.as_ref() {
                Some(fut) => fut.clone(),
                None => {
                    let this = self.clone();
                    let fut = async move { this.establish().await }.boxed().shared();
                    *guard = Some(fut.clone());
                    fut
                }
            }
        };
        fut.await
    }

    /// Iterate candidate addresses until one accepts the session binding.
    #[tracing::instrument(level = "debug", skip(self), fields(client=%self.client_id))]
    async fn establish(self: Arc<Self>) -> ConnectOutput<T::Channel> {
        self.selector.lock().unwrap().reset();
        loop {
            let address = self.selector.lock().unwrap().next();
            let address = match address {
                Some(address) => address,
                None => {
                    tracing::warn!("failed to connect to the cluster");
                    *self.connect_future.lock().unwrap() = None;
                    return None;
                }
            };

            let channel = match self.manager.get(&address).await {
                Ok(channel) => channel,
                Err(err) => {
                    tracing::debug!(%address, error=%err, "error connecting to cluster member");
                    self.manager.evict(&address);
                    continue;
                }
            };

            // Bind the session to this server so it can push events to us. A client which has
            // not yet registered takes the channel as-is.
            let session = self.session();
            if session > 0 {
                let rpc = ConnectRequest {
                    client: self.client_id.clone(),
                    session,
                };
                match channel.connect_session(rpc, self.publish_tx.clone()).await {
                    Ok(resp) => {
                        self.selector.lock().unwrap().reset_with(resp.leader, resp.members);
                    }
                    Err(err) => {
                        tracing::debug!(%address, error=%err, "error binding session to cluster member");
                        self.manager.evict(&address);
                        continue;
                    }
                }
            }

            *self.current.lock().unwrap() = Some((address.clone(), channel.clone()));
            *self.connect_future.lock().unwrap() = None;
            return Some((address, channel));
        }
    }

    /// Drop the active channel so the next request reconnects.
    fn clear_connection(&self, address: &str, evict: bool) {
        let mut current = self.current.lock().unwrap();
        if let Some((current_address, _)) = current.as_ref() {
            if current_address == address {
                *current = None;
            }
        }
        if evict {
            self.manager.evict(address);
        }
    }

    /// Send one RPC through the active channel with reconnect-and-retry semantics.
    ///
    /// Response level errors pass through to the caller; `NoLeader`/`IllegalMemberState` and
    /// transport failures advance to the next candidate server. The retry budget is one full
    /// pass over the cluster.
    async fn send<Req, Resp, F, Fut>(self: &Arc<Self>, rpc: Req, send: F) -> Result<Resp, ClientError>
    where
        Req: Clone + Send,
        Resp: ProtocolResponse + Send,
        F: Fn(Arc<T::Channel>, Req) -> Fut,
        Fut: Future<Output = anyhow::Result<Resp>> + Send,
    {
        let mut budget = self.selector.lock().unwrap().len().max(1) + 1;
        loop {
            let (address, channel) = match self.connect().await {
                Some(x) => x,
                None => return Err(ClientError::NoConnection),
            };
            match send(channel, rpc.clone()).await {
                Ok(resp) => match resp.error_kind() {
                    Some(kind) if !kind.is_response_error() => {
                        tracing::debug!(%address, ?kind, "cluster member cannot serve request, reconnecting");
                        // Follow any leader hint so the next pass starts at the right server.
                        if let Some((leader, members)) = resp.leader_hint() {
                            self.update_hint(leader, members);
                        }
                        self.clear_connection(&address, false);
                        budget -= 1;
                        if budget == 0 {
                            return Err(ClientError::NoConnection);
                        }
                    }
                    _ => return Ok(resp),
                },
                Err(err) => {
                    tracing::debug!(%address, error=%err, "transport failure, reconnecting");
                    self.clear_connection(&address, true);
                    budget -= 1;
                    if budget == 0 {
                        return Err(ClientError::Transport(err));
                    }
                }
            }
        }
    }

    pub(crate) async fn register(self: &Arc<Self>, rpc: RegisterRequest) -> Result<RegisterResponse, ClientError> {
        self.send(rpc, |chan, rpc| async move { chan.register(rpc).await }).await
    }

    pub(crate) async fn keep_alive(self: &Arc<Self>, rpc: KeepAliveRequest) -> Result<KeepAliveResponse, ClientError> {
        self.send(rpc, |chan, rpc| async move { chan.keep_alive(rpc).await }).await
    }

    pub(crate) async fn unregister(
        self: &Arc<Self>,
        rpc: UnregisterRequest,
    ) -> Result<UnregisterResponse, ClientError> {
        self.send(rpc, |chan, rpc| async move { chan.unregister(rpc).await }).await
    }

    pub(crate) async fn command(self: &Arc<Self>, rpc: CommandRequest<D>) -> Result<CommandResponse<R>, ClientError> {
        self.send(rpc, |chan, rpc| async move { chan.command(rpc).await }).await
    }

    pub(crate) async fn query(self: &Arc<Self>, rpc: QueryRequest<D>) -> Result<QueryResponse<R>, ClientError> {
        self.send(rpc, |chan, rpc| async move { chan.query(rpc).await }).await
    }

    /// Ask the connected server to re-send unacknowledged events. Best effort.
    pub(crate) async fn reset_events(self: &Arc<Self>, rpc: ResetRequest) {
        if let Some((address, channel)) = self.connect().await {
            if let Err(err) = channel.reset_events(rpc).await {
                tracing::debug!(%address, error=%err, "error requesting event re-delivery");
                self.clear_connection(&address, true);
            }
        }
    }
}
