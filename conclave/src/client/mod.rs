//! The session client: linearizable commands, consistent queries, and in-order event delivery
//! over an unreliable transport.

pub(crate) mod connection;
pub mod selector;
pub mod sequencer;
pub(crate) mod submitter;
pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::Duration;

use crate::client::connection::ClientConnection;
use crate::client::sequencer::ClientSequencer;
use crate::client::submitter::Submitter;
use crate::client::transport::ClientTransport;
use crate::error::ClientError;
use crate::protocol::Consistency;
use crate::protocol::ErrorKind;
use crate::protocol::Event;
use crate::protocol::KeepAliveRequest;
use crate::protocol::PublishRequest;
use crate::protocol::RegisterRequest;
use crate::protocol::ResetRequest;
use crate::protocol::ResponseStatus;
use crate::protocol::UnregisterRequest;
use crate::AppData;
use crate::AppDataResponse;
use crate::SessionId;

/// The retry budget for the initial session registration.
const MAX_REGISTER_ATTEMPTS: u64 = 8;

/// Client-local session state shared between the submitter, the keep-alive task, and the event
/// dispatcher.
pub(crate) struct SessionState {
    /// The registered session id; 0 before registration completes.
    session: AtomicU64,
    /// The granted session timeout in milliseconds.
    timeout: AtomicU64,
    /// The allocator for per-session command sequence numbers.
    command_sequence: AtomicU64,
    /// The highest command sequence whose response has been delivered to the caller.
    response_sequence: AtomicU64,
    /// The highest log index observed through responses; queries carry it for read-your-writes.
    response_index: AtomicU64,
    /// The highest event index received from the cluster, for gap detection.
    event_received_index: AtomicU64,
    /// The highest event index whose callbacks have fired, acknowledged via keep-alive.
    event_ack_index: AtomicU64,
    closed: AtomicBool,
}

impl SessionState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            session: AtomicU64::new(0),
            timeout: AtomicU64::new(0),
            command_sequence: AtomicU64::new(0),
            response_sequence: AtomicU64::new(0),
            response_index: AtomicU64::new(0),
            event_received_index: AtomicU64::new(0),
            event_ack_index: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn session(&self) -> SessionId {
        self.session.load(Ordering::SeqCst)
    }

    pub(crate) fn timeout(&self) -> u64 {
        self.timeout.load(Ordering::SeqCst)
    }

    pub(crate) fn next_command_sequence(&self) -> u64 {
        self.command_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn command_sequence(&self) -> u64 {
        self.command_sequence.load(Ordering::SeqCst)
    }

    pub(crate) fn response_sequence(&self) -> u64 {
        self.response_sequence.load(Ordering::SeqCst)
    }

    pub(crate) fn response_index(&self) -> u64 {
        self.response_index.load(Ordering::SeqCst)
    }

    pub(crate) fn event_ack_index(&self) -> u64 {
        self.event_ack_index.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Record a completed command: its sequence for keep-alive acks, its index for queries.
    pub(crate) fn record_command_completion(&self, sequence: u64, index: u64) {
        self.response_sequence.fetch_max(sequence, Ordering::SeqCst);
        self.observe_index(index);
    }

    pub(crate) fn observe_index(&self, index: u64) {
        self.response_index.fetch_max(index, Ordering::SeqCst);
    }
}

/// A handle identifying one registered event callback, for removal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSubscription {
    name: String,
    id: u64,
}

type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Per-name sets of event callbacks, removable by handle.
#[derive(Default)]
struct EventHandlers {
    next_id: u64,
    handlers: HashMap<String, HashMap<u64, EventHandler>>,
}

impl EventHandlers {
    fn add(&mut self, name: String, handler: EventHandler) -> EventSubscription {
        self.next_id += 1;
        let id = self.next_id;
        self.handlers.entry(name.clone()).or_default().insert(id, handler);
        EventSubscription { name, id }
    }

    fn remove(&mut self, subscription: &EventSubscription) {
        if let Some(set) = self.handlers.get_mut(&subscription.name) {
            set.remove(&subscription.id);
            if set.is_empty() {
                self.handlers.remove(&subscription.name);
            }
        }
    }

    fn dispatch(&self, event: &Event) {
        if let Some(set) = self.handlers.get(&event.name) {
            for handler in set.values() {
                handler(event);
            }
        }
    }
}

struct SessionClientInner<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
{
    state: Arc<SessionState>,
    connection: Arc<ClientConnection<D, R, T>>,
    submitter: Arc<Submitter<D, R, T>>,
    handlers: Arc<Mutex<EventHandlers>>,
    keep_alive_handle: Mutex<Option<JoinHandle<()>>>,
    events_handle: Mutex<Option<JoinHandle<()>>>,
}

/// A registered client session against a conclave cluster.
///
/// A session gives exactly-once command semantics and in-order event delivery across retries,
/// reconnects, and leader changes. Cheap to clone.
pub struct SessionClient<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
{
    inner: Arc<SessionClientInner<D, R, T>>,
}

impl<D, R, T> Clone for SessionClient<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Builder for a [`SessionClient`].
pub struct SessionClientBuilder<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
{
    transport: Arc<T>,
    servers: Vec<String>,
    client_id: String,
    timeout: Option<u64>,
    marker: std::marker::PhantomData<(D, R)>,
}

impl<D, R, T> SessionClientBuilder<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
{
    /// Start building a session over the given transport and server addresses.
    pub fn new(transport: Arc<T>, servers: Vec<String>) -> Self {
        let client_id = format!("client-{:016x}", rand::thread_rng().gen::<u64>());
        Self {
            transport,
            servers,
            client_id,
            timeout: None,
            marker: std::marker::PhantomData,
        }
    }

    /// Use a caller supplied client identity instead of a generated one.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Request a specific session timeout in milliseconds; the cluster default applies otherwise.
    pub fn timeout(mut self, millis: u64) -> Self {
        self.timeout = Some(millis);
        self
    }

    /// Register the session with the cluster and start its background tasks.
    pub async fn register(self) -> Result<SessionClient<D, R, T>, ClientError> {
        SessionClient::register(self).await
    }
}

impl<D, R, T> SessionClient<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
{
    /// Start building a session client.
    pub fn builder(transport: Arc<T>, servers: Vec<String>) -> SessionClientBuilder<D, R, T> {
        SessionClientBuilder::new(transport, servers)
    }

    #[tracing::instrument(level = "debug", skip(builder), fields(client=%builder.client_id))]
    async fn register(builder: SessionClientBuilder<D, R, T>) -> Result<Self, ClientError> {
        let state = SessionState::new();
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let connection = ClientConnection::new(
            builder.transport.clone(),
            builder.servers.clone(),
            builder.client_id.clone(),
            publish_tx,
        );

        // Register against the cluster, following leader hints with a capped backoff.
        let rpc = RegisterRequest {
            client: builder.client_id.clone(),
            timeout: builder.timeout,
        };
        let mut attempt = 0u64;
        let response = loop {
            attempt += 1;
            match connection.register(rpc.clone()).await {
                Ok(resp) if resp.status == ResponseStatus::Ok => break resp,
                Ok(resp) => {
                    let kind = resp.error.unwrap_or(ErrorKind::Internal);
                    if attempt >= MAX_REGISTER_ATTEMPTS {
                        return Err(ClientError::Cluster(kind));
                    }
                }
                Err(err) => {
                    if attempt >= MAX_REGISTER_ATTEMPTS {
                        return Err(err);
                    }
                    tracing::debug!(error=%err, "session registration attempt failed");
                }
            }
            sleep(Duration::from_millis(250 * attempt)).await;
        };

        tracing::debug!(session = response.session, timeout = response.timeout, "session registered");
        state.session.store(response.session, Ordering::SeqCst);
        state.timeout.store(response.timeout, Ordering::SeqCst);
        connection.update_hint(response.leader.clone(), response.members.clone());
        connection.bind_session(response.session);
        // Bind the session eagerly so events flow before the first command.
        let _ = connection.connect().await;

        let sequencer = Arc::new(Mutex::new(ClientSequencer::new()));
        let submitter = Submitter::new(connection.clone(), state.clone(), sequencer.clone());
        let handlers: Arc<Mutex<EventHandlers>> = Arc::new(Mutex::new(EventHandlers::default()));

        let inner = Arc::new(SessionClientInner {
            state: state.clone(),
            connection: connection.clone(),
            submitter,
            handlers: handlers.clone(),
            keep_alive_handle: Mutex::new(None),
            events_handle: Mutex::new(None),
        });

        let keep_alive = tokio::spawn(Self::keep_alive_loop(state.clone(), connection.clone()));
        let events = tokio::spawn(Self::event_loop(
            state,
            connection,
            sequencer,
            handlers,
            publish_rx,
        ));
        *inner.keep_alive_handle.lock().unwrap() = Some(keep_alive);
        *inner.events_handle.lock().unwrap() = Some(events);

        Ok(Self { inner })
    }

    /// The id of this session.
    pub fn session_id(&self) -> SessionId {
        self.inner.state.session()
    }

    /// Check if the session has been closed locally or expired by the cluster.
    pub fn is_closed(&self) -> bool {
        self.inner.state.is_closed()
    }

    /// Submit a command for replicated, exactly-once application.
    ///
    /// Commands complete in submission order. The returned future resolves after all events
    /// produced at or before the command's apply have been delivered to their handlers.
    pub async fn submit(&self, command: D) -> Result<R, ClientError> {
        self.inner.submitter.submit(command).await
    }

    /// Execute a read-only query at the given consistency level.
    pub async fn query(&self, query: D, consistency: Consistency) -> Result<R, ClientError> {
        self.inner.submitter.query(query, consistency).await
    }

    /// Register a callback for events published under `name`.
    pub fn on_event(&self, name: impl Into<String>, handler: impl Fn(&Event) + Send + Sync + 'static) -> EventSubscription {
        self.inner.handlers.lock().unwrap().add(name.into(), Arc::new(handler))
    }

    /// Remove a callback previously registered with `on_event`.
    pub fn remove_handler(&self, subscription: &EventSubscription) {
        self.inner.handlers.lock().unwrap().remove(subscription);
    }

    /// Close the session: unregister with the cluster and stop background tasks.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.inner.state.is_closed() {
            return Ok(());
        }
        self.inner.state.close();
        let res = self
            .inner
            .connection
            .unregister(UnregisterRequest {
                session: self.inner.state.session(),
            })
            .await;
        if let Some(handle) = self.inner.keep_alive_handle.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.events_handle.lock().unwrap().take() {
            handle.abort();
        }
        res.map(|_| ())
    }

    /// The periodic liveness loop: one keep-alive every half session timeout.
    async fn keep_alive_loop(state: Arc<SessionState>, connection: Arc<ClientConnection<D, R, T>>) {
        let interval = Duration::from_millis((state.timeout() / 2).max(1));
        loop {
            sleep(interval).await;
            if state.is_closed() {
                return;
            }
            let rpc = KeepAliveRequest {
                session: state.session(),
                command_sequence: state.response_sequence(),
                event_index: state.event_ack_index(),
            };
            match connection.keep_alive(rpc).await {
                Ok(resp) => {
                    if resp.error == Some(ErrorKind::UnknownSession) {
                        // The authoritative liveness probe says the session is gone.
                        tracing::warn!(session = state.session(), "session expired by the cluster");
                        state.close();
                        return;
                    }
                    connection.update_hint(resp.leader, resp.members);
                }
                Err(err) => {
                    tracing::debug!(error=%err, "keep-alive attempt failed");
                }
            }
        }
    }

    /// The event dispatch loop: gap detection, sequencing, handler fan-out.
    async fn event_loop(
        state: Arc<SessionState>,
        connection: Arc<ClientConnection<D, R, T>>,
        sequencer: Arc<Mutex<ClientSequencer>>,
        handlers: Arc<Mutex<EventHandlers>>,
        mut publish_rx: mpsc::UnboundedReceiver<PublishRequest>,
    ) {
        while let Some(request) = publish_rx.recv().await {
            if state.is_closed() {
                return;
            }
            let received = state.event_received_index.load(Ordering::SeqCst);
            if request.event_index <= received {
                // A replay from a reconnect bind; the sequencer has already seen it.
                continue;
            }
            if request.previous_index != received {
                // A batch is missing between what we have and what arrived; ask the server to
                // re-send from our high-water mark and drop this batch.
                tracing::debug!(
                    previous = request.previous_index,
                    received,
                    "event gap detected, requesting re-delivery"
                );
                connection
                    .reset_events(ResetRequest {
                        session: state.session(),
                        index: received,
                    })
                    .await;
                continue;
            }
            state.event_received_index.store(request.event_index, Ordering::SeqCst);

            let state2 = state.clone();
            let handlers2 = handlers.clone();
            let batch = request.clone();
            sequencer.lock().unwrap().sequence_event(
                request,
                Box::new(move || {
                    let registry = handlers2.lock().unwrap();
                    for event in batch.events.iter() {
                        registry.dispatch(event);
                    }
                    state2.event_ack_index.fetch_max(batch.event_index, Ordering::SeqCst);
                }),
            );
        }
    }
}
