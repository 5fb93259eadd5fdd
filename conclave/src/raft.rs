//! Public Raft interface and data types.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
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
use crate::sessions::StateMachineExecutor;
use crate::storage::SnapshotMeta;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

struct RaftInner<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D>> {
    tx_api: mpsc::UnboundedSender<(RaftMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// The Raft API.
///
/// This type is the interface to a running Raft node. Applications building on top of it will
/// use this to spawn a Raft task, route inbound RPCs from peers and session clients to it, and
/// observe its metrics.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very cheap
/// and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns a `RaftError::ShuttingDown`, this indicates that the Raft
/// node is shutting down (potentially for data safety reasons due to a storage error), and the
/// `shutdown` method should be called on this type to await the shutdown of the node. If the
/// parent application needs to shutdown the Raft node for any reason, calling `shutdown` will do
/// the trick.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D>> {
    inner: Arc<RaftInner<D, R, N, S>>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D>> Raft<D, R, N, S> {
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within the cluster.
    /// Applications must guarantee that the ID provided to this function is stable, and should be
    /// persisted in a well known location, probably alongside the Raft log and the application's
    /// state machine. This ensures that restarts of the node will yield the same ID every time.
    ///
    /// ### `config`
    /// Raft's runtime config. See the docs on the `Config` object for more details.
    ///
    /// ### `network`
    /// An implementation of the `RaftNetwork` trait which will be used by Raft for sending RPCs
    /// to peer nodes within the cluster.
    ///
    /// ### `storage`
    /// An implementation of the `RaftStorage` trait which will be used by Raft for log and
    /// snapshot persistence.
    ///
    /// ### `executor`
    /// The session-aware state machine executor wrapping the application's `StateMachine`.
    /// Committed entries are applied through it, and it owns all session state.
    #[tracing::instrument(level="trace", skip(config, network, storage, executor), fields(cluster=%config.cluster_name))]
    pub fn new(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        executor: Arc<StateMachineExecutor<D, R>>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, executor, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries (§5.3), and are also
    /// used as heartbeats (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::AppendEntries { rpc, tx }, rx).await
    }

    /// Submit a VoteRequest (RequestVote in the spec) RPC to this Raft node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state attempting to gather
    /// votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::RequestVote { rpc, tx }, rx).await
    }

    /// Submit a PollRequest (pre-vote) RPC to this Raft node.
    ///
    /// A follower whose election timer fired straw-polls its peers with its current term and
    /// last log position before starting a real election. Handling a poll never mutates term,
    /// vote, or election timers.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn poll(&self, rpc: PollRequest) -> Result<PollResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Poll { rpc, tx }, rx).await
    }

    /// Submit an InstallSnapshot RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader in order to bring a new node or a slow node
    /// up-to-speed with the leader (§7).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(snapshot_id=%rpc.meta.last_log_id))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::InstallSnapshot { rpc, tx }, rx).await
    }

    /// Submit a Configure RPC to this Raft node.
    ///
    /// Leaders push committed membership configs to Reserve members with this RPC, since those
    /// members do not receive the live log.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn configure(&self, rpc: ConfigureRequest) -> Result<ConfigureResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Configure { rpc, tx }, rx).await
    }

    /// Submit a session command to this Raft node.
    ///
    /// On the leader the command is admitted against the session's sequence window, appended to
    /// the log, committed to the cluster and applied exactly once; the response carries the
    /// apply result. Any other role answers with a `NoLeader` error response.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn command(&self, rpc: CommandRequest<D>) -> Result<CommandResponse<R>, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Command { rpc, tx }, rx).await
    }

    /// Submit a session query to this Raft node.
    ///
    /// Queries are never logged. A linearizable query waits for the session's observed index to
    /// be applied and for a heartbeat round confirming leadership; a sequential query skips the
    /// heartbeat round.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn query(&self, rpc: QueryRequest<D>) -> Result<QueryResponse<R>, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Query { rpc, tx }, rx).await
    }

    /// Register a new client session with the cluster.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn register(&self, rpc: RegisterRequest) -> Result<RegisterResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Register { rpc, tx }, rx).await
    }

    /// Submit a session keep-alive to this Raft node.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn keep_alive(&self, rpc: KeepAliveRequest) -> Result<KeepAliveResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::SessionKeepAlive { rpc, tx }, rx).await
    }

    /// Close a client session.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn unregister(&self, rpc: UnregisterRequest) -> Result<UnregisterResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Unregister { rpc, tx }, rx).await
    }

    /// Bind a session to this server for event delivery.
    ///
    /// `publish_tx` is the pipe through which this node will push `PublishRequest` batches for
    /// the session. Any role accepts the binding; the response carries leader and membership
    /// hints for the client's address selector.
    #[tracing::instrument(level = "debug", skip(self, rpc, publish_tx))]
    pub async fn connect(
        &self,
        rpc: ConnectRequest,
        publish_tx: mpsc::UnboundedSender<PublishRequest>,
    ) -> Result<ConnectResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::ConnectSession { rpc, publish_tx, tx }, rx).await
    }

    /// Force re-delivery of unacknowledged session events from the given index.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn reset_events(&self, rpc: ResetRequest) -> Result<(), RaftError> {
        let span = tracing::debug_span!("CH");
        self.inner
            .tx_api
            .send((RaftMsg::ResetEvents { rpc }, span))
            .map_err(|_| RaftError::ShuttingDown)
    }

    /// Get the ID of the current leader from this Raft node.
    ///
    /// This method is based on the Raft metrics system which does a good job at staying
    /// up-to-date; however, a linearizable query must still be used to guard against stale
    /// reads. This method is perfect for making decisions on where to route client requests.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Initialize a pristine Raft node with the given members.
    ///
    /// This command should be called on pristine nodes — where the log index is 0 and the node
    /// is in Reserve state — as if either of those constraints are false, it indicates that the
    /// cluster is already formed and in motion. If `InitializeError::NotAllowed` is returned,
    /// it is safe to ignore, as it simply indicates that the cluster is already up and running,
    /// which is ultimately the goal of this function.
    ///
    /// This command will work for single-node or multi-node cluster formation. It should be
    /// called with all discovered members which need to be part of the cluster, and as such it
    /// is recommended that applications be configured with an initial cluster formation delay
    /// which will allow time for the initial members of the cluster to be discovered for this
    /// call.
    ///
    /// Every member of the cluster should perform these actions. This routine is race-condition
    /// free, and Raft guarantees that the first node to become the cluster leader will propagate
    /// only its own config.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: BTreeMap<NodeId, Member>) -> Result<(), InitializeError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::Initialize { members, tx }, span))
            .map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Synchronize a new Raft member, bringing it up-to-speed (§6).
    ///
    /// Calling this API will spawn a replication stream to the target member, without yet
    /// counting it as a voter. Once the member is up-to-speed, this function will return. It is
    /// the responsibility of the application to then call `change_membership` once all of the
    /// new members are synced.
    ///
    /// If this Raft node is not the cluster leader, then this call will fail.
    #[tracing::instrument(level = "debug", skip(self, member), fields(target=member.id))]
    pub async fn add_member(&self, member: Member) -> Result<(), ResponseError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::AddMember { member, tx }, span))
            .map_err(|_| ResponseError::Raft(RaftError::ShuttingDown))?;
        let res = match rx.await {
            Ok(x) => x,
            Err(e) => {
                tracing::error!("recv rx error: {}", e);
                return Err(ChangeConfigError::RaftError(RaftError::ShuttingDown).into());
            }
        };
        res?;
        Ok(())
    }

    /// Propose a cluster configuration change (§6).
    ///
    /// This will cause the leader to begin a cluster membership configuration change. If there
    /// are new replicating members in the proposed config which are not already synced — from an
    /// earlier call to `add_member` — then the new members will first be brought up-to-speed
    /// before the cluster moves into joint consensus. As this process may take some time, it is
    /// recommended that `add_member` be called first for new members, and then once all new
    /// members have been synchronized, call this method to start reconfiguration.
    ///
    /// If this Raft node is not the cluster leader, then the proposed configuration change will
    /// be rejected.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_membership(&self, members: BTreeMap<NodeId, Member>) -> Result<(), ResponseError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ChangeMembership { members, tx }, span))
            .map_err(|_| ResponseError::Raft(RaftError::ShuttingDown))?;
        let res = match rx.await {
            Ok(x) => x,
            Err(e) => {
                tracing::error!("recv rx error: {}", e);
                return Err(ChangeConfigError::RaftError(RaftError::ShuttingDown).into());
            }
        };
        res?;
        Ok(())
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use conclave::{State, Raft};
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(Some(timeout)).log(3, "log").await?;
    ///
    /// // wait for ever for raft node's current leader to become 3:
    /// r.wait(None).current_leader(3, "leader").await?;
    ///
    /// // wait for raft state to become a follower
    /// r.wait(None).state(State::Follower, "follower").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }

    /// Route a message to the core task and await its response.
    async fn call_core<T>(&self, msg: RaftMsg<D, R>, rx: oneshot::Receiver<RaftResult<T>>) -> Result<T, RaftError> {
        let span = tracing::debug_span!("CH");
        self.inner.tx_api.send((msg, span)).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D>> Clone for Raft<D, R, N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type CommandTx<R> = oneshot::Sender<RaftResult<CommandResponse<R>>>;
pub(crate) type QueryTx<R> = oneshot::Sender<RaftResult<QueryResponse<R>>>;
pub(crate) type RegisterTx = oneshot::Sender<RaftResult<RegisterResponse>>;
pub(crate) type KeepAliveTx = oneshot::Sender<RaftResult<KeepAliveResponse>>;
pub(crate) type UnregisterTx = oneshot::Sender<RaftResult<UnregisterResponse>>;
pub(crate) type ResponseTx = oneshot::Sender<Result<u64, ResponseError>>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<RaftResult<AppendEntriesResponse>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<RaftResult<VoteResponse>>,
    },
    Poll {
        rpc: PollRequest,
        tx: oneshot::Sender<RaftResult<PollResponse>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<RaftResult<InstallSnapshotResponse>>,
    },
    Configure {
        rpc: ConfigureRequest,
        tx: oneshot::Sender<RaftResult<ConfigureResponse>>,
    },
    Command {
        rpc: CommandRequest<D>,
        tx: CommandTx<R>,
    },
    Query {
        rpc: QueryRequest<D>,
        tx: QueryTx<R>,
    },
    Register {
        rpc: RegisterRequest,
        tx: RegisterTx,
    },
    SessionKeepAlive {
        rpc: KeepAliveRequest,
        tx: KeepAliveTx,
    },
    Unregister {
        rpc: UnregisterRequest,
        tx: UnregisterTx,
    },
    ConnectSession {
        rpc: ConnectRequest,
        publish_tx: mpsc::UnboundedSender<PublishRequest>,
        tx: oneshot::Sender<RaftResult<ConnectResponse>>,
    },
    ResetEvents {
        rpc: ResetRequest,
    },
    Initialize {
        members: BTreeMap<NodeId, Member>,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    AddMember {
        member: Member,
        tx: ResponseTx,
    },
    ChangeMembership {
        members: BTreeMap<NodeId, Member>,
        tx: ResponseTx,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,

    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,

    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The leader's commit index.
    pub leader_commit: u64,
    /// The lowest log index known to be replicated on every live replication target.
    ///
    /// Followers bound their self-triggered log compaction by this value, so that no member
    /// compacts a prefix some lagging peer still needs.
    pub global_index: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, global_index={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.global_index,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,
    /// Will be true if follower contained entry matching `prev_log_index` and `prev_log_term`.
    pub success: bool,
    /// A value used to implement the _conflicting term_ optimization outlined in §5.3.
    ///
    /// This value will only be present, and should only be considered, when `success` is `false`.
    pub conflict_opt: Option<ConflictOpt>,
}

/// A struct used to implement the _conflicting term_ optimization outlined in §5.3 for log replication.
///
/// This implementation of Raft uses this value to more quickly synchronize a leader with its
/// followers which may be some distance behind in replication, may have conflicting entries, or
/// which may be new to the cluster.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ConflictOpt {
    /// The most recent entry which does not conflict with the received request.
    pub log_id: LogId,
}

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    /// Create a new purged marker at the given log id.
    ///
    /// All entries at and below the marker have been compacted into a snapshot.
    pub fn new_purged_marker(log_id: LogId) -> Self {
        Entry {
            log_id,
            payload: EntryPayload::PurgedMarker,
        }
    }
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl<D: AppData> MessageSummary for &[Entry<D>] {
    fn summary(&self) -> String {
        let mut res = Vec::with_capacity(self.len());
        for x in self.iter() {
            let e = format!("{}:{}", x.log_id, x.payload.summary());
            res.push(e);
        }

        res.join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A session command.
    #[serde(bound = "D: AppData")]
    Normal(EntryNormal<D>),
    /// A config change log entry.
    ConfigChange(EntryConfigChange),
    /// A session registration.
    Register(RegisterEntry),
    /// A batch of session liveness acknowledgements.
    KeepAlive(KeepAliveEntry),
    /// A session removal, client requested or cluster expired.
    Unregister(UnregisterEntry),
    /// A record of the server a session is bound to for event delivery.
    Connect(ConnectEntry),
    /// An entry before which all logs are removed.
    PurgedMarker,
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(n) => format!("normal: session={}, sequence={}", n.session, n.sequence),
            EntryPayload::ConfigChange(c) => {
                format!("config-change: {:?}", c.membership)
            }
            EntryPayload::Register(r) => format!("register: client={}", r.client),
            EntryPayload::KeepAlive(k) => format!("keep-alive: n={}", k.acks.len()),
            EntryPayload::Unregister(u) => format!("unregister: session={}, expired={}", u.session, u.expired),
            EntryPayload::Connect(c) => format!("connect: session={}, connection={}", c.session, c.connection),
            EntryPayload::PurgedMarker => "purged-marker".to_string(),
        }
    }
}

/// A session command entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal<D: AppData> {
    /// The session which submitted this command.
    pub session: u64,
    /// The session's client assigned sequence number for this command.
    pub sequence: u64,
    /// Leader wall clock at append time, in epoch milliseconds.
    ///
    /// Entry timestamps are the deterministic clock driving session expiry on every replica.
    pub timestamp: u64,
    /// The contents of this entry; `None` is a no-op filling an abandoned sequence slot.
    #[serde(bound = "D: AppData")]
    pub data: Option<D>,
}

/// A log entry holding a config change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryConfigChange {
    /// Details on the cluster's membership configuration.
    pub membership: MembershipConfig,
}

/// A log entry creating a session. The session's id is this entry's index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntry {
    pub client: String,
    /// The granted session timeout in milliseconds.
    pub timeout: u64,
    pub timestamp: u64,
}

/// A per-session acknowledgement carried inside a keep-alive entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionAck {
    pub session: u64,
    /// The highest command sequence for which the client has received a response.
    pub command_sequence: u64,
    /// The highest event index the client has received.
    pub event_index: u64,
}

/// A log entry recording liveness for all sessions the leader has heard from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveEntry {
    pub acks: Vec<SessionAck>,
    pub timestamp: u64,
}

/// A log entry removing a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnregisterEntry {
    pub session: u64,
    /// True when the cluster expired the session rather than the client closing it.
    pub expired: bool,
    pub timestamp: u64,
}

/// A log entry recording which server a session is bound to for event delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectEntry {
    pub session: u64,
    /// The node the session connected to.
    pub connection: NodeId,
    pub timestamp: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The type of a cluster member, governing whether it votes and what it replicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberKind {
    /// Votes in elections and counts toward the commit quorum.
    Active,
    /// Receives the live log but does not vote.
    Passive,
    /// Receives configuration updates and snapshots only.
    Reserve,
    /// Holds a seat in the config but participates in nothing.
    Inactive,
}

/// A single member of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    /// The member's address, in whatever form the transport resolves.
    pub address: String,
    pub kind: MemberKind,
}

impl Member {
    pub fn new(id: NodeId, address: impl Into<String>, kind: MemberKind) -> Self {
        Self {
            id,
            address: address.into(),
            kind,
        }
    }

    /// Check if this member receives the live log from the leader.
    pub fn replicates(&self) -> bool {
        matches!(self.kind, MemberKind::Active | MemberKind::Passive)
    }
}

/// The membership configuration of the cluster.
///
/// Joint consensus is modeled as in classic Raft: while `members_after_consensus` is present,
/// decisions require a majority of the Active voters of both groups.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// All members of the Raft cluster.
    pub members: BTreeMap<NodeId, Member>,
    /// All members of the Raft cluster after joint consensus is finalized.
    ///
    /// The presence of a value here indicates that the config is in joint consensus.
    pub members_after_consensus: Option<BTreeMap<NodeId, Member>>,
}

impl MembershipConfig {
    /// Create a new initial config containing only the given member as an Active voter.
    pub fn new_initial(id: NodeId, address: impl Into<String>) -> Self {
        let mut members = BTreeMap::new();
        members.insert(id, Member::new(id, address, MemberKind::Active));
        Self {
            members,
            members_after_consensus: None,
        }
    }

    /// Get the ids of all members in the current config, spanning both joint groups.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        let mut all: BTreeSet<NodeId> = self.members.keys().cloned().collect();
        if let Some(members) = &self.members_after_consensus {
            all.extend(members.keys());
        }
        all
    }

    /// Get the ids of all members which receive the live log, spanning both joint groups.
    pub fn replication_targets(&self) -> BTreeSet<NodeId> {
        let mut all: BTreeSet<NodeId> = self.members.values().filter(|m| m.replicates()).map(|m| m.id).collect();
        if let Some(members) = &self.members_after_consensus {
            all.extend(members.values().filter(|m| m.replicates()).map(|m| m.id));
        }
        all
    }

    /// Get the ids of all Reserve members, spanning both joint groups.
    pub fn reserve_targets(&self) -> BTreeSet<NodeId> {
        let mut all: BTreeSet<NodeId> =
            self.members.values().filter(|m| m.kind == MemberKind::Reserve).map(|m| m.id).collect();
        if let Some(members) = &self.members_after_consensus {
            all.extend(members.values().filter(|m| m.kind == MemberKind::Reserve).map(|m| m.id));
        }
        all
    }

    /// Get the ids of the Active voters of the current config group.
    pub fn voters(&self) -> BTreeSet<NodeId> {
        Self::voters_of(&self.members)
    }

    /// Get the ids of the Active voters of the post joint consensus group, if any.
    pub fn voters_after_consensus(&self) -> Option<BTreeSet<NodeId>> {
        self.members_after_consensus.as_ref().map(Self::voters_of)
    }

    fn voters_of(members: &BTreeMap<NodeId, Member>) -> BTreeSet<NodeId> {
        members.values().filter(|m| m.kind == MemberKind::Active).map(|m| m.id).collect()
    }

    /// Look up a member by id, preferring the post consensus group.
    pub fn get_member(&self, id: &NodeId) -> Option<&Member> {
        if let Some(members) = &self.members_after_consensus {
            if let Some(m) = members.get(id) {
                return Some(m);
            }
        }
        self.members.get(id)
    }

    /// Look up the address of a member by id.
    pub fn address_of(&self, id: &NodeId) -> Option<String> {
        self.get_member(id).map(|m| m.address.clone())
    }

    /// The addresses of all Active voters of the current config group, for client selector hints.
    pub fn voter_addresses(&self) -> Vec<String> {
        self.members.values().filter(|m| m.kind == MemberKind::Active).map(|m| m.address.clone()).collect()
    }

    /// Check if the given NodeId exists in this membership config.
    ///
    /// When in joint consensus, this will check both config groups.
    pub fn contains(&self, x: &NodeId) -> bool {
        self.members.contains_key(x)
            || if let Some(members) = &self.members_after_consensus {
                members.contains_key(x)
            } else {
                false
            }
    }

    /// Check if the given NodeId is an Active voter in either config group.
    pub fn is_voter(&self, x: &NodeId) -> bool {
        self.get_member(x).map(|m| m.kind == MemberKind::Active).unwrap_or(false)
    }

    /// Check to see if the config is currently in joint consensus.
    pub fn is_in_joint_consensus(&self) -> bool {
        self.members_after_consensus.is_some()
    }

    /// Collapse a joint config down to its final uniform config.
    pub fn to_final_config(&self) -> Self {
        match self.members_after_consensus {
            None => self.clone(),
            Some(ref m) => MembershipConfig {
                members: m.clone(),
                members_after_consensus: None,
            },
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: u64,
    /// The index of the candidate’s last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate’s last log entry (§5.4).
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A pre-vote straw poll sent by a follower whose election timer has fired.
///
/// Unlike a `VoteRequest`, handling a poll never mutates the receiver's term or vote, and the
/// sender has not incremented its own term. Only a majority of accepting voters licenses a real
/// election, which prevents a partitioned node from inflating terms on reconnection.
#[derive(Debug, Serialize, Deserialize)]
pub struct PollRequest {
    /// The polling node's current term.
    pub term: u64,
    /// The polling node's ID.
    pub candidate_id: u64,
    /// The index of the polling node's last log entry.
    pub last_log_index: u64,
    /// The term of the polling node's last log entry.
    pub last_log_term: u64,
}

impl MessageSummary for PollRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl PollRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

/// The response to a `PollRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    /// The current term of the responding node.
    pub term: u64,
    /// Will be true if the responder would vote for the poller in a real election.
    pub accepted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the Raft leader to send chunks of a snapshot to a follower (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,

    /// Metadata of a snapshot: snapshot_id, last log id covered, membership.
    pub meta: SnapshotMeta,

    /// The byte offset where this chunk of data is positioned in the snapshot file.
    pub offset: u64,
    /// The raw bytes of the snapshot chunk, starting at `offset`.
    pub data: Vec<u8>,

    /// Will be `true` if this is the last chunk in the snapshot.
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, meta={:?}, offset={}, len={}, done={}",
            self.term,
            self.leader_id,
            self.meta,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for leader to update itself.
    pub term: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC pushing a committed membership config to a member which does not receive the log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigureRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader_id: u64,
    /// The log index at which the carried config was committed.
    pub index: u64,
    /// The committed membership config.
    pub membership: MembershipConfig,
}

impl MessageSummary for ConfigureRequest {
    fn summary(&self) -> String {
        format!("term={}, leader_id={}, index={}", self.term, self.leader_id, self.index)
    }
}

/// The response to a `ConfigureRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigureResponse {
    /// The receiving node's current term.
    pub term: u64,
}
