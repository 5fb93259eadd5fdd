//! Fixtures for testing conclave clusters.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use conclave::async_trait::async_trait;
use conclave::client::transport::ClientChannel;
use conclave::client::transport::ClientTransport;
use conclave::metrics::Wait;
use conclave::protocol::CommandRequest;
use conclave::protocol::CommandResponse;
use conclave::protocol::ConnectRequest;
use conclave::protocol::ConnectResponse;
use conclave::protocol::KeepAliveRequest;
use conclave::protocol::KeepAliveResponse;
use conclave::protocol::PublishRequest;
use conclave::protocol::QueryRequest;
use conclave::protocol::QueryResponse;
use conclave::protocol::RegisterRequest;
use conclave::protocol::RegisterResponse;
use conclave::protocol::ResetRequest;
use conclave::protocol::UnregisterRequest;
use conclave::protocol::UnregisterResponse;
use conclave::raft::AppendEntriesRequest;
use conclave::raft::AppendEntriesResponse;
use conclave::raft::ConfigureRequest;
use conclave::raft::ConfigureResponse;
use conclave::raft::InstallSnapshotRequest;
use conclave::raft::InstallSnapshotResponse;
use conclave::raft::Member;
use conclave::raft::MemberKind;
use conclave::raft::PollRequest;
use conclave::raft::PollResponse;
use conclave::raft::VoteRequest;
use conclave::raft::VoteResponse;
use conclave::sessions::StateMachineExecutor;
use conclave::Config;
use conclave::NodeId;
use conclave::Raft;
use conclave::RaftMetrics;
use conclave::RaftNetwork;
use conclave::State;
use memstore::ClientRequest as MemClientRequest;
use memstore::ClientResponse as MemClientResponse;
use memstore::KvStateMachine;
use memstore::MemStore;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete Raft type used during testing.
pub type MemRaft = Raft<MemClientRequest, MemClientResponse, RaftRouter, MemStore>;

/// A concrete executor type used during testing.
pub type MemExecutor = Arc<StateMachineExecutor<MemClientRequest, MemClientResponse>>;

/// A shared handle onto a node's key-value data, for assertions.
pub type KvHandle = Arc<StdMutex<HashMap<String, String>>>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Build an all-Active membership map over the given node ids, addressed as `node-{id}`.
pub fn active_members(ids: &BTreeSet<NodeId>) -> BTreeMap<NodeId, Member> {
    ids.iter().map(|id| (*id, Member::new(*id, format!("node-{}", id), MemberKind::Active))).collect()
}

struct RouterNode {
    raft: MemRaft,
    storage: Arc<MemStore>,
    executor: MemExecutor,
    kv: KvHandle,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A type which emulates a network transport for both peers and session clients.
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, RouterNode>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: Arc<RwLock<HashSet<NodeId>>>,
    /// Commands addressed by (session, sequence) to drop at the "network", with a remaining
    /// drop count per address.
    dropped_commands: Arc<StdMutex<HashMap<(u64, u64), u32>>>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
            dropped_commands: Default::default(),
        }
    }

    /// Create and register a new Raft node bearing the given ID.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId) {
        let storage = Arc::new(MemStore::new(id));
        let state_machine = KvStateMachine::new();
        let kv = state_machine.handle();
        let executor = StateMachineExecutor::new(Box::new(state_machine));
        let raft = Raft::new(id, self.config.clone(), self.clone(), storage.clone(), executor.clone());
        let mut rt = self.routing_table.write().await;
        rt.insert(id, RouterNode {
            raft,
            storage,
            executor,
            kv,
        });
    }

    /// Remove the target node from the routing table & isolation.
    pub async fn remove_node(&self, id: NodeId) -> Option<Arc<MemStore>> {
        let mut rt = self.routing_table.write().await;
        let node = rt.remove(&id);
        let mut isolated = self.isolated_nodes.write().await;
        isolated.remove(&id);
        node.map(|n| n.storage)
    }

    /// Initialize the cluster from the given node with the given Active members.
    pub async fn initialize_with(&self, node: NodeId, members: BTreeSet<NodeId>) -> Result<()> {
        tracing::info!({ node }, "initializing cluster");
        let rt = self.routing_table.read().await;
        rt.get(&node)
            .ok_or_else(|| anyhow!("node {} not found in routing table", node))?
            .raft
            .initialize(active_members(&members))
            .await?;
        Ok(())
    }

    /// Isolate the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore_node(&self, id: NodeId) {
        let mut nodes = self.isolated_nodes.write().await;
        nodes.remove(&id);
    }

    /// Drop the next `count` command frames carrying the given (session, sequence).
    pub fn drop_command(&self, session: u64, sequence: u64, count: u32) {
        self.dropped_commands.lock().unwrap().insert((session, sequence), count);
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        let mut metrics = vec![];
        for node in rt.values() {
            metrics.push(node.raft.metrics().borrow().clone());
        }
        metrics
    }

    /// Get a handle to the Raft node bearing the given ID.
    pub async fn get_raft_handle(&self, node_id: &NodeId) -> Result<MemRaft> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("node {} not found in routing table", node_id))?;
        Ok(node.raft.clone())
    }

    /// Get a handle to the storage backend for the target node.
    pub async fn get_storage_handle(&self, node_id: &NodeId) -> Result<Arc<MemStore>> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("node {} not found in routing table", node_id))?;
        Ok(node.storage.clone())
    }

    /// Get a handle to the key-value data of the target node's state machine.
    pub async fn get_kv_handle(&self, node_id: &NodeId) -> Result<KvHandle> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("node {} not found in routing table", node_id))?;
        Ok(node.kv.clone())
    }

    pub async fn wait(&self, node_id: &NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("node {} not found", node_id))?;
        Ok(node.raft.wait(timeout))
    }

    /// Wait for metrics until it satisfies some condition.
    #[tracing::instrument(level = "info", skip(self, func))]
    pub async fn wait_for_metrics<T>(
        &self,
        node_id: &NodeId,
        func: T,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<RaftMetrics>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let wait = self.wait(node_id, timeout).await?;
        let rst = wait.metrics(func, msg).await?;
        Ok(rst)
    }

    /// Wait for specified nodes until they applied upto `want_log`(inclusive) logs.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<u64>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for specified nodes until their state becomes `state`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_state(
        &self,
        node_ids: &BTreeSet<u64>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.state(want_state, msg).await?;
        }
        Ok(())
    }

    /// Get the ID of the current leader.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|node| {
            if node.current_leader == Some(node.id) {
                if isolated.contains(&node.id) {
                    None
                } else {
                    Some(node.id)
                }
            } else {
                None
            }
        })
    }

    /// The addresses of all registered nodes, for building session clients.
    pub async fn addresses(&self) -> Vec<String> {
        let rt = self.routing_table.read().await;
        rt.keys().map(|id| format!("node-{}", id)).collect()
    }

    //////////////////////////////////////////////////////////////////////////////////////////////

    /// Assert that the cluster has an elected leader, and is in a stable state with all nodes uniform.
    ///
    /// If `expected_term` is `Some`, then all nodes will be tested to ensure that they are in the
    /// given term. Else, the leader's current term will be used for the assertion.
    ///
    /// If `expected_last_log` is `Some`, then all nodes will be tested to ensure that their last
    /// log index and last applied log match the given value. Else, the leader's last_log_index
    /// will be used for the assertion.
    pub async fn assert_stable_cluster(&self, expected_term: Option<u64>, expected_last_log: Option<u64>) {
        let isolated = self.isolated_nodes.read().await;
        let nodes = self.latest_metrics().await;

        let non_isolated_nodes: Vec<_> = nodes.iter().filter(|node| !isolated.contains(&node.id)).collect();
        let leader = nodes
            .iter()
            .filter(|node| !isolated.contains(&node.id))
            .find(|node| node.state == State::Leader)
            .expect("expected to find a cluster leader");
        let followers: Vec<_> = nodes
            .iter()
            .filter(|node| !isolated.contains(&node.id))
            .filter(|node| node.state == State::Follower)
            .collect();

        assert_eq!(
            followers.len() + 1,
            non_isolated_nodes.len(),
            "expected all nodes to be followers with one leader, got 1 leader and {} followers, expected {} followers",
            followers.len(),
            non_isolated_nodes.len() - 1,
        );
        let expected_term = match expected_term {
            Some(term) => term,
            None => leader.current_term,
        };
        let expected_last_log = match expected_last_log {
            Some(idx) => idx,
            None => leader.last_log_index,
        };
        let all_nodes = nodes.iter().map(|node| node.id).collect::<Vec<_>>();
        for node in non_isolated_nodes.iter() {
            assert_eq!(
                node.current_leader,
                Some(leader.id),
                "node {} has leader {:?}, expected {}",
                node.id,
                node.current_leader,
                leader.id
            );
            assert_eq!(
                node.current_term, expected_term,
                "node {} has term {}, expected {}",
                node.id, node.current_term, expected_term
            );
            assert_eq!(
                node.last_applied, expected_last_log,
                "node {} has last_applied {}, expected {}",
                node.id, node.last_applied, expected_last_log
            );
            assert_eq!(
                node.last_log_index, expected_last_log,
                "node {} has last_log_index {}, expected {}",
                node.id, node.last_log_index, expected_last_log
            );
            let mut members = node.membership_config.members.keys().cloned().collect::<Vec<_>>();
            members.sort_unstable();
            assert_eq!(
                members, all_nodes,
                "node {} has membership {:?}, expected {:?}",
                node.id, members, all_nodes
            );
            assert!(
                node.membership_config.members_after_consensus.is_none(),
                "node {} was not in uniform consensus state",
                node.id
            );
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

#[async_trait]
impl RaftNetwork<MemClientRequest> for RaftRouter {
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(
        &self,
        target: u64,
        rpc: AppendEntriesRequest<MemClientRequest>,
    ) -> Result<AppendEntriesResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let node = rt.get(&target).expect("target node not found in routing table");
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target node is isolated"));
        }
        let resp = node.raft.append_entries(rpc).await;
        Ok(resp?)
    }

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: u64, rpc: VoteRequest) -> Result<VoteResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let node = rt.get(&target).expect("target node not found in routing table");
        if isolated.contains(&target) || isolated.contains(&rpc.candidate_id) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(node.raft.vote(rpc).await?)
    }

    /// Send a pre-vote Poll RPC to the target Raft node.
    async fn send_poll(&self, target: u64, rpc: PollRequest) -> Result<PollResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let node = rt.get(&target).expect("target node not found in routing table");
        if isolated.contains(&target) || isolated.contains(&rpc.candidate_id) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(node.raft.poll(rpc).await?)
    }

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn send_install_snapshot(&self, target: u64, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let node = rt.get(&target).expect("target node not found in routing table");
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(node.raft.install_snapshot(rpc).await?)
    }

    /// Send a Configure RPC to the target Raft node.
    async fn send_configure(&self, target: u64, rpc: ConfigureRequest) -> Result<ConfigureResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let node = rt.get(&target).expect("target node not found in routing table");
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(node.raft.configure(rpc).await?)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A session client channel to one node, routed in-process.
pub struct RouterChannel {
    target: NodeId,
    raft: MemRaft,
    isolated: Arc<RwLock<HashSet<NodeId>>>,
    dropped_commands: Arc<StdMutex<HashMap<(u64, u64), u32>>>,
}

impl RouterChannel {
    async fn check_reachable(&self) -> Result<()> {
        if self.isolated.read().await.contains(&self.target) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(())
    }
}

#[async_trait]
impl ClientChannel<MemClientRequest, MemClientResponse> for RouterChannel {
    async fn connect_session(
        &self,
        rpc: ConnectRequest,
        publish_tx: mpsc::UnboundedSender<PublishRequest>,
    ) -> Result<ConnectResponse> {
        self.check_reachable().await?;
        Ok(self.raft.connect(rpc, publish_tx).await?)
    }

    async fn register(&self, rpc: RegisterRequest) -> Result<RegisterResponse> {
        self.check_reachable().await?;
        Ok(self.raft.register(rpc).await?)
    }

    async fn keep_alive(&self, rpc: KeepAliveRequest) -> Result<KeepAliveResponse> {
        self.check_reachable().await?;
        Ok(self.raft.keep_alive(rpc).await?)
    }

    async fn unregister(&self, rpc: UnregisterRequest) -> Result<UnregisterResponse> {
        self.check_reachable().await?;
        Ok(self.raft.unregister(rpc).await?)
    }

    async fn command(&self, rpc: CommandRequest<MemClientRequest>) -> Result<CommandResponse<MemClientResponse>> {
        self.check_reachable().await?;
        {
            let mut drops = self.dropped_commands.lock().unwrap();
            if let Some(remaining) = drops.get_mut(&(rpc.session, rpc.sequence)) {
                if *remaining > 0 {
                    *remaining -= 1;
                    if *remaining == 0 {
                        drops.remove(&(rpc.session, rpc.sequence));
                    }
                    return Err(anyhow!("command frame dropped by test network"));
                }
            }
        }
        Ok(self.raft.command(rpc).await?)
    }

    async fn query(&self, rpc: QueryRequest<MemClientRequest>) -> Result<QueryResponse<MemClientResponse>> {
        self.check_reachable().await?;
        Ok(self.raft.query(rpc).await?)
    }

    async fn reset_events(&self, rpc: ResetRequest) -> Result<()> {
        self.check_reachable().await?;
        Ok(self.raft.reset_events(rpc).await?)
    }
}

#[async_trait]
impl ClientTransport<MemClientRequest, MemClientResponse> for RaftRouter {
    type Channel = RouterChannel;

    async fn connect(&self, address: &str) -> Result<Arc<Self::Channel>> {
        let id: NodeId = address
            .strip_prefix("node-")
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| anyhow!("unresolvable address: {}", address))?;
        let rt = self.routing_table.read().await;
        let node = rt.get(&id).ok_or_else(|| anyhow!("no node at address {}", address))?;
        if self.isolated_nodes.read().await.contains(&id) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(Arc::new(RouterChannel {
            target: id,
            raft: node.raft.clone(),
            isolated: self.isolated_nodes.clone(),
            dropped_commands: self.dropped_commands.clone(),
        }))
    }
}
