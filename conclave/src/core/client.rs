use std::sync::Arc;

use anyhow::anyhow;
use futures::future::TryFutureExt;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use tokio::time::timeout;
use tokio::time::Duration;
use tracing::Instrument;

use crate::core::LeaderState;
use crate::core::State;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::protocol::CommandRequest;
use crate::protocol::CommandResponse;
use crate::protocol::Consistency;
use crate::protocol::ConnectRequest;
use crate::protocol::ConnectResponse;
use crate::protocol::ErrorKind;
use crate::protocol::KeepAliveRequest;
use crate::protocol::KeepAliveResponse;
use crate::protocol::PublishRequest;
use crate::protocol::QueryRequest;
use crate::protocol::QueryResponse;
use crate::protocol::RegisterRequest;
use crate::protocol::RegisterResponse;
use crate::protocol::ResponseStatus;
use crate::protocol::UnregisterRequest;
use crate::protocol::UnregisterResponse;
use crate::quorum;
use crate::raft::AppendEntriesRequest;
use crate::raft::CommandTx;
use crate::raft::ConnectEntry;
use crate::raft::Entry;
use crate::raft::EntryNormal;
use crate::raft::EntryPayload;
use crate::raft::KeepAliveEntry;
use crate::raft::KeepAliveTx;
use crate::raft::QueryTx;
use crate::raft::RegisterEntry;
use crate::raft::RegisterTx;
use crate::raft::ResponseTx;
use crate::raft::SessionAck;
use crate::raft::UnregisterEntry;
use crate::raft::UnregisterTx;
use crate::replication::RaftEvent;
use crate::sessions::Admission;
use crate::sessions::ApplyOutcome;
use crate::sessions::CommandOutcome;
use crate::sessions::OutcomeError;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// A wrapper around a session request which has been transformed into an Entry, along with its
/// response channel.
pub(super) struct ClientRequestEntry<D: AppData, R: AppDataResponse> {
    /// The Arc'd entry of the request.
    ///
    /// This value is Arc'd so that it may be sent across thread boundaries for replication
    /// without having to clone the data payload itself.
    pub entry: Arc<Entry<D>>,
    /// The response channel for the request.
    pub tx: ClientOrInternalResponseTx<R>,
}

impl<D: AppData, R: AppDataResponse> ClientRequestEntry<D, R> {
    /// Create a new instance from the raw components of a client request.
    pub(crate) fn from_entry<T: Into<ClientOrInternalResponseTx<R>>>(entry: Entry<D>, tx: T) -> Self {
        Self {
            entry: Arc::new(entry),
            tx: tx.into(),
        }
    }
}

/// An enum type wrapping the response channel variants of the session protocol, or an internal
/// Raft response channel.
#[derive(derive_more::From)]
pub enum ClientOrInternalResponseTx<R: AppDataResponse> {
    Command(CommandTx<R>),
    Register(RegisterTx),
    KeepAlive((KeepAliveTx, u64)),
    Unregister(UnregisterTx),
    Internal(Option<ResponseTx>),
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D>> LeaderState<'a, D, R, N, S> {
    /// Commit the initial entry which new leaders are obligated to create when first coming to power, per §8.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        // If the cluster has just formed, and the current index is 0, then commit the current
        // config, else a blank payload.
        let last_index = self.core.last_log_id.index;

        let payload: EntryPayload<D> = if last_index == 0 {
            EntryPayload::ConfigChange(crate::raft::EntryConfigChange {
                membership: self.core.membership.clone(),
            })
        } else {
            // Complete a partial member-change:
            //
            // Raft appends two consecutive membership change logs: the joint config and the
            // final config, to impl a membership change.
            //
            // It is possible only the first one, the joint config log, was written to storage or
            // replicated. Thus if a new leader sees only the first one, it needs to append the
            // final config log to let the change-membership operation finish.
            let last_logs =
                self.core.storage.get_log_entries(last_index..=last_index).await.map_err(RaftError::RaftStorage)?;
            let last_log = &last_logs[0];

            let req = match last_log.payload {
                EntryPayload::ConfigChange(ref mem) => {
                    if mem.membership.members_after_consensus.is_some() {
                        let final_config = mem.membership.to_final_config();
                        Some(EntryPayload::ConfigChange(crate::raft::EntryConfigChange {
                            membership: final_config,
                        }))
                    } else {
                        None
                    }
                }
                _ => None,
            };

            req.unwrap_or(EntryPayload::Blank)
        };

        // Commit the initial payload to the cluster.
        let entry = self.append_payload_to_log(payload).await?;
        self.core.last_log_id.term = self.core.current_term; // This only ever needs to be updated once per term.

        let cr_entry = ClientRequestEntry::from_entry(entry, None);
        self.replicate_client_request(cr_entry).await;

        Ok(())
    }

    /// Handle a session command request.
    ///
    /// The command is admitted against the session's sequence window before anything is logged:
    /// retries answer from the result cache, and gaps are bounced back to the client for
    /// resubmission without consuming log space.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_command_request(&mut self, rpc: CommandRequest<D>, tx: CommandTx<R>) {
        match self.core.executor.admit_command(rpc.session, rpc.sequence).await {
            Admission::UnknownSession => {
                let _ = tx.send(Ok(CommandResponse::error(ErrorKind::UnknownSession, 0)));
            }
            Admission::Cached(outcome) => {
                let _ = tx.send(Ok(response_from_outcome(outcome)));
            }
            Admission::Gap { last_sequence } => {
                tracing::debug!(
                    session = rpc.session,
                    sequence = rpc.sequence,
                    last_sequence,
                    "command left a sequence gap, rejecting for resubmission"
                );
                let _ = tx.send(Ok(CommandResponse::error(ErrorKind::CommandError, last_sequence)));
            }
            Admission::Accept => {
                let payload = EntryPayload::Normal(EntryNormal {
                    session: rpc.session,
                    sequence: rpc.sequence,
                    timestamp: super::timestamp_now(),
                    data: rpc.command,
                });
                let entry = match self.append_payload_to_log(payload).await {
                    Ok(entry) => ClientRequestEntry::from_entry(entry, tx),
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                self.replicate_client_request(entry).await;
            }
        }
    }

    /// Handle a session query request.
    ///
    /// Queries are never logged. A query whose observed index is ahead of the applied index is
    /// parked until applies catch up, so the client never reads state missing its own writes.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_query_request(&mut self, rpc: QueryRequest<D>, tx: QueryTx<R>) {
        if rpc.index > self.core.last_applied.index {
            tracing::debug!(
                session = rpc.session,
                want = rpc.index,
                applied = self.core.last_applied.index,
                "parking query until applied index catches up"
            );
            self.awaiting_queries.push((rpc.index, rpc, tx));
            return;
        }
        self.execute_query(rpc, tx).await;
    }

    /// Execute a query at its requested consistency level.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn execute_query(&mut self, rpc: QueryRequest<D>, tx: QueryTx<R>) {
        // A linearizable query must first confirm this node is still leader via a heartbeat
        // round; a sequential query settles for committed state.
        if let Consistency::Linearizable = rpc.consistency {
            if !self.confirm_leadership().await {
                let _ = tx.send(Ok(QueryResponse::error(ErrorKind::NoLeader)));
                return;
            }
            if !self.core.target_state.is_leader() {
                let _ = tx.send(Ok(QueryResponse::error(ErrorKind::NoLeader)));
                return;
            }
        }

        let outcome = self.core.executor.query(rpc.session, rpc.sequence, &rpc.query).await;
        let response = match outcome.result {
            Ok(result) => QueryResponse {
                status: ResponseStatus::Ok,
                index: outcome.index,
                event_index: outcome.event_index,
                result: Some(result),
                error: None,
            },
            Err(OutcomeError::UnknownSession) => QueryResponse::error(ErrorKind::UnknownSession),
            Err(OutcomeError::SequenceAhead) => QueryResponse::error(ErrorKind::QueryError),
            Err(OutcomeError::Application(msg)) => {
                tracing::debug!(session = rpc.session, error = %msg, "query raised in state machine");
                QueryResponse::error(ErrorKind::ApplicationError)
            }
        };
        let _ = tx.send(Ok(response));
    }

    /// Execute any parked queries whose observed index has now been applied.
    pub(super) async fn drain_awaiting_queries(&mut self) {
        if self.awaiting_queries.is_empty() {
            return;
        }
        let applied = self.core.last_applied.index;
        let mut parked = std::mem::take(&mut self.awaiting_queries);
        let mut ready = Vec::new();
        parked.retain_mut_split(applied, &mut ready);
        self.awaiting_queries = parked;
        for (_, rpc, tx) in ready {
            self.execute_query(rpc, tx).await;
        }
    }

    /// Commit expiry unregister entries for sessions which have gone silent.
    pub(super) async fn propose_expirations(&mut self) {
        let expired = self.core.executor.take_expired().await;
        for session in expired {
            tracing::info!(session, "session exceeded twice its timeout, committing expiry");
            let payload = EntryPayload::Unregister(UnregisterEntry {
                session,
                expired: true,
                timestamp: super::timestamp_now(),
            });
            match self.append_payload_to_log(payload).await {
                Ok(entry) => {
                    let cr_entry = ClientRequestEntry::from_entry(entry, None);
                    self.replicate_client_request(cr_entry).await;
                }
                Err(err) => {
                    tracing::error!({error=%err, session}, "error appending session expiry entry");
                }
            }
        }
    }

    /// Handle a session registration request.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_register_request(&mut self, rpc: RegisterRequest, tx: RegisterTx) {
        let timeout = rpc.timeout.unwrap_or(self.core.config.session_timeout);
        let payload = EntryPayload::Register(RegisterEntry {
            client: rpc.client,
            timeout,
            timestamp: super::timestamp_now(),
        });
        let entry = match self.append_payload_to_log(payload).await {
            Ok(entry) => ClientRequestEntry::from_entry(entry, tx),
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        self.replicate_client_request(entry).await;
    }

    /// Handle a session keep-alive request.
    ///
    /// The ack is folded together with any other acks the leader has collected since its last
    /// keep-alive entry, so one committed entry refreshes every session heard from.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_keep_alive_request(&mut self, rpc: KeepAliveRequest, tx: KeepAliveTx) {
        self.pending_acks.insert(rpc.session, SessionAck {
            session: rpc.session,
            command_sequence: rpc.command_sequence,
            event_index: rpc.event_index,
        });
        let acks: Vec<SessionAck> = self.pending_acks.drain().map(|(_, ack)| ack).collect();
        let payload = EntryPayload::KeepAlive(KeepAliveEntry {
            acks,
            timestamp: super::timestamp_now(),
        });
        let entry = match self.append_payload_to_log(payload).await {
            Ok(entry) => ClientRequestEntry::from_entry(entry, (tx, rpc.session)),
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        self.replicate_client_request(entry).await;
    }

    /// Handle a session unregister request.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_unregister_request(&mut self, rpc: UnregisterRequest, tx: UnregisterTx) {
        let payload = EntryPayload::Unregister(UnregisterEntry {
            session: rpc.session,
            expired: false,
            timestamp: super::timestamp_now(),
        });
        let entry = match self.append_payload_to_log(payload).await {
            Ok(entry) => ClientRequestEntry::from_entry(entry, tx),
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        self.replicate_client_request(entry).await;
    }

    /// Handle a connect request on the leader: bind the publish pipe locally like any other
    /// node, then record the binding in the log so replicas learn where the session lives.
    #[tracing::instrument(level = "trace", skip(self, rpc, publish_tx, tx))]
    pub(super) async fn handle_leader_connect_request(
        &mut self,
        rpc: ConnectRequest,
        publish_tx: tokio::sync::mpsc::UnboundedSender<PublishRequest>,
        tx: tokio::sync::oneshot::Sender<RaftResult<ConnectResponse>>,
    ) {
        let session = rpc.session;
        self.core.handle_connect_request(rpc, publish_tx, tx).await;
        if session == 0 {
            return;
        }
        let payload = EntryPayload::Connect(ConnectEntry {
            session,
            connection: self.core.id,
            timestamp: super::timestamp_now(),
        });
        match self.append_payload_to_log(payload).await {
            Ok(entry) => {
                let cr_entry = ClientRequestEntry::from_entry(entry, None);
                self.replicate_client_request(cr_entry).await;
            }
            Err(err) => {
                tracing::error!({error=%err, session}, "error appending connect entry");
            }
        }
    }

    /// Confirm this node is still the cluster leader with a heartbeat round (§8).
    ///
    /// Spawn requests to all voting members of the cluster, including members being added in
    /// joint consensus. Each request has a timeout, and we succeed once we have a majority
    /// agreement from each config group. Most of the time, we will have a single uniform
    /// config group.
    ///
    /// From the spec (§8):
    /// Second, a leader must check whether it has been deposed before processing a read-only
    /// request (its information may be stale if a more recent leader has been elected). Raft
    /// handles this by having the leader exchange heartbeat messages with a majority of the
    /// cluster before responding to read-only requests.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn confirm_leadership(&mut self) -> bool {
        // Setup sentinel values to track when we've received majority confirmation of leadership.
        let mut c0_confirmed = 0usize;
        // Voters of the current config group; will never be zero, as we don't allow it when
        // proposing config changes.
        let c0_voters = self.core.membership.voters();
        let c0_needed = quorum::majority_of(c0_voters.len());

        let mut c1_confirmed = 0usize;
        let mut c1_needed = 0usize;
        let c1_voters = self.core.membership.voters_after_consensus();
        if let Some(voters) = &c1_voters {
            c1_needed = quorum::majority_of(voters.len());
        }

        // Increment confirmations for self, including post-joint-consensus config if applicable.
        if c0_voters.contains(&self.core.id) {
            c0_confirmed += 1;
        }
        if c1_voters.as_ref().map(|voters| voters.contains(&self.core.id)).unwrap_or(false) {
            c1_confirmed += 1;
        }

        // If we already have all needed confirmations — which would be the case for single node
        // clusters — then respond.
        if c0_confirmed >= c0_needed && c1_confirmed >= c1_needed {
            return true;
        }

        // Spawn parallel requests, all with the standard timeout for heartbeats.
        let mut pending = FuturesUnordered::new();
        for (id, node) in self.nodes.iter() {
            if !c0_voters.contains(id) && !c1_voters.as_ref().map(|v| v.contains(id)).unwrap_or(false) {
                continue;
            }
            let rpc = AppendEntriesRequest {
                term: self.core.current_term,
                leader_id: self.core.id,
                prev_log_id: node.matched,
                entries: vec![],
                leader_commit: self.core.commit_index,
                global_index: self.core.global_index,
            };
            let target = *id;
            let network = self.core.network.clone();
            let ttl = Duration::from_millis(self.core.config.heartbeat_interval);
            let task = tokio::spawn(
                async move {
                    match timeout(ttl, network.send_append_entries(target, rpc)).await {
                        Ok(Ok(data)) => Ok((target, data)),
                        Ok(Err(err)) => Err((target, err)),
                        Err(_timeout) => Err((target, anyhow!("timeout waiting for leadership confirmation"))),
                    }
                }
                .instrument(tracing::debug_span!("spawn")),
            )
            .map_err(move |err| (target, err));
            pending.push(task);
        }

        // Handle responses as they return.
        while let Some(res) = pending.next().await {
            let (target, data) = match res {
                Ok(Ok(res)) => res,
                Ok(Err((target, err))) => {
                    tracing::warn!(target, error=%err, "failure while confirming leadership for read request");
                    continue;
                }
                Err((target, err)) => {
                    tracing::error!(target, "{}", err);
                    continue;
                }
            };

            // If we receive a response with a greater term, then revert to follower and abort this request.
            if data.term != self.core.current_term {
                self.core.update_current_term(data.term, None);
                self.core.set_target_state(State::Follower);
                return false;
            }

            // If the term is the same, then it means we are still the leader.
            if c0_voters.contains(&target) {
                c0_confirmed += 1;
            }
            if c1_voters.as_ref().map(|voters| voters.contains(&target)).unwrap_or(false) {
                c1_confirmed += 1;
            }
            if c0_confirmed >= c0_needed && c1_confirmed >= c1_needed {
                return true;
            }
        }

        // If we've hit this location, then we've failed to gather needed confirmations due to
        // request failures.
        tracing::warn!("too many heartbeat requests failed, could not confirm leadership");
        false
    }

    /// Transform the given payload into an entry, assign an index and term, and append the entry to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<Entry<D>> {
        let entry = Entry {
            log_id: LogId {
                index: self.core.last_log_id.index + 1,
                term: self.core.current_term,
            },
            payload,
        };
        self.core
            .storage
            .append_to_log(&[&entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id.index = entry.log_id.index;

        self.leader_report_metrics();

        Ok(entry)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// NOTE WELL: this routine does not wait for the request to actually finish replication, it
    /// merely begins the process. Once the request is committed to the cluster, its response will
    /// be generated asynchronously.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry<D, R>) {
        // Replicate the request if there are other cluster members. The client response will be
        // returned elsewhere after the entry has been committed to the cluster.
        let entry_arc = req.entry.clone();

        if self.nodes.is_empty() && self.joining.is_empty() {
            // Else, there are no voting nodes for replication, so the payload is now committed.
            self.core.commit_index = entry_arc.log_id.index;
            self.core.global_index = entry_arc.log_id.index;
            self.leader_report_metrics();
            self.client_request_post_commit(req).await;
            return;
        }

        self.awaiting_committed.push(req);

        if !self.nodes.is_empty() {
            for node in self.nodes.values() {
                let _ = node.replstream.repl_tx.send((
                    RaftEvent::Replicate {
                        entry: entry_arc.clone(),
                        commit_index: self.core.commit_index,
                        global_index: self.core.global_index,
                    },
                    tracing::debug_span!("CH"),
                ));
            }
        }

        if !self.joining.is_empty() {
            // Replicate to nodes being synced for joining.
            for node in self.joining.values() {
                let _ = node.state.replstream.repl_tx.send((
                    RaftEvent::Replicate {
                        entry: entry_arc.clone(),
                        commit_index: self.core.commit_index,
                        global_index: self.core.global_index,
                    },
                    tracing::debug_span!("CH"),
                ));
            }
        }
    }

    /// Handle the post-commit logic for a client request.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry<D, R>) {
        let entry = req.entry.clone();

        // Apply this entry — and any earlier committed entries not yet applied — through the
        // executor. The outcomes of earlier entries are matched against deferred response
        // channels; no current waiter means the response belongs to a prior term's client.
        let outcomes = match self.apply_entries_through(entry.log_id.index).await {
            Ok(outcomes) => outcomes,
            Err(err) => {
                tracing::error!({error=%err}, "error applying committed entries");
                self.fail_request(req.tx, err);
                return;
            }
        };

        match req.tx {
            ClientOrInternalResponseTx::Command(tx) => {
                let (session, sequence) = match &entry.payload {
                    EntryPayload::Normal(normal) => (normal.session, normal.sequence),
                    _ => {
                        // Requests are paired with their entries at append time; this cannot be
                        // hit unless the pairing above is broken in review.
                        tracing::error!("critical: command response channel paired with a non-command entry");
                        self.core.set_target_state(State::Inactive);
                        return;
                    }
                };
                let own = self.dispatch_completions(&outcomes, Some((session, sequence)));
                match own {
                    Some(outcome) => {
                        let _ = tx.send(Ok(response_from_outcome(outcome)));
                    }
                    // The command was buffered behind a sequence gap; its completion will
                    // surface when the missing predecessor applies.
                    None => {
                        self.deferred_commands.insert((session, sequence), tx);
                    }
                }
            }
            ClientOrInternalResponseTx::Register(tx) => {
                self.dispatch_completions(&outcomes, None);
                let registered = outcomes.iter().rev().find_map(|o| match o {
                    ApplyOutcome::Register { session, timeout } => Some((*session, *timeout)),
                    _ => None,
                });
                let _ = match registered {
                    Some((session, timeout)) => tx.send(Ok(RegisterResponse {
                        status: ResponseStatus::Ok,
                        error: None,
                        session,
                        timeout,
                        leader: self.core.leader_address(),
                        members: self.core.membership.voter_addresses(),
                    })),
                    None => tx.send(Ok(RegisterResponse {
                        status: ResponseStatus::Error,
                        error: Some(ErrorKind::Internal),
                        session: 0,
                        timeout: 0,
                        leader: self.core.leader_address(),
                        members: self.core.membership.voter_addresses(),
                    })),
                };
            }
            ClientOrInternalResponseTx::KeepAlive((tx, session)) => {
                self.dispatch_completions(&outcomes, None);
                // A keep-alive for a session the cluster no longer tracks tells the client its
                // session is dead.
                let known = self.core.executor.session_exists(session).await;
                let _ = tx.send(Ok(KeepAliveResponse {
                    status: if known { ResponseStatus::Ok } else { ResponseStatus::Error },
                    error: if known { None } else { Some(ErrorKind::UnknownSession) },
                    leader: self.core.leader_address(),
                    members: self.core.membership.voter_addresses(),
                }));
            }
            ClientOrInternalResponseTx::Unregister(tx) => {
                self.dispatch_completions(&outcomes, None);
                let _ = tx.send(Ok(UnregisterResponse {
                    status: ResponseStatus::Ok,
                    error: None,
                }));
            }
            ClientOrInternalResponseTx::Internal(tx) => {
                self.handle_special_log(&entry);
                self.dispatch_completions(&outcomes, None);
                if let Some(tx) = tx {
                    let send_res = tx.send(Ok(entry.log_id.index));
                    tracing::debug!("send internal response through tx, res: {:?}", send_res);
                }
            }
        }

        // Trigger log compaction if needed.
        self.core.trigger_log_compaction_if_needed(false);
    }

    /// Route command completions to their waiting response channels.
    ///
    /// Returns the completion matching `own`, if present; all other completions answer deferred
    /// channels from earlier requests.
    fn dispatch_completions(
        &mut self,
        outcomes: &[ApplyOutcome<R>],
        own: Option<(u64, u64)>,
    ) -> Option<CommandOutcome<R>> {
        let mut own_outcome = None;
        for outcome in outcomes {
            let completions = match outcome {
                ApplyOutcome::Command { completions } => completions,
                _ => continue,
            };
            for completion in completions {
                let key = (completion.session, completion.sequence);
                if own == Some(key) && own_outcome.is_none() {
                    own_outcome = Some(completion.clone());
                } else if let Some(tx) = self.deferred_commands.remove(&key) {
                    let _ = tx.send(Ok(response_from_outcome(completion.clone())));
                }
            }
        }
        own_outcome
    }

    /// Apply all committed-but-unapplied entries through the given index.
    ///
    /// Note that entries before `index` would only ever be outstanding if this node had
    /// unapplied logs from before becoming leader.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn apply_entries_through(&mut self, index: u64) -> RaftResult<Vec<ApplyOutcome<R>>> {
        let start = self.core.last_applied.index + 1;
        if start > index {
            return Ok(Vec::new());
        }

        // Before applying, ensure no spawned replication task is racing us to the executor.
        if !self.core.replicate_to_sm_handle.is_empty() {
            if let Some(Ok(replicate_to_sm_result)) = self.core.replicate_to_sm_handle.next().await {
                self.core.handle_replicate_to_sm_result(replicate_to_sm_result)?;
            }
        }

        let entries = self
            .core
            .storage
            .get_log_entries(start..=index)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;

        let last_log_id = match entries.last() {
            Some(entry) => entry.log_id,
            None => return Ok(Vec::new()),
        };

        let outcomes = self
            .core
            .executor
            .apply(&entries)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;

        self.core.last_applied = last_log_id;
        self.leader_report_metrics();
        Ok(outcomes)
    }

    /// Answer a request whose apply failed fatally.
    fn fail_request(&mut self, tx: ClientOrInternalResponseTx<R>, err: RaftError) {
        match tx {
            ClientOrInternalResponseTx::Command(tx) => {
                let _ = tx.send(Err(err));
            }
            ClientOrInternalResponseTx::Register(tx) => {
                let _ = tx.send(Err(err));
            }
            ClientOrInternalResponseTx::KeepAlive((tx, _)) => {
                let _ = tx.send(Err(err));
            }
            ClientOrInternalResponseTx::Unregister(tx) => {
                let _ = tx.send(Err(err));
            }
            ClientOrInternalResponseTx::Internal(tx) => {
                if let Some(tx) = tx {
                    let _ = tx.send(Err(ResponseError::Raft(err)));
                }
            }
        }
    }

    /// Dispatch config-change bookkeeping for committed entries.
    pub fn handle_special_log(&mut self, entry: &Arc<Entry<D>>) {
        match &entry.payload {
            EntryPayload::ConfigChange(ref mem) => {
                let m = &mem.membership;
                if m.is_in_joint_consensus() {
                    self.handle_joint_consensus_committed();
                } else {
                    self.handle_uniform_consensus_committed(entry.log_id.index);
                }
            }
            _ => {}
        }
    }
}

/// Build the wire response for a command completion.
pub(super) fn response_from_outcome<R: AppDataResponse>(outcome: CommandOutcome<R>) -> CommandResponse<R> {
    match outcome.result {
        Ok(result) => CommandResponse {
            status: ResponseStatus::Ok,
            index: outcome.index,
            event_index: outcome.event_index,
            last_sequence: outcome.last_sequence,
            result,
            error: None,
        },
        Err(OutcomeError::UnknownSession) => CommandResponse::error(ErrorKind::UnknownSession, 0),
        Err(OutcomeError::SequenceAhead) => CommandResponse::error(ErrorKind::CommandError, outcome.last_sequence),
        Err(OutcomeError::Application(msg)) => {
            tracing::debug!(session = outcome.session, sequence = outcome.sequence, error = %msg, "command raised in state machine");
            CommandResponse {
                status: ResponseStatus::Error,
                index: outcome.index,
                event_index: outcome.event_index,
                last_sequence: outcome.last_sequence,
                result: None,
                error: Some(ErrorKind::ApplicationError),
            }
        }
    }
}

/// Helper extension for draining parked queries which have become executable.
trait RetainSplit<D: AppData, R: AppDataResponse> {
    fn retain_mut_split(&mut self, applied: u64, ready: &mut Vec<(u64, QueryRequest<D>, QueryTx<R>)>);
}

impl<D: AppData, R: AppDataResponse> RetainSplit<D, R> for Vec<(u64, QueryRequest<D>, QueryTx<R>)> {
    fn retain_mut_split(&mut self, applied: u64, ready: &mut Vec<(u64, QueryRequest<D>, QueryTx<R>)>) {
        let mut i = 0;
        while i < self.len() {
            if self[i].0 <= applied {
                ready.push(self.remove(i));
            } else {
                i += 1;
            }
        }
    }
}
