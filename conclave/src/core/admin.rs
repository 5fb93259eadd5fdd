use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::core::client::ClientRequestEntry;
use crate::core::ConsensusState;
use crate::core::JoiningReplicationState;
use crate::core::LeaderState;
use crate::core::RaftCore;
use crate::core::ReserveState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::error::RaftResult;
use crate::raft::ConfigureRequest;
use crate::raft::ConfigureResponse;
use crate::raft::EntryConfigChange;
use crate::raft::EntryPayload;
use crate::raft::Member;
use crate::raft::MemberKind;
use crate::raft::MembershipConfig;
use crate::raft::ResponseTx;
use crate::replication::RaftEvent;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftError;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D>> ReserveState<'a, D, R, N, S> {
    /// Handle the admin `initialize` command.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_init_with_config(
        &mut self,
        mut members: BTreeMap<NodeId, Member>,
    ) -> Result<(), InitializeError> {
        if self.core.last_log_id.index != 0 || self.core.current_term != 0 {
            tracing::error!({self.core.last_log_id.index, self.core.current_term}, "rejecting initialize request as last_log_index or current_term is not 0");
            return Err(InitializeError::NotAllowed);
        }

        // Ensure given config contains this node's ID as a voter as well.
        if !members.contains_key(&self.core.id) {
            let address = self.core.membership.address_of(&self.core.id).unwrap_or_default();
            members.insert(self.core.id, Member::new(self.core.id, address, MemberKind::Active));
        }

        // Build a new membership config from given init data & assign it as the new cluster
        // membership config in memory only.
        self.core.membership = MembershipConfig {
            members,
            members_after_consensus: None,
        };

        // Become a candidate and start campaigning for leadership. If this node is the only
        // Active voter in the cluster, then become leader without holding an election. If voter
        // len == 1, we know it is our ID due to the above code where we ensure our own ID is
        // present as a voter.
        if self.core.membership.voters().len() == 1 {
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.set_target_state(State::Leader);
            self.core.save_hard_state().await?;
        } else if self.core.membership.is_voter(&self.core.id) {
            self.core.set_target_state(State::Candidate);
        } else {
            // This node is configured as Passive or Reserve; take the matching role and wait to
            // hear from whichever voter wins the election.
            let next = self.core.state_for_own_membership();
            self.core.set_target_state(next);
        }

        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to push a committed membership config to a member which does
    /// not receive the live log.
    #[tracing::instrument(level = "debug", skip(self, req))]
    pub(super) async fn handle_configure_request(&mut self, req: ConfigureRequest) -> RaftResult<ConfigureResponse> {
        if req.term < self.current_term {
            return Ok(ConfigureResponse {
                term: self.current_term,
            });
        }

        self.update_next_election_timeout(true);
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
        }
        if self.current_leader.as_ref() != Some(&req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
        }

        self.update_membership(req.membership.clone())?;
        self.report_metrics(crate::Update::Ignore);
        Ok(ConfigureResponse {
            term: self.current_term,
        })
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D>> LeaderState<'a, D, R, N, S> {
    /// Add a new member to the cluster, bringing it up-to-speed, and then responding
    /// on the given channel.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) fn add_member(&mut self, member: Member, tx: ResponseTx) {
        // Ensure the node doesn't already exist in the current config, in the set of new nodes
        // already being synced, or in the nodes being removed.
        if self.core.membership.contains(&member.id) || self.joining.contains_key(&member.id) {
            tracing::debug!("target node is already a cluster member or is being synced");
            let _ = tx.send(Err(ChangeConfigError::Noop.into()));
            return;
        }

        // A member which will not receive the live log needs no synchronization; it will be
        // configured or snapshotted when it enters a config.
        if !member.replicates() {
            let _ = tx.send(Ok(self.core.last_log_id.index));
            return;
        }

        // Spawn a replication stream for the new member. Track state as a joining node so that
        // it can be updated to be added to the cluster config once it has been brought up-to-date.
        let state = self.spawn_replication_stream(member.id);
        self.joining.insert(member.id, JoiningReplicationState {
            state,
            is_ready_to_join: false,
            tx: Some(tx),
        });
    }

    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn change_membership(&mut self, members: BTreeMap<NodeId, Member>, tx: ResponseTx) {
        // Ensure cluster will have at least one voter.
        if members.values().filter(|m| m.kind == MemberKind::Active).count() == 0 {
            let _ = tx.send(Err(ChangeConfigError::InoperableConfig.into()));
            return;
        }

        // Only allow config updates when currently in a uniform consensus state.
        match &self.consensus_state {
            ConsensusState::Uniform => (),
            ConsensusState::Syncing { .. } | ConsensusState::Joint { .. } => {
                let _ = tx.send(Err(ChangeConfigError::ConfigChangeInProgress.into()));
                return;
            }
        }

        // Check the proposed config for any new replicating nodes. If ALL new nodes already have
        // replication streams AND are ready to join, then we can immediately proceed with
        // entering joint consensus. Else, new nodes need to first be brought up-to-speed.
        //
        // Here, all we do is check to see which nodes still need to be synced, which determines
        // if we can proceed.
        let mut awaiting = HashSet::new();
        for new_member in members.values().filter(|m| m.replicates()) {
            if self.core.membership.contains(&new_member.id) || new_member.id == self.core.id {
                continue;
            }
            match self.joining.get(&new_member.id) {
                // Node is ready to join.
                Some(node) if node.is_ready_to_join => continue,
                // Node has repl stream, but is not yet ready to join.
                Some(_) => (),
                // Node does not yet have a repl stream, spawn one.
                None => {
                    let state = self.spawn_replication_stream(new_member.id);
                    self.joining.insert(new_member.id, JoiningReplicationState {
                        state,
                        is_ready_to_join: false,
                        tx: None,
                    });
                }
            }
            awaiting.insert(new_member.id);
        }
        // If there are new nodes which need to sync, then we need to wait until they are synced.
        // Once they've finished, this routine will be called again to progress further.
        if !awaiting.is_empty() {
            self.consensus_state = ConsensusState::Syncing { awaiting, members, tx };
            return;
        }

        // Enter into joint consensus if we are not awaiting any new nodes.
        if !members.get(&self.core.id).map(|m| m.kind == MemberKind::Active).unwrap_or(false) {
            self.is_stepping_down = true;
        }
        self.consensus_state = ConsensusState::Joint { is_committed: false };
        self.core.membership.members_after_consensus = Some(members.clone());

        // Create final_config first, as the joint config may be committed at once if the cluster
        // has only 1 voter, which changes core.membership.
        let final_config = MembershipConfig {
            members,
            members_after_consensus: None,
        };

        let joint_config = self.core.membership.clone();

        let res = self.append_membership_log(joint_config, None).await;
        if let Err(e) = res {
            tracing::error!("append joint log error: {:?}", e);
        }

        let res = self.append_membership_log(final_config, Some(tx)).await;
        if let Err(e) = res {
            tracing::error!("append final log error: {:?}", e);
        }
    }

    #[tracing::instrument(level = "trace", skip(self, resp_tx), fields(id=self.core.id))]
    pub async fn append_membership_log(
        &mut self,
        mem: MembershipConfig,
        resp_tx: Option<ResponseTx>,
    ) -> Result<(), RaftError> {
        let payload = EntryPayload::<D>::ConfigChange(EntryConfigChange { membership: mem });
        let res = self.append_payload_to_log(payload).await;
        let entry = match res {
            Ok(entry) => entry,
            Err(err) => {
                let err_str = err.to_string();
                if let Some(tx) = resp_tx {
                    let send_res = tx.send(Err(err.into()));
                    if let Err(e) = send_res {
                        tracing::error!("send response res error: {:?}", e);
                    }
                }
                return Err(RaftError::RaftStorage(anyhow::anyhow!(err_str)));
            }
        };

        let cr_entry = ClientRequestEntry::from_entry(entry, resp_tx);
        self.replicate_client_request(cr_entry).await;

        Ok(())
    }

    /// Handle the commitment of a joint consensus cluster configuration.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn handle_joint_consensus_committed(&mut self) {
        if let ConsensusState::Joint { is_committed, .. } = &mut self.consensus_state {
            *is_committed = true; // Mark as committed.
        }
        // Only proceed to finalize this joint consensus if there are no remaining nodes being synced.
        if self.consensus_state.is_joint_consensus_safe_to_finalize() {
            self.update_replication_state();
            self.finalize_joint_consensus();
        }
    }

    /// Ensure every member which now receives the live log has a replication stream.
    ///
    /// When the joint membership is committed (not the uniform membership), newly added
    /// replicating members turn from joining nodes into full members, so their replication
    /// state moves from `joining` to `nodes`. A member promoted from Reserve never had a
    /// stream; one is spawned for it here.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn update_replication_state(&mut self) {
        tracing::debug!("update_replication_state");

        let targets = self
            .core
            .membership
            .replication_targets()
            .into_iter()
            .filter(|elem| elem != &self.core.id)
            .collect::<Vec<_>>();

        for target in targets {
            if self.nodes.contains_key(&target) {
                continue;
            }
            match self.joining.remove(&target) {
                Some(joining) => {
                    self.nodes.insert(target, joining.state);
                }
                None => {
                    let state = self.spawn_replication_stream(target);
                    self.nodes.insert(target, state);
                }
            }
        }
    }

    /// Finalize the committed joint consensus.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn finalize_joint_consensus(&mut self) {
        // Only proceed if it is safe to do so.
        if !self.consensus_state.is_joint_consensus_safe_to_finalize() {
            tracing::error!("attempted to finalize joint consensus when it was not safe to do so");
            return;
        }

        // Cut the cluster config over to the new membership config.
        if let Some(new_members) = self.core.membership.members_after_consensus.take() {
            self.core.membership.members = new_members;
        }
        self.consensus_state = ConsensusState::Uniform;

        // NOTE WELL: this implementation uses replication streams (src/replication/**) to
        // replicate entries. Nodes which do not exist in the new config will still have an
        // active replication stream until the current leader determines that they have
        // replicated the config entry which removes them from the cluster. At that point in
        // time, the node will revert to a non-replicating state.
        //
        // HOWEVER, if an election takes place, the new leader will not have the old nodes in its
        // config and the old nodes may not revert using the above mechanism. That is fine. The
        // Raft spec accounts for this using the 3rd safety measure of cluster configuration
        // changes described at the very end of §6. This measure is already implemented and in
        // place.
    }

    /// Handle the commitment of a uniform consensus cluster configuration.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn handle_uniform_consensus_committed(&mut self, index: u64) {
        // Step down if needed.
        if self.is_stepping_down {
            tracing::debug!("raft node is stepping down");
            self.core.set_target_state(State::Reserve);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            return;
        }

        // Remove any replication streams which have replicated this config & which are no longer
        // cluster members receiving the live log. All other replication streams which are no
        // longer replication targets, but which have not yet replicated this config, will be
        // marked for removal.
        let targets = self.core.membership.replication_targets();
        let nodes_to_remove: Vec<_> = self
            .nodes
            .iter_mut()
            .filter(|(id, _)| !targets.contains(id))
            .filter_map(|(idx, replstate)| {
                if replstate.matched.index >= index {
                    Some(*idx)
                } else {
                    replstate.remove_after_commit = Some(index);
                    None
                }
            })
            .collect();

        let follower_ids: Vec<u64> = self.nodes.keys().cloned().collect();
        let joining_ids: Vec<u64> = self.joining.keys().cloned().collect();
        tracing::debug!("nodes: {:?}", follower_ids);
        tracing::debug!("joining: {:?}", joining_ids);
        tracing::debug!("membership: {:?}", self.core.membership);
        tracing::debug!("nodes_to_remove: {:?}", nodes_to_remove);

        for target in nodes_to_remove {
            tracing::debug!(target, "removing target node from replication pool");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));

                // remove metrics entry
                self.leader_metrics.replication.remove(&target);
            }
        }

        // Reserve members never see this config entry; hand it to them directly.
        self.push_configuration(index);
        self.leader_report_metrics();
    }

    /// Push the committed membership config to all Reserve members via Configure RPCs.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn push_configuration(&self, index: u64) {
        for target in self.core.membership.reserve_targets() {
            if target == self.core.id {
                continue;
            }
            let rpc = ConfigureRequest {
                term: self.core.current_term,
                leader_id: self.core.id,
                index,
                membership: self.core.membership.clone(),
            };
            let network = self.core.network.clone();
            tokio::spawn(async move {
                if let Err(err) = network.send_configure(target, rpc).await {
                    tracing::warn!({error=%err, target}, "error pushing configuration to reserve member");
                }
            });
        }
    }
}
