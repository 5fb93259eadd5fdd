use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D>> RaftCore<D, R, N, S> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    #[tracing::instrument(level = "trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        // If candidate's current term is less than this nodes current term, reject.
        if msg.term < self.current_term {
            tracing::debug!({candidate=msg.candidate_id, self.current_term, rpc_term=msg.term}, "VoteRequest term is less than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Per §5.1, if a server observes a higher term it updates its own and reverts to follower.
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.update_next_election_timeout(false);
            self.save_hard_state().await?;
            if self.target_state.is_leader() || self.target_state.is_candidate() {
                self.set_target_state(State::Follower);
            }
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.report_metrics(Update::Ignore);
        }

        // Per §5.4.1, a voter rejects a candidate whose log is less fresh than its own: the
        // candidate's last log term must be greater, or equal with at least as high an index.
        let candidate_is_fresh = msg.last_log_term > self.last_log_id.term
            || (msg.last_log_term == self.last_log_id.term && msg.last_log_index >= self.last_log_id.index);
        if !candidate_is_fresh {
            tracing::debug!(
                { candidate = msg.candidate_id },
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Votes are issued on a first-come-first-served basis, at most one per term.
        match &self.voted_for {
            // This node has already voted for the candidate.
            Some(candidate_id) if candidate_id == &msg.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            }),
            // This node has already voted for a different candidate.
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            // This node has not yet voted for the current term, so vote for the candidate.
            None => {
                self.voted_for = Some(msg.candidate_id);
                self.save_hard_state().await?;
                self.update_next_election_timeout(false);
                tracing::debug!({candidate=msg.candidate_id, term=msg.term}, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D>> CandidateState<'a, D, R, N, S> {
    /// Spawn parallel vote requests to all Active voters of the cluster.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let mut all_voters = self.core.membership.voters();
        if let Some(voters) = self.core.membership.voters_after_consensus() {
            all_voters.extend(voters);
        }
        let (tx, rx) = mpsc::channel(all_voters.len().max(1));
        for member in all_voters.into_iter().filter(|member| member != &self.core.id) {
            let rpc = VoteRequest::new(
                self.core.current_term,
                self.core.id,
                self.core.last_log_id.index,
                self.core.last_log_id.term,
            );
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.send_vote(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => tracing::error!({error=%err, peer=member}, "error while requesting vote from peer"),
                    }
                }
                .instrument(tracing::debug_span!("requesting vote from peer", target = member)),
            );
        }
        rx
    }

    /// Handle response from a vote request sent to a peer.
    #[tracing::instrument(level = "trace", skip(self, res, target))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        // If peer's term is greater than current term, revert to follower state.
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            self.core.report_metrics(Update::Ignore);
            tracing::debug!("reverting to follower state due to greater term observed in VoteResponse");
            return Ok(());
        }

        // If peer granted vote, then update campaign state.
        if res.vote_granted {
            // Handle vote responses from the C0 config group.
            if self.core.membership.voters().contains(&target) {
                self.votes_granted_old += 1;
            }
            // Handle vote responses from members of C1 config group.
            if self
                .core
                .membership
                .voters_after_consensus()
                .map(|voters| voters.contains(&target))
                .unwrap_or(false)
            {
                self.votes_granted_new += 1;
            }
            // If we've received enough votes from both config groups, then transition to leader state.
            if self.votes_granted_old >= self.votes_needed_old && self.votes_granted_new >= self.votes_needed_new {
                tracing::debug!("transitioning to leader state as minimum number of votes have been received");
                self.core.set_target_state(State::Leader);
                return Ok(());
            }
        }

        // Otherwise, we just return and let the candidate loop wait for more votes to come in.
        Ok(())
    }
}
