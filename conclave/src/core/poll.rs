//! The pre-vote straw poll run by followers before starting a real election.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::core::FollowerState;
use crate::core::RaftCore;
use crate::core::State;
use crate::error::RaftResult;
use crate::quorum;
use crate::quorum::Quorum;
use crate::raft::PollRequest;
use crate::raft::PollResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D>> RaftCore<D, R, N, S> {
    /// An RPC invoked by a follower whose election timer fired, probing whether a real election
    /// could succeed.
    ///
    /// The poll is answered with the same freshness rule a real vote would apply, but grants
    /// nothing: term, vote, and election timers are all left untouched. A node which would
    /// refuse the vote answers `accepted: false`, and a majority of refusals keeps the poller
    /// from inflating its term.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_poll_request(&mut self, msg: PollRequest) -> RaftResult<PollResponse> {
        if msg.term < self.current_term {
            return Ok(PollResponse {
                term: self.current_term,
                accepted: false,
            });
        }

        let candidate_is_fresh = msg.last_log_term > self.last_log_id.term
            || (msg.last_log_term == self.last_log_id.term && msg.last_log_index >= self.last_log_id.index);

        Ok(PollResponse {
            term: self.current_term,
            accepted: candidate_is_fresh,
        })
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D>> FollowerState<'a, D, R, N, S> {
    /// The election timer fired: begin a pre-vote round instead of an immediate election.
    ///
    /// The previous round, if any, is abandoned: its quorum latch and response channel are
    /// replaced, so stragglers from the old round tally into nothing.
    #[tracing::instrument(level = "trace", skip(self), fields(id=self.core.id))]
    pub(super) async fn start_pre_vote(&mut self) {
        // Rearm the election timer for the next round up front.
        self.core.update_next_election_timeout(false);

        let mut all_voters = self.core.membership.voters();
        if let Some(voters) = self.core.membership.voters_after_consensus() {
            all_voters.extend(voters);
        }
        if !all_voters.contains(&self.core.id) {
            tracing::debug!("election timeout fired on a non-voter, ignoring");
            return;
        }

        // A lone voter needs no one's permission.
        let peers: Vec<_> = all_voters.iter().cloned().filter(|id| id != &self.core.id).collect();
        if peers.is_empty() {
            tracing::debug!("single voter cluster, proceeding directly to candidate state");
            self.core.set_target_state(State::Candidate);
            return;
        }
        let quorum_size = quorum::majority_of(all_voters.len());

        tracing::debug!(term=self.core.current_term, "election timeout fired, polling peers before election");

        let outcome = Arc::new(Mutex::new(None));
        let outcome_cb = outcome.clone();
        // The latch counts this node's implicit acceptance of itself.
        let mut latch = Quorum::new(quorum_size, all_voters.len(), move |res| {
            *outcome_cb.lock().unwrap() = Some(res);
        });
        latch.succeed();
        self.poll_outcome = outcome;
        self.poll_quorum = Some(latch);

        let (tx, rx) = mpsc::channel(peers.len());
        for member in peers {
            let rpc = PollRequest::new(
                self.core.current_term,
                self.core.id,
                self.core.last_log_id.index,
                self.core.last_log_id.term,
            );
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.send_poll(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => tracing::warn!({error=%err, peer=member}, "error while polling peer"),
                    }
                }
                .instrument(tracing::debug_span!("polling peer", target = member)),
            );
        }
        self.pending_polls = Some(rx);
    }

    /// Tally one poll response into the quorum latch and act on its resolution.
    #[tracing::instrument(level = "trace", skip(self, res, target))]
    pub(super) async fn handle_poll_response(&mut self, res: PollResponse, target: NodeId) -> RaftResult<()> {
        let latch = match &mut self.poll_quorum {
            Some(latch) => latch,
            None => return Ok(()),
        };

        // A response showing a newer term means a leader or election we haven't heard from yet
        // is live; adopt the term and stand down from this round entirely.
        if res.term > self.core.current_term {
            tracing::debug!({peer=target, term=res.term}, "poll response carries newer term, abandoning pre-vote");
            self.abandon_pre_vote();
            self.core.update_current_term(res.term, None);
            self.core.save_hard_state().await?;
            return Ok(());
        }

        if res.accepted {
            latch.succeed();
        } else {
            latch.fail();
        }

        let resolution = *self.poll_outcome.lock().unwrap();
        match resolution {
            Some(true) => {
                tracing::debug!("pre-vote accepted by majority, starting election");
                self.abandon_pre_vote();
                self.core.set_target_state(State::Candidate);
            }
            Some(false) => {
                // The cluster would refuse us; stay follower on the current term and let the
                // already rearmed election timer schedule any future attempt.
                tracing::debug!("pre-vote refused by majority, remaining follower without term change");
                self.abandon_pre_vote();
            }
            None => {}
        }
        Ok(())
    }

    /// Drop all state of the in-flight pre-vote round.
    fn abandon_pre_vote(&mut self) {
        self.pending_polls = None;
        self.poll_quorum = None;
        self.poll_outcome = Arc::new(Mutex::new(None));
    }
}
