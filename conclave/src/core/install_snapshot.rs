//! Receiving a snapshot streamed from the leader (§7).

use std::io::SeekFrom;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;

use crate::core::RaftCore;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftError;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D>> RaftCore<D, R, N, S> {
    /// Accept one segment of a snapshot stream from the leader.
    ///
    /// Segments of one snapshot arrive in order and are identified by snapshot id + byte
    /// offset. A segment for a different id at offset 0 opens a brand new stream (the leader
    /// has cut a newer snapshot and abandoned the old transfer); a different id at any other
    /// offset is an ordering violation and is refused.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        rpc: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        // A stale leader gets our term back and nothing else.
        if rpc.term < self.current_term {
            return Ok(self.snapshot_response());
        }

        self.acknowledge_snapshot_leader(&rpc).await?;

        match self.snapshot_state.take() {
            // The segment continues the stream we are already writing.
            Some(SnapshotState::Streaming { id, offset, snapshot }) if id == rpc.meta.snapshot_id => {
                self.receive_segment(rpc, offset, snapshot).await
            }
            // A different snapshot id mid-stream is only legal as a restart from offset 0.
            Some(SnapshotState::Streaming { id, offset, .. }) if rpc.offset != 0 => Err(RaftError::SnapshotMismatch {
                expect: (id, offset).into(),
                got: (rpc.meta.snapshot_id.clone(), rpc.offset).into(),
            }),
            other => {
                // Anything else means a new stream starts here. A compaction of our own in
                // flight loses to the leader's transfer.
                if let Some(SnapshotState::Snapshotting { handle, .. }) = other {
                    handle.abort();
                }
                self.start_receiving(rpc).await
            }
        }
    }

    /// Term, leader, role, and election-timer bookkeeping for an accepted snapshot RPC.
    async fn acknowledge_snapshot_leader(&mut self, rpc: &InstallSnapshotRequest) -> RaftResult<()> {
        self.update_next_election_timeout(true);

        let mut changed = false;
        if rpc.term != self.current_term {
            self.update_current_term(rpc.term, None);
            self.save_hard_state().await?;
            changed = true;
        }
        if self.current_leader != Some(rpc.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(rpc.leader_id));
            changed = true;
        }
        // A campaigning or leading node that is being sent a snapshot has been superseded.
        if !self.target_state.is_follower() && !self.target_state.is_passive() && !self.target_state.is_reserve() {
            self.set_target_state(State::Follower);
        }
        if changed {
            self.report_metrics(Update::Ignore);
        }
        Ok(())
    }

    fn snapshot_response(&self) -> InstallSnapshotResponse {
        InstallSnapshotResponse {
            term: self.current_term,
        }
    }

    /// Open a fresh receive stream with this segment as its first bytes.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    async fn start_receiving(&mut self, rpc: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let id = rpc.meta.snapshot_id.clone();

        // A stream must open at byte 0; a mid-stream segment with no stream to join is refused.
        if rpc.offset > 0 {
            return Err(RaftError::SnapshotMismatch {
                expect: (id.clone(), 0).into(),
                got: (id, rpc.offset).into(),
            });
        }

        let mut receiver = self
            .storage
            .begin_receiving_snapshot()
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        receiver.as_mut().write_all(&rpc.data).await?;

        // A snapshot small enough to fit one segment completes on the spot.
        if rpc.done {
            self.seal_snapshot(rpc, receiver).await?;
            return Ok(self.snapshot_response());
        }

        self.snapshot_state = Some(SnapshotState::Streaming {
            id,
            offset: rpc.data.len() as u64,
            snapshot: receiver,
        });
        Ok(self.snapshot_response())
    }

    /// Append one more segment to the open stream.
    #[tracing::instrument(level = "debug", skip(self, rpc, receiver), fields(rpc=%rpc.summary()))]
    async fn receive_segment(
        &mut self,
        rpc: InstallSnapshotRequest,
        mut written: u64,
        mut receiver: Box<S::SnapshotData>,
    ) -> RaftResult<InstallSnapshotResponse> {
        let stream_id = rpc.meta.snapshot_id.clone();

        let io = async {
            // A retransmitted or skipped segment names its own offset; position the writer
            // there before appending.
            if rpc.offset != written {
                receiver.as_mut().seek(SeekFrom::Start(rpc.offset)).await?;
                written = rpc.offset;
            }
            receiver.as_mut().write_all(&rpc.data).await?;
            written += rpc.data.len() as u64;
            Ok::<(), tokio::io::Error>(())
        }
        .await;

        // On a write failure the stream state is put back as-is, so the leader's retry of this
        // segment can resume the transfer.
        if let Err(err) = io {
            self.snapshot_state = Some(SnapshotState::Streaming {
                id: stream_id,
                offset: written,
                snapshot: receiver,
            });
            return Err(err.into());
        }

        if rpc.done {
            self.seal_snapshot(rpc, receiver).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming {
                id: stream_id,
                offset: written,
                snapshot: receiver,
            });
        }
        Ok(self.snapshot_response())
    }

    /// The stream is complete: persist it as the current snapshot and swap it into effect.
    ///
    /// Failures past this point leave log and state machine inconsistent with each other, so
    /// they all route through the fatal-storage path and stop the node.
    #[tracing::instrument(level = "debug", skip(self, rpc, receiver), fields(rpc=%rpc.summary()))]
    async fn seal_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest,
        mut receiver: Box<S::SnapshotData>,
    ) -> RaftResult<()> {
        receiver.as_mut().shutdown().await.map_err(|err| self.map_fatal_storage_error(err.into()))?;
        self.storage
            .finalize_snapshot_installation(&rpc.meta, receiver)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        // Hand the sealed image to the executor, which replaces its session table and user
        // state machine wholesale. Reading it back through storage keeps the executor's view
        // identical to what a restart would reconstruct.
        if let Some(mut sealed) =
            self.storage.get_current_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?
        {
            let mut image = Vec::new();
            sealed.snapshot.as_mut().read_to_end(&mut image).await?;
            self.executor.restore(&image).await.map_err(|err| self.map_fatal_storage_error(err))?;
        }

        // The snapshot carries the freshest committed membership; adopt it along with the new
        // log position.
        let membership = self.storage.get_membership_config().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.update_membership(membership)?;
        self.last_log_id = rpc.meta.last_log_id;
        self.last_applied = rpc.meta.last_log_id;
        self.snapshot_last_log_id = rpc.meta.last_log_id;
        self.report_metrics(Update::Ignore);
        Ok(())
    }
}
