//! Per-peer log replication.
//!
//! The leader runs one replication task per target. A task owns the cursor state for its peer
//! (`next_index`, `matched`), ships AppendEntries frames strictly one at a time, and reports
//! progress back to the leader loop as [`ReplicaEvent`]s. Frames are never pipelined: a frame
//! stays owned by the task until the peer acknowledges it, which is also what makes
//! retransmission after a transport failure trivial.
//!
//! A task moves between three working modes. `LineRate` feeds the peer straight from the
//! leader's append stream. `CatchUp` reads committed history out of storage for a peer whose
//! cursor has fallen behind the live stream. `Snapshot` streams the current snapshot when the
//! prefix the peer needs has already been compacted away.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeek;
use tokio::io::AsyncSeekExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;
use tracing::Span;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::InstallSnapshotRequest;
use crate::storage::Snapshot;
use crate::AppData;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// Replication progress for one target, as shown in the leader's metrics.
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub matched: LogId,
}

/// The leader's handle to one spawned replication task.
pub(crate) struct ReplicationStream<D: AppData> {
    /// The channel over which the leader feeds the task entries and cursor updates.
    pub repl_tx: mpsc::UnboundedSender<(RaftEvent<D>, Span)>,
}

impl<D: AppData> ReplicationStream<D> {
    /// Spawn a replication task for the given target and return its handle.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<N: RaftNetwork<D>, S: RaftStorage<D>>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        global_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        replication_tx: mpsc::UnboundedSender<(ReplicaEvent<S::SnapshotData>, Span)>,
    ) -> Self {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let core = ReplicationCore {
            id,
            target,
            term,
            network,
            storage,
            frame_capacity: config.max_payload_entries as usize,
            rpc_timeout: Duration::from_millis(config.heartbeat_interval),
            snapshot_rpc_timeout: Duration::from_millis(config.install_snapshot_timeout),
            heartbeat: interval(Duration::from_millis(config.heartbeat_interval)),
            config,
            mode: Mode::CatchUp,
            leader_last_index: last_log.index,
            commit_index,
            global_index,
            next_index: last_log.index + 1,
            matched: last_log,
            queue: VecDeque::new(),
            frame: Vec::new(),
            events: replication_tx,
            commands: repl_rx,
        };
        tokio::spawn(core.main().instrument(tracing::debug_span!("spawn")));
        ReplicationStream { repl_tx }
    }
}

/// The working mode of a replication task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Shipping entries as the leader appends them.
    LineRate,
    /// Reading committed history from storage to close a cursor gap.
    CatchUp,
    /// Streaming the current snapshot because the needed prefix is compacted.
    Snapshot,
    /// The task is done; the leader tore it down or lost its term.
    Closed,
}

/// One replication task.
struct ReplicationCore<D: AppData, N: RaftNetwork<D>, S: RaftStorage<D>> {
    /// The leader's own id.
    id: NodeId,
    /// The peer this task replicates to.
    target: NodeId,
    /// The term this task was spawned under; a task never outlives its term.
    term: u64,

    network: Arc<N>,
    storage: Arc<S>,
    config: Arc<Config>,

    /// Upper bound on entries per AppendEntries frame.
    frame_capacity: usize,
    /// How long to wait on one AppendEntries round trip.
    rpc_timeout: Duration,
    /// How long to wait on one snapshot segment round trip.
    snapshot_rpc_timeout: Duration,
    /// Paces heartbeats while there is nothing to ship.
    heartbeat: Interval,

    mode: Mode,

    /// The index of the newest entry appended on the leader.
    leader_last_index: u64,
    /// The leader's commit index, forwarded to the peer on every frame.
    commit_index: u64,
    /// The cluster-wide replication floor, forwarded to the peer on every frame.
    global_index: u64,

    /// The index of the next entry owed to the peer.
    next_index: u64,
    /// The newest log id the peer has confirmed. Doubles as `prev_log_id` on outgoing frames.
    matched: LogId,

    /// Entries received from the leader's append stream, awaiting a slot in a frame.
    ///
    /// Only filled at line rate; a catching-up task rereads history from storage instead, and
    /// drops this queue so it cannot go stale.
    queue: VecDeque<Arc<Entry<D>>>,
    /// The frame currently owed to the peer.
    ///
    /// Entries stay here until the peer acknowledges receipt, so a timed-out frame is simply
    /// sent again as-is.
    frame: Vec<Entry<D>>,

    /// Progress and trouble reports to the leader loop.
    events: mpsc::UnboundedSender<(ReplicaEvent<S::SnapshotData>, Span)>,
    /// Entries and cursor updates from the leader loop.
    commands: mpsc::UnboundedReceiver<(RaftEvent<D>, Span)>,
}

impl<D: AppData, N: RaftNetwork<D>, S: RaftStorage<D>> ReplicationCore<D, N, S> {
    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target, cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        // Lead with a bare heartbeat so the peer learns about this term at once.
        self.send_frame().await;

        loop {
            match self.mode {
                Mode::LineRate => self.line_rate_loop().await,
                Mode::CatchUp => self.catch_up_loop().await,
                Mode::Snapshot => self.snapshot_loop().await,
                Mode::Closed => return,
            }
        }
    }

    /// Report an event to the leader loop.
    fn report(&self, event: ReplicaEvent<S::SnapshotData>) {
        let _ = self.events.send((event, tracing::debug_span!("CH")));
    }

    /// Tell the leader whether this peer is keeping up with the live stream.
    fn report_rate(&self, is_line_rate: bool) {
        self.report(ReplicaEvent::RateUpdate {
            target: self.target,
            is_line_rate,
        });
    }

    fn report_matched(&self) {
        self.report(ReplicaEvent::UpdateMatchIndex {
            target: self.target,
            matched: self.matched,
        });
    }

    /// Move queued entries into the outgoing frame, up to the frame capacity.
    fn fill_frame_from_queue(&mut self) {
        if !self.frame.is_empty() {
            return;
        }
        while self.frame.len() < self.frame_capacity {
            match self.queue.pop_front() {
                Some(entry) => self.frame.push(entry.as_ref().clone()),
                None => break,
            }
        }
    }

    /// Ship the current frame (or a bare heartbeat) and digest the peer's answer.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_frame(&mut self) {
        self.fill_frame_from_queue();

        let rpc = AppendEntriesRequest {
            leader_id: self.id,
            term: self.term,
            prev_log_id: self.matched,
            leader_commit: self.commit_index,
            global_index: self.global_index,
            entries: self.frame.clone(),
        };

        let response = match timeout(self.rpc_timeout, self.network.send_append_entries(self.target, rpc)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                // The frame stays owned; the next attempt retransmits it unchanged.
                tracing::warn!(error=%err, "append frame to peer failed in transit");
                return;
            }
            Err(err) => {
                tracing::warn!(error=%err, "append frame to peer timed out");
                return;
            }
        };

        // The peer received the frame, whatever it thought of it; never send these bytes again.
        let shipped_through = self.frame.last().map(|entry| entry.log_id);
        self.frame.clear();

        if response.success {
            self.handle_ack(shipped_through);
            return;
        }
        self.handle_reject(response).await;
    }

    /// The peer accepted the frame.
    fn handle_ack(&mut self, shipped_through: Option<LogId>) {
        let log_id = match shipped_through {
            Some(log_id) => log_id,
            None => {
                // An empty heartbeat moved no cursors, but it proves the peer is alive; the
                // leader's heartbeat-quorum tracking feeds on these.
                self.report_matched();
                return;
            }
        };

        self.matched = log_id;
        self.next_index = log_id.index + 1;
        self.report_matched();

        // A peer that acknowledges frames but keeps losing ground against the append stream
        // cannot be fed from the in-memory queue forever; fall back to reading history.
        let adrift = self
            .leader_last_index
            .checked_sub(self.matched.index)
            .map(|gap| gap > self.config.replication_lag_threshold)
            .unwrap_or(false);
        if adrift {
            self.mode = Mode::CatchUp;
        }
    }

    /// The peer refused the frame: either our term is stale, or its log disagrees at
    /// `prev_log_id` and the peer pointed us at its best agreement candidate.
    async fn handle_reject(&mut self, response: AppendEntriesResponse) {
        if response.term > self.term {
            tracing::debug!(peer_term = response.term, "peer is in a newer term, closing stream");
            self.report(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: response.term,
            });
            self.mode = Mode::Closed;
            return;
        }

        let conflict = match response.conflict_opt {
            Some(conflict) => conflict.log_id,
            None => return,
        };

        // A hint beyond our own log is nonsense; ignore it rather than chase it.
        if conflict.index > self.leader_last_index {
            return;
        }

        self.next_index = conflict.index + 1;
        self.matched = conflict;

        // Index 0 is the empty-log sentinel; there is no entry to cross-check, so just restart
        // replication from the very beginning.
        if conflict.index == 0 {
            self.mode = Mode::CatchUp;
            self.report_matched();
            return;
        }

        // Adopt the term of our own entry at the hinted index, so the next `prev_log_id` is a
        // position both logs can actually agree on. A missing entry means that prefix has been
        // compacted out from under us, and only a snapshot can help the peer.
        match self.storage.try_get_log_entry(conflict.index).await {
            Ok(Some(entry)) => {
                self.matched.term = entry.log_id.term;
                self.report_matched();
            }
            Ok(None) => {
                self.mode = Mode::Snapshot;
                self.report_matched();
                return;
            }
            Err(err) => {
                tracing::error!(error=?err, "error reading log while resolving a conflict hint");
                self.report(ReplicaEvent::Shutdown);
                self.mode = Mode::Closed;
                return;
            }
        }

        // Decide between replaying history and shipping a snapshot based on how far back the
        // agreed position sits.
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        if self.leader_last_index - conflict.index >= *threshold {
            self.mode = Mode::Snapshot;
        } else {
            self.mode = Mode::CatchUp;
        }
    }

    /// Whether the peer's confirmed position is so far behind commit that replaying the log is
    /// no longer worth it.
    fn needs_snapshot(&self) -> bool {
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        self.commit_index
            .checked_sub(self.matched.index)
            .map(|gap| gap >= *threshold)
            .unwrap_or(false)
    }

    /// Absorb commands from the leader loop, bounded so a hot stream cannot starve the task.
    fn drain_commands(&mut self, first: RaftEvent<D>, span: Span) {
        let mut pending = Some((first, span));
        for _ in 0..=self.frame_capacity {
            let (event, span) = match pending.take() {
                Some(next) => next,
                None => return,
            };
            let _entered = span.enter();

            match event {
                RaftEvent::Replicate {
                    entry,
                    commit_index,
                    global_index,
                } => {
                    self.commit_index = commit_index;
                    self.global_index = global_index;
                    self.leader_last_index = entry.log_id.index;
                    // Off line rate the entry will be reread from storage when its turn comes,
                    // so buffering it here would only go stale.
                    if self.mode == Mode::LineRate {
                        self.queue.push_back(entry);
                    }
                }
                RaftEvent::UpdateCommitIndex {
                    commit_index,
                    global_index,
                } => {
                    self.commit_index = commit_index;
                    self.global_index = global_index;
                }
                RaftEvent::Terminate => {
                    self.mode = Mode::Closed;
                    return;
                }
            }

            if let Some(next) = self.commands.recv().now_or_never() {
                pending = next;
            }
        }
    }

    /// Absorb any commands already sitting in the channel, without waiting for more.
    fn drain_pending_commands(&mut self) {
        if let Some(Some((event, span))) = self.commands.recv().now_or_never() {
            self.drain_commands(event, span);
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Line rate /////////////////////////////////////////////////////////////

    #[tracing::instrument(level = "trace", skip(self), fields(mode = "line-rate"))]
    async fn line_rate_loop(&mut self) {
        self.report_rate(true);
        loop {
            if self.mode != Mode::LineRate {
                return;
            }

            // The frame/queue only ever hold entries the leader pushed while we were at line
            // rate. After a mode round trip the head of that data may sit beyond `next_index`;
            // the hole must be patched from storage or the peer would reject the frame.
            let head = self
                .frame
                .first()
                .map(|entry| entry.log_id.index)
                .or_else(|| self.queue.front().map(|entry| entry.log_id.index))
                .unwrap_or(self.leader_last_index + 1);
            if self.next_index != head {
                self.backfill_frame(self.next_index, head).await;
                if self.mode != Mode::LineRate {
                    return;
                }
                self.send_frame().await;
                continue;
            }

            let span = tracing::debug_span!("CHrx:line-rate");
            let _entered = span.enter();

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_frame().await,
                command = self.commands.recv() => {
                    match command {
                        Some((event, span)) => {
                            self.drain_commands(event, span);
                            // Ship fresh entries right away instead of waiting out the
                            // heartbeat interval.
                            if self.mode == Mode::LineRate && !(self.queue.is_empty() && self.frame.is_empty()) {
                                self.send_frame().await;
                            }
                        }
                        None => self.mode = Mode::Closed,
                    }
                }
            }
        }
    }

    /// Patch `[start, head)` into the front of the frame from storage.
    async fn backfill_frame(&mut self, start: u64, head: u64) {
        let entries = match self.storage.get_log_entries(start..head).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "error reading log while backfilling a frame");
                self.report(ReplicaEvent::Shutdown);
                return;
            }
        };

        if entries.iter().any(|entry| matches!(entry.payload, EntryPayload::PurgedMarker)) {
            // Part of the needed range is gone; the peer needs the snapshot instead.
            self.mode = Mode::Snapshot;
            return;
        }

        let mut patched = entries;
        patched.extend(self.frame.drain(..));
        self.frame = patched;
    }

    //////////////////////////////////////////////////////////////////////////
    // Catch up //////////////////////////////////////////////////////////////

    #[tracing::instrument(level = "trace", skip(self), fields(mode = "catch-up"))]
    async fn catch_up_loop(&mut self) {
        self.report_rate(false);
        // Whatever was queued at line rate is behind the peer's real needs now.
        self.queue.clear();
        self.frame.clear();

        loop {
            if self.mode != Mode::CatchUp {
                return;
            }
            if self.needs_snapshot() {
                self.mode = Mode::Snapshot;
                return;
            }
            // Caught up with commit: everything newer is still in the live stream's hands.
            if self.next_index > self.commit_index {
                self.mode = Mode::LineRate;
                return;
            }

            if self.frame.is_empty() {
                // Read the next window of committed history. The subtraction cannot underflow:
                // the caught-up check above already ruled that out.
                let window_end = (self.next_index + self.frame_capacity as u64).min(self.commit_index) + 1;
                let entries = match self.storage.get_log_entries(self.next_index..window_end).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        tracing::error!(error=%err, "error reading log while catching a peer up");
                        self.report(ReplicaEvent::Shutdown);
                        self.mode = Mode::Closed;
                        return;
                    }
                };
                if entries.iter().any(|entry| matches!(entry.payload, EntryPayload::PurgedMarker)) {
                    self.mode = Mode::Snapshot;
                    return;
                }
                self.frame = entries;
            }

            self.send_frame().await;
            self.drain_pending_commands();
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Snapshot //////////////////////////////////////////////////////////////

    #[tracing::instrument(level = "trace", skip(self), fields(mode = "snapshot"))]
    async fn snapshot_loop(&mut self) {
        self.report_rate(false);
        self.queue.clear();
        self.frame.clear();

        while self.mode == Mode::Snapshot {
            // Ask the leader loop for the current snapshot, then keep the peer's election timer
            // quiet with heartbeats while the answer is in flight.
            let (tx, rx) = oneshot::channel();
            self.report(ReplicaEvent::NeedsSnapshot {
                target: self.target,
                tx,
            });
            let snapshot = match self.await_snapshot(rx).await {
                Some(snapshot) => snapshot,
                None if self.mode == Mode::Closed => return,
                // The channel can die for benign reasons (e.g. a compaction still running);
                // loop around and ask again.
                None => continue,
            };

            if let Err(err) = self.push_snapshot(snapshot).await {
                tracing::warn!(error=%err, "error streaming snapshot to target");
            }
        }
    }

    /// Wait for the leader loop to hand over a snapshot, heartbeating in the meantime.
    async fn await_snapshot(
        &mut self,
        mut rx: oneshot::Receiver<Snapshot<S::SnapshotData>>,
    ) -> Option<Snapshot<S::SnapshotData>> {
        loop {
            let span = tracing::debug_span!("CHrx:AwaitSnapshot");
            let _entered = span.enter();

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_frame().await,
                command = self.commands.recv() => {
                    match command {
                        Some((event, span)) => self.drain_commands(event, span),
                        None => {
                            self.mode = Mode::Closed;
                            return None;
                        }
                    }
                }
                snapshot = &mut rx => return snapshot.ok(),
            }
        }
    }

    /// Stream the snapshot to the peer segment by segment.
    async fn push_snapshot(&mut self, mut source: Snapshot<S::SnapshotData>) -> RaftResult<()> {
        let total = source.snapshot.seek(SeekFrom::End(0)).await?;

        // Once installed, the peer's log position is the snapshot's last covered entry.
        self.next_index = source.meta.last_log_id.index + 1;
        self.matched = source.meta.last_log_id;

        let mut segment = vec![0u8; self.config.snapshot_max_chunk_size as usize];
        let mut offset = 0u64;
        loop {
            source.snapshot.seek(SeekFrom::Start(offset)).await?;
            let len = source.snapshot.read(&mut segment).await?;
            let done = offset + len as u64 == total;

            let rpc = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                meta: source.meta.clone(),
                offset,
                data: segment[..len].to_vec(),
                done,
            };
            tracing::debug!(segment = len, offset, total, done, "sending snapshot segment");

            let response = match timeout(
                self.snapshot_rpc_timeout,
                self.network.send_install_snapshot(self.target, rpc),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    // Retransmit the same segment; the receiver sorts duplicates out by offset.
                    tracing::warn!(error=%err, "snapshot segment to peer failed in transit");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(error=%err, "snapshot segment to peer timed out");
                    continue;
                }
            };

            if response.term > self.term {
                self.report(ReplicaEvent::RevertToFollower {
                    target: self.target,
                    term: response.term,
                });
                self.mode = Mode::Closed;
                return Ok(());
            }

            if done {
                // Anything committed since the snapshot was cut gets replayed from the log.
                self.mode = Mode::CatchUp;
                return Ok(());
            }

            offset += len as u64;
            self.drain_pending_commands();
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A command from the leader loop to a replication task.
pub(crate) enum RaftEvent<D: AppData> {
    /// A freshly appended entry to ship; always the newest entry on the leader.
    Replicate {
        entry: Arc<Entry<D>>,
        /// The leader's commit index as of this append.
        commit_index: u64,
        /// The cluster-wide replication floor as of this append.
        global_index: u64,
    },
    /// The cursors moved without a new entry.
    UpdateCommitIndex {
        commit_index: u64,
        /// The cluster-wide replication floor.
        global_index: u64,
    },
    /// Tear the task down.
    Terminate,
}

/// A report from a replication task back to the leader loop.
pub(crate) enum ReplicaEvent<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    /// The peer moved onto or off of the live append stream.
    ///
    /// The leader uses this to judge when a joining member has synced far enough to be
    /// promoted into the cluster config.
    RateUpdate {
        target: NodeId,
        is_line_rate: bool,
    },
    /// The peer confirmed replication through `matched`.
    ///
    /// Also emitted on successful empty heartbeats with an unchanged `matched`, which is the
    /// liveness signal behind the leader's heartbeat-quorum check.
    UpdateMatchIndex {
        target: NodeId,
        matched: LogId,
    },
    /// The peer answered from a newer term; the leader must stand down.
    RevertToFollower {
        target: NodeId,
        term: u64,
    },
    /// The task needs the current snapshot to bring its peer forward.
    NeedsSnapshot {
        target: NodeId,
        tx: oneshot::Sender<Snapshot<S>>,
    },
    /// The task hit an unrecoverable storage failure.
    Shutdown,
}

impl<S: AsyncRead + AsyncSeek + Send + Unpin + 'static> MessageSummary for ReplicaEvent<S> {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::RateUpdate { target, is_line_rate } => {
                format!("RateUpdate: target: {}, is_line_rate: {}", target, is_line_rate)
            }
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                format!("UpdateMatchIndex: target: {}, matched: {}", target, matched)
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
            ReplicaEvent::NeedsSnapshot { target, .. } => {
                format!("NeedsSnapshot: target: {}", target)
            }
            ReplicaEvent::Shutdown => "Shutdown".to_string(),
        }
    }
}
