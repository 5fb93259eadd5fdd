//! Server side session state: registration, command sequencing, result caching, event batches.
//!
//! Everything in this module is synchronous bookkeeping; the async orchestration around the user
//! state machine lives in the executor.

mod executor;

pub use executor::StateMachineExecutor;
pub(crate) use executor::Admission;
pub(crate) use executor::ApplyOutcome;
pub(crate) use executor::CommandOutcome;
pub(crate) use executor::OutcomeError;
pub(crate) use executor::QueryOutcome;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use crate::protocol::PublishRequest;
use crate::raft::KeepAliveEntry;
use crate::raft::RegisterEntry;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::SessionId;

/// A command result retained for retry deduplication.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "R: AppDataResponse")]
pub(crate) struct CachedResult<R: AppDataResponse> {
    /// The log index at which the command was applied.
    pub index: u64,
    /// The session's event index after the apply.
    pub event_index: u64,
    /// The apply result; `Err` carries an application error message.
    pub result: Result<Option<R>, String>,
}

/// A committed command buffered because its predecessor in the sequence has not yet applied.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: AppData")]
pub(crate) struct PendingCommand<D: AppData> {
    pub index: u64,
    pub sequence: u64,
    pub timestamp: u64,
    pub data: Option<D>,
}

/// A server side session record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: AppData, R: AppDataResponse")]
pub(crate) struct Session<D: AppData, R: AppDataResponse> {
    /// The session's id: the index of the register entry which created it.
    pub id: SessionId,
    /// The client supplied identity.
    pub client: String,
    /// The granted timeout in milliseconds.
    pub timeout: u64,
    /// The entry timestamp at which the session was last heard from.
    pub last_updated: u64,
    /// The highest sequence number whose command has been applied.
    pub command_sequence: u64,
    /// The highest sequence number the leader has accepted into the log.
    ///
    /// Volatile in spirit: a new leader re-derives it from `command_sequence`.
    pub request_sequence: u64,
    /// The highest log index applied for this session.
    pub last_applied: u64,
    /// The index of the last event batch published for this session.
    pub event_index: u64,
    /// The highest event index the client has acknowledged.
    pub complete_index: u64,
    /// The node this session last connected to for event delivery.
    pub connection: Option<NodeId>,
    /// Cached command results keyed by sequence.
    pub results: BTreeMap<u64, CachedResult<R>>,
    /// Committed commands buffered out of sequence order.
    pub pending: BTreeMap<u64, PendingCommand<D>>,
    /// Published but unacknowledged event batches, oldest first.
    pub events: VecDeque<PublishRequest>,
}

impl<D: AppData, R: AppDataResponse> Session<D, R> {
    fn new(id: SessionId, client: String, timeout: u64, timestamp: u64) -> Self {
        Self {
            id,
            client,
            timeout,
            last_updated: timestamp,
            command_sequence: 0,
            request_sequence: 0,
            last_applied: 0,
            event_index: 0,
            complete_index: 0,
            connection: None,
            results: BTreeMap::new(),
            pending: BTreeMap::new(),
            events: VecDeque::new(),
        }
    }

    /// Cache a command result, evicting entries beyond the retention bound.
    fn cache_result(&mut self, sequence: u64, result: CachedResult<R>, bound: u64) {
        self.results.insert(sequence, result);
        let floor = self.command_sequence.saturating_sub(bound);
        while let Some((&seq, _)) = self.results.iter().next() {
            if seq >= floor {
                break;
            }
            self.results.remove(&seq);
        }
    }
}

/// The disposition of a command entry at apply time.
pub(crate) enum CommandDisposition<R: AppDataResponse> {
    /// The named session does not exist.
    UnknownSession,
    /// The command was already applied; answer from the cache.
    Cached(CachedResult<R>),
    /// The command is next in sequence and must be applied now.
    Apply,
    /// The command arrived ahead of a missing predecessor and has been buffered.
    Buffered,
}

/// All session records of a replica, plus the suspicion set driving expiry.
pub(crate) struct SessionManager<D: AppData, R: AppDataResponse> {
    sessions: HashMap<SessionId, Session<D, R>>,
    /// Sessions whose silence has exceeded twice their timeout, pending an unregister entry.
    suspicious: BTreeSet<SessionId>,
    /// Retention bound for per-session result caches.
    result_cache_bound: u64,
}

impl<D: AppData, R: AppDataResponse> SessionManager<D, R> {
    pub(crate) fn new(result_cache_bound: u64) -> Self {
        Self {
            sessions: HashMap::new(),
            suspicious: BTreeSet::new(),
            result_cache_bound,
        }
    }

    pub(crate) fn set_result_cache_bound(&mut self, bound: u64) {
        self.result_cache_bound = bound;
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn get(&self, id: &SessionId) -> Option<&Session<D, R>> {
        self.sessions.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session<D, R>> {
        self.sessions.get_mut(id)
    }

    /// Create a session from a register entry; its id is the entry's index.
    pub(crate) fn register(&mut self, index: u64, entry: &RegisterEntry) -> SessionId {
        let session = Session::new(index, entry.client.clone(), entry.timeout, entry.timestamp);
        self.sessions.insert(index, session);
        index
    }

    /// Apply a keep-alive entry: refresh liveness and purge acknowledged state.
    pub(crate) fn keep_alive(&mut self, entry: &KeepAliveEntry) {
        for ack in entry.acks.iter() {
            let session = match self.sessions.get_mut(&ack.session) {
                Some(s) => s,
                None => continue,
            };
            session.last_updated = entry.timestamp;
            self.suspicious.remove(&ack.session);

            // The client vouches for responses through `command_sequence`; drop the cache below
            // it and never wait for the sequences it covers.
            let acked = ack.command_sequence;
            session.results = session.results.split_off(&(acked + 1));
            if acked > session.command_sequence {
                session.command_sequence = acked;
            }
            if acked > session.request_sequence {
                session.request_sequence = acked;
            }

            if ack.event_index > session.complete_index {
                session.complete_index = ack.event_index;
            }
            while let Some(front) = session.events.front() {
                if front.event_index <= session.complete_index {
                    session.events.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Remove a session. Returns true if it existed.
    pub(crate) fn unregister(&mut self, id: SessionId) -> bool {
        self.suspicious.remove(&id);
        self.sessions.remove(&id).is_some()
    }

    /// Record the node a session is bound to for event delivery.
    pub(crate) fn connect(&mut self, id: SessionId, node: NodeId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.connection = Some(node);
        }
    }

    /// Classify a command entry against its session's sequence window.
    ///
    /// A command ahead of its predecessor is buffered here; the caller applies `Apply`
    /// dispositions and then drains with `take_next_pending`.
    pub(crate) fn begin_command(&mut self, session: SessionId, cmd: PendingCommand<D>) -> CommandDisposition<R> {
        let record = match self.sessions.get_mut(&session) {
            Some(s) => s,
            None => return CommandDisposition::UnknownSession,
        };
        record.last_updated = cmd.timestamp;
        self.suspicious.remove(&session);

        if cmd.sequence <= record.command_sequence {
            return match record.results.get(&cmd.sequence) {
                Some(cached) => CommandDisposition::Cached(cached.clone()),
                // The cache has been purged by a keep-alive: the client has already seen this
                // response, so an empty success is safe to repeat.
                None => CommandDisposition::Cached(CachedResult {
                    index: record.last_applied,
                    event_index: record.event_index,
                    result: Ok(None),
                }),
            };
        }
        if cmd.sequence == record.command_sequence + 1 {
            return CommandDisposition::Apply;
        }
        record.pending.insert(cmd.sequence, cmd);
        CommandDisposition::Buffered
    }

    /// Record the result of an applied command and produce its event batch, if any.
    pub(crate) fn finish_command(
        &mut self,
        session: SessionId,
        cmd: &PendingCommand<D>,
        result: Result<Option<R>, String>,
        events: Vec<crate::protocol::Event>,
    ) -> (CachedResult<R>, Option<PublishRequest>) {
        let record = self.sessions.get_mut(&session).expect("finish_command for unknown session");
        record.command_sequence = cmd.sequence;
        if record.request_sequence < cmd.sequence {
            record.request_sequence = cmd.sequence;
        }
        record.last_applied = cmd.index;

        let batch = if events.is_empty() {
            None
        } else {
            let batch = PublishRequest {
                session,
                event_index: cmd.index,
                previous_index: record.event_index,
                events,
            };
            record.event_index = cmd.index;
            record.events.push_back(batch.clone());
            Some(batch)
        };

        let cached = CachedResult {
            index: cmd.index,
            event_index: record.event_index,
            result,
        };
        let bound = self.result_cache_bound;
        let record = self.sessions.get_mut(&session).expect("finish_command for unknown session");
        record.cache_result(cmd.sequence, cached.clone(), bound);
        (cached, batch)
    }

    /// Take the next buffered command if it is now dense with the applied sequence.
    pub(crate) fn take_next_pending(&mut self, session: SessionId) -> Option<PendingCommand<D>> {
        let record = self.sessions.get_mut(&session)?;
        let next = record.command_sequence + 1;
        record.pending.remove(&next)
    }

    /// Mark sessions whose silence exceeds twice their timeout, as measured by the
    /// deterministic entry-timestamp clock.
    pub(crate) fn check_expirations(&mut self, timestamp: u64) {
        for (id, session) in self.sessions.iter() {
            if timestamp > session.last_updated && timestamp - session.last_updated > session.timeout * 2 {
                self.suspicious.insert(*id);
            }
        }
    }

    /// Drain the sessions due for an expiry unregister entry.
    pub(crate) fn take_suspicious(&mut self) -> Vec<SessionId> {
        let out: Vec<_> = self.suspicious.iter().cloned().collect();
        self.suspicious.clear();
        out
    }

    /// Export all sessions for inclusion in a snapshot.
    pub(crate) fn export(&self) -> Vec<Session<D, R>> {
        let mut out: Vec<_> = self.sessions.values().cloned().collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Replace all sessions with the given snapshot image.
    pub(crate) fn import(&mut self, sessions: Vec<Session<D, R>>) {
        self.sessions = sessions.into_iter().map(|s| (s.id, s)).collect();
        self.suspicious.clear();
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::SessionAck;

    fn manager() -> SessionManager<String, String> {
        SessionManager::new(1024)
    }

    fn register(mgr: &mut SessionManager<String, String>, index: u64, timeout: u64) -> SessionId {
        mgr.register(index, &RegisterEntry {
            client: "client-1".into(),
            timeout,
            timestamp: 1_000,
        })
    }

    fn cmd(index: u64, sequence: u64) -> PendingCommand<String> {
        PendingCommand {
            index,
            sequence,
            timestamp: 2_000,
            data: Some(format!("cmd-{}", sequence)),
        }
    }

    #[test]
    fn test_register_assigns_entry_index_as_id() {
        let mut mgr = manager();
        let id = register(&mut mgr, 5, 1000);
        assert_eq!(id, 5);
        assert_eq!(mgr.get(&5).unwrap().timeout, 1000);
    }

    #[test]
    fn test_commands_apply_only_in_dense_sequence_order() {
        let mut mgr = manager();
        let id = register(&mut mgr, 1, 1000);

        // Sequence 3 ahead of 2 is buffered.
        assert!(matches!(mgr.begin_command(id, cmd(4, 3)), CommandDisposition::Buffered));
        // Sequence 1 is next.
        assert!(matches!(mgr.begin_command(id, cmd(2, 1)), CommandDisposition::Apply));
        let c1 = cmd(2, 1);
        mgr.finish_command(id, &c1, Ok(Some("r1".into())), vec![]);

        // 2 is now next; 3 still buffered until 2 finishes.
        assert!(mgr.take_next_pending(id).is_none());
        assert!(matches!(mgr.begin_command(id, cmd(3, 2)), CommandDisposition::Apply));
        let c2 = cmd(3, 2);
        mgr.finish_command(id, &c2, Ok(Some("r2".into())), vec![]);

        let drained = mgr.take_next_pending(id).expect("buffered command should drain");
        assert_eq!(drained.sequence, 3);
    }

    #[test]
    fn test_retry_of_applied_sequence_returns_cached_result() {
        let mut mgr = manager();
        let id = register(&mut mgr, 1, 1000);
        assert!(matches!(mgr.begin_command(id, cmd(2, 1)), CommandDisposition::Apply));
        let c1 = cmd(2, 1);
        mgr.finish_command(id, &c1, Ok(Some("first".into())), vec![]);

        match mgr.begin_command(id, cmd(9, 1)) {
            CommandDisposition::Cached(cached) => {
                assert_eq!(cached.index, 2);
                assert_eq!(cached.result, Ok(Some("first".into())));
            }
            _ => panic!("expected cached disposition"),
        }
    }

    #[test]
    fn test_event_batches_chain_previous_index() {
        let mut mgr = manager();
        let id = register(&mut mgr, 1, 1000);
        assert!(matches!(mgr.begin_command(id, cmd(2, 1)), CommandDisposition::Apply));
        let c1 = cmd(2, 1);
        let (_, batch1) =
            mgr.finish_command(id, &c1, Ok(None), vec![crate::protocol::Event::new("change", vec![1])]);
        let batch1 = batch1.unwrap();
        assert_eq!(batch1.event_index, 2);
        assert_eq!(batch1.previous_index, 0);

        assert!(matches!(mgr.begin_command(id, cmd(7, 2)), CommandDisposition::Apply));
        let c2 = cmd(7, 2);
        let (_, batch2) =
            mgr.finish_command(id, &c2, Ok(None), vec![crate::protocol::Event::new("change", vec![2])]);
        let batch2 = batch2.unwrap();
        assert_eq!(batch2.event_index, 7);
        assert_eq!(batch2.previous_index, 2);
    }

    #[test]
    fn test_keep_alive_purges_results_and_acked_events() {
        let mut mgr = manager();
        let id = register(&mut mgr, 1, 1000);
        for seq in 1..=3u64 {
            let c = cmd(seq + 1, seq);
            assert!(matches!(mgr.begin_command(id, c.clone()), CommandDisposition::Apply));
            mgr.finish_command(id, &c, Ok(None), vec![crate::protocol::Event::new("e", vec![])]);
        }
        assert_eq!(mgr.get(&id).unwrap().results.len(), 3);
        assert_eq!(mgr.get(&id).unwrap().events.len(), 3);

        mgr.keep_alive(&KeepAliveEntry {
            acks: vec![SessionAck {
                session: id,
                command_sequence: 2,
                event_index: 3,
            }],
            timestamp: 3_000,
        });
        let session = mgr.get(&id).unwrap();
        assert_eq!(session.results.len(), 1, "results at or below the ack must be dropped");
        assert_eq!(session.events.len(), 1, "acked event batches must be dropped");
        assert_eq!(session.last_updated, 3_000);
    }

    #[test]
    fn test_silent_sessions_become_suspicious_after_twice_timeout() {
        let mut mgr = manager();
        let id = register(&mut mgr, 1, 1000);
        mgr.check_expirations(2_900);
        assert!(mgr.take_suspicious().is_empty());

        mgr.check_expirations(3_100);
        assert_eq!(mgr.take_suspicious(), vec![id]);

        // A keep-alive rescues the session.
        mgr.check_expirations(3_100);
        mgr.keep_alive(&KeepAliveEntry {
            acks: vec![SessionAck {
                session: id,
                command_sequence: 0,
                event_index: 0,
            }],
            timestamp: 3_200,
        });
        assert!(mgr.take_suspicious().is_empty());
    }

    #[test]
    fn test_keep_alive_rewinds_sequence_window_forward() {
        let mut mgr = manager();
        let id = register(&mut mgr, 1, 1000);
        // A fresh leader derived both watermarks as 0; the client vouches for 6 completed.
        mgr.keep_alive(&KeepAliveEntry {
            acks: vec![SessionAck {
                session: id,
                command_sequence: 6,
                event_index: 0,
            }],
            timestamp: 2_000,
        });
        let session = mgr.get(&id).unwrap();
        assert_eq!(session.command_sequence, 6);
        assert_eq!(session.request_sequence, 6);

        // The next command is admitted and applied as sequence 7.
        assert!(matches!(mgr.begin_command(id, cmd(9, 7)), CommandDisposition::Apply));
    }
}
