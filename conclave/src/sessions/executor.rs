//! The session-aware state machine executor.
//!
//! All committed entries — on leaders and followers alike — are applied through this type. It
//! dispatches entry kinds to the session manager, drives the user state machine for commands,
//! pushes event batches through registered client connections, and produces/restores the
//! snapshot image covering both the session table and the user state machine.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::protocol::Event;
use crate::protocol::PublishRequest;
use crate::raft::Entry;
use crate::raft::EntryNormal;
use crate::raft::EntryPayload;
use crate::sessions::CachedResult;
use crate::sessions::CommandDisposition;
use crate::sessions::PendingCommand;
use crate::sessions::Session;
use crate::sessions::SessionManager;
use crate::state_machine::Commit;
use crate::state_machine::Registry;
use crate::state_machine::StateMachine;
use crate::state_machine::UnknownStateMachineError;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::SessionId;

/// The default retention bound for per-session result caches; overridden from `Config` when the
/// Raft core starts.
const DEFAULT_RESULT_CACHE: u64 = 1024;

/// The reason a command produced no application result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OutcomeError {
    /// The named session is not registered.
    UnknownSession,
    /// The operation's sequence number runs ahead of the session's applied commands.
    SequenceAhead,
    /// The user state machine raised; the message is logged server side.
    Application(String),
}

/// The completion of one applied command, addressed by session and sequence so the leader can
/// match it against a waiting response channel.
#[derive(Debug, Clone)]
pub(crate) struct CommandOutcome<R: AppDataResponse> {
    pub session: SessionId,
    pub sequence: u64,
    /// The log index at which the command was applied.
    pub index: u64,
    /// The session's event index after the apply.
    pub event_index: u64,
    /// The session's applied command sequence after the apply.
    pub last_sequence: u64,
    pub result: Result<Option<R>, OutcomeError>,
}

/// The result of applying one log entry.
pub(crate) enum ApplyOutcome<R: AppDataResponse> {
    /// Blank, config change, or purged marker: nothing session visible.
    Internal,
    Register {
        session: SessionId,
        timeout: u64,
    },
    KeepAlive,
    Unregister {
        session: SessionId,
    },
    Connect {
        session: SessionId,
    },
    /// Zero or more command completions: none when the command was buffered on a sequence gap,
    /// several when its apply unblocked buffered successors.
    Command {
        completions: Vec<CommandOutcome<R>>,
    },
}

/// The leader's admission decision for a command request, taken before the command is logged.
pub(crate) enum Admission<R: AppDataResponse> {
    /// The named session does not exist.
    UnknownSession,
    /// The command was already applied; the cached response must be returned without logging.
    Cached(CommandOutcome<R>),
    /// The command fits the session's sequence window and may be appended.
    Accept,
    /// The command leaves a sequence gap; the client must resubmit from `last_sequence`.
    Gap { last_sequence: u64 },
}

/// The outcome of a query executed against current state.
pub(crate) struct QueryOutcome<R: AppDataResponse> {
    pub index: u64,
    pub event_index: u64,
    pub result: Result<R, OutcomeError>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "D: AppData, R: AppDataResponse")]
struct SnapshotEnvelope<D: AppData, R: AppDataResponse> {
    last_applied: LogId,
    sessions: Vec<Session<D, R>>,
    state_machine: Vec<u8>,
}

struct ExecutorInner<D: AppData, R: AppDataResponse> {
    state_machine: Box<dyn StateMachine<D, R>>,
    sessions: SessionManager<D, R>,
    /// The log id of the last entry applied through this executor.
    last_applied: LogId,
    /// Publish pipes for sessions bound to this node.
    connections: HashMap<SessionId, mpsc::UnboundedSender<PublishRequest>>,
}

/// The deterministic apply engine shared by the Raft core and its follower apply tasks.
pub struct StateMachineExecutor<D: AppData, R: AppDataResponse> {
    inner: Mutex<ExecutorInner<D, R>>,
    /// Mirror of the live session count, readable without the lock for metrics reporting.
    sessions_gauge: AtomicU64,
}

impl<D: AppData, R: AppDataResponse> StateMachineExecutor<D, R> {
    /// Create a new executor around the given state machine.
    pub fn new(state_machine: Box<dyn StateMachine<D, R>>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ExecutorInner {
                state_machine,
                sessions: SessionManager::new(DEFAULT_RESULT_CACHE),
                last_applied: LogId { term: 0, index: 0 },
                connections: HashMap::new(),
            }),
            sessions_gauge: AtomicU64::new(0),
        })
    }

    /// Create a new executor from a registered state machine factory.
    pub fn from_registry(registry: &Registry<D, R>, name: &str) -> Result<Arc<Self>, UnknownStateMachineError> {
        Ok(Self::new(registry.create(name)?))
    }

    pub(crate) async fn set_result_cache_bound(&self, bound: u64) {
        self.inner.lock().await.sessions.set_result_cache_bound(bound);
    }

    /// The number of live sessions, for metrics. Lock free.
    pub(crate) fn session_count(&self) -> u64 {
        self.sessions_gauge.load(Ordering::Relaxed)
    }

    /// Apply a payload of committed entries in log order.
    ///
    /// Errors from the session bookkeeping are fatal (they indicate replica divergence);
    /// application errors from the user state machine are captured inside the outcomes.
    #[tracing::instrument(level = "trace", skip(self, entries))]
    pub(crate) async fn apply(&self, entries: &[Entry<D>]) -> Result<Vec<ApplyOutcome<R>>> {
        let mut inner = self.inner.lock().await;
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.log_id.index <= inner.last_applied.index && inner.last_applied.index != 0 {
                tracing::debug!("skipping already applied entry {}", entry.log_id);
                outcomes.push(ApplyOutcome::Internal);
                continue;
            }
            let outcome = inner.apply_entry(entry).await?;
            inner.last_applied = entry.log_id;
            outcomes.push(outcome);
        }
        self.sessions_gauge.store(inner.sessions.len() as u64, Ordering::Relaxed);
        Ok(outcomes)
    }

    /// The leader's pre-log admission check for a command request.
    ///
    /// An accepted command advances the session's volatile request window so that a subsequent
    /// request for the following sequence is admitted before this one commits.
    pub(crate) async fn admit_command(&self, session: SessionId, sequence: u64) -> Admission<R> {
        let mut inner = self.inner.lock().await;
        let record = match inner.sessions.get_mut(&session) {
            Some(r) => r,
            None => return Admission::UnknownSession,
        };
        if sequence <= record.command_sequence {
            let cached = match record.results.get(&sequence) {
                Some(c) => c.clone(),
                None => CachedResult {
                    index: record.last_applied,
                    event_index: record.event_index,
                    result: Ok(None),
                },
            };
            let last_sequence = record.command_sequence;
            return Admission::Cached(outcome_from_cache(session, sequence, last_sequence, cached));
        }
        if sequence <= record.request_sequence + 1 {
            if sequence > record.request_sequence {
                record.request_sequence = sequence;
            }
            return Admission::Accept;
        }
        Admission::Gap {
            last_sequence: record.request_sequence,
        }
    }

    /// Execute a query against current state on behalf of a session.
    pub(crate) async fn query(&self, session: SessionId, sequence: u64, query: &D) -> QueryOutcome<R> {
        let inner = self.inner.lock().await;
        let record = match inner.sessions.get(&session) {
            Some(r) => r,
            None => {
                return QueryOutcome {
                    index: inner.last_applied.index,
                    event_index: 0,
                    result: Err(OutcomeError::UnknownSession),
                }
            }
        };
        // A query sequenced ahead of the session's applied commands must not observe state
        // which is missing writes the client believes precede it.
        if sequence > record.command_sequence {
            return QueryOutcome {
                index: inner.last_applied.index,
                event_index: record.event_index,
                result: Err(OutcomeError::SequenceAhead),
            };
        }
        let event_index = record.event_index;
        let result = match inner.state_machine.query(query).await {
            Ok(r) => Ok(r),
            Err(err) => Err(OutcomeError::Application(err.to_string())),
        };
        QueryOutcome {
            index: inner.last_applied.index,
            event_index,
            result,
        }
    }

    /// Check whether a session is currently registered.
    pub(crate) async fn session_exists(&self, session: SessionId) -> bool {
        let inner = self.inner.lock().await;
        inner.sessions.get(&session).is_some()
    }

    /// Register a publish pipe for a session bound to this node and re-send any
    /// unacknowledged event batches through it.
    pub(crate) async fn connect_session(
        &self,
        session: SessionId,
        publish_tx: mpsc::UnboundedSender<PublishRequest>,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.sessions.get(&session) {
            for batch in record.events.iter() {
                let _ = publish_tx.send(batch.clone());
            }
        }
        inner.connections.insert(session, publish_tx);
    }

    /// Re-send unacknowledged event batches above the client's received index.
    pub(crate) async fn reset_events(&self, session: SessionId, index: u64) {
        let inner = self.inner.lock().await;
        let record = match inner.sessions.get(&session) {
            Some(r) => r,
            None => return,
        };
        let tx = match inner.connections.get(&session) {
            Some(tx) => tx,
            None => return,
        };
        for batch in record.events.iter() {
            if batch.event_index > index {
                let _ = tx.send(batch.clone());
            }
        }
    }

    /// Drain the sessions whose silence has exceeded twice their timeout.
    ///
    /// Only the leader acts on these, by committing expiry unregister entries.
    pub(crate) async fn take_expired(&self) -> Vec<SessionId> {
        self.inner.lock().await.sessions.take_suspicious()
    }

    /// Serialize the full apply state: session table plus user state machine image.
    pub(crate) async fn snapshot(&self) -> Result<(Vec<u8>, LogId)> {
        let inner = self.inner.lock().await;
        let state_machine = inner.state_machine.snapshot().await?;
        let envelope = SnapshotEnvelope {
            last_applied: inner.last_applied,
            sessions: inner.sessions.export(),
            state_machine,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        Ok((bytes, inner.last_applied))
    }

    /// Replace all apply state with the given snapshot image.
    pub(crate) async fn restore(&self, data: &[u8]) -> Result<()> {
        let envelope: SnapshotEnvelope<D, R> =
            serde_json::from_slice(data).map_err(|err| anyhow!("malformed snapshot envelope: {}", err))?;
        let mut inner = self.inner.lock().await;
        inner.state_machine.restore(&envelope.state_machine).await?;
        inner.sessions.import(envelope.sessions);
        inner.last_applied = envelope.last_applied;
        self.sessions_gauge.store(inner.sessions.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse> ExecutorInner<D, R> {
    async fn apply_entry(&mut self, entry: &Entry<D>) -> Result<ApplyOutcome<R>> {
        match &entry.payload {
            EntryPayload::Blank | EntryPayload::ConfigChange(_) | EntryPayload::PurgedMarker => {
                Ok(ApplyOutcome::Internal)
            }
            EntryPayload::Register(register) => {
                let session = self.sessions.register(entry.log_id.index, register);
                self.sessions.check_expirations(register.timestamp);
                Ok(ApplyOutcome::Register {
                    session,
                    timeout: register.timeout,
                })
            }
            EntryPayload::KeepAlive(keep_alive) => {
                self.sessions.keep_alive(keep_alive);
                self.sessions.check_expirations(keep_alive.timestamp);
                Ok(ApplyOutcome::KeepAlive)
            }
            EntryPayload::Unregister(unregister) => {
                self.sessions.unregister(unregister.session);
                self.connections.remove(&unregister.session);
                self.sessions.check_expirations(unregister.timestamp);
                Ok(ApplyOutcome::Unregister {
                    session: unregister.session,
                })
            }
            EntryPayload::Connect(connect) => {
                self.sessions.connect(connect.session, connect.connection);
                self.sessions.check_expirations(connect.timestamp);
                Ok(ApplyOutcome::Connect {
                    session: connect.session,
                })
            }
            EntryPayload::Normal(normal) => {
                let completions = self.apply_command(entry.log_id.index, normal).await?;
                self.sessions.check_expirations(normal.timestamp);
                Ok(ApplyOutcome::Command { completions })
            }
        }
    }

    /// Apply one command entry, then drain any buffered successors it unblocked.
    async fn apply_command(&mut self, index: u64, normal: &EntryNormal<D>) -> Result<Vec<CommandOutcome<R>>> {
        let session = normal.session;
        let first = PendingCommand {
            index,
            sequence: normal.sequence,
            timestamp: normal.timestamp,
            data: normal.data.clone(),
        };

        let mut completions = Vec::new();
        match self.sessions.begin_command(session, first.clone()) {
            CommandDisposition::UnknownSession => {
                completions.push(CommandOutcome {
                    session,
                    sequence: normal.sequence,
                    index,
                    event_index: 0,
                    last_sequence: 0,
                    result: Err(OutcomeError::UnknownSession),
                });
                return Ok(completions);
            }
            CommandDisposition::Cached(cached) => {
                completions.push(outcome_from_cache(session, normal.sequence, normal.sequence, cached));
                return Ok(completions);
            }
            CommandDisposition::Buffered => return Ok(completions),
            CommandDisposition::Apply => {
                let outcome = self.run_command(session, &first).await?;
                completions.push(outcome);
            }
        }

        // The applied command may have made buffered successors dense; drain them in order.
        while let Some(next) = self.sessions.take_next_pending(session) {
            let outcome = self.run_command(session, &next).await?;
            completions.push(outcome);
        }
        Ok(completions)
    }

    /// Run a single in-sequence command through the user state machine.
    async fn run_command(&mut self, session: SessionId, cmd: &PendingCommand<D>) -> Result<CommandOutcome<R>> {
        let mut events: Vec<Event> = Vec::new();
        let result = match &cmd.data {
            // A no-op fill: consumes the sequence slot without touching the state machine.
            None => Ok(None),
            Some(data) => {
                let mut commit = Commit {
                    index: cmd.index,
                    timestamp: cmd.timestamp,
                    session,
                    events: &mut events,
                };
                match self.state_machine.apply(&mut commit, data).await {
                    Ok(response) => Ok(Some(response)),
                    Err(err) => {
                        tracing::warn!(session, sequence=cmd.sequence, error=%err, "state machine apply raised");
                        Err(err.to_string())
                    }
                }
            }
        };

        let (cached, batch) = self.sessions.finish_command(session, cmd, result, events);
        if let Some(batch) = batch {
            self.publish(session, batch);
        }
        let last_sequence = self
            .sessions
            .get(&session)
            .map(|s| s.command_sequence)
            .unwrap_or(cmd.sequence);
        Ok(outcome_from_cache(session, cmd.sequence, last_sequence, cached))
    }

    /// Push an event batch to the session's registered connection, if any.
    fn publish(&mut self, session: SessionId, batch: PublishRequest) {
        if let Some(tx) = self.connections.get(&session) {
            if tx.send(batch).is_err() {
                // The client side of the pipe is gone; it will re-register on reconnect.
                self.connections.remove(&session);
            }
        }
    }
}

fn outcome_from_cache<R: AppDataResponse>(
    session: SessionId,
    sequence: u64,
    last_sequence: u64,
    cached: CachedResult<R>,
) -> CommandOutcome<R> {
    CommandOutcome {
        session,
        sequence,
        index: cached.index,
        event_index: cached.event_index,
        last_sequence,
        result: match cached.result {
            Ok(r) => Ok(r),
            Err(msg) => Err(OutcomeError::Application(msg)),
        },
    }
}
