//! The client submitter: retrying, order preserving command and query submission.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio::time::Duration;

use crate::client::connection::ClientConnection;
use crate::client::sequencer::ClientSequencer;
use crate::client::sequencer::SequencedResponse;
use crate::client::SessionState;
use crate::client::transport::ClientTransport;
use crate::error::ClientError;
use crate::protocol::CommandRequest;
use crate::protocol::CommandResponse;
use crate::protocol::Consistency;
use crate::protocol::ErrorKind;
use crate::protocol::KeepAliveRequest;
use crate::protocol::QueryRequest;
use crate::protocol::ResponseStatus;
use crate::AppData;
use crate::AppDataResponse;

/// Backoff schedule for transient failures, in seconds; attempts beyond the table reuse its tail.
const FIBONACCI: [u64; 5] = [1, 1, 2, 3, 5];

/// The retry budget for one command or query before its failure is surfaced to the caller.
const MAX_OPERATION_ATTEMPTS: u64 = 8;

/// A command awaiting its response, addressable for group resubmission.
struct PendingCommand {
    attempt: u64,
    /// Wakes the command's backoff sleep for an immediate resubmit.
    retry: Arc<Notify>,
}

/// Submits session operations, preserving program order across retries.
///
/// Every command occupies one slot in the session's dense sequence space and one slot in the
/// sequencer's request ordering. Responses — successes and failures alike — are fed through the
/// sequencer so callbacks observe server apply order.
pub(crate) struct Submitter<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
{
    connection: Arc<ClientConnection<D, R, T>>,
    state: Arc<SessionState>,
    sequencer: Arc<Mutex<ClientSequencer>>,
    pending: Mutex<BTreeMap<u64, PendingCommand>>,
}

impl<D, R, T> Submitter<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
{
    pub(crate) fn new(
        connection: Arc<ClientConnection<D, R, T>>,
        state: Arc<SessionState>,
        sequencer: Arc<Mutex<ClientSequencer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            state,
            sequencer,
            pending: Mutex::new(BTreeMap::new()),
        })
    }

    /// Submit a command for replicated, exactly-once application.
    pub(crate) async fn submit(self: &Arc<Self>, command: D) -> Result<R, ClientError> {
        if self.state.is_closed() {
            return Err(ClientError::SessionClosed);
        }
        // Allocate the session sequence and the sequencer slot under one lock, so concurrent
        // submissions cannot interleave the two orderings.
        let (sequence, request_sequence) = {
            let mut sequencer = self.sequencer.lock().unwrap();
            (self.state.next_command_sequence(), sequencer.next_request())
        };
        let retry = Arc::new(Notify::new());
        self.pending.lock().unwrap().insert(sequence, PendingCommand {
            attempt: 1,
            retry: retry.clone(),
        });

        let res = self.submit_attempts(sequence, request_sequence, command, retry).await;
        self.pending.lock().unwrap().remove(&sequence);

        // A command abandoned on failure would leave a hole in the session's sequence space and
        // stall every later command; fill the slot with a no-op carrying the same sequence.
        if let Err(err) = &res {
            if !err.is_session_fatal() {
                self.spawn_no_op_fill(sequence);
            }
        }
        res
    }

    async fn submit_attempts(
        self: &Arc<Self>,
        sequence: u64,
        request_sequence: u64,
        command: D,
        retry: Arc<Notify>,
    ) -> Result<R, ClientError> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            if let Some(pending) = self.pending.lock().unwrap().get_mut(&sequence) {
                pending.attempt = attempt;
            }
            if self.state.is_closed() {
                self.sequence_error(request_sequence);
                return Err(ClientError::SessionClosed);
            }

            let rpc = CommandRequest {
                session: self.state.session(),
                sequence,
                command: Some(command.clone()),
            };
            let response = match self.connection.command(rpc).await {
                Ok(response) => response,
                Err(err @ ClientError::NoConnection) | Err(err @ ClientError::Transport(_)) => {
                    if attempt >= MAX_OPERATION_ATTEMPTS {
                        self.sequence_error(request_sequence);
                        return Err(err);
                    }
                    self.backoff(attempt, &retry).await;
                    continue;
                }
                Err(err) => {
                    self.sequence_error(request_sequence);
                    return Err(err);
                }
            };

            match response.error {
                None => return self.sequence_success(sequence, request_sequence, response).await,
                Some(ErrorKind::CommandError) => {
                    // The leader observed a gap below this command. Resubmit everything pending
                    // above the gap point; if our completed responses already passed it, first
                    // rewind the server's sequence window with a keep-alive.
                    let last_sequence = response.last_sequence;
                    if self.state.response_sequence() > last_sequence {
                        let rewind = KeepAliveRequest {
                            session: self.state.session(),
                            command_sequence: self.state.response_sequence(),
                            event_index: self.state.event_ack_index(),
                        };
                        if let Err(err) = self.connection.keep_alive(rewind).await {
                            tracing::debug!(error=%err, "error sending reset-indexes keep-alive");
                        }
                    }
                    self.resubmit_pending(last_sequence, attempt, sequence);
                    if attempt >= MAX_OPERATION_ATTEMPTS {
                        self.sequence_error(request_sequence);
                        return Err(ClientError::Cluster(ErrorKind::CommandError));
                    }
                    // This command's own slot is still above the gap; try again once the
                    // missing predecessors have had a chance to land.
                    self.backoff(attempt, &retry).await;
                }
                Some(kind)
                    if matches!(
                        kind,
                        ErrorKind::ApplicationError
                            | ErrorKind::UnknownClient
                            | ErrorKind::UnknownSession
                            | ErrorKind::UnknownStateMachine
                            | ErrorKind::Internal
                            | ErrorKind::ClosedSession
                    ) =>
                {
                    self.sequence_error(request_sequence);
                    return Err(ClientError::Cluster(kind));
                }
                Some(kind) => {
                    // NoLeader and friends: the connection layer already rotated servers; back
                    // off and retry.
                    tracing::debug!(?kind, sequence, "retrying command after cluster error");
                    if attempt >= MAX_OPERATION_ATTEMPTS {
                        self.sequence_error(request_sequence);
                        return Err(ClientError::Cluster(kind));
                    }
                    self.backoff(attempt, &retry).await;
                }
            }
        }
    }

    /// Execute a query at the given consistency level.
    ///
    /// Queries retry on network errors only; every cluster returned error surfaces directly.
    pub(crate) async fn query(self: &Arc<Self>, query: D, consistency: Consistency) -> Result<R, ClientError> {
        if self.state.is_closed() {
            return Err(ClientError::SessionClosed);
        }
        let request_sequence = self.sequencer.lock().unwrap().next_request();
        let rpc = QueryRequest {
            session: self.state.session(),
            sequence: self.state.command_sequence(),
            index: self.state.response_index(),
            query,
            consistency,
        };

        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let response = match self.connection.query(rpc.clone()).await {
                Ok(response) => response,
                Err(err @ ClientError::NoConnection) | Err(err @ ClientError::Transport(_)) => {
                    if attempt >= MAX_OPERATION_ATTEMPTS {
                        self.sequence_error(request_sequence);
                        return Err(err);
                    }
                    sleep(backoff_delay(attempt)).await;
                    continue;
                }
                Err(err) => {
                    self.sequence_error(request_sequence);
                    return Err(err);
                }
            };

            if let Some(kind) = response.error {
                self.sequence_error(request_sequence);
                return Err(ClientError::Cluster(kind));
            }

            let (tx, rx) = oneshot::channel();
            let state = self.state.clone();
            let index = response.index;
            let result = response.result;
            self.sequencer.lock().unwrap().sequence_response(
                request_sequence,
                Some(SequencedResponse::plain()),
                Box::new(move || {
                    state.observe_index(index);
                    let _ = tx.send(result);
                }),
            );
            let result = rx.await.map_err(|_| ClientError::SessionClosed)?;
            return result.ok_or(ClientError::Cluster(ErrorKind::Internal));
        }
    }

    /// Feed a successful command response through the sequencer and await its ordered callback.
    async fn sequence_success(
        self: &Arc<Self>,
        sequence: u64,
        request_sequence: u64,
        response: CommandResponse<R>,
    ) -> Result<R, ClientError> {
        debug_assert_eq!(response.status, ResponseStatus::Ok);
        let (tx, rx) = oneshot::channel();
        let state = self.state.clone();
        let index = response.index;
        let result = response.result;
        self.sequencer.lock().unwrap().sequence_response(
            request_sequence,
            Some(SequencedResponse::command(response.event_index)),
            Box::new(move || {
                state.record_command_completion(sequence, index);
                let _ = tx.send(result);
            }),
        );
        let result = rx.await.map_err(|_| ClientError::SessionClosed)?;
        // A `None` result is a replay answered from a purged cache slot; the original response
        // was already delivered, so surface it as an internal condition.
        result.ok_or(ClientError::Cluster(ErrorKind::Internal))
    }

    /// Hold a failed operation's place in the response ordering.
    fn sequence_error(&self, request_sequence: u64) {
        self.sequencer.lock().unwrap().sequence_response(request_sequence, None, Box::new(|| {}));
    }

    /// Wake every pending command above the gap point whose attempt does not exceed the failing
    /// attempt, so they resubmit immediately and restore a dense sequence at the leader.
    fn resubmit_pending(&self, last_sequence: u64, attempt: u64, except: u64) {
        let pending = self.pending.lock().unwrap();
        for (sequence, command) in pending.range(last_sequence + 1..) {
            if *sequence != except && command.attempt <= attempt {
                tracing::debug!(sequence, "waking pending command for resubmission");
                command.retry.notify_one();
            }
        }
    }

    /// Sleep the Fibonacci backoff for this attempt, or resume early on a resubmit wake.
    async fn backoff(&self, attempt: u64, retry: &Notify) {
        tokio::select! {
            _ = sleep(backoff_delay(attempt)) => {}
            _ = retry.notified() => {}
        }
    }

    /// Fill an abandoned sequence slot with a no-op command, keeping the server's sequence
    /// space dense so later commands are not stalled behind the failure.
    fn spawn_no_op_fill(self: &Arc<Self>, sequence: u64) {
        let connection = self.connection.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let rpc = CommandRequest::<D> {
                session: state.session(),
                sequence,
                command: None,
            };
            for attempt in 1..=MAX_OPERATION_ATTEMPTS {
                match connection.command(rpc.clone()).await {
                    Ok(response) => match response.error {
                        None => {
                            state.record_command_completion(sequence, response.index);
                            return;
                        }
                        Some(ErrorKind::CommandError) => {
                            // The slot below us is still missing; the owning submissions will
                            // restore density and this fill will land on a later attempt.
                        }
                        Some(kind) => {
                            tracing::debug!(sequence, ?kind, "giving up no-op fill");
                            return;
                        }
                    },
                    Err(err) => {
                        tracing::debug!(sequence, error=%err, "no-op fill attempt failed");
                    }
                }
                sleep(backoff_delay(attempt)).await;
            }
        });
    }
}

fn backoff_delay(attempt: u64) -> Duration {
    let idx = ((attempt.max(1) - 1) as usize).min(FIBONACCI.len() - 1);
    Duration::from_secs(FIBONACCI[idx])
}

//////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_follows_fibonacci_and_caps_at_tail() {
        let secs: Vec<u64> = (1..=7).map(|n| backoff_delay(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 1, 2, 3, 5, 5, 5]);
    }
}
