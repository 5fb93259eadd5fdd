//! The client sequencer: merges command responses and server pushed events into one ordering.
//!
//! Two streams arrive concurrently at a session client: operation responses, identified by the
//! client assigned request sequence, and published event batches, identified by log event index.
//! User callbacks must observe them in a single linearization consistent with the server's apply
//! order. The contract is: every event batch with an event index at or below a command
//! response's event index fires before that command's callback.

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::protocol::PublishRequest;

/// A callback fired by the sequencer when its turn in the linearization arrives.
pub type Callback = Box<dyn FnOnce() + Send>;

/// The ordering-relevant portion of an operation response.
///
/// `event_index` is present for command responses, which gate on event delivery; it is `None`
/// for query responses and for error placeholders, which complete in plain sequential order.
#[derive(Debug, Clone, Copy)]
pub struct SequencedResponse {
    pub event_index: Option<u64>,
}

impl SequencedResponse {
    pub fn command(event_index: u64) -> Self {
        Self {
            event_index: Some(event_index),
        }
    }

    pub fn plain() -> Self {
        Self { event_index: None }
    }
}

/// The response/event merge state of one session client.
#[derive(Default)]
pub struct ClientSequencer {
    /// The request number most recently assigned; monotonic.
    request_sequence: u64,
    /// The highest contiguous request number whose response callback has fired.
    response_sequence: u64,
    /// The highest event index whose callbacks have fired.
    event_index: u64,
    /// Responses buffered for out-of-order arrival or pending event delivery.
    responses: HashMap<u64, (Option<SequencedResponse>, Callback)>,
    /// Event batches awaiting their place in the linearization, oldest first.
    events: VecDeque<(PublishRequest, Callback)>,
}

impl ClientSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next request number. Responses must be sequenced under this number.
    pub fn next_request(&mut self) -> u64 {
        self.request_sequence += 1;
        self.request_sequence
    }

    /// The highest event index whose callbacks have fired.
    pub fn event_index(&self) -> u64 {
        self.event_index
    }

    /// Sequence an operation response under its request number.
    ///
    /// `response` of `None` marks an exceptional outcome: it holds its place in the ordering but
    /// gates on nothing.
    pub fn sequence_response(&mut self, sequence: u64, response: Option<SequencedResponse>, callback: Callback) {
        if sequence <= self.response_sequence {
            // A response for an already sequenced request; complete it out of band.
            callback();
            return;
        }
        self.responses.insert(sequence, (response, callback));
        self.complete_responses();
    }

    /// Sequence a published event batch.
    ///
    /// A batch arriving while no operations are outstanding fires immediately when contiguous;
    /// otherwise it queues and fires during the response drain, interleaved by event index.
    pub fn sequence_event(&mut self, request: PublishRequest, callback: Callback) {
        if request.event_index <= self.event_index {
            tracing::debug!(
                event_index = request.event_index,
                fired = self.event_index,
                "dropping replayed event batch"
            );
            return;
        }
        if self.request_sequence == self.response_sequence {
            if request.previous_index <= self.event_index {
                self.event_index = request.event_index;
                callback();
                self.complete_responses();
            } else {
                self.events.push_back((request, callback));
            }
        } else {
            self.events.push_back((request, callback));
            self.complete_responses();
        }
    }

    /// Fire as many contiguous responses as possible, then drain events if nothing is in flight.
    fn complete_responses(&mut self) {
        loop {
            let next = self.response_sequence + 1;
            let completable = match self.responses.get(&next) {
                None => break,
                Some((response, _)) => self.can_complete(response),
            };
            if !completable {
                break;
            }
            let (response, callback) = self.responses.remove(&next).expect("checked presence above");
            self.complete_response(response, callback);
            self.response_sequence = next;
        }

        // Once we've completed as many responses as possible, if no more operations are
        // outstanding, complete any events pending in the event queue.
        if self.request_sequence == self.response_sequence {
            self.complete_events();
        }
    }

    /// Whether the next response can fire without reordering events before it.
    fn can_complete(&self, response: &Option<SequencedResponse>) -> bool {
        let response_event_index = match response {
            Some(SequencedResponse {
                event_index: Some(idx),
            }) => *idx,
            // Plain responses and error placeholders gate on nothing.
            _ => return true,
        };
        if response_event_index <= self.event_index {
            return true;
        }
        // The response saw events we have not fired yet. If the next queued batch continues our
        // fired chain, the drain can proceed (either firing batches up to the response's event
        // index, or tolerating the gap when the queued batch has skipped past it — an earlier
        // batch that never arrives). With nothing queued, hold the response for the event.
        match self.events.front() {
            Some((request, _)) => request.previous_index <= self.event_index,
            None => false,
        }
    }

    /// Fire one response, first draining queued events at or below its event index.
    fn complete_response(&mut self, response: Option<SequencedResponse>, callback: Callback) {
        if let Some(SequencedResponse {
            event_index: Some(response_event_index),
        }) = response
        {
            while let Some((request, _)) = self.events.front() {
                if request.event_index > response_event_index {
                    break;
                }
                let (request, event_callback) = self.events.pop_front().expect("checked presence above");
                self.event_index = request.event_index;
                event_callback();
            }
        }
        callback();
    }

    /// Fire all queued events in order.
    fn complete_events(&mut self) {
        while let Some((request, callback)) = self.events.pop_front() {
            self.event_index = request.event_index;
            callback();
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    fn publish(event_index: u64, previous_index: u64) -> PublishRequest {
        PublishRequest {
            session: 1,
            event_index,
            previous_index,
            events: vec![],
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Callback) {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let record = move |label: &'static str| -> Callback {
            let log = log2.clone();
            Box::new(move || log.lock().unwrap().push(label))
        };
        (log, record)
    }

    #[test]
    fn test_event_before_command_fires_event_first() {
        let (log, record) = recorder();
        let mut sequencer = ClientSequencer::new();

        let sequence = sequencer.next_request();
        sequencer.sequence_event(publish(1, 0), record("event"));
        sequencer.sequence_response(sequence, Some(SequencedResponse::command(1)), record("response"));

        assert_eq!(*log.lock().unwrap(), vec!["event", "response"]);
    }

    #[test]
    fn test_event_after_command_still_fires_event_first() {
        let (log, record) = recorder();
        let mut sequencer = ClientSequencer::new();

        let sequence = sequencer.next_request();
        // The response saw event index 1, so it is deferred until that event has fired.
        sequencer.sequence_response(sequence, Some(SequencedResponse::command(1)), record("response"));
        assert!(log.lock().unwrap().is_empty());

        sequencer.sequence_event(publish(1, 0), record("event"));
        assert_eq!(*log.lock().unwrap(), vec!["event", "response"]);
    }

    #[test]
    fn test_event_after_all_commands_fires_after_response() {
        let (log, record) = recorder();
        let mut sequencer = ClientSequencer::new();

        let sequence = sequencer.next_request();
        sequencer.sequence_event(publish(2, 0), record("event1"));
        sequencer.sequence_event(publish(3, 2), record("event2"));
        sequencer.sequence_response(sequence, Some(SequencedResponse::command(2)), record("response"));

        assert_eq!(*log.lock().unwrap(), vec!["event1", "response", "event2"]);
    }

    #[test]
    fn test_missing_event_gap_is_tolerated() {
        let (log, record) = recorder();
        let mut sequencer = ClientSequencer::new();

        // Pre-seed: two requests assigned, one response completed, events fired through 5.
        sequencer.next_request();
        let sequence = sequencer.next_request();
        sequencer.sequence_response(1, None, Box::new(|| {}));
        sequencer.event_index = 5;

        // The response saw event index 10, but no batch covering (5, 10] ever arrives; the next
        // batch skips to 25. The gap is tolerated and the response fires first.
        sequencer.sequence_response(sequence, Some(SequencedResponse::command(10)), record("response"));
        assert!(log.lock().unwrap().is_empty());

        sequencer.sequence_event(publish(25, 5), record("event"));
        assert_eq!(*log.lock().unwrap(), vec!["response", "event"]);
        assert_eq!(sequencer.event_index(), 25);
    }

    #[test]
    fn test_out_of_order_responses_fire_in_sequence_order() {
        let (log, record) = recorder();
        let mut sequencer = ClientSequencer::new();

        let s1 = sequencer.next_request();
        let s2 = sequencer.next_request();
        sequencer.sequence_response(s2, Some(SequencedResponse::command(0)), record("second"));
        assert!(log.lock().unwrap().is_empty());
        sequencer.sequence_response(s1, Some(SequencedResponse::command(0)), record("first"));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_error_placeholder_preserves_order() {
        let (log, record) = recorder();
        let mut sequencer = ClientSequencer::new();

        let s1 = sequencer.next_request();
        let s2 = sequencer.next_request();
        sequencer.sequence_response(s2, Some(SequencedResponse::command(0)), record("ok"));
        sequencer.sequence_response(s1, None, record("error"));
        assert_eq!(*log.lock().unwrap(), vec!["error", "ok"]);
    }

    #[test]
    fn test_replayed_event_batches_are_dropped() {
        let (log, record) = recorder();
        let mut sequencer = ClientSequencer::new();

        sequencer.sequence_event(publish(2, 0), record("event"));
        sequencer.sequence_event(publish(2, 0), record("replay"));
        assert_eq!(*log.lock().unwrap(), vec!["event"]);
    }
}
