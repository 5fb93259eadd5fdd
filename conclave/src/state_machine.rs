//! The user state machine interface and the name → factory registry.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::protocol::Event;
use crate::AppData;
use crate::AppDataResponse;
use crate::SessionId;

/// The context handed to the state machine for a single command apply.
///
/// A commit exposes the deterministic facts of the entry being applied — its log index and the
/// leader-assigned timestamp — and collects any events the state machine publishes for the
/// submitting session. A state machine must derive everything it does from this context and the
/// command payload; wall clocks and other ambient inputs would diverge across replicas.
pub struct Commit<'a> {
    pub(crate) index: u64,
    pub(crate) timestamp: u64,
    pub(crate) session: SessionId,
    pub(crate) events: &'a mut Vec<Event>,
}

impl<'a> Commit<'a> {
    /// Build a commit context directly, for exercising a state machine in tests.
    pub fn new(index: u64, timestamp: u64, session: SessionId, events: &'a mut Vec<Event>) -> Self {
        Self {
            index,
            timestamp,
            session,
            events,
        }
    }

    /// The log index of the command being applied.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The leader wall clock at append time, in epoch milliseconds.
    ///
    /// This is the only clock a state machine may observe.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The session which submitted the command being applied.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Publish an event to the submitting session.
    ///
    /// Events are buffered with this commit's index as their event index and pushed to the
    /// session's client before the command's own response callback fires there.
    pub fn publish(&mut self, event: Event) {
        self.events.push(event);
    }
}

/// A trait defining an application's deterministic state machine.
///
/// The Raft core guarantees that `apply` is invoked with committed commands only, exactly once
/// per command, in log order, on every replica. Command retries never reach the state machine;
/// the session layer answers them from its result cache.
#[async_trait]
pub trait StateMachine<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Apply a committed command, returning the response to deliver to the submitting client.
    ///
    /// An error here is an application error: it is surfaced verbatim in the command's response,
    /// but the entry is still consumed and the session's command sequence advances.
    async fn apply(&mut self, commit: &mut Commit<'_>, command: &D) -> Result<R>;

    /// Execute a read-only query against current state.
    ///
    /// The core has already established the required consistency level before invoking this.
    async fn query(&self, query: &D) -> Result<R>;

    /// Serialize the state machine into a snapshot image.
    async fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace all state with the given snapshot image.
    async fn restore(&mut self, snapshot: &[u8]) -> Result<()>;
}

/// An error indicating that no factory is registered under the requested name.
#[derive(Debug, thiserror::Error)]
#[error("no state machine registered under name '{name}'")]
pub struct UnknownStateMachineError {
    pub name: String,
}

type Factory<D, R> = Box<dyn Fn() -> Box<dyn StateMachine<D, R>> + Send + Sync>;

/// A registry mapping state machine names to factories.
///
/// Server binaries typically register every state machine they ship at startup and instantiate
/// the one named by their configuration.
#[derive(Default)]
pub struct Registry<D, R>
where
    D: AppData,
    R: AppDataResponse,
{
    factories: HashMap<String, Factory<D, R>>,
}

impl<D, R> Registry<D, R>
where
    D: AppData,
    R: AppDataResponse,
{
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under the given name, replacing any previous registration.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where F: Fn() -> Box<dyn StateMachine<D, R>> + Send + Sync + 'static {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    /// Instantiate the state machine registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn StateMachine<D, R>>, UnknownStateMachineError> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(UnknownStateMachineError { name: name.to_string() }),
        }
    }

    /// Check if a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    struct Null;

    #[async_trait]
    impl StateMachine<u64, u64> for Null {
        async fn apply(&mut self, _commit: &mut Commit<'_>, command: &u64) -> Result<u64> {
            Ok(*command)
        }

        async fn query(&self, query: &u64) -> Result<u64> {
            Ok(*query)
        }

        async fn snapshot(&self) -> Result<Vec<u8>> {
            Ok(vec![])
        }

        async fn restore(&mut self, _snapshot: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_creates_registered_machines() {
        let mut registry: Registry<u64, u64> = Registry::new();
        registry.register("null", || Box::new(Null));
        assert!(registry.contains("null"));
        assert!(registry.create("null").is_ok());
    }

    #[test]
    fn test_registry_unknown_name_is_an_error() {
        let registry: Registry<u64, u64> = Registry::new();
        let err = match registry.create("missing") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.name, "missing");
    }
}
