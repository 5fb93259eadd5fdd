//! In-memory implementations of the `conclave` storage and state machine traits.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use conclave::raft::Entry;
use conclave::raft::EntryPayload;
use conclave::raft::MembershipConfig;
use conclave::state_machine::Commit;
use conclave::state_machine::StateMachine;
use conclave::storage::HardState;
use conclave::storage::InitialState;
use conclave::storage::RaftStorage;
use conclave::storage::RaftStorageDebug;
use conclave::storage::Snapshot;
use conclave::storage::SnapshotMeta;
use conclave::Event;
use conclave::LogId;
use conclave::NodeId;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::sync::RwLockWriteGuard;

/// The application data request type for the test key-value store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Set a key to a value, publishing a `change` event to the submitting session.
    Set { key: String, value: String },
    /// Read a key.
    Get { key: String },
}

impl ClientRequest {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        ClientRequest::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        ClientRequest::Get { key: key.into() }
    }
}

/// The application data response type: the previous value for writes, the current for reads.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse(pub Option<String>);

/// A keyed-value state machine which publishes a `change` event for every applied write.
///
/// State lives behind a shared handle so tests can assert against it directly while the
/// executor owns the boxed machine.
pub struct KvStateMachine {
    data: Arc<StdMutex<HashMap<String, String>>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self {
            data: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// A shared handle onto the machine's data, for test assertions.
    pub fn handle(&self) -> Arc<StdMutex<HashMap<String, String>>> {
        self.data.clone()
    }
}

impl Default for KvStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateMachine<ClientRequest, ClientResponse> for KvStateMachine {
    async fn apply(&mut self, commit: &mut Commit<'_>, command: &ClientRequest) -> Result<ClientResponse> {
        match command {
            ClientRequest::Set { key, value } => {
                let previous = self.data.lock().unwrap().insert(key.clone(), value.clone());
                let payload = serde_json::to_vec(&(key, value))?;
                commit.publish(Event::new("change", payload));
                Ok(ClientResponse(previous))
            }
            ClientRequest::Get { key } => {
                let value = self.data.lock().unwrap().get(key).cloned();
                Ok(ClientResponse(value))
            }
        }
    }

    async fn query(&self, query: &ClientRequest) -> Result<ClientResponse> {
        match query {
            ClientRequest::Get { key } => {
                let value = self.data.lock().unwrap().get(key).cloned();
                Ok(ClientResponse(value))
            }
            ClientRequest::Set { .. } => Err(anyhow!("writes cannot be submitted as queries")),
        }
    }

    async fn snapshot(&self) -> Result<Vec<u8>> {
        let data = self.data.lock().unwrap().clone();
        Ok(serde_json::to_vec(&data)?)
    }

    async fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        let data: HashMap<String, String> = serde_json::from_slice(snapshot)?;
        *self.data.lock().unwrap() = data;
        Ok(())
    }
}

/// The current snapshot of a `MemStore`.
#[derive(Clone, Debug)]
pub struct MemStoreSnapshot {
    pub meta: SnapshotMeta,
    /// The data of the state machine at the time of this snapshot.
    pub data: Vec<u8>,
}

/// An in-memory log and snapshot store implementing the `RaftStorage` trait.
pub struct MemStore {
    id: NodeId,
    address: String,
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    hs: RwLock<Option<HardState>>,
    current_snapshot: RwLock<Option<MemStoreSnapshot>>,
    snapshot_idx: StdMutex<u64>,
}

impl MemStore {
    /// Create a new `MemStore` instance, addressed as `node-{id}`.
    pub fn new(id: NodeId) -> Self {
        Self::new_with_address(id, format!("node-{}", id))
    }

    /// Create a new `MemStore` instance with an explicit address.
    pub fn new_with_address(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            log: RwLock::new(BTreeMap::new()),
            hs: RwLock::new(None),
            current_snapshot: RwLock::new(None),
            snapshot_idx: StdMutex::new(0),
        }
    }

    /// The address this store was configured with.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get a handle to the log for testing purposes.
    pub async fn get_log(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, Entry<ClientRequest>>> {
        self.log.write().await
    }

    /// Get the current snapshot record for testing purposes.
    pub async fn get_snapshot(&self) -> Option<MemStoreSnapshot> {
        self.current_snapshot.read().await.clone()
    }
}

#[async_trait]
impl RaftStorage<ClientRequest> for MemStore {
    type SnapshotData = Cursor<Vec<u8>>;

    async fn get_membership_config(&self) -> Result<MembershipConfig> {
        let log = self.log.read().await;
        let cfg_opt = log.values().rev().find_map(|entry| match &entry.payload {
            EntryPayload::ConfigChange(cfg) => Some(cfg.membership.clone()),
            EntryPayload::PurgedMarker => None,
            _ => None,
        });
        if let Some(cfg) = cfg_opt {
            return Ok(cfg);
        }
        if let Some(snapshot) = &*self.current_snapshot.read().await {
            return Ok(snapshot.meta.membership.clone());
        }
        Ok(MembershipConfig::new_initial(self.id, self.address.clone()))
    }

    async fn get_initial_state(&self) -> Result<InitialState> {
        let membership = self.get_membership_config().await?;
        let mut hs = self.hs.write().await;
        let log = self.log.read().await;
        match &mut *hs {
            Some(inner) => {
                let last_log_id = match log.values().rev().next() {
                    Some(entry) => entry.log_id,
                    None => match &*self.current_snapshot.read().await {
                        Some(snapshot) => snapshot.meta.last_log_id,
                        None => LogId { term: 0, index: 0 },
                    },
                };
                let last_applied_log = match &*self.current_snapshot.read().await {
                    Some(snapshot) => snapshot.meta.last_log_id,
                    None => LogId { term: 0, index: 0 },
                };
                Ok(InitialState {
                    last_log_id,
                    last_applied_log,
                    hard_state: inner.clone(),
                    membership,
                })
            }
            None => {
                let new = InitialState::new_initial(self.id, self.address.clone());
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, val)| val.clone()).collect())
    }

    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.get(&log_index).cloned())
    }

    async fn get_last_log_id(&self) -> Result<LogId> {
        let log = self.log.read().await;
        if let Some(entry) = log.values().rev().next() {
            return Ok(entry.log_id);
        }
        if let Some(snapshot) = &*self.current_snapshot.read().await {
            return Ok(snapshot.meta.last_log_id);
        }
        Ok(LogId { term: 0, index: 0 })
    }

    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<()> {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(range).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn append_to_log(&self, entries: &[&Entry<ClientRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    async fn create_snapshot(&self) -> Result<(String, Box<Self::SnapshotData>)> {
        let snapshot_id = {
            let mut idx = self.snapshot_idx.lock().unwrap();
            *idx += 1;
            format!("{}-{}", self.id, *idx)
        };
        Ok((snapshot_id, Box::new(Cursor::new(Vec::new()))))
    }

    async fn finalize_snapshot_creation(&self, meta: &SnapshotMeta, snapshot: Box<Self::SnapshotData>) -> Result<()> {
        let data = snapshot.into_inner();
        {
            let mut log = self.log.write().await;
            let keys: Vec<u64> = log.range(..=meta.last_log_id.index).map(|(k, _)| *k).collect();
            for key in keys {
                log.remove(&key);
            }
            log.insert(meta.last_log_id.index, Entry::new_purged_marker(meta.last_log_id));
        }
        *self.current_snapshot.write().await = Some(MemStoreSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn finalize_snapshot_installation(&self, meta: &SnapshotMeta, snapshot: Box<Self::SnapshotData>) -> Result<()> {
        let data = snapshot.into_inner();
        {
            let mut log = self.log.write().await;
            let keys: Vec<u64> = log.range(..=meta.last_log_id.index).map(|(k, _)| *k).collect();
            for key in keys {
                log.remove(&key);
            }
            log.insert(meta.last_log_id.index, Entry::new_purged_marker(meta.last_log_id));
        }
        *self.current_snapshot.write().await = Some(MemStoreSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => Ok(Some(Snapshot {
                meta: snapshot.meta.clone(),
                snapshot: Box::new(Cursor::new(snapshot.data.clone())),
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RaftStorageDebug for MemStore {
    async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64) -> Entry<ClientRequest> {
        Entry {
            log_id: LogId { term, index },
            payload: EntryPayload::Blank,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_log_entries() -> Result<()> {
        let store = MemStore::new(1);
        let entries = vec![entry(1, 1), entry(1, 2), entry(1, 3)];
        let refs: Vec<_> = entries.iter().collect();
        store.append_to_log(&refs).await?;

        let read = store.get_log_entries(2..=3).await?;
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].log_id, LogId::new(1, 2));
        assert_eq!(store.get_last_log_id().await?, LogId::new(1, 3));
        assert_eq!(store.try_get_log_entry(9).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_logs_from_truncates_suffix() -> Result<()> {
        let store = MemStore::new(1);
        let entries = vec![entry(1, 1), entry(1, 2), entry(1, 3)];
        let refs: Vec<_> = entries.iter().collect();
        store.append_to_log(&refs).await?;

        store.delete_logs_from(2..).await?;
        assert_eq!(store.get_last_log_id().await?, LogId::new(1, 1));
        Ok(())
    }

    #[tokio::test]
    async fn test_initial_state_for_pristine_store() -> Result<()> {
        let store = MemStore::new(7);
        let state = store.get_initial_state().await?;
        assert_eq!(state.last_log_id, LogId::new(0, 0));
        assert_eq!(state.hard_state, HardState::default());
        assert!(state.membership.contains(&7));
        assert_eq!(state.membership.address_of(&7).as_deref(), Some("node-7"));
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_creation_purges_log_prefix() -> Result<()> {
        let store = MemStore::new(1);
        let entries = vec![entry(1, 1), entry(1, 2), entry(1, 3), entry(1, 4)];
        let refs: Vec<_> = entries.iter().collect();
        store.append_to_log(&refs).await?;

        let (snapshot_id, mut handle) = store.create_snapshot().await?;
        tokio::io::AsyncWriteExt::write_all(handle.as_mut(), b"image").await?;
        let meta = SnapshotMeta {
            last_log_id: LogId::new(1, 3),
            membership: MembershipConfig::new_initial(1, "node-1"),
            snapshot_id,
        };
        store.finalize_snapshot_creation(&meta, handle).await?;

        let log = store.get_log().await;
        assert!(matches!(log.get(&3).unwrap().payload, EntryPayload::PurgedMarker));
        assert!(log.get(&2).is_none());
        assert!(log.get(&4).is_some());
        drop(log);

        let current = store.get_snapshot().await.unwrap();
        assert_eq!(current.data, b"image");
        Ok(())
    }

    #[tokio::test]
    async fn test_state_machine_apply_publishes_change_event() -> Result<()> {
        let mut sm = KvStateMachine::new();
        let mut events = Vec::new();
        let mut commit = Commit::new(5, 1_000, 1, &mut events);
        let res = sm.apply(&mut commit, &ClientRequest::set("foo", "bar")).await?;
        assert_eq!(res, ClientResponse(None));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "change");

        let mut events = Vec::new();
        let mut commit = Commit::new(6, 1_001, 1, &mut events);
        let res = sm.apply(&mut commit, &ClientRequest::set("foo", "baz")).await?;
        assert_eq!(res, ClientResponse(Some("bar".into())));
        Ok(())
    }

    #[tokio::test]
    async fn test_state_machine_snapshot_round_trip() -> Result<()> {
        let mut sm = KvStateMachine::new();
        let mut events = Vec::new();
        let mut commit = Commit::new(1, 1, 1, &mut events);
        sm.apply(&mut commit, &ClientRequest::set("k", "v")).await?;

        let image = sm.snapshot().await?;
        let mut restored = KvStateMachine::new();
        restored.restore(&image).await?;
        assert_eq!(restored.query(&ClientRequest::get("k")).await?, ClientResponse(Some("v".into())));
        Ok(())
    }

    #[tokio::test]
    async fn test_state_machine_rejects_write_queries() {
        let sm = KvStateMachine::new();
        let res = sm.query(&ClientRequest::set("k", "v")).await;
        assert!(res.is_err());
    }
}
