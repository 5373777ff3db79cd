// In-memory collaborators: entity handles, storage and permissions for
// embedding hosts without a database, and for tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::machine::traits::{EntityHandle, PermissionOracle};
use crate::machine::types::{Principal, State};
use crate::storage::{IsolationLevel, StateWrite, Storage, StorageError, StorageTransaction};

/// Entity handle holding its state in memory. `persist` stages the current
/// state in the caller's transaction.
#[derive(Debug)]
pub struct MemoryEntity {
    kind: String,
    id: String,
    state: Mutex<State>,
    persist_count: AtomicUsize,
    fail_persist: AtomicBool,
}

impl MemoryEntity {
    pub fn new(kind: impl Into<String>, id: impl Into<String>, initial: impl Into<State>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            state: Mutex::new(initial.into()),
            persist_count: AtomicUsize::new(0),
            fail_persist: AtomicBool::new(false),
        }
    }

    /// Make subsequent `persist` calls fail with a backend error
    pub fn fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    /// Writes staged so far, committed or not
    pub fn persist_count(&self) -> usize {
        self.persist_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityHandle for MemoryEntity {
    fn entity_kind(&self) -> &str {
        &self.kind
    }

    fn entity_id(&self) -> String {
        self.id.clone()
    }

    async fn current_state(&self) -> State {
        self.state.lock().await.clone()
    }

    async fn set_state(&self, state: State) {
        *self.state.lock().await = state;
    }

    async fn persist(&self, tx: &mut dyn StorageTransaction) -> Result<(), StorageError> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!(
                "persist failed for {}#{}",
                self.kind, self.id
            )));
        }
        let current = self.state.lock().await.clone();
        tx.write(StateWrite::new(self.kind.clone(), self.id.clone(), current))
            .await?;
        self.persist_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Transaction boundary as seen by [`MemoryStorage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    Begin(Option<IsolationLevel>),
    Commit,
    Rollback,
}

type Rows = BTreeMap<(String, String), State>;

/// Storage keeping committed entity states in memory. Records transaction
/// boundaries and can be told to fail commits.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    rows: Arc<Mutex<Rows>>,
    events: Arc<Mutex<Vec<TransactionEvent>>>,
    fail_commit: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Last committed state of an entity, `None` if nothing was ever committed
    pub async fn persisted_state(&self, entity_kind: &str, entity_id: &str) -> Option<State> {
        self.rows
            .lock()
            .await
            .get(&(entity_kind.to_string(), entity_id.to_string()))
            .cloned()
    }

    pub async fn events(&self) -> Vec<TransactionEvent> {
        self.events.lock().await.clone()
    }

    pub async fn count(&self, event: &TransactionEvent) -> usize {
        self.events.lock().await.iter().filter(|e| *e == event).count()
    }
}

struct MemoryTransaction {
    rows: Arc<Mutex<Rows>>,
    events: Arc<Mutex<Vec<TransactionEvent>>>,
    pending: Vec<StateWrite>,
    fail_commit: bool,
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn begin(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> Result<Box<dyn StorageTransaction>, StorageError> {
        self.events.lock().await.push(TransactionEvent::Begin(isolation));
        Ok(Box::new(MemoryTransaction {
            rows: self.rows.clone(),
            events: self.events.clone(),
            pending: Vec::new(),
            fail_commit: self.fail_commit.load(Ordering::SeqCst),
        }))
    }
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn write(&mut self, write: StateWrite) -> Result<(), StorageError> {
        self.pending.push(write);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTransaction {
            rows,
            events,
            pending,
            fail_commit,
        } = *self;
        if fail_commit {
            events.lock().await.push(TransactionEvent::Rollback);
            return Err(StorageError::Conflict("commit rejected".to_string()));
        }
        {
            let mut rows = rows.lock().await;
            for write in pending {
                rows.insert((write.entity_kind, write.entity_id), write.state);
            }
        }
        events.lock().await.push(TransactionEvent::Commit);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.events.lock().await.push(TransactionEvent::Rollback);
        Ok(())
    }
}

/// Permission oracle backed by a fixed grant table
#[derive(Debug, Default, Clone)]
pub struct StaticPermissionOracle {
    grants: HashMap<String, HashSet<String>>,
    allow_all: bool,
}

impl StaticPermissionOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oracle that grants every permission to every principal
    pub fn allow_all() -> Self {
        Self {
            grants: HashMap::new(),
            allow_all: true,
        }
    }

    pub fn grant(mut self, principal_id: impl Into<String>, permission: impl Into<String>) -> Self {
        self.grants
            .entry(principal_id.into())
            .or_default()
            .insert(permission.into());
        self
    }
}

#[async_trait]
impl PermissionOracle for StaticPermissionOracle {
    async fn has_permission(&self, principal: &Principal, permission: &str) -> bool {
        self.allow_all
            || self
                .grants
                .get(&principal.id)
                .map(|perms| perms.contains(permission))
                .unwrap_or(false)
    }
}
