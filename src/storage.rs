// Storage transaction contract used to bracket state writes

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::machine::types::State;

/// Errors raised by a storage backend while persisting a transition
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("write conflict on {0}")]
    Conflict(String),

    #[error("transaction already finished")]
    Closed,
}

/// Transaction isolation level requested for a coordinated transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling, e.g. for `SET TRANSACTION ISOLATION LEVEL ...`
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// One entity's new state, staged inside a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateWrite {
    pub entity_kind: String,
    pub entity_id: String,
    pub state: State,
}

impl StateWrite {
    pub fn new(entity_kind: impl Into<String>, entity_id: impl Into<String>, state: State) -> Self {
        Self {
            entity_kind: entity_kind.into(),
            entity_id: entity_id.into(),
            state,
        }
    }
}

/// Opens transactions that scope the state write of one or more transitions.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Begin a transaction, optionally at a specific isolation level
    async fn begin(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> Result<Box<dyn StorageTransaction>, StorageError>;
}

/// An open storage transaction. Consumed by `commit` or `rollback`.
///
/// Writes staged with [`StorageTransaction::write`] become durable on
/// `commit` and are discarded on `rollback` or a failed commit.
#[async_trait]
pub trait StorageTransaction: Send {
    async fn write(&mut self, write: StateWrite) -> Result<(), StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Storage that accepts and discards every write, for hosts that keep
/// lifecycle state only in their entity handles
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

struct NoopTransaction;

#[async_trait]
impl Storage for NoopStorage {
    async fn begin(
        &self,
        _isolation: Option<IsolationLevel>,
    ) -> Result<Box<dyn StorageTransaction>, StorageError> {
        Ok(Box::new(NoopTransaction))
    }
}

#[async_trait]
impl StorageTransaction for NoopTransaction {
    async fn write(&mut self, _write: StateWrite) -> Result<(), StorageError> {
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_sql_names() {
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::ReadCommitted.to_string(), "READ COMMITTED");
    }

    #[tokio::test]
    async fn test_noop_storage_commits_and_rolls_back() {
        let storage = NoopStorage;
        let mut tx = storage.begin(Some(IsolationLevel::RepeatableRead)).await.unwrap();
        tx.write(StateWrite::new("task", "1", State::from("INPROGRESS")))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        let tx = storage.begin(None).await.unwrap();
        tx.rollback().await.unwrap();
    }
}
