//! Shared fixtures for integration tests: the task lifecycle graph, entity
//! builders and a fully wired in-memory coordinator.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use transition_coordinator::{
    BatchCoordinator, EntityHandle, InMemoryAuditSink, InMemoryLockService, MemoryEntity,
    MemoryStorage, Principal, State, StateMachine, StaticPermissionOracle, TransitionContext,
    TransitionCoordinator, TransitionGraph, TransitionHooks, TransitionResult,
};

/// `{ASSIGNED: {INPROGRESS, STANDBY}, INPROGRESS: {COMPLETED}, COMPLETED: {}}`
pub fn task_graph() -> Arc<TransitionGraph> {
    Arc::new(
        TransitionGraph::builder()
            .transitions("ASSIGNED", ["INPROGRESS", "STANDBY"])
            .edge_requiring("INPROGRESS", "COMPLETED", ["task.complete"])
            .state("COMPLETED")
            .build()
            .expect("task graph is valid"),
    )
}

/// Business rule rejecting a fixed set of entity ids
pub struct RejectIds(pub HashSet<String>);

impl RejectIds {
    pub fn new<const N: usize>(ids: [&str; N]) -> Self {
        Self(ids.iter().map(|id| id.to_string()).collect())
    }
}

#[async_trait]
impl TransitionHooks for RejectIds {
    async fn validate_business_rules(
        &self,
        entity: &dyn EntityHandle,
        from: &State,
        to: &State,
        _context: &TransitionContext,
    ) -> TransitionResult {
        if self.0.contains(&entity.entity_id()) {
            return TransitionResult::rejected(
                from.clone(),
                to.clone(),
                format!("task {} is on hold", entity.entity_id()),
            );
        }
        TransitionResult::success(from.clone(), to.clone())
    }
}

/// Pre-transition hook that yields for a while, widening race windows
pub struct SlowHooks(pub Duration);

#[async_trait]
impl TransitionHooks for SlowHooks {
    async fn pre_transition(
        &self,
        _entity: &dyn EntityHandle,
        from: &State,
        to: &State,
        _context: &TransitionContext,
    ) -> TransitionResult {
        tokio::time::sleep(self.0).await;
        TransitionResult::success(from.clone(), to.clone())
    }
}

/// In-memory collaborators shared by every machine of a test
pub struct TaskWorld {
    pub graph: Arc<TransitionGraph>,
    pub storage: Arc<MemoryStorage>,
    pub oracle: Arc<StaticPermissionOracle>,
    pub locks: Arc<InMemoryLockService>,
    pub audit: Arc<InMemoryAuditSink>,
    pub coordinator: Arc<TransitionCoordinator>,
}

impl TaskWorld {
    pub fn new() -> Self {
        let locks = Arc::new(InMemoryLockService::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let coordinator = Arc::new(
            TransitionCoordinator::new(locks.clone(), audit.clone()).with_stats_logging(false),
        );
        Self {
            graph: task_graph(),
            storage: Arc::new(MemoryStorage::new()),
            oracle: Arc::new(StaticPermissionOracle::new().grant("lead", "task.complete")),
            locks,
            audit,
            coordinator,
        }
    }

    pub fn batch(&self) -> BatchCoordinator {
        BatchCoordinator::new(self.coordinator.clone())
    }

    pub fn task(&self, id: &str, initial: &str) -> (Arc<MemoryEntity>, Arc<StateMachine>) {
        let entity = Arc::new(MemoryEntity::new("task", id, initial));
        let machine = StateMachine::new(
            entity.clone(),
            self.graph.clone(),
            self.oracle.clone(),
            self.storage.clone(),
        );
        (entity, Arc::new(machine))
    }

    pub fn task_with_hooks(
        &self,
        id: &str,
        initial: &str,
        hooks: Arc<dyn TransitionHooks>,
    ) -> (Arc<MemoryEntity>, Arc<StateMachine>) {
        let entity = Arc::new(MemoryEntity::new("task", id, initial));
        let machine = StateMachine::new(
            entity.clone(),
            self.graph.clone(),
            self.oracle.clone(),
            self.storage.clone(),
        )
        .with_hooks(hooks);
        (entity, Arc::new(machine))
    }

    /// Five tasks in `ASSIGNED`, ids "1".."5", sharing `hooks`
    pub fn five_tasks(
        &self,
        hooks: Arc<dyn TransitionHooks>,
    ) -> (Vec<Arc<MemoryEntity>>, Vec<Arc<StateMachine>>) {
        (1..=5)
            .map(|i| self.task_with_hooks(&i.to_string(), "ASSIGNED", hooks.clone()))
            .unzip()
    }
}

pub fn lead() -> TransitionContext {
    TransitionContext::new(Principal::new("lead").with_tenant("acme"), "shift_start")
}

pub fn worker() -> TransitionContext {
    TransitionContext::new(Principal::new("worker").with_tenant("acme"), "shift_start")
}

pub async fn current_states(entities: &[Arc<MemoryEntity>]) -> Vec<String> {
    let mut states = Vec::with_capacity(entities.len());
    for entity in entities {
        states.push(entity.current_state().await.to_string());
    }
    states
}
