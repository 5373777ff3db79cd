// Traits for dependency injection - the engine only sees entities, permissions
// and hooks through these seams

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::machine::types::{Principal, State, TransitionContext, TransitionResult};
use crate::storage::{StorageError, StorageTransaction};

/// Handle onto one domain entity whose lifecycle state the engine governs.
///
/// Implemented per entity kind; the engine never looks past these methods.
#[async_trait]
pub trait EntityHandle: Send + Sync {
    /// Entity kind name, e.g. `"task"` or `"work_order"`
    fn entity_kind(&self) -> &str;

    /// Stable identifier used for lock keys and audit records
    fn entity_id(&self) -> String;

    async fn current_state(&self) -> State;

    async fn set_state(&self, state: State);

    /// Stage the entity's current state in `tx`. Nothing is durable until
    /// the transaction commits.
    async fn persist(&self, tx: &mut dyn StorageTransaction) -> Result<(), StorageError>;
}

/// Answers whether a principal holds a named capability
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PermissionOracle: Send + Sync {
    async fn has_permission(&self, principal: &Principal, permission: &str) -> bool;
}

/// Domain-specific checks and observers around a transition.
///
/// Every method has a pass-through default, so implementors override only
/// what their entity kind needs.
#[async_trait]
pub trait TransitionHooks: Send + Sync {
    /// Business-rule validation; runs after the graph and permission checks
    async fn validate_business_rules(
        &self,
        _entity: &dyn EntityHandle,
        from: &State,
        to: &State,
        _context: &TransitionContext,
    ) -> TransitionResult {
        TransitionResult::success(from.clone(), to.clone())
    }

    /// Last validation step before the state is written
    async fn pre_transition(
        &self,
        _entity: &dyn EntityHandle,
        from: &State,
        to: &State,
        _context: &TransitionContext,
    ) -> TransitionResult {
        TransitionResult::success(from.clone(), to.clone())
    }

    /// Observer invoked after the new state is committed. Errors are logged,
    /// never rolled back.
    async fn post_transition(
        &self,
        _entity: &dyn EntityHandle,
        _from: &State,
        _to: &State,
        _context: &TransitionContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that accept every transition
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

#[async_trait]
impl TransitionHooks for NoHooks {}
