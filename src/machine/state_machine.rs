// Generic state machine: validates and applies one transition for one entity

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::TransitionError;
use crate::locking::lock_key;
use crate::machine::graph::TransitionGraph;
use crate::machine::traits::{EntityHandle, NoHooks, PermissionOracle, TransitionHooks};
use crate::machine::types::{
    FailureKind, Principal, State, TransitionContext, TransitionRecord, TransitionResult,
};
use crate::storage::{IsolationLevel, Storage, StorageError, StorageTransaction};

/// Wraps one entity together with its kind's transition graph and hooks.
///
/// Validation runs in a fixed order: graph membership, permissions,
/// business rules, pre-transition hook. The first failure is returned as
/// data; only [`StateMachine::execute`] turns it into an error.
pub struct StateMachine {
    entity: Arc<dyn EntityHandle>,
    graph: Arc<TransitionGraph>,
    permissions: Arc<dyn PermissionOracle>,
    storage: Arc<dyn Storage>,
    hooks: Arc<dyn TransitionHooks>,
    history: Mutex<Vec<TransitionRecord>>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("entity_kind", &self.entity.entity_kind())
            .field("entity_id", &self.entity.entity_id())
            .finish_non_exhaustive()
    }
}

impl StateMachine {
    pub fn new(
        entity: Arc<dyn EntityHandle>,
        graph: Arc<TransitionGraph>,
        permissions: Arc<dyn PermissionOracle>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            entity,
            graph,
            permissions,
            storage,
            hooks: Arc::new(NoHooks),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn TransitionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn entity(&self) -> &Arc<dyn EntityHandle> {
        &self.entity
    }

    pub fn entity_kind(&self) -> &str {
        self.entity.entity_kind()
    }

    pub fn entity_id(&self) -> String {
        self.entity.entity_id()
    }

    pub fn graph(&self) -> &TransitionGraph {
        &self.graph
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Per-entity lock key, stable across processes
    pub fn lock_key(&self) -> String {
        lock_key(self.entity.entity_kind(), &self.entity.entity_id())
    }

    pub async fn current_state(&self) -> State {
        self.entity.current_state().await
    }

    pub async fn is_terminal(&self) -> bool {
        let current = self.entity.current_state().await;
        self.graph.is_terminal(&current)
    }

    /// Validate a transition to `target` without side effects
    pub async fn validate(&self, target: &State, context: &TransitionContext) -> TransitionResult {
        let from = self.entity.current_state().await;
        self.validate_from(&from, target, context).await
    }

    pub async fn can_transition(&self, target: &State, context: &TransitionContext) -> bool {
        self.validate(target, context).await.success
    }

    pub(crate) async fn validate_from(
        &self,
        from: &State,
        target: &State,
        context: &TransitionContext,
    ) -> TransitionResult {
        if context.skip_validation() {
            warn!(
                entity_kind = %self.entity_kind(),
                entity_id = %self.entity_id(),
                from = %from,
                to = %target,
                "Validation skipped for transition"
            );
            return TransitionResult::success(from.clone(), target.clone())
                .with_warning("validation skipped");
        }

        if !self.graph.is_edge(from, target) {
            debug!(from = %from, to = %target, "Rejected: not an edge of the transition graph");
            return TransitionResult::invalid(from.clone(), target.clone());
        }

        if !context.skip_permissions() {
            let required = self.graph.required_permissions(from, target);
            let missing = self.missing_permissions(context.principal(), required).await;
            if !missing.is_empty() {
                debug!(from = %from, to = %target, missing = ?missing, "Rejected: missing permissions");
                return TransitionResult::permission_denied(from.clone(), target.clone(), missing);
            }
        }

        let mut warnings = Vec::new();

        let business = self
            .hooks
            .validate_business_rules(self.entity.as_ref(), from, target, context)
            .await;
        if !business.success {
            return Self::hook_failure(business, from, target, FailureKind::BusinessRule);
        }
        warnings.extend(business.warnings);

        let pre = self
            .hooks
            .pre_transition(self.entity.as_ref(), from, target, context)
            .await;
        if !pre.success {
            return Self::hook_failure(pre, from, target, FailureKind::PreTransition);
        }
        warnings.extend(pre.warnings);

        TransitionResult::success(from.clone(), target.clone()).with_warnings(warnings)
    }

    fn hook_failure(
        mut result: TransitionResult,
        from: &State,
        target: &State,
        default_kind: FailureKind,
    ) -> TransitionResult {
        result.from_state = from.clone();
        result.to_state = target.clone();
        result.failure_kind.get_or_insert(default_kind);
        if result.error.is_none() {
            result.error = Some(match default_kind {
                FailureKind::PreTransition => "Pre-transition check failed".to_string(),
                _ => "Business rule validation failed".to_string(),
            });
        }
        debug!(from = %from, to = %target, error = ?result.error, "Rejected by hook");
        result
    }

    async fn missing_permissions(
        &self,
        principal: Option<&Principal>,
        required: &BTreeSet<String>,
    ) -> Vec<String> {
        let mut missing = Vec::new();
        for permission in required {
            let granted = match principal {
                Some(principal) => self.permissions.has_permission(principal, permission).await,
                None => false,
            };
            if !granted {
                missing.push(permission.clone());
            }
        }
        missing
    }

    /// Validate and apply a transition in its own storage transaction
    pub async fn execute(
        &self,
        target: &State,
        context: &TransitionContext,
    ) -> Result<TransitionResult, TransitionError> {
        self.execute_with_isolation(target, context, None).await
    }

    pub async fn execute_with_isolation(
        &self,
        target: &State,
        context: &TransitionContext,
        isolation: Option<IsolationLevel>,
    ) -> Result<TransitionResult, TransitionError> {
        let from = self.entity.current_state().await;
        let validation = self.validate_from(&from, target, context).await;
        if !validation.success {
            return Err(TransitionError::from_failed_result(&validation));
        }

        if context.dry_run() {
            return Ok(validation);
        }

        let mut tx = self
            .storage
            .begin(isolation)
            .await
            .map_err(|e| TransitionError::storage("could not open a storage transaction", e))?;

        if let Err(e) = self.write_state(target, tx.as_mut()).await {
            self.restore(&from).await;
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed after persist error");
            }
            return Err(TransitionError::storage(
                format!("failed to persist transition {from} -> {target}"),
                e,
            ));
        }

        if let Err(e) = tx.commit().await {
            self.restore(&from).await;
            return Err(TransitionError::storage(
                format!("failed to commit transition {from} -> {target}"),
                e,
            ));
        }

        Ok(self.finish(&from, target, context, validation.warnings).await)
    }

    /// States reachable from the current one, filtered by the principal's
    /// permissions when a principal is given
    pub async fn allowed_transitions(&self, principal: Option<&Principal>) -> BTreeSet<State> {
        let current = self.entity.current_state().await;
        let mut allowed = BTreeSet::new();
        for target in self.graph.allowed_from(&current) {
            if let Some(principal) = principal {
                let required = self.graph.required_permissions(&current, target);
                if !self.missing_permissions(Some(principal), required).await.is_empty() {
                    continue;
                }
            }
            allowed.insert(target.clone());
        }
        allowed
    }

    /// Transitions executed through this machine, oldest first
    pub async fn history(&self) -> Vec<TransitionRecord> {
        self.history.lock().await.clone()
    }

    /// Set the new state and stage it in `tx`
    pub(crate) async fn write_state(
        &self,
        target: &State,
        tx: &mut dyn StorageTransaction,
    ) -> Result<(), StorageError> {
        self.entity.set_state(target.clone()).await;
        self.entity.persist(tx).await
    }

    /// Put the handle back to `from` after a rolled-back write. The staged
    /// write itself is discarded by the transaction.
    pub(crate) async fn restore(&self, from: &State) {
        self.entity.set_state(from.clone()).await;
    }

    /// Post-commit bookkeeping: observer hook, transition log, success result
    pub(crate) async fn finish(
        &self,
        from: &State,
        target: &State,
        context: &TransitionContext,
        mut warnings: Vec<String>,
    ) -> TransitionResult {
        if let Err(e) = self
            .hooks
            .post_transition(self.entity.as_ref(), from, target, context)
            .await
        {
            warn!(
                entity_kind = %self.entity_kind(),
                entity_id = %self.entity_id(),
                error = %e,
                "Post-transition hook failed; state change stands"
            );
            warnings.push(format!("post-transition hook failed: {e}"));
        }

        self.history.lock().await.push(TransitionRecord {
            from_state: from.clone(),
            to_state: target.clone(),
            principal_id: context.principal_id().map(str::to_string),
            reason: context.reason().to_string(),
            at: Utc::now(),
        });

        info!(
            entity_kind = %self.entity_kind(),
            entity_id = %self.entity_id(),
            from = %from,
            to = %target,
            principal = context.principal_id().unwrap_or("system"),
            reason = %context.reason(),
            "State transition committed"
        );

        TransitionResult::success(from.clone(), target.clone()).with_warnings(warnings)
    }
}
