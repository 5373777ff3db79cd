// Tests for the generic state machine

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::mocks::*;
    use super::super::traits::*;
    use super::super::types::*;
    use super::super::{StateMachine, TransitionGraph};
    use crate::errors::ErrorKind;
    use crate::memory::{MemoryEntity, MemoryStorage, StaticPermissionOracle, TransactionEvent};
    use crate::storage::IsolationLevel;

    fn task_graph() -> Arc<TransitionGraph> {
        Arc::new(
            TransitionGraph::builder()
                .transitions("ASSIGNED", ["INPROGRESS", "STANDBY"])
                .edge_requiring("INPROGRESS", "COMPLETED", ["task.complete"])
                .edge("STANDBY", "ASSIGNED")
                .state("COMPLETED")
                .build()
                .unwrap(),
        )
    }

    struct Fixture {
        entity: Arc<MemoryEntity>,
        storage: Arc<MemoryStorage>,
        hooks: Arc<MockHooks>,
        machine: StateMachine,
    }

    fn fixture(initial: &str, oracle: Arc<dyn PermissionOracle>) -> Fixture {
        let entity = Arc::new(MemoryEntity::new("task", "42", initial));
        let storage = Arc::new(MemoryStorage::new());
        let hooks = Arc::new(MockHooks::new());
        let machine = StateMachine::new(entity.clone(), task_graph(), oracle, storage.clone())
            .with_hooks(hooks.clone());
        Fixture {
            entity,
            storage,
            hooks,
            machine,
        }
    }

    fn alice() -> TransitionContext {
        TransitionContext::new(Principal::new("alice"), "shift_start")
    }

    #[tokio::test]
    async fn test_validate_accepts_graph_edge() {
        let f = fixture("ASSIGNED", Arc::new(StaticPermissionOracle::new()));
        let result = f.machine.validate(&State::from("INPROGRESS"), &alice()).await;
        assert!(result.success);
        assert_eq!(result.from_state, "ASSIGNED");
        assert_eq!(result.to_state, "INPROGRESS");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_validate_rejects_non_edge_before_hooks() {
        let f = fixture("ASSIGNED", Arc::new(StaticPermissionOracle::allow_all()));
        let result = f.machine.validate(&State::from("COMPLETED"), &alice()).await;
        assert!(!result.success);
        assert_eq!(result.failure_kind, Some(FailureKind::InvalidTransition));
        assert!(f.hooks.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_permission_gating_with_mock_oracle() {
        let mut oracle = MockPermissionOracle::new();
        oracle
            .expect_has_permission()
            .withf(|principal, permission| principal.id == "alice" && permission == "task.complete")
            .times(1)
            .returning(|_, _| false);

        let f = fixture("INPROGRESS", Arc::new(oracle));
        let result = f.machine.validate(&State::from("COMPLETED"), &alice()).await;
        assert!(!result.success);
        assert_eq!(result.failure_kind, Some(FailureKind::PermissionDenied));
        assert_eq!(result.missing_permissions, vec!["task.complete".to_string()]);
    }

    #[tokio::test]
    async fn test_skip_permissions_bypasses_oracle() {
        let mut oracle = MockPermissionOracle::new();
        oracle.expect_has_permission().never();

        let f = fixture("INPROGRESS", Arc::new(oracle));
        let ctx = alice().with_skip_permissions();
        let result = f.machine.validate(&State::from("COMPLETED"), &ctx).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_missing_principal_reports_all_permissions() {
        let f = fixture("INPROGRESS", Arc::new(StaticPermissionOracle::allow_all()));
        let ctx = TransitionContext::system("nightly_close");
        // system() skips permissions; a principal-less context that does not skip them fails
        assert!(f.machine.validate(&State::from("COMPLETED"), &ctx).await.success);

        let anonymous = TransitionContext::anonymous("import");
        let result = f.machine.validate(&State::from("COMPLETED"), &anonymous).await;
        assert_eq!(result.missing_permissions, vec!["task.complete".to_string()]);
    }

    #[tokio::test]
    async fn test_business_rule_rejection_is_returned_not_raised() {
        let f = fixture("ASSIGNED", Arc::new(StaticPermissionOracle::new()));
        f.hooks.reject_business("INPROGRESS", "Checklist incomplete");
        let result = f.machine.validate(&State::from("INPROGRESS"), &alice()).await;
        assert!(!result.success);
        assert_eq!(result.failure_kind, Some(FailureKind::BusinessRule));
        assert_eq!(result.error.as_deref(), Some("Checklist incomplete"));
        // Pre-transition hook never ran
        assert_eq!(f.hooks.get_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_pre_hook_failure_gets_classified() {
        let f = fixture("ASSIGNED", Arc::new(StaticPermissionOracle::new()));
        f.hooks.reject_pre("STANDBY", "Standby requires a supervisor on site");
        let result = f.machine.validate(&State::from("STANDBY"), &alice()).await;
        assert_eq!(result.failure_kind, Some(FailureKind::PreTransition));
        assert_eq!(
            f.hooks.get_calls(),
            vec![
                HookCall::BusinessRules { from: "ASSIGNED".into(), to: "STANDBY".into() },
                HookCall::PreTransition { from: "ASSIGNED".into(), to: "STANDBY".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_hook_warnings_are_merged() {
        let f = fixture("ASSIGNED", Arc::new(StaticPermissionOracle::new()));
        f.hooks.warn_business("Late start");
        let result = f.machine.validate(&State::from("INPROGRESS"), &alice()).await;
        assert!(result.success);
        assert_eq!(result.warnings, vec!["Late start".to_string()]);
    }

    #[tokio::test]
    async fn test_validate_has_no_side_effects() {
        let f = fixture("ASSIGNED", Arc::new(StaticPermissionOracle::new()));
        for _ in 0..3 {
            f.machine.validate(&State::from("INPROGRESS"), &alice()).await;
        }
        assert_eq!(f.entity.current_state().await, "ASSIGNED");
        assert_eq!(f.entity.persist_count(), 0);
        assert!(f.storage.events().await.is_empty());
        assert!(f.machine.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_execute_applies_and_logs() {
        let f = fixture("ASSIGNED", Arc::new(StaticPermissionOracle::new()));
        let result = f
            .machine
            .execute_with_isolation(&State::from("INPROGRESS"), &alice(), Some(IsolationLevel::Serializable))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(f.entity.current_state().await, "INPROGRESS");
        assert_eq!(
            f.storage.persisted_state("task", "42").await,
            Some(State::from("INPROGRESS"))
        );
        assert_eq!(
            f.storage.events().await,
            vec![
                TransactionEvent::Begin(Some(IsolationLevel::Serializable)),
                TransactionEvent::Commit,
            ]
        );

        let history = f.machine.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].principal_id.as_deref(), Some("alice"));
        assert_eq!(history[0].reason, "shift_start");
    }

    #[tokio::test]
    async fn test_execute_raises_typed_errors() {
        let f = fixture("ASSIGNED", Arc::new(StaticPermissionOracle::new()));
        let err = f.machine.execute(&State::from("COMPLETED"), &alice()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);

        f.hooks.reject_business("INPROGRESS", "Missing permission slip from site manager");
        let err = f.machine.execute(&State::from("INPROGRESS"), &alice()).await.unwrap_err();
        // Message mentions "permission" but the kind comes from the hook
        assert_eq!(err.kind(), ErrorKind::StateTransition);
        assert_eq!(f.entity.current_state().await, "ASSIGNED");
    }

    #[tokio::test]
    async fn test_dry_run_matches_validate_and_does_not_mutate() {
        let f = fixture("ASSIGNED", Arc::new(StaticPermissionOracle::new()));
        let target = State::from("INPROGRESS");
        let validated = f.machine.validate(&target, &alice()).await;
        let dry = f.machine.execute(&target, &alice().as_dry_run()).await.unwrap();

        assert_eq!(dry.success, validated.success);
        assert_eq!(dry.from_state, validated.from_state);
        assert_eq!(dry.to_state, validated.to_state);
        assert_eq!(dry.error, validated.error);
        assert_eq!(f.entity.current_state().await, "ASSIGNED");
        assert!(f.storage.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_rolls_back_and_restores() {
        let f = fixture("ASSIGNED", Arc::new(StaticPermissionOracle::new()));
        f.entity.fail_persist(true);

        let err = f.machine.execute(&State::from("INPROGRESS"), &alice()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateTransition);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(f.entity.current_state().await, "ASSIGNED");
        assert_eq!(f.storage.persisted_state("task", "42").await, None);
        assert_eq!(
            f.storage.events().await,
            vec![TransactionEvent::Begin(None), TransactionEvent::Rollback]
        );
    }

    #[tokio::test]
    async fn test_commit_failure_restores_state() {
        let f = fixture("ASSIGNED", Arc::new(StaticPermissionOracle::new()));
        f.storage.fail_commit(true);
        let err = f.machine.execute(&State::from("INPROGRESS"), &alice()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateTransition);
        assert_eq!(f.entity.current_state().await, "ASSIGNED");
        // The staged write never became durable
        assert_eq!(f.storage.persisted_state("task", "42").await, None);
        assert!(f.machine.history().await.is_empty());
        assert!(f.hooks.get_calls().iter().all(|c| !matches!(c, HookCall::PostTransition { .. })));
    }

    #[tokio::test]
    async fn test_unavailable_storage_surfaces_as_state_transition_error() {
        let entity = Arc::new(MemoryEntity::new("task", "7", "ASSIGNED"));
        let machine = StateMachine::new(
            entity.clone(),
            task_graph(),
            Arc::new(StaticPermissionOracle::new()),
            Arc::new(UnavailableStorage),
        );
        let err = machine.execute(&State::from("INPROGRESS"), &alice()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateTransition);
        assert_eq!(entity.current_state().await, "ASSIGNED");
    }

    #[tokio::test]
    async fn test_post_hook_failure_does_not_roll_back() {
        let f = fixture("ASSIGNED", Arc::new(StaticPermissionOracle::new()));
        f.hooks.set_fail_post(true);
        let result = f.machine.execute(&State::from("INPROGRESS"), &alice()).await.unwrap();
        assert!(result.success);
        assert_eq!(f.entity.current_state().await, "INPROGRESS");
        assert!(result.warnings.iter().any(|w| w.contains("post-transition hook failed")));
    }

    #[tokio::test]
    async fn test_skip_validation_bypasses_graph() {
        let f = fixture("ASSIGNED", Arc::new(StaticPermissionOracle::new()));
        let ctx = alice().with_skip_validation();
        let result = f.machine.execute(&State::from("COMPLETED"), &ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.warnings, vec!["validation skipped".to_string()]);
        assert_eq!(f.entity.current_state().await, "COMPLETED");
    }

    #[tokio::test]
    async fn test_allowed_transitions_filters_by_permission() {
        let oracle = StaticPermissionOracle::new().grant("alice", "task.complete");
        let f = fixture("INPROGRESS", Arc::new(oracle));

        let all = f.machine.allowed_transitions(None).await;
        assert_eq!(all.len(), 1);

        let alice = Principal::new("alice");
        let bob = Principal::new("bob");
        assert!(f.machine.allowed_transitions(Some(&alice)).await.contains(&State::from("COMPLETED")));
        assert!(f.machine.allowed_transitions(Some(&bob)).await.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_and_can_transition() {
        let f = fixture("COMPLETED", Arc::new(StaticPermissionOracle::new()));
        assert!(f.machine.is_terminal().await);
        assert!(!f.machine.can_transition(&State::from("ASSIGNED"), &alice()).await);
        assert_eq!(f.machine.lock_key(), "transition:task:42");
    }
}
