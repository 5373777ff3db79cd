use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn, Instrument};

use crate::batch::{BatchPolicy, BatchTransitionResult, EntityOutcome};
use crate::coordinator::audit::AuditRecord;
use crate::coordinator::transition::{CoordinationOptions, TransitionCoordinator};
use crate::errors::TransitionError;
use crate::locking::{canonical_lock_order, LeaseGuard};
use crate::machine::state_machine::StateMachine;
use crate::machine::types::{State, TransitionContext};
use crate::observability::OperationTimer;
use crate::telemetry::generate_correlation_id;

/// Entity written inside the shared transaction of an atomic batch
struct Applied<'a> {
    machine: &'a StateMachine,
    from: State,
    target: &'a State,
    warnings: Vec<String>,
}

/// Entity that stopped an atomic batch, with the error to raise
struct Aborted<'a> {
    machine: &'a StateMachine,
    from: State,
    target: &'a State,
    error: TransitionError,
}

/// Raises a parallel batch's failure flag when dropped armed. A worker that
/// panics unwinds through it, so a panic stops submission like an error.
struct FailureFlag {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl FailureFlag {
    fn arm(flag: Arc<AtomicBool>) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FailureFlag {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Runs many `(state machine, target state)` pairs as one logical operation.
///
/// Every entity still goes through per-entity locking; the policy decides
/// how failures and concurrency are handled.
pub struct BatchCoordinator {
    coordinator: Arc<TransitionCoordinator>,
}

impl BatchCoordinator {
    pub fn new(coordinator: Arc<TransitionCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<TransitionCoordinator> {
        &self.coordinator
    }

    /// Move every machine to the same `target`
    pub async fn run_all(
        &self,
        machines: &[Arc<StateMachine>],
        target: &State,
        context: &TransitionContext,
        policy: BatchPolicy,
        options: &CoordinationOptions,
    ) -> Result<BatchTransitionResult, TransitionError> {
        let pairs: Vec<(Arc<StateMachine>, State)> = machines
            .iter()
            .map(|machine| (machine.clone(), target.clone()))
            .collect();
        self.run(&pairs, context, policy, options).await
    }

    pub async fn run(
        &self,
        pairs: &[(Arc<StateMachine>, State)],
        context: &TransitionContext,
        policy: BatchPolicy,
        options: &CoordinationOptions,
    ) -> Result<BatchTransitionResult, TransitionError> {
        if pairs.is_empty() {
            return Ok(BatchTransitionResult::empty());
        }

        let correlation_id = generate_correlation_id();
        let span = tracing::info_span!(
            "batch_transition",
            policy = ?policy,
            size = pairs.len(),
            correlation.id = %correlation_id,
            dry_run = context.dry_run()
        );

        let outcome = async {
            self.coordinator.metrics().record_batch();
            let timer = OperationTimer::new("batch_transition");

            let result = if context.dry_run() {
                Ok(self.run_dry(pairs, context).await)
            } else {
                match policy {
                    BatchPolicy::AtomicSequential => {
                        self.run_atomic(pairs, context, options, &correlation_id)
                            .await
                    }
                    BatchPolicy::BestEffortSequential => {
                        Ok(self.run_best_effort(pairs, context, options).await)
                    }
                    BatchPolicy::Parallel {
                        max_workers,
                        atomic,
                    } => {
                        self.run_parallel(pairs, context, options, max_workers, atomic)
                            .await
                    }
                }
            };

            let elapsed = timer.finish();
            let result = result.map(|mut r| {
                r.duration = elapsed;
                r
            });

            match &result {
                Ok(r) => info!(
                    total = r.total_count,
                    succeeded = r.success_count,
                    failed = r.failure_count,
                    "Batch transition finished"
                ),
                Err(e) => warn!(error = %e, "Batch transition aborted"),
            }
            if self.coordinator.stats_logging() {
                self.coordinator.metrics().log_stats();
            }
            result
        };

        outcome.instrument(span).await
    }

    async fn run_dry(
        &self,
        pairs: &[(Arc<StateMachine>, State)],
        context: &TransitionContext,
    ) -> BatchTransitionResult {
        let mut outcomes = Vec::with_capacity(pairs.len());
        for (machine, target) in pairs {
            let result = self.coordinator.validate_only(machine, target, context).await;
            outcomes.push(EntityOutcome::from_result(machine, result));
        }
        BatchTransitionResult::from_outcomes(outcomes, Default::default())
    }

    async fn run_best_effort(
        &self,
        pairs: &[(Arc<StateMachine>, State)],
        context: &TransitionContext,
        options: &CoordinationOptions,
    ) -> BatchTransitionResult {
        let mut outcomes = Vec::with_capacity(pairs.len());
        for (machine, target) in pairs {
            let outcome = match self
                .coordinator
                .coordinate(machine, target, context, options)
                .await
            {
                Ok(result) => EntityOutcome::from_result(machine, result),
                Err(e) => EntityOutcome::from_error(machine, &e),
            };
            outcomes.push(outcome);
        }
        BatchTransitionResult::from_outcomes(outcomes, Default::default())
    }

    async fn run_atomic(
        &self,
        pairs: &[(Arc<StateMachine>, State)],
        context: &TransitionContext,
        options: &CoordinationOptions,
        correlation_id: &str,
    ) -> Result<BatchTransitionResult, TransitionError> {
        ensure_shared_storage(pairs)?;

        let started = Instant::now();
        let keys = canonical_lock_order(pairs.iter().map(|(m, _)| m.lock_key()));

        let mut guards = Vec::with_capacity(keys.len());
        let mut retries = 0;
        for key in &keys {
            match self.coordinator.acquire_with_retry(key, options).await {
                Ok((guard, key_retries)) => {
                    retries += key_retries;
                    guards.push(guard);
                }
                Err(e) => {
                    release_in_reverse(guards).await;
                    self.audit_lock_failure(pairs, key, &e, started, context, options, correlation_id)
                        .await;
                    return Err(e);
                }
            }
        }
        let lock_wait_ms = started.elapsed().as_millis() as u64;

        let applied = self.apply_in_one_transaction(pairs, context, options).await;

        let metrics = self.coordinator.metrics();
        let outcome = match applied {
            Ok(applied) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let mut outcomes = Vec::with_capacity(applied.len());
                for Applied {
                    machine,
                    from,
                    target,
                    warnings,
                } in applied
                {
                    let result = machine.finish(&from, target, context, warnings).await;
                    metrics.record_attempt();
                    metrics.record_success();
                    let record = AuditRecord::new(
                        machine.entity_kind(),
                        machine.entity_id(),
                        from,
                        target.clone(),
                        context,
                        machine.lock_key(),
                    )
                    .with_outcome(true, None)
                    .with_timing(duration_ms, lock_wait_ms, retries)
                    .with_isolation(options.isolation)
                    .with_correlation_id(correlation_id);
                    self.coordinator.emit_audit(&record).await;
                    outcomes.push(EntityOutcome::from_result(machine, result));
                }
                Ok(BatchTransitionResult::from_outcomes(outcomes, Default::default()))
            }
            Err(Aborted {
                machine,
                from,
                target,
                error,
            }) => {
                metrics.record_attempt();
                metrics.record_failure();
                let record = AuditRecord::new(
                    machine.entity_kind(),
                    machine.entity_id(),
                    from,
                    target.clone(),
                    context,
                    machine.lock_key(),
                )
                .with_outcome(false, Some(error.to_string()))
                .with_timing(started.elapsed().as_millis() as u64, lock_wait_ms, retries)
                .with_isolation(options.isolation)
                .with_correlation_id(correlation_id);
                self.coordinator.emit_audit(&record).await;
                Err(error)
            }
        };

        release_in_reverse(guards).await;
        outcome
    }

    /// Failure record for the entity whose lock could not be taken
    #[allow(clippy::too_many_arguments)]
    async fn audit_lock_failure(
        &self,
        pairs: &[(Arc<StateMachine>, State)],
        key: &str,
        error: &TransitionError,
        started: Instant,
        context: &TransitionContext,
        options: &CoordinationOptions,
        correlation_id: &str,
    ) {
        let metrics = self.coordinator.metrics();
        metrics.record_attempt();
        metrics.record_failure();

        let Some((machine, target)) = pairs.iter().find(|(m, _)| m.lock_key() == key) else {
            return;
        };
        let waited = started.elapsed().as_millis() as u64;
        let record = AuditRecord::new(
            machine.entity_kind(),
            machine.entity_id(),
            machine.current_state().await,
            target.clone(),
            context,
            key,
        )
        .with_outcome(false, Some(error.to_string()))
        .with_timing(waited, waited, options.max_attempts() - 1)
        .with_isolation(options.isolation)
        .with_correlation_id(correlation_id);
        self.coordinator.emit_audit(&record).await;
    }

    /// Validate and stage every pair inside one transaction opened on the
    /// shared storage. On failure every touched handle is restored and the
    /// staged writes are discarded with the transaction.
    async fn apply_in_one_transaction<'a>(
        &self,
        pairs: &'a [(Arc<StateMachine>, State)],
        context: &TransitionContext,
        options: &CoordinationOptions,
    ) -> Result<Vec<Applied<'a>>, Aborted<'a>> {
        let (first, first_target) = (pairs[0].0.as_ref(), &pairs[0].1);
        let mut tx = match first.storage().begin(options.isolation).await {
            Ok(tx) => tx,
            Err(e) => {
                return Err(Aborted {
                    machine: first,
                    from: first.current_state().await,
                    target: first_target,
                    error: TransitionError::storage("could not open a batch transaction", e),
                });
            }
        };

        let mut applied: Vec<Applied<'a>> = Vec::with_capacity(pairs.len());
        for (machine, target) in pairs {
            let machine = machine.as_ref();
            let from = machine.current_state().await;
            let validation = machine.validate_from(&from, target, context).await;

            let failure = if !validation.success {
                Some(
                    validation
                        .error
                        .clone()
                        .unwrap_or_else(|| "Transition validation failed".to_string()),
                )
            } else if let Err(e) = machine.write_state(target, tx.as_mut()).await {
                machine.restore(&from).await;
                Some(format!("failed to persist transition {from} -> {target}: {e}"))
            } else {
                None
            };

            if let Some(message) = failure {
                for done in applied.iter().rev() {
                    done.machine.restore(&done.from).await;
                }
                if let Err(e) = tx.rollback().await {
                    warn!(error = %e, "Rollback of batch transaction failed");
                }
                let error = TransitionError::BatchAborted {
                    entity_kind: machine.entity_kind().to_string(),
                    entity_id: machine.entity_id(),
                    message,
                    completed: applied.len(),
                };
                return Err(Aborted {
                    machine,
                    from,
                    target,
                    error,
                });
            }

            applied.push(Applied {
                machine,
                from,
                target,
                warnings: validation.warnings,
            });
        }

        if let Err(e) = tx.commit().await {
            for done in applied.iter().rev() {
                done.machine.restore(&done.from).await;
            }
            return Err(Aborted {
                machine: first,
                from: first.current_state().await,
                target: first_target,
                error: TransitionError::storage("failed to commit batch transaction", e),
            });
        }

        Ok(applied)
    }

    async fn run_parallel(
        &self,
        pairs: &[(Arc<StateMachine>, State)],
        context: &TransitionContext,
        options: &CoordinationOptions,
        max_workers: usize,
        atomic: bool,
    ) -> Result<BatchTransitionResult, TransitionError> {
        let pool = Arc::new(Semaphore::new(max_workers.max(1)));
        let failed = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(pairs.len());

        for (machine, target) in pairs {
            let permit = pool.clone().acquire_owned().await.map_err(|_| {
                TransitionError::StateTransition {
                    message: "batch worker pool closed".to_string(),
                    source: None,
                }
            })?;
            if atomic && failed.load(Ordering::SeqCst) {
                break;
            }

            let coordinator = self.coordinator.clone();
            let task_machine = machine.clone();
            let target = target.clone();
            let context = context.clone();
            let options = options.clone();
            let failed = failed.clone();

            let handle = tokio::spawn(
                async move {
                    let _permit = permit;
                    let flag = FailureFlag::arm(failed);
                    let result = coordinator
                        .coordinate(&task_machine, &target, &context, &options)
                        .await;
                    if result.is_ok() {
                        flag.disarm();
                    }
                    result
                }
                .in_current_span(),
            );
            handles.push((machine, handle));
        }

        let not_started = pairs.len() - handles.len();
        if not_started > 0 {
            warn!(not_started, "Batch failure cancelled work that had not started");
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (machine, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(result)) => EntityOutcome::from_result(machine, result),
                Ok(Err(e)) => EntityOutcome::from_error(machine, &e),
                Err(join_error) => {
                    EntityOutcome::failed(machine, format!("batch worker failed: {join_error}"))
                }
            };
            outcomes.push(outcome);
        }

        if atomic {
            if let Some(first_failure) = outcomes.iter().find(|o| !o.success) {
                return Err(TransitionError::BatchAborted {
                    entity_kind: first_failure.entity_kind.clone(),
                    entity_id: first_failure.entity_id.clone(),
                    message: first_failure.error.clone().unwrap_or_default(),
                    completed: outcomes.iter().filter(|o| o.success).count(),
                });
            }
        }

        Ok(BatchTransitionResult::from_outcomes(outcomes, Default::default()))
    }
}

/// An atomic batch has one transaction, so every machine must write to the
/// same storage backend
fn ensure_shared_storage(pairs: &[(Arc<StateMachine>, State)]) -> Result<(), TransitionError> {
    let Some((first, _)) = pairs.first() else {
        return Ok(());
    };
    let shared = pairs
        .iter()
        .all(|(machine, _)| Arc::ptr_eq(machine.storage(), first.storage()));
    if shared {
        return Ok(());
    }
    Err(TransitionError::StateTransition {
        message: "atomic batch spans more than one storage backend".to_string(),
        source: None,
    })
}

async fn release_in_reverse(guards: Vec<LeaseGuard>) {
    for guard in guards.into_iter().rev() {
        let key = guard.key().to_string();
        if let Err(e) = guard.release().await {
            warn!(key = %key, error = %e, "Failed to release batch lock");
        }
    }
}
