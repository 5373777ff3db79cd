// Concurrency-safe wrapper around one state machine execute call

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn, Instrument};

use crate::coordinator::audit::{AuditRecord, AuditSink};
use crate::coordinator::retry::RetryPolicy;
use crate::errors::TransitionError;
use crate::locking::{LeaseGuard, LockService};
use crate::machine::state_machine::StateMachine;
use crate::machine::types::{State, TransitionContext, TransitionResult};
use crate::observability::TransitionMetrics;
use crate::storage::IsolationLevel;
use crate::telemetry::{create_transition_span, generate_correlation_id};

/// Per-call locking and isolation knobs
#[derive(Debug, Clone)]
pub struct CoordinationOptions {
    /// How long an acquired lock is held before it expires on its own
    pub lock_timeout: Duration,
    /// How long one acquisition attempt waits for the lock
    pub blocking_timeout: Duration,
    pub isolation: Option<IsolationLevel>,
    /// Total acquisition attempts; values below 1 are treated as 1
    pub max_retries: u32,
}

impl Default for CoordinationOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            blocking_timeout: Duration::from_secs(5),
            isolation: None,
            max_retries: 3,
        }
    }
}

impl CoordinationOptions {
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeouts(mut self, lock_timeout: Duration, blocking_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self.blocking_timeout = blocking_timeout;
        self
    }

    pub(crate) fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Serializes transitions per entity through a [`LockService`], retries lock
/// contention with backoff, and writes one audit record per call.
pub struct TransitionCoordinator {
    locks: Arc<dyn LockService>,
    audit: Arc<dyn AuditSink>,
    retry: RetryPolicy,
    metrics: Arc<TransitionMetrics>,
    log_stats: bool,
}

impl TransitionCoordinator {
    pub fn new(locks: Arc<dyn LockService>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            locks,
            audit,
            retry: RetryPolicy::default(),
            metrics: Arc::new(TransitionMetrics::new()),
            log_stats: true,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<TransitionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Whether batch runs log a metrics summary when they finish
    pub fn with_stats_logging(mut self, enabled: bool) -> Self {
        self.log_stats = enabled;
        self
    }

    pub fn metrics(&self) -> &Arc<TransitionMetrics> {
        &self.metrics
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn locks(&self) -> &Arc<dyn LockService> {
        &self.locks
    }

    pub(crate) fn stats_logging(&self) -> bool {
        self.log_stats
    }

    /// Lock the entity, execute the transition, release, audit.
    ///
    /// A dry-run context is routed to [`Self::validate_only`]: no lock is
    /// taken and no audit record is written.
    pub async fn coordinate(
        &self,
        machine: &StateMachine,
        target: &State,
        context: &TransitionContext,
        options: &CoordinationOptions,
    ) -> Result<TransitionResult, TransitionError> {
        if context.dry_run() {
            let result = self.validate_only(machine, target, context).await;
            if !result.success {
                return Err(TransitionError::from_failed_result(&result));
            }
            return Ok(result);
        }

        let correlation_id = generate_correlation_id();
        let span = create_transition_span(
            "coordinate",
            machine.entity_kind(),
            &machine.entity_id(),
            target.as_str(),
            &correlation_id,
        );

        self.coordinate_locked(machine, target, context, options, &correlation_id)
            .instrument(span)
            .await
    }

    async fn coordinate_locked(
        &self,
        machine: &StateMachine,
        target: &State,
        context: &TransitionContext,
        options: &CoordinationOptions,
        correlation_id: &str,
    ) -> Result<TransitionResult, TransitionError> {
        self.metrics.record_attempt();
        let started = Instant::now();
        let key = machine.lock_key();

        let (guard, retries) = match self.acquire_with_retry(&key, options).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.metrics.record_failure();
                let waited = elapsed_ms(started);
                let record = AuditRecord::new(
                    machine.entity_kind(),
                    machine.entity_id(),
                    machine.current_state().await,
                    target.clone(),
                    context,
                    key,
                )
                .with_outcome(false, Some(e.to_string()))
                .with_timing(waited, waited, options.max_attempts() - 1)
                .with_isolation(options.isolation)
                .with_correlation_id(correlation_id);
                self.emit_audit(&record).await;
                return Err(e);
            }
        };
        let lock_wait_ms = elapsed_ms(started);

        // Read under the lock so the audit reflects what execute validated against
        let from = machine.current_state().await;
        let outcome = machine
            .execute_with_isolation(target, context, options.isolation)
            .await;

        if let Err(e) = guard.release().await {
            warn!(key = %key, error = %e, "Failed to release transition lock");
        }

        match &outcome {
            Ok(_) => self.metrics.record_success(),
            Err(_) => self.metrics.record_failure(),
        }

        let record = AuditRecord::new(
            machine.entity_kind(),
            machine.entity_id(),
            from,
            target.clone(),
            context,
            key,
        )
        .with_outcome(outcome.is_ok(), outcome.as_ref().err().map(|e| e.to_string()))
        .with_timing(elapsed_ms(started), lock_wait_ms, retries)
        .with_isolation(options.isolation)
        .with_correlation_id(correlation_id);
        self.emit_audit(&record).await;

        outcome
    }

    /// Validate a transition without locking, mutating or auditing
    pub async fn validate_only(
        &self,
        machine: &StateMachine,
        target: &State,
        context: &TransitionContext,
    ) -> TransitionResult {
        self.metrics.record_dry_run();
        let dry_run = context.as_dry_run();
        let result = machine.validate(target, &dry_run).await;
        debug!(
            entity_kind = %machine.entity_kind(),
            entity_id = %machine.entity_id(),
            to = %target,
            success = result.success,
            "Dry-run validation"
        );
        result
    }

    /// Acquire `key`, retrying lock failures with backoff.
    ///
    /// Returns the held lease and how many retries it took.
    pub(crate) async fn acquire_with_retry(
        &self,
        key: &str,
        options: &CoordinationOptions,
    ) -> Result<(LeaseGuard, u32), TransitionError> {
        let max_attempts = options.max_attempts();
        let mut attempt = 1;

        loop {
            match self
                .locks
                .acquire(key, options.lock_timeout, options.blocking_timeout)
                .await
            {
                Ok(lease) => {
                    debug!(key = %key, attempt, "Transition lock acquired");
                    return Ok((LeaseGuard::new(self.locks.clone(), lease), attempt - 1));
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        key = %key,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Lock acquisition failed, retrying"
                    );
                    self.metrics.record_lock_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.metrics.record_lock_failure();
                    error!(key = %key, attempts = attempt, error = %e, "Lock acquisition exhausted");
                    return Err(TransitionError::LockAcquisition {
                        key: key.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    /// Write an audit record; sink failures are logged and swallowed
    pub(crate) async fn emit_audit(&self, record: &AuditRecord) {
        if let Err(e) = self.audit.record(record).await {
            self.metrics.record_audit_failure();
            warn!(
                entity_kind = %record.entity_kind,
                entity_id = %record.entity_id,
                error = %e,
                "Failed to write audit record"
            );
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
