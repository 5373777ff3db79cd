use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Transition engine counters
#[derive(Debug, Default)]
pub struct TransitionMetrics {
    pub attempted: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub dry_runs: AtomicU64,
    pub lock_retries: AtomicU64,
    pub lock_failures: AtomicU64,
    pub audit_failures: AtomicU64,
    pub batches: AtomicU64,
}

impl TransitionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dry_run(&self) {
        self.dry_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_retry(&self) {
        self.lock_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_failure(&self) {
        self.lock_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audit_failure(&self) {
        self.audit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dry_runs: self.dry_runs.load(Ordering::Relaxed),
            lock_retries: self.lock_retries.load(Ordering::Relaxed),
            lock_failures: self.lock_failures.load(Ordering::Relaxed),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.snapshot();
        info!(
            "Transition metrics: attempted={}, succeeded={}, failed={}, dry_runs={}, lock_retries={}, lock_failures={}, audit_failures={}, batches={}",
            stats.attempted,
            stats.succeeded,
            stats.failed,
            stats.dry_runs,
            stats.lock_retries,
            stats.lock_failures,
            stats.audit_failures,
            stats.batches
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dry_runs: u64,
    pub lock_retries: u64,
    pub lock_failures: u64,
    pub audit_failures: u64,
    pub batches: u64,
}

/// Time an operation and log its duration
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(self) -> Duration {
        let elapsed = self.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = elapsed.as_millis() as u64,
            "Operation completed"
        );
        elapsed
    }
}
