// Transition Coordinator Library - concurrency-safe, pluggable state transitions
// This exposes the engine, its collaborator seams and in-memory reference implementations

pub mod batch;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod locking;
pub mod machine;
pub mod memory;
pub mod observability;
pub mod storage;
pub mod telemetry;

// Re-export key types for easy access
pub use batch::{BatchCoordinator, BatchPolicy, BatchTransitionResult, EntityOutcome};
pub use config::EngineConfig;
pub use coordinator::{
    sanitize_metadata, AuditError, AuditRecord, AuditSink, CoordinationOptions,
    InMemoryAuditSink, RetryPolicy, TracingAuditSink, TransitionCoordinator,
};
pub use errors::{ErrorKind, TransitionError};
pub use locking::{
    canonical_lock_order, lock_key, InMemoryLockService, Lease, LeaseGuard, LockError, LockService,
};
pub use machine::{
    EntityHandle, FailureKind, GraphError, Metadata, NoHooks, PermissionOracle, Principal,
    State, StateMachine, TransitionContext, TransitionGraph, TransitionGraphBuilder,
    TransitionHooks, TransitionRecord, TransitionResult,
};
pub use memory::{MemoryEntity, MemoryStorage, StaticPermissionOracle, TransactionEvent};
pub use observability::{MetricsSnapshot, OperationTimer, TransitionMetrics};
pub use storage::{
    IsolationLevel, NoopStorage, StateWrite, Storage, StorageError, StorageTransaction,
};
pub use telemetry::{create_transition_span, generate_correlation_id, init_telemetry};
