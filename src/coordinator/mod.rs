// Coordinator module - per-entity locking, lock retry and audit around
// state machine execution

pub mod audit;
pub mod retry;
pub mod transition;

pub use audit::{sanitize_metadata, AuditError, AuditRecord, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use retry::RetryPolicy;
pub use transition::{CoordinationOptions, TransitionCoordinator};
