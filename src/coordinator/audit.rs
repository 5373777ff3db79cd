// Audit trail for coordinated transitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::machine::types::{Metadata, State, TransitionContext};
use crate::storage::IsolationLevel;

/// Metadata keys containing any of these fragments never reach an audit sink
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &["password", "token", "api_key", "secret", "ssn"];

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink failed: {0}")]
    Sink(String),
}

/// One completed coordinated call, written once and never mutated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub entity_kind: String,
    pub entity_id: String,
    pub from_state: State,
    pub to_state: State,
    pub principal_id: Option<String>,
    pub reason: String,
    pub comments: Option<String>,
    pub metadata: Metadata,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub lock_wait_ms: u64,
    pub retry_count: u32,
    pub lock_key: String,
    pub isolation_level: Option<IsolationLevel>,
    pub correlation_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Start a record from the call's context. Metadata is sanitized here.
    pub fn new(
        entity_kind: impl Into<String>,
        entity_id: impl Into<String>,
        from_state: State,
        to_state: State,
        context: &TransitionContext,
        lock_key: impl Into<String>,
    ) -> Self {
        Self {
            entity_kind: entity_kind.into(),
            entity_id: entity_id.into(),
            from_state,
            to_state,
            principal_id: context.principal_id().map(str::to_string),
            reason: context.reason().to_string(),
            comments: context.comments().map(str::to_string),
            metadata: sanitize_metadata(context.metadata()),
            success: false,
            error: None,
            duration_ms: 0,
            lock_wait_ms: 0,
            retry_count: 0,
            lock_key: lock_key.into(),
            isolation_level: None,
            correlation_id: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_outcome(mut self, success: bool, error: Option<String>) -> Self {
        self.success = success;
        self.error = error;
        self
    }

    pub fn with_timing(mut self, duration_ms: u64, lock_wait_ms: u64, retry_count: u32) -> Self {
        self.duration_ms = duration_ms;
        self.lock_wait_ms = lock_wait_ms;
        self.retry_count = retry_count;
        self
    }

    pub fn with_isolation(mut self, isolation: Option<IsolationLevel>) -> Self {
        self.isolation_level = isolation;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Durable destination for audit records.
///
/// Failures are reported to the coordinator, which logs and swallows them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Writes audit records as structured events on the `audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        info!(
            target: "audit",
            entity_kind = %record.entity_kind,
            entity_id = %record.entity_id,
            from = %record.from_state,
            to = %record.to_state,
            principal = record.principal_id.as_deref().unwrap_or("system"),
            reason = %record.reason,
            success = record.success,
            error = record.error.as_deref(),
            duration_ms = record.duration_ms,
            lock_wait_ms = record.lock_wait_ms,
            retry_count = record.retry_count,
            lock_key = %record.lock_key,
            isolation = record.isolation_level.map(|level| level.as_sql()),
            correlation_id = record.correlation_id.as_deref(),
            metadata = ?record.metadata,
            "Transition audited"
        );
        Ok(())
    }
}

/// Keeps records in memory; can be switched into a failing mode
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    failing: AtomicBool,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Sink("audit store unavailable".to_string()));
        }
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// Copy of `metadata` with secret-looking keys removed at every depth
pub fn sanitize_metadata(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .filter(|(key, _)| !is_sensitive_key(key))
        .map(|(key, value)| (key.clone(), sanitize_value(value)))
        .collect()
}

fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !is_sensitive_key(key))
                .map(|(key, value)| (key.clone(), sanitize_value(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        other => other.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| key.contains(fragment))
}
