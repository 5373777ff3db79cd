// Per-entity lock leases: the contract, key derivation and release-on-drop

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub use memory::InMemoryLockService;

/// Errors raised by a lock service
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited_ms}ms waiting for lock '{key}'")]
    Timeout { key: String, waited_ms: u64 },

    #[error("lock backend error: {0}")]
    Backend(String),
}

/// A time-bounded, exclusive hold on one lock key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    /// Distinguishes this hold from later holds of the same key
    pub token: Uuid,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(key: impl Into<String>, hold_timeout: Duration) -> Self {
        let acquired_at = Utc::now();
        let expires_at = chrono::Duration::from_std(hold_timeout)
            .ok()
            .and_then(|hold| acquired_at.checked_add_signed(hold))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key: key.into(),
            token: Uuid::new_v4(),
            owner: lease_owner().to_string(),
            acquired_at,
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Named, mutually exclusive, time-bounded leases.
///
/// `wait_timeout` bounds how long `acquire` blocks; `hold_timeout` bounds
/// how long a lease lives before it expires on its own.
#[async_trait]
pub trait LockService: Send + Sync {
    async fn acquire(
        &self,
        key: &str,
        hold_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<Lease, LockError>;

    /// Idempotent. Releasing an expired or already released lease is a no-op.
    async fn release(&self, lease: &Lease) -> Result<(), LockError>;
}

/// Deterministic lock key for one entity, identical across processes
pub fn lock_key(entity_kind: &str, entity_id: &str) -> String {
    format!("transition:{}:{}", entity_kind.to_lowercase(), entity_id)
}

/// The one acquisition order for multi-entity locking: lexicographic,
/// duplicates removed. Every caller locking several keys must use it.
pub fn canonical_lock_order<I>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut keys: Vec<String> = keys.into_iter().collect();
    keys.sort();
    keys.dedup();
    keys
}

/// `<hostname>:<pid>` of this process
pub fn lease_owner() -> &'static str {
    static OWNER: std::sync::LazyLock<String> = std::sync::LazyLock::new(|| {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".to_string());
        format!("{}:{}", host, std::process::id())
    });
    &OWNER
}

/// Holds a lease and guarantees it is released.
///
/// Call [`LeaseGuard::release`] on the normal path. If the guard is dropped
/// while still holding (panic, cancelled future), the release is spawned on
/// the current tokio runtime; outside a runtime the lease simply expires.
pub struct LeaseGuard {
    service: Arc<dyn LockService>,
    lease: Lease,
    released: bool,
}

impl LeaseGuard {
    pub fn new(service: Arc<dyn LockService>, lease: Lease) -> Self {
        Self {
            service,
            lease,
            released: false,
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn key(&self) -> &str {
        &self.lease.key
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.service.release(&self.lease).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let service = self.service.clone();
        let lease = self.lease.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(key = %lease.key, "Releasing lease from drop");
                handle.spawn(async move {
                    if let Err(e) = service.release(&lease).await {
                        warn!(key = %lease.key, error = %e, "Failed to release dropped lease");
                    }
                });
            }
            Err(_) => {
                warn!(
                    key = %lease.key,
                    expires_at = %lease.expires_at,
                    "Lease dropped outside a runtime; it will expire on its own"
                );
            }
        }
    }
}
