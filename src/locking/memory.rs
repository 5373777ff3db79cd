// Process-local lock service backed by a keyed registry

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{Lease, LockError, LockService};

#[derive(Debug)]
struct Holder {
    token: Uuid,
    expires_at: Instant,
}

/// Lock service for a single process. Expired holds are pruned by the next
/// acquire of any key.
#[derive(Debug, Default)]
pub struct InMemoryLockService {
    holders: Mutex<HashMap<String, Holder>>,
    released: Notify,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held by an unexpired lease
    pub async fn is_locked(&self, key: &str) -> bool {
        let holders = self.holders.lock().await;
        holders
            .get(key)
            .map(|h| h.expires_at > Instant::now())
            .unwrap_or(false)
    }

    pub async fn held_count(&self) -> usize {
        let now = Instant::now();
        let holders = self.holders.lock().await;
        holders.values().filter(|h| h.expires_at > now).count()
    }
}

fn saturating_deadline(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(
        &self,
        key: &str,
        hold_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<Lease, LockError> {
        let deadline = saturating_deadline(Instant::now(), wait_timeout);

        loop {
            // Register for release notifications before inspecting the registry
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut holders = self.holders.lock().await;
                let now = Instant::now();
                // Holds that expired without a release are dropped here
                holders.retain(|_, holder| holder.expires_at > now);
                let busy_until = holders
                    .get(key)
                    .map(|h| h.expires_at)
                    .filter(|expires_at| *expires_at > now);

                match busy_until {
                    None => {
                        let lease = Lease::new(key, hold_timeout);
                        holders.insert(
                            key.to_string(),
                            Holder {
                                token: lease.token,
                                expires_at: saturating_deadline(now, hold_timeout),
                            },
                        );
                        debug!(key = %key, token = %lease.token, "Lock acquired");
                        return Ok(lease);
                    }
                    Some(_) if now >= deadline => {
                        return Err(LockError::Timeout {
                            key: key.to_string(),
                            waited_ms: wait_timeout.as_millis() as u64,
                        });
                    }
                    Some(expires_at) => expires_at.min(deadline),
                }
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        let mut holders = self.holders.lock().await;
        match holders.get(&lease.key) {
            Some(holder) if holder.token == lease.token => {
                holders.remove(&lease.key);
                drop(holders);
                debug!(key = %lease.key, token = %lease.token, "Lock released");
                self.released.notify_waiters();
            }
            _ => {
                debug!(key = %lease.key, token = %lease.token, "Release of a lease that is no longer held");
            }
        }
        Ok(())
    }
}
