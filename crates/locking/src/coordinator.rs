use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{LockError, LockStore, Result};

/// Default lock TTL.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(3);

/// Shortest TTL the coordinator will write. A zero TTL expires on write.
pub const MIN_LOCK_TTL: Duration = Duration::from_millis(1);

/// Configuration for the lock coordinator.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a lock lives if its holder never releases it.
    pub ttl: Duration,
    /// Prefix applied to every key in the shared store.
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_LOCK_TTL,
            key_prefix: "lock:".to_string(),
        }
    }
}

/// Proof that a lock was acquired.
///
/// Hand it back to [`LockCoordinator::release`]. A guard dropped without an
/// explicit release (a cancelled request future, for example) schedules the
/// delete on the current runtime; if there is none, the TTL cleans up.
pub struct LockGuard {
    key: String,
    token: String,
    acquired_at: Instant,
    ttl: Duration,
    store: Arc<dyn LockStore>,
    released: bool,
}

impl LockGuard {
    /// The full key held in the store, prefix included.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Sentinel value written for this acquisition. Used for log correlation only.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn elapsed(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// True once the TTL has passed, meaning another caller may now hold the key.
    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.ttl
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            let key = std::mem::take(&mut self.key);
            handle.spawn(async move {
                if let Err(e) = store.delete(&key).await {
                    warn!(key = %key, error = %e, "Failed to release dropped lock, waiting for TTL");
                }
            });
        }
    }
}

/// Short-lived mutual exclusion keyed by resource.
///
/// At most one caller holds a key within its TTL. When the store is
/// unreachable acquisition fails closed with an error.
#[derive(Clone)]
pub struct LockCoordinator {
    store: Arc<dyn LockStore>,
    config: LockConfig,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn LockStore>, mut config: LockConfig) -> Self {
        if config.ttl < MIN_LOCK_TTL {
            warn!(ttl_ms = config.ttl.as_millis() as u64, "Lock TTL too short, raising to minimum");
            config.ttl = MIN_LOCK_TTL;
        }
        Self { store, config }
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Tries to take the lock for `key` without waiting.
    ///
    /// Returns `Ok(None)` when another caller holds it.
    #[tracing::instrument(skip(self))]
    pub async fn try_acquire(&self, key: &str) -> Result<Option<LockGuard>> {
        let full_key = format!("{}{}", self.config.key_prefix, key);
        let token = Uuid::new_v4().simple().to_string();

        match self
            .store
            .set_if_absent(&full_key, &token, self.config.ttl)
            .await
        {
            Ok(true) => {
                metrics::counter!("lock_acquire_total", "outcome" => "acquired").increment(1);
                debug!(key = %full_key, token = %token, "Lock acquired");
                Ok(Some(LockGuard {
                    key: full_key,
                    token,
                    acquired_at: Instant::now(),
                    ttl: self.config.ttl,
                    store: Arc::clone(&self.store),
                    released: false,
                }))
            }
            Ok(false) => {
                metrics::counter!("lock_acquire_total", "outcome" => "contended").increment(1);
                debug!(key = %full_key, "Lock held by another caller");
                Ok(None)
            }
            Err(e) => {
                metrics::counter!("lock_acquire_total", "outcome" => "error").increment(1);
                error!(key = %full_key, error = %e, "Lock store failure, refusing to acquire");
                Err(e)
            }
        }
    }

    /// Releases a lock by deleting its key unconditionally.
    ///
    /// If the critical section outlived the TTL the key may already belong to
    /// someone else; that is logged and counted but the delete still happens.
    #[tracing::instrument(skip(self, guard), fields(key = %guard.key))]
    pub async fn release(&self, mut guard: LockGuard) -> Result<()> {
        guard.released = true;

        let elapsed = guard.elapsed();
        if elapsed >= guard.ttl {
            metrics::counter!("lock_ttl_overrun_total").increment(1);
            warn!(
                token = %guard.token,
                elapsed_ms = elapsed.as_millis() as u64,
                ttl_ms = guard.ttl.as_millis() as u64,
                "Critical section outlived lock TTL"
            );
        }

        self.store.delete(&guard.key).await.inspect_err(|e| {
            error!(error = %e, "Failed to release lock, it will expire after its TTL");
        })
    }

    /// Runs `f` while holding the lock for `key`, releasing it afterwards.
    ///
    /// Returns `Ok(None)` without running `f` if the lock is held elsewhere.
    /// The lock is released whether `f` succeeds or fails; a release failure
    /// is logged and never masks the result of `f`.
    pub async fn with_lock<T, E, F, Fut>(&self, key: &str, f: F) -> std::result::Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<LockError>,
    {
        let Some(guard) = self.try_acquire(key).await? else {
            return Ok(None);
        };

        let result = f().await;
        let _ = self.release(guard).await;
        result.map(Some)
    }
}
