use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// A shared key-value store with atomic set-if-absent and expiry.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Sets `key` to `value` with the given TTL only if the key is absent.
    ///
    /// Returns true iff this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Removes `key` regardless of its value.
    async fn delete(&self, key: &str) -> Result<()>;
}
