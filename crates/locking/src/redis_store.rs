use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::{LockError, LockStore, Result};

/// Default bound on a single Redis round trip.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(250);

/// Redis-backed lock store using `SET key value NX PX ttl` and `DEL`.
///
/// Every call is bounded by a timeout; a slow or unreachable server surfaces
/// as an error and is never treated as a successful acquire.
#[derive(Clone)]
pub struct RedisLockStore {
    client: redis::Client,
    op_timeout: Duration,
}

impl RedisLockStore {
    /// Creates a store for the given `redis://` URL. Does not connect yet.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            op_timeout: DEFAULT_OP_TIMEOUT,
        })
    }

    /// Overrides the per-command timeout.
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.op_timeout, op).await {
            Ok(result) => result.map_err(LockError::from),
            Err(_) => Err(LockError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let reply: Option<String> = self
            .bounded(async {
                let mut conn = self.client.get_multiplexed_async_connection().await?;
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        // SET NX replies "OK" on success and nil when the key already exists
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _removed: i64 = self
            .bounded(async {
                let mut conn = self.client.get_multiplexed_async_connection().await?;
                redis::cmd("DEL").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }
}
