use std::time::Duration;

use chrono::Utc;
use order_store::OutboxStore;
use tracing::info;

use crate::Result;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Published records older than this are deleted.
    pub retention: Duration,
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Deletes published outbox records past the retention cutoff.
///
/// `FailedToPublish` records are never purged.
pub struct OutboxPurger<S> {
    store: S,
    config: RetentionConfig,
}

impl<S: OutboxStore> OutboxPurger<S> {
    pub fn new(store: S, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(36500));
        let cutoff = Utc::now() - retention;

        let purged = self.store.purge_published_before(cutoff).await?;
        if purged > 0 {
            info!(purged, %cutoff, "Purged published outbox records");
            metrics::counter!("outbox_purged_total").increment(purged);
        }
        Ok(purged)
    }
}
