use std::time::Duration;

use chrono::Utc;
use order_store::{OutboxRecord, OutboxStore};
use tracing::{debug, error, info};

use crate::{Broker, Message, Result};

/// Configuration for the outbox relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How often the relay scans for pending records.
    pub interval: Duration,
    /// Maximum records claimed per cycle.
    pub batch_size: usize,
    /// A pending record relayed longer ago than this is published again.
    pub redispatch_after: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
            redispatch_after: Duration::from_secs(600),
        }
    }
}

/// Outcome of one relay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub claimed: usize,
    pub published: usize,
    /// Records handed back for the next cycle because the broker failed.
    pub released: usize,
}

/// Moves pending outbox records to the broker.
///
/// Records stay `Pending` after hand-off; the consumer marks them
/// `Published` once the notification has actually been sent.
pub struct OutboxRelay<S, B> {
    store: S,
    broker: B,
    config: RelayConfig,
}

impl<S: OutboxStore, B: Broker> OutboxRelay<S, B> {
    pub fn new(store: S, broker: B, config: RelayConfig) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Runs a single relay cycle.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<RelayReport> {
        let redispatch_after = chrono::Duration::from_std(self.config.redispatch_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let records = self
            .store
            .claim_pending(self.config.batch_size, Utc::now() - redispatch_after)
            .await?;

        let mut report = RelayReport {
            claimed: records.len(),
            ..RelayReport::default()
        };
        if records.is_empty() {
            debug!("No pending outbox records");
            return Ok(report);
        }

        let mut remaining = records.into_iter();
        while let Some(record) = remaining.next() {
            let outbox_id = record.id;
            match self.hand_off(record).await {
                Ok(()) => {
                    report.published += 1;
                    metrics::counter!("outbox_relayed_total").increment(1);
                }
                Err(e) => {
                    // The broker is most likely down; give the whole rest of the
                    // batch back rather than failing it record by record.
                    error!(%outbox_id, error = %e, "Broker hand-off failed, releasing batch");
                    for id in std::iter::once(outbox_id).chain(remaining.by_ref().map(|r| r.id)) {
                        self.store.release_claim(id).await?;
                        report.released += 1;
                    }
                    break;
                }
            }
        }

        info!(
            claimed = report.claimed,
            published = report.published,
            released = report.released,
            "Relay cycle finished"
        );
        Ok(report)
    }

    async fn hand_off(&self, record: OutboxRecord) -> Result<()> {
        let body = serde_json::to_vec(&record.payload)?;
        self.broker
            .publish(Message {
                outbox_id: record.id,
                event_type: record.event_type,
                body,
            })
            .await
    }
}
