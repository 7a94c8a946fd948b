use order_store::{FailedDeliveryOutcome, OutboxStore, StoreError};
use tracing::{debug, info, warn};

use crate::{Broker, DeadLetterReason, Result};

/// Tally of one dead-letter pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadLetterReport {
    /// Records with budget left, re-armed for another relay cycle.
    pub rearmed: usize,
    /// Records moved to `FailedToPublish`.
    pub failed: usize,
    /// Letters whose record was missing or already terminal.
    pub ignored: usize,
}

/// Charges dead-lettered deliveries to their outbox records.
///
/// Uses the same ceiling as broker redelivery: a record whose retry count
/// reaches it becomes `FailedToPublish` and is never retried again.
/// Rejected messages are charged the full ceiling since redelivering an
/// undecodable payload cannot succeed.
pub struct DeadLetterReconciler<S, B> {
    store: S,
    broker: B,
    ceiling: u32,
    batch_size: usize,
}

impl<S: OutboxStore, B: Broker> DeadLetterReconciler<S, B> {
    pub fn new(store: S, broker: B, ceiling: u32) -> Self {
        Self {
            store,
            broker,
            ceiling,
            batch_size: 100,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<DeadLetterReport> {
        let mut report = DeadLetterReport::default();
        let mut letters = self.broker.take_dead_letters(self.batch_size).await?.into_iter();

        while let Some(letter) = letters.next() {
            let outbox_id = letter.message.outbox_id;
            let attempts = match letter.reason {
                DeadLetterReason::Exhausted => letter.attempts,
                DeadLetterReason::Rejected(_) => self.ceiling,
            };

            match self
                .store
                .record_failed_delivery(outbox_id, attempts, self.ceiling)
                .await
            {
                Ok(FailedDeliveryOutcome::Rearmed { retry_count }) => {
                    info!(%outbox_id, retry_count, ceiling = self.ceiling, "Outbox record re-armed");
                    report.rearmed += 1;
                }
                Ok(FailedDeliveryOutcome::FailedToPublish { retry_count }) => {
                    warn!(
                        %outbox_id,
                        retry_count,
                        reason = ?letter.reason,
                        "Outbox record failed to publish, operator action required"
                    );
                    metrics::counter!("outbox_failed_to_publish_total").increment(1);
                    report.failed += 1;
                }
                Ok(FailedDeliveryOutcome::AlreadyTerminal(status)) => {
                    debug!(%outbox_id, %status, "Dead letter for terminal record ignored");
                    report.ignored += 1;
                }
                Err(StoreError::NotFound { .. }) => {
                    warn!(%outbox_id, "Dead letter references unknown outbox record");
                    report.ignored += 1;
                }
                Err(e) => {
                    // Keep the unprocessed letters for the next pass
                    let unprocessed: Vec<_> = std::iter::once(letter).chain(letters).collect();
                    self.broker.restore_dead_letters(unprocessed).await?;
                    return Err(e.into());
                }
            }
        }

        Ok(report)
    }
}
