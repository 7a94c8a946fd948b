use std::time::Duration;

use order_store::{OutboxStatus, OutboxStore};
use tracing::{debug, info, warn};

use crate::mail::compose_confirmation;
use crate::{Broker, Delivery, MailTransport, OrderConfirmation, Result};

/// Configuration for the notification consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// How often the consumer polls the broker when idle.
    pub poll_interval: Duration,
    /// Maximum deliveries handled per poll.
    pub max_batch: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            max_batch: 50,
        }
    }
}

/// What the consumer did with a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The email was sent and this delivery moved the record to `Published`.
    Delivered,
    /// The record was already published; acknowledged without side effects
    /// counted as done.
    Duplicate,
    /// The record is gone or terminally failed; acknowledged and dropped.
    Skipped,
    /// The send failed; the broker will redeliver or dead-letter it.
    Retrying { attempt: u32 },
    /// The payload could not be decoded and was dead-lettered.
    Rejected,
}

/// Tally of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub delivered: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub retrying: usize,
    pub rejected: usize,
}

impl ConsumeReport {
    pub fn handled(&self) -> usize {
        self.delivered + self.duplicates + self.skipped + self.retrying + self.rejected
    }

    fn record(&mut self, outcome: ConsumeOutcome) {
        match outcome {
            ConsumeOutcome::Delivered => self.delivered += 1,
            ConsumeOutcome::Duplicate => self.duplicates += 1,
            ConsumeOutcome::Skipped => self.skipped += 1,
            ConsumeOutcome::Retrying { .. } => self.retrying += 1,
            ConsumeOutcome::Rejected => self.rejected += 1,
        }
    }
}

/// Receives relayed outbox messages and sends the confirmation email.
///
/// Delivery is at-least-once, so the same message may arrive several times.
/// Only the delivery whose conditional `Pending -> Published` update succeeds
/// counts as done.
pub struct NotificationConsumer<S, B, M> {
    store: S,
    broker: B,
    mail: M,
    config: ConsumerConfig,
}

impl<S, B, M> NotificationConsumer<S, B, M>
where
    S: OutboxStore,
    B: Broker,
    M: MailTransport,
{
    pub fn new(store: S, broker: B, mail: M, config: ConsumerConfig) -> Self {
        Self {
            store,
            broker,
            mail,
            config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Drains up to `max_batch` ready deliveries.
    pub async fn poll_once(&self) -> Result<ConsumeReport> {
        let mut report = ConsumeReport::default();
        for _ in 0..self.config.max_batch {
            let Some(delivery) = self.broker.receive().await? else {
                break;
            };
            report.record(self.handle(delivery).await?);
        }
        if report.handled() > 0 {
            debug!(?report, "Consumer poll finished");
        }
        Ok(report)
    }

    /// Handles one delivery and settles it with the broker.
    #[tracing::instrument(skip(self, delivery), fields(outbox_id = %delivery.message.outbox_id, attempt = delivery.attempt))]
    pub async fn handle(&self, delivery: Delivery) -> Result<ConsumeOutcome> {
        let confirmation = match OrderConfirmation::decode(&delivery.message.body) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Undecodable payload, dead-lettering");
                metrics::counter!("notification_failures_total", "kind" => "poison").increment(1);
                self.broker.reject(delivery.tag, &e.to_string()).await?;
                return Ok(ConsumeOutcome::Rejected);
            }
        };

        let outbox_id = delivery.message.outbox_id;
        match self.store.get_outbox_record(outbox_id).await {
            Ok(Some(record)) if record.status == OutboxStatus::Pending => {}
            Ok(Some(record)) if record.status == OutboxStatus::Published => {
                debug!("Record already published, acknowledging duplicate");
                metrics::counter!("notifications_duplicate_total").increment(1);
                self.broker.ack(delivery.tag).await?;
                return Ok(ConsumeOutcome::Duplicate);
            }
            Ok(record) => {
                warn!(
                    status = ?record.map(|r| r.status),
                    "Record missing or terminally failed, dropping delivery"
                );
                self.broker.ack(delivery.tag).await?;
                return Ok(ConsumeOutcome::Skipped);
            }
            Err(e) => {
                // Status unknown and nothing was attempted: hand it back
                // without spending the message's delivery budget.
                warn!(error = %e, "Outbox store unreadable, requeueing delivery");
                self.broker.requeue(delivery.tag).await?;
                return Err(e.into());
            }
        }

        let email = compose_confirmation(&confirmation);
        if let Err(e) = self.mail.send(&email).await {
            warn!(error = %e, "Mail transport failed, leaving delivery unacknowledged");
            metrics::counter!("notification_failures_total", "kind" => "transport").increment(1);
            self.broker.nack(delivery.tag).await?;
            return Ok(ConsumeOutcome::Retrying {
                attempt: delivery.attempt,
            });
        }

        let published = match self.store.mark_published(outbox_id).await {
            Ok(published) => published,
            Err(e) => {
                // The email went out but the record could not be updated; the
                // redelivery may send it again, which is tolerated.
                self.broker.nack(delivery.tag).await?;
                return Err(e.into());
            }
        };
        self.broker.ack(delivery.tag).await?;

        if published {
            info!(order_id = %confirmation.order_id, "Order confirmation delivered");
            metrics::counter!("notifications_sent_total").increment(1);
            Ok(ConsumeOutcome::Delivered)
        } else {
            debug!("Concurrent delivery published first");
            metrics::counter!("notifications_duplicate_total").increment(1);
            Ok(ConsumeOutcome::Duplicate)
        }
    }
}
