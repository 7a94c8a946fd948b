//! Message broker abstraction with at-least-once delivery.
//!
//! The in-memory broker implements redelivery as an explicit state machine:
//! each message carries an attempt count, a failed delivery is requeued with
//! exponential backoff, and once the attempt budget is spent the message is
//! moved to the dead-letter queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OutboxId;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{DEFAULT_DELIVERY_CEILING, NotificationError, Result};

/// A message as handed to the broker.
///
/// `outbox_id` travels outside the body so a message can be traced back to
/// its record even when the body cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub outbox_id: OutboxId,
    pub event_type: String,
    pub body: Vec<u8>,
}

/// Broker-assigned handle for one delivery of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub message: Message,
    /// 1-based delivery attempt for this message.
    pub attempt: u32,
}

/// Why a message ended up in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Every redelivery attempt was negatively acknowledged.
    Exhausted,
    /// The consumer rejected the message outright.
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: Message,
    /// Deliveries made before the message was dead-lettered.
    pub attempts: u32,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Bounded redelivery with exponential backoff.
#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    /// Total deliveries per message before it is dead-lettered.
    pub max_deliveries: u32,
    /// Delay before the second delivery; doubles on each further attempt.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RedeliveryPolicy {
    /// Redelivers immediately. Useful in tests.
    pub fn immediate(max_deliveries: u32) -> Self {
        Self {
            max_deliveries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before the delivery following `attempts` failed ones.
    pub fn backoff_after(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_deliveries: DEFAULT_DELIVERY_CEILING,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// At-least-once message broker with acknowledgements and dead-lettering.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueues a message. Returns once the broker has accepted it.
    async fn publish(&self, message: Message) -> Result<()>;

    /// Takes the next message that is ready for delivery, if any.
    async fn receive(&self) -> Result<Option<Delivery>>;

    /// Confirms a delivery; the message is removed.
    async fn ack(&self, tag: DeliveryTag) -> Result<()>;

    /// Reports a failed delivery; the message is redelivered after backoff or
    /// dead-lettered once its attempt budget is exhausted.
    async fn nack(&self, tag: DeliveryTag) -> Result<()>;

    /// Returns a delivery to the queue without charging it an attempt.
    ///
    /// For failures that say nothing about the message itself, such as the
    /// consumer losing its own store.
    async fn requeue(&self, tag: DeliveryTag) -> Result<()>;

    /// Sends a delivery straight to the dead-letter queue.
    async fn reject(&self, tag: DeliveryTag, reason: &str) -> Result<()>;

    /// Removes and returns up to `max` dead letters, oldest first.
    async fn take_dead_letters(&self, max: usize) -> Result<Vec<DeadLetter>>;

    /// Puts dead letters back at the front of the queue, e.g. after a failed
    /// reconciliation.
    async fn restore_dead_letters(&self, letters: Vec<DeadLetter>) -> Result<()>;
}

struct Queued {
    message: Message,
    attempts: u32,
    not_before: Instant,
}

#[derive(Default)]
struct BrokerState {
    ready: VecDeque<Queued>,
    in_flight: HashMap<DeliveryTag, (Message, u32)>,
    dead_letters: VecDeque<DeadLetter>,
    next_tag: u64,
}

/// In-process broker for tests and single-node deployments.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    policy: RedeliveryPolicy,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryBroker {
    pub fn new(policy: RedeliveryPolicy) -> Self {
        Self {
            state: Arc::default(),
            policy,
            unavailable: Arc::default(),
        }
    }

    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    /// Makes every subsequent call fail as if the broker were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages waiting for delivery, including those in backoff.
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn dead_letter_len(&self) -> usize {
        self.state.lock().await.dead_letters.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(NotificationError::Broker("broker unreachable".into()));
        }
        Ok(())
    }

    fn dead_letter(state: &mut BrokerState, message: Message, attempts: u32, reason: DeadLetterReason) {
        warn!(
            outbox_id = %message.outbox_id,
            attempts,
            reason = ?reason,
            "Message dead-lettered"
        );
        state.dead_letters.push_back(DeadLetter {
            message,
            attempts,
            reason,
            dead_lettered_at: Utc::now(),
        });
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(RedeliveryPolicy::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, message: Message) -> Result<()> {
        self.check_available()?;
        self.state.lock().await.ready.push_back(Queued {
            message,
            attempts: 0,
            not_before: Instant::now(),
        });
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        let now = Instant::now();
        let Some(pos) = state.ready.iter().position(|q| q.not_before <= now) else {
            return Ok(None);
        };
        let Some(queued) = state.ready.remove(pos) else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = DeliveryTag(state.next_tag);
        let attempt = queued.attempts + 1;
        state
            .in_flight
            .insert(tag, (queued.message.clone(), attempt));

        Ok(Some(Delivery {
            tag,
            message: queued.message,
            attempt,
        }))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&tag)
            .map(|_| ())
            .ok_or(NotificationError::UnknownDelivery(tag.0))
    }

    async fn nack(&self, tag: DeliveryTag) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let (message, attempts) = state
            .in_flight
            .remove(&tag)
            .ok_or(NotificationError::UnknownDelivery(tag.0))?;

        if attempts >= self.policy.max_deliveries {
            Self::dead_letter(&mut state, message, attempts, DeadLetterReason::Exhausted);
            return Ok(());
        }

        let delay = self.policy.backoff_after(attempts);
        debug!(outbox_id = %message.outbox_id, attempts, delay_ms = delay.as_millis() as u64, "Scheduling redelivery");
        state.ready.push_back(Queued {
            message,
            attempts,
            not_before: Instant::now() + delay,
        });
        Ok(())
    }

    async fn requeue(&self, tag: DeliveryTag) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let (message, attempt) = state
            .in_flight
            .remove(&tag)
            .ok_or(NotificationError::UnknownDelivery(tag.0))?;

        let delay = self.policy.backoff_after(1);
        debug!(outbox_id = %message.outbox_id, delay_ms = delay.as_millis() as u64, "Requeueing delivery uncharged");
        state.ready.push_back(Queued {
            message,
            attempts: attempt.saturating_sub(1),
            not_before: Instant::now() + delay,
        });
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, reason: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let (message, attempts) = state
            .in_flight
            .remove(&tag)
            .ok_or(NotificationError::UnknownDelivery(tag.0))?;

        Self::dead_letter(
            &mut state,
            message,
            attempts,
            DeadLetterReason::Rejected(reason.to_string()),
        );
        Ok(())
    }

    async fn take_dead_letters(&self, max: usize) -> Result<Vec<DeadLetter>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let n = max.min(state.dead_letters.len());
        Ok(state.dead_letters.drain(..n).collect())
    }

    async fn restore_dead_letters(&self, letters: Vec<DeadLetter>) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        for letter in letters.into_iter().rev() {
            state.dead_letters.push_front(letter);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message {
            outbox_id: OutboxId::new(),
            event_type: "OrderConfirmation".into(),
            body: b"{}".to_vec(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RedeliveryPolicy {
            max_deliveries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff_after(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_after(4), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn acked_message_is_gone() {
        let broker = InMemoryBroker::new(RedeliveryPolicy::immediate(5));
        broker.publish(message()).await.unwrap();

        let delivery = broker.receive().await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 1);
        broker.ack(delivery.tag).await.unwrap();

        assert!(broker.receive().await.unwrap().is_none());
        assert_eq!(broker.in_flight_len().await, 0);
    }

    #[tokio::test]
    async fn nacked_message_is_dead_lettered_after_max_deliveries() {
        let broker = InMemoryBroker::new(RedeliveryPolicy::immediate(3));
        let sent = message();
        broker.publish(sent.clone()).await.unwrap();

        for expected_attempt in 1..=3 {
            let delivery = broker.receive().await.unwrap().unwrap();
            assert_eq!(delivery.attempt, expected_attempt);
            broker.nack(delivery.tag).await.unwrap();
        }

        assert!(broker.receive().await.unwrap().is_none());
        let dead = broker.take_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].reason, DeadLetterReason::Exhausted);
        assert_eq!(dead[0].message, sent);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_waits_for_backoff() {
        let policy = RedeliveryPolicy {
            max_deliveries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        };
        let broker = InMemoryBroker::new(policy);
        broker.publish(message()).await.unwrap();

        let delivery = broker.receive().await.unwrap().unwrap();
        broker.nack(delivery.tag).await.unwrap();
        assert!(broker.receive().await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(1001)).await;
        let retry = broker.receive().await.unwrap().unwrap();
        assert_eq!(retry.attempt, 2);
    }

    #[tokio::test]
    async fn requeued_delivery_keeps_its_attempt_budget() {
        let broker = InMemoryBroker::new(RedeliveryPolicy::immediate(2));
        broker.publish(message()).await.unwrap();

        for _ in 0..5 {
            let delivery = broker.receive().await.unwrap().unwrap();
            assert_eq!(delivery.attempt, 1);
            broker.requeue(delivery.tag).await.unwrap();
        }

        let delivery = broker.receive().await.unwrap().unwrap();
        broker.nack(delivery.tag).await.unwrap();
        let retry = broker.receive().await.unwrap().unwrap();
        assert_eq!(retry.attempt, 2);
        assert_eq!(broker.dead_letter_len().await, 0);
    }

    #[tokio::test]
    async fn rejected_message_skips_remaining_attempts() {
        let broker = InMemoryBroker::new(RedeliveryPolicy::immediate(5));
        broker.publish(message()).await.unwrap();

        let delivery = broker.receive().await.unwrap().unwrap();
        broker.reject(delivery.tag, "undecodable").await.unwrap();

        let dead = broker.take_dead_letters(10).await.unwrap();
        assert_eq!(dead[0].attempts, 1);
        assert!(matches!(dead[0].reason, DeadLetterReason::Rejected(_)));
    }

    #[tokio::test]
    async fn unknown_tags_are_errors() {
        let broker = InMemoryBroker::default();
        assert!(matches!(
            broker.ack(DeliveryTag(99)).await,
            Err(NotificationError::UnknownDelivery(99))
        ));
    }

    #[tokio::test]
    async fn restored_dead_letters_keep_their_order() {
        let broker = InMemoryBroker::new(RedeliveryPolicy::immediate(1));
        for _ in 0..3 {
            broker.publish(message()).await.unwrap();
            let d = broker.receive().await.unwrap().unwrap();
            broker.nack(d.tag).await.unwrap();
        }

        let taken = broker.take_dead_letters(2).await.unwrap();
        let first = taken[0].message.outbox_id;
        broker.restore_dead_letters(taken).await.unwrap();

        let again = broker.take_dead_letters(3).await.unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(again[0].message.outbox_id, first);
    }
}
