//! Reliable delivery of order-confirmation notifications.
//!
//! Outbox records written with each order are moved to a message broker by
//! the [`OutboxRelay`]. The [`NotificationConsumer`] sends the email and marks
//! the record `Published` once delivery is confirmed. Failed deliveries are
//! redelivered by the broker up to a single ceiling, then dead-lettered; the
//! [`DeadLetterReconciler`] charges them to the record and eventually moves
//! it to `FailedToPublish`. Old published records are removed by the
//! [`OutboxPurger`].

pub mod broker;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod mail;
pub mod payload;
pub mod relay;
pub mod retention;

pub use broker::{
    Broker, DeadLetter, DeadLetterReason, Delivery, DeliveryTag, InMemoryBroker, Message,
    RedeliveryPolicy,
};
pub use consumer::{ConsumeOutcome, ConsumeReport, ConsumerConfig, NotificationConsumer};
pub use dead_letter::{DeadLetterReconciler, DeadLetterReport};
pub use error::{NotificationError, Result};
pub use mail::{Email, InMemoryMailTransport, LogMailTransport, MailTransport, compose_confirmation};
pub use payload::{ConfirmationLine, ORDER_CONFIRMATION_EVENT, OrderConfirmation};
pub use relay::{OutboxRelay, RelayConfig, RelayReport};
pub use retention::{OutboxPurger, RetentionConfig};

/// Default ceiling on delivery attempts per outbox record.
///
/// Shared by broker redelivery and dead-letter reconciliation so there is a
/// single bound on total attempts.
pub const DEFAULT_DELIVERY_CEILING: u32 = 5;
