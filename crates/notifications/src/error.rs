//! Notification pipeline error types.

use order_store::StoreError;
use thiserror::Error;

/// Errors raised inside the background notification pipeline.
///
/// None of these reach the caller that created the order.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// The broker rejected a command or is unreachable.
    #[error("Broker error: {0}")]
    Broker(String),

    /// An ack/nack referenced a delivery the broker does not know about.
    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(u64),

    /// The mail transport failed to send.
    #[error("Mail transport error: {0}")]
    Mail(String),

    /// A payload could not be encoded or decoded.
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The outbox store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for notification operations.
pub type Result<T> = std::result::Result<T, NotificationError>;
