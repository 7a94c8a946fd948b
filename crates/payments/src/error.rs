//! Payment error types.

use order_store::StoreError;
use thiserror::Error;

/// Errors that can occur while registering or settling payments.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// The payment gateway could not be queried.
    #[error("Payment gateway error: {0}")]
    Gateway(String),

    /// The payment store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// No payment is registered under the gateway key.
    #[error("Unknown payment: {0}")]
    UnknownPayment(String),

    /// No order exists for the payment being registered.
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// The requested status change would move a payment backwards or out of
    /// a terminal state.
    #[error("Invalid payment transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl PaymentError {
    pub fn is_transient(&self) -> bool {
        match self {
            PaymentError::Gateway(_) => true,
            PaymentError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type for payment operations.
pub type Result<T> = std::result::Result<T, PaymentError>;
