//! Order creation error types.

use locking::LockError;
use notifications::NotificationError;
use order_store::StoreError;
use thiserror::Error;

/// Errors surfaced to the caller of [`crate::OrderService::create_order`].
#[derive(Debug, Error)]
pub enum OrderError {
    /// Another checkout for the same buyer or idempotency key holds the lock.
    #[error("Conflicting operation in progress for {key}")]
    Conflict { key: String },

    /// The cart has no lines.
    #[error("Cart is empty")]
    EmptyCart,

    /// A line asks for zero items, or more than a line can hold.
    #[error("Invalid quantity {quantity} for product {product_id}")]
    InvalidQuantity { product_id: String, quantity: u32 },

    /// The order total does not fit in the money representation.
    #[error("Order total is too large")]
    TotalTooLarge,

    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    /// A line references a product that is not in the catalog.
    #[error("Product not found: {product_id}")]
    ProductNotFound { product_id: String },

    /// A line references a product that cannot be bought right now.
    #[error("Product not purchasable: {product_id}")]
    ProductUnavailable { product_id: String },

    /// The idempotency key already produced an order for a different buyer.
    #[error("Idempotency key {key} belongs to another buyer")]
    IdempotencyKeyReused { key: String },

    /// The lock store could not be reached; the request failed closed.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The notification payload could not be encoded.
    #[error("Payload error: {0}")]
    Payload(#[from] NotificationError),
}

impl OrderError {
    /// True if the same request may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrderError::Conflict { .. } | OrderError::Lock(_) => true,
            OrderError::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    /// True for problems with the request itself.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OrderError::EmptyCart
                | OrderError::InvalidQuantity { .. }
                | OrderError::TotalTooLarge
                | OrderError::InvalidIdempotencyKey(_)
                | OrderError::ProductNotFound { .. }
                | OrderError::ProductUnavailable { .. }
                | OrderError::IdempotencyKeyReused { .. }
        )
    }

    /// Short label used for the `reason` metric dimension.
    pub fn reason(&self) -> &'static str {
        match self {
            OrderError::Conflict { .. } => "conflict",
            OrderError::EmptyCart => "empty_cart",
            OrderError::InvalidQuantity { .. } => "invalid_quantity",
            OrderError::TotalTooLarge => "total_too_large",
            OrderError::InvalidIdempotencyKey(_) => "invalid_idempotency_key",
            OrderError::ProductNotFound { .. } => "product_not_found",
            OrderError::ProductUnavailable { .. } => "product_unavailable",
            OrderError::IdempotencyKeyReused { .. } => "idempotency_key_reused",
            OrderError::Lock(_) => "lock_unavailable",
            OrderError::Store(_) => "store",
            OrderError::Payload(_) => "payload",
        }
    }
}

/// Result type for order creation.
pub type Result<T> = std::result::Result<T, OrderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_classification() {
        assert!(OrderError::Conflict { key: "k".into() }.is_retryable());
        assert!(OrderError::Lock(LockError::Unavailable("down".into())).is_retryable());
        assert!(OrderError::Store(StoreError::Unavailable("down".into())).is_retryable());
        assert!(!OrderError::EmptyCart.is_retryable());
        assert!(OrderError::EmptyCart.is_validation());
        assert!(
            !OrderError::Store(StoreError::DuplicateReference("r".into())).is_retryable()
        );
    }
}
