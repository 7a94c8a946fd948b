//! Order creation for the checkout flow.
//!
//! [`OrderService::create_order`] takes a per-buyer (or per-idempotency-key)
//! lock, prices the cart from the current catalog and persists the order
//! together with its notification outbox record in one transaction. The
//! notification itself is delivered later by the outbox pipeline.

pub mod cart;
pub mod error;
pub mod service;

pub use cart::{CartLine, CartSelection, MAX_IDEMPOTENCY_KEY_LEN, MAX_LINE_QUANTITY};
pub use error::{OrderError, Result};
pub use service::OrderService;
