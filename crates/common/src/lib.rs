//! Shared types for the checkout system.
//!
//! - Typed identifiers wrapping UUIDs so order, buyer, outbox and payment ids
//!   cannot be mixed up
//! - [`Money`] stored as integer cents
//! - [`task`] helpers for running periodic background work with a shutdown hook

pub mod money;
pub mod task;
pub mod types;

pub use money::Money;
pub use task::{Shutdown, ShutdownTrigger, spawn_periodic};
pub use types::{BuyerId, OrderId, OutboxId, PaymentId, ProductId};
