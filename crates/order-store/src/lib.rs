//! Durable storage for the checkout core.
//!
//! Orders, their items and the outbox record announcing them are written in a
//! single atomic unit through [`OrderStore::create_order`]. Outbox lifecycle
//! updates and payment transitions are conditional, so concurrent workers
//! never regress a record's state.
//!
//! Two backends implement every trait: [`InMemoryStore`] for tests and local
//! runs, and [`PostgresStore`] for production.

pub mod catalog;
pub mod error;
pub mod memory;
pub mod order;
pub mod outbox;
pub mod payment;
pub mod postgres;
pub mod store;

pub use catalog::{Catalog, InMemoryCatalog, Product};
pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use order::{NewOrder, Order, OrderItem, generate_reference};
pub use outbox::{FailedDeliveryOutcome, NewOutboxRecord, OutboxRecord, OutboxStatus};
pub use payment::{NewPayment, Payment, PaymentStatus};
pub use postgres::PostgresStore;
pub use store::{OrderStore, OutboxStore, PaymentStore};
