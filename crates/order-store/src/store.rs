use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, OutboxId, PaymentId};

use crate::{
    FailedDeliveryOutcome, NewOrder, NewOutboxRecord, NewPayment, Order, OutboxRecord, Payment,
    PaymentStatus, Result,
};

/// Persistence for orders.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persists the order, its items and its outbox record atomically.
    ///
    /// Either all three are committed or none are. Fails with
    /// `DuplicateIdempotencyKey` if another order already holds the key.
    async fn create_order(&self, order: NewOrder, outbox: NewOutboxRecord) -> Result<Order>;

    /// Loads an order with its items.
    async fn get_order(&self, id: OrderId) -> Result<Option<Order>>;

    /// Loads the order committed under an idempotency key, if any.
    async fn find_order_by_idempotency_key(&self, key: &str) -> Result<Option<Order>>;

    /// Loads an order by its external reference.
    async fn get_order_by_reference(&self, reference: &str) -> Result<Option<Order>>;
}

/// Lifecycle operations on outbox records.
///
/// Records are only ever created by [`OrderStore::create_order`].
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claims up to `limit` pending records for relaying, oldest first.
    ///
    /// A record is eligible if it was never relayed or was last relayed before
    /// `redispatch_before`. Claimed records get `relayed_at` set to now.
    async fn claim_pending(
        &self,
        limit: usize,
        redispatch_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>>;

    /// Clears the claim on a pending record so the next relay cycle picks it up.
    ///
    /// Used when hand-off to the broker failed. No-op for non-pending records.
    async fn release_claim(&self, id: OutboxId) -> Result<()>;

    async fn get_outbox_record(&self, id: OutboxId) -> Result<Option<OutboxRecord>>;

    /// Returns every outbox record created for an order.
    async fn find_outbox_for_order(&self, order_id: OrderId) -> Result<Vec<OutboxRecord>>;

    /// Moves a pending record to `Published`.
    ///
    /// Returns false if the record was not pending (already published or
    /// failed), which callers treat as a duplicate delivery.
    async fn mark_published(&self, id: OutboxId) -> Result<bool>;

    /// Charges `attempts` failed deliveries to a record.
    ///
    /// Once the retry count reaches `ceiling` the record becomes
    /// `FailedToPublish`; otherwise it is re-armed for the next relay cycle.
    async fn record_failed_delivery(
        &self,
        id: OutboxId,
        attempts: u32,
        ceiling: u32,
    ) -> Result<FailedDeliveryOutcome>;

    /// Deletes published records last updated before `cutoff`.
    ///
    /// Returns the number of records removed.
    async fn purge_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Persistence for payments.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Registers a payment in `Ready` state.
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment>;

    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>>;

    async fn get_payment_by_key(&self, payment_key: &str) -> Result<Option<Payment>>;

    /// Finds payments in one of `statuses` requested before `requested_before`.
    async fn find_stale_payments(
        &self,
        statuses: &[PaymentStatus],
        requested_before: DateTime<Utc>,
    ) -> Result<Vec<Payment>>;

    /// Moves a payment from `expected` to `next` only if it is still in `expected`.
    ///
    /// Returns false when another writer changed the status first. Fails with
    /// `InvalidTransition` if `expected -> next` is not a forward move.
    async fn transition_payment(
        &self,
        id: PaymentId,
        expected: PaymentStatus,
        next: PaymentStatus,
        approved_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;
}

/// Rejects non-monotonic payment transitions before they reach storage.
pub(crate) fn ensure_forward(expected: PaymentStatus, next: PaymentStatus) -> Result<()> {
    if expected.can_transition_to(next) {
        Ok(())
    } else {
        Err(crate::StoreError::InvalidTransition {
            from: expected.to_string(),
            to: next.to_string(),
        })
    }
}
