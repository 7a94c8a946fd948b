use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, OutboxId, PaymentId};
use tokio::sync::RwLock;

use crate::outbox::charge_failed_delivery;
use crate::store::ensure_forward;
use crate::{
    FailedDeliveryOutcome, NewOrder, NewOutboxRecord, NewPayment, Order, OrderStore, OutboxRecord,
    OutboxStatus, OutboxStore, Payment, PaymentStatus, PaymentStore, Result, StoreError,
};

#[derive(Default)]
struct State {
    orders: HashMap<OrderId, Order>,
    outbox: HashMap<OutboxId, OutboxRecord>,
    payments: HashMap<PaymentId, Payment>,
}

#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_next_outbox_write: AtomicBool,
}

/// In-memory store implementation for testing.
///
/// Provides the same interface and atomicity guarantees as the PostgreSQL
/// implementation: every write happens under one lock, and a failed order
/// write leaves no trace.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    faults: Arc<Faults>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next order write fail after the order is staged but before
    /// the outbox record is written, simulating a crash between the two.
    pub fn fail_next_outbox_write(&self) {
        self.faults.fail_next_outbox_write.store(true, Ordering::SeqCst);
    }

    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    pub async fn outbox_count(&self) -> usize {
        self.state.read().await.outbox.len()
    }

    /// Returns all outbox records, oldest first.
    pub async fn outbox_records(&self) -> Vec<OutboxRecord> {
        let mut records: Vec<_> = self.state.read().await.outbox.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Overwrites a record's `updated_at`, for retention tests.
    pub async fn backdate_outbox(&self, id: OutboxId, updated_at: DateTime<Utc>) {
        if let Some(record) = self.state.write().await.outbox.get_mut(&id) {
            record.updated_at = updated_at;
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn create_order(&self, order: NewOrder, outbox: NewOutboxRecord) -> Result<Order> {
        self.check_available()?;
        let mut state = self.state.write().await;

        if let Some(key) = &order.idempotency_key
            && state
                .orders
                .values()
                .any(|o| o.idempotency_key.as_deref() == Some(key.as_str()))
        {
            return Err(StoreError::DuplicateIdempotencyKey(key.clone()));
        }
        if state.orders.values().any(|o| o.reference == order.reference) {
            return Err(StoreError::DuplicateReference(order.reference));
        }

        // Stage both rows; nothing touches `state` until both are ready.
        let now = Utc::now();
        let order = order.into_order(now);
        if self.faults.fail_next_outbox_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "connection lost before outbox write".to_string(),
            ));
        }
        let record = outbox.into_record(order.id, now);

        state.outbox.insert(record.id, record);
        state.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        self.check_available()?;
        Ok(self.state.read().await.orders.get(&id).cloned())
    }

    async fn find_order_by_idempotency_key(&self, key: &str) -> Result<Option<Order>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .orders
            .values()
            .find(|o| o.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn get_order_by_reference(&self, reference: &str) -> Result<Option<Order>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .orders
            .values()
            .find(|o| o.reference == reference)
            .cloned())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn claim_pending(
        &self,
        limit: usize,
        redispatch_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>> {
        self.check_available()?;
        let mut state = self.state.write().await;

        let mut eligible: Vec<_> = state
            .outbox
            .values()
            .filter(|r| {
                r.status == OutboxStatus::Pending
                    && r.relayed_at.is_none_or(|at| at < redispatch_before)
            })
            .map(|r| (r.created_at, r.id))
            .collect();
        eligible.sort();

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(eligible.len().min(limit));
        for (_, id) in eligible.into_iter().take(limit) {
            if let Some(record) = state.outbox.get_mut(&id) {
                record.relayed_at = Some(now);
                record.updated_at = now;
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn release_claim(&self, id: OutboxId) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(record) = state
            .outbox
            .get_mut(&id)
            .filter(|r| r.status == OutboxStatus::Pending)
        {
            record.relayed_at = None;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_outbox_record(&self, id: OutboxId) -> Result<Option<OutboxRecord>> {
        self.check_available()?;
        Ok(self.state.read().await.outbox.get(&id).cloned())
    }

    async fn find_outbox_for_order(&self, order_id: OrderId) -> Result<Vec<OutboxRecord>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .outbox
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: OutboxId) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let record = state.outbox.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "Outbox record",
            id: id.to_string(),
        })?;

        if record.status != OutboxStatus::Pending {
            return Ok(false);
        }
        record.status = OutboxStatus::Published;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_failed_delivery(
        &self,
        id: OutboxId,
        attempts: u32,
        ceiling: u32,
    ) -> Result<FailedDeliveryOutcome> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let record = state.outbox.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "Outbox record",
            id: id.to_string(),
        })?;

        if record.status.is_terminal() {
            return Ok(FailedDeliveryOutcome::AlreadyTerminal(record.status));
        }

        let (retry_count, status) = charge_failed_delivery(record.retry_count, attempts, ceiling);
        record.retry_count = retry_count;
        record.status = status;
        record.updated_at = Utc::now();

        if status == OutboxStatus::FailedToPublish {
            Ok(FailedDeliveryOutcome::FailedToPublish { retry_count })
        } else {
            record.relayed_at = None;
            Ok(FailedDeliveryOutcome::Rearmed { retry_count })
        }
    }

    async fn purge_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let before = state.outbox.len();
        state
            .outbox
            .retain(|_, r| !(r.status == OutboxStatus::Published && r.updated_at < cutoff));
        Ok((before - state.outbox.len()) as u64)
    }
}

#[async_trait]
impl PaymentStore for InMemoryStore {
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment> {
        self.check_available()?;
        let mut state = self.state.write().await;

        if !state.orders.contains_key(&payment.order_id) {
            return Err(StoreError::NotFound {
                entity: "Order",
                id: payment.order_id.to_string(),
            });
        }
        if state
            .payments
            .values()
            .any(|p| p.order_id == payment.order_id || p.payment_key == payment.payment_key)
        {
            return Err(StoreError::DuplicatePayment(payment.payment_key));
        }

        let payment = payment.into_payment();
        state.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        self.check_available()?;
        Ok(self.state.read().await.payments.get(&id).cloned())
    }

    async fn get_payment_by_key(&self, payment_key: &str) -> Result<Option<Payment>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.payment_key == payment_key)
            .cloned())
    }

    async fn find_stale_payments(
        &self,
        statuses: &[PaymentStatus],
        requested_before: DateTime<Utc>,
    ) -> Result<Vec<Payment>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut stale: Vec<_> = state
            .payments
            .values()
            .filter(|p| statuses.contains(&p.status) && p.requested_at < requested_before)
            .cloned()
            .collect();
        stale.sort_by_key(|p| p.requested_at);
        Ok(stale)
    }

    async fn transition_payment(
        &self,
        id: PaymentId,
        expected: PaymentStatus,
        next: PaymentStatus,
        approved_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        ensure_forward(expected, next)?;
        self.check_available()?;
        let mut state = self.state.write().await;
        let payment = state.payments.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "Payment",
            id: id.to_string(),
        })?;

        if payment.status != expected {
            return Ok(false);
        }
        payment.status = next;
        if approved_at.is_some() {
            payment.approved_at = approved_at;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OrderItem;
    use chrono::Duration;
    use common::{BuyerId, Money};

    fn new_order(key: Option<&str>) -> NewOrder {
        NewOrder::new(
            BuyerId::new(42),
            vec![
                OrderItem::new("SKU-001", "Notebook", 1, Money::from_cents(1250)),
                OrderItem::new("SKU-002", "Pen", 1, Money::from_cents(725)),
            ],
            key.map(str::to_string),
        )
    }

    fn new_outbox() -> NewOutboxRecord {
        NewOutboxRecord::new("OrderConfirmed", serde_json::json!({"test": true}))
    }

    async fn create(store: &InMemoryStore) -> (Order, OutboxId) {
        let outbox = new_outbox();
        let outbox_id = outbox.id;
        let order = store.create_order(new_order(None), outbox).await.unwrap();
        (order, outbox_id)
    }

    #[tokio::test]
    async fn create_order_writes_order_and_outbox() {
        let store = InMemoryStore::new();
        let (order, outbox_id) = create(&store).await;

        assert_eq!(order.total_price.cents(), 1975);
        let record = store.get_outbox_record(outbox_id).await.unwrap().unwrap();
        assert_eq!(record.order_id, order.id);
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn crash_between_writes_persists_nothing() {
        let store = InMemoryStore::new();
        store.fail_next_outbox_write();

        let result = store.create_order(new_order(None), new_outbox()).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.order_count().await, 0);
        assert_eq!(store.outbox_count().await, 0);

        // Fault is one-shot.
        create(&store).await;
        assert_eq!(store.order_count().await, 1);
        assert_eq!(store.outbox_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected() {
        let store = InMemoryStore::new();
        store
            .create_order(new_order(Some("idem-1")), new_outbox())
            .await
            .unwrap();

        let result = store
            .create_order(new_order(Some("idem-1")), new_outbox())
            .await;
        assert!(matches!(result, Err(StoreError::DuplicateIdempotencyKey(_))));
        assert_eq!(store.order_count().await, 1);

        let found = store.find_order_by_idempotency_key("idem-1").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn claim_pending_skips_recently_relayed() {
        let store = InMemoryStore::new();
        create(&store).await;
        create(&store).await;

        let cutoff = Utc::now() - Duration::minutes(10);
        let first = store.claim_pending(10, cutoff).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|r| r.relayed_at.is_some()));

        let second = store.claim_pending(10, cutoff).await.unwrap();
        assert!(second.is_empty());

        // Anything relayed before "now + 1s" is eligible again.
        let again = store
            .claim_pending(1, Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn released_claim_is_picked_up_immediately() {
        let store = InMemoryStore::new();
        let (_, outbox_id) = create(&store).await;

        let cutoff = Utc::now() - Duration::minutes(10);
        store.claim_pending(10, cutoff).await.unwrap();
        store.release_claim(outbox_id).await.unwrap();

        let reclaimed = store.claim_pending(10, cutoff).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, outbox_id);
    }

    #[tokio::test]
    async fn published_records_never_regress() {
        let store = InMemoryStore::new();
        let (_, outbox_id) = create(&store).await;

        assert!(store.mark_published(outbox_id).await.unwrap());
        assert!(!store.mark_published(outbox_id).await.unwrap());

        let outcome = store.record_failed_delivery(outbox_id, 5, 5).await.unwrap();
        assert_eq!(
            outcome,
            FailedDeliveryOutcome::AlreadyTerminal(OutboxStatus::Published)
        );
        let record = store.get_outbox_record(outbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Published);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn failed_delivery_rearms_then_fails() {
        let store = InMemoryStore::new();
        let (_, outbox_id) = create(&store).await;
        store.claim_pending(10, Utc::now()).await.unwrap();

        let outcome = store.record_failed_delivery(outbox_id, 2, 5).await.unwrap();
        assert_eq!(outcome, FailedDeliveryOutcome::Rearmed { retry_count: 2 });
        let record = store.get_outbox_record(outbox_id).await.unwrap().unwrap();
        assert!(record.relayed_at.is_none());

        let outcome = store.record_failed_delivery(outbox_id, 3, 5).await.unwrap();
        assert_eq!(outcome, FailedDeliveryOutcome::FailedToPublish { retry_count: 5 });
        assert!(!store.mark_published(outbox_id).await.unwrap());
    }

    #[tokio::test]
    async fn purge_removes_only_old_published_records() {
        let store = InMemoryStore::new();
        let (_, published) = create(&store).await;
        let (_, pending) = create(&store).await;
        store.mark_published(published).await.unwrap();

        let old = Utc::now() - Duration::days(60);
        store.backdate_outbox(published, old).await;
        store.backdate_outbox(pending, old).await;

        let purged = store
            .purge_published_before(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_outbox_record(published).await.unwrap().is_none());
        assert!(store.get_outbox_record(pending).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn payment_transition_is_conditional() {
        let store = InMemoryStore::new();
        let (order, _) = create(&store).await;
        let payment = store
            .insert_payment(NewPayment {
                order_id: order.id,
                payment_key: "pay_123".into(),
                amount: order.total_price,
                requested_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Ready);

        assert!(
            store
                .transition_payment(payment.id, PaymentStatus::Ready, PaymentStatus::InProgress, None)
                .await
                .unwrap()
        );
        // Stale expectation loses the race.
        assert!(
            !store
                .transition_payment(payment.id, PaymentStatus::Ready, PaymentStatus::Failed, None)
                .await
                .unwrap()
        );

        let backwards = store
            .transition_payment(payment.id, PaymentStatus::Done, PaymentStatus::Ready, None)
            .await;
        assert!(matches!(backwards, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let result = store.create_order(new_order(None), new_outbox()).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert!(store.get_order(OrderId::new()).await.is_err());
    }
}
