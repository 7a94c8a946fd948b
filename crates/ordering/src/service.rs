//! Order creation service.

use std::collections::HashMap;
use std::time::Instant;

use common::{BuyerId, Money, OrderId};
use locking::LockCoordinator;
use notifications::{ORDER_CONFIRMATION_EVENT, OrderConfirmation};
use order_store::{
    Catalog, NewOrder, NewOutboxRecord, Order, OrderItem, OrderStore, StoreError,
};
use tracing::{debug, info, warn};

use crate::{CartSelection, MAX_IDEMPOTENCY_KEY_LEN, MAX_LINE_QUANTITY, OrderError, Result};

/// Attempts at drawing an unused order reference.
const REFERENCE_ATTEMPTS: usize = 3;

/// Creates orders under a lock and records their notification intent.
///
/// Generic over the order store and catalog so the same service runs against
/// PostgreSQL in production and in-memory collaborators in tests.
pub struct OrderService<S, C> {
    store: S,
    catalog: C,
    locks: LockCoordinator,
}

impl<S: OrderStore, C: Catalog> OrderService<S, C> {
    pub fn new(store: S, catalog: C, locks: LockCoordinator) -> Self {
        Self {
            store,
            catalog,
            locks,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The lock key guarding a checkout.
    ///
    /// Scoped to the idempotency token when the client sent one, otherwise to
    /// the buyer.
    pub fn lock_key(buyer_id: BuyerId, cart: &CartSelection) -> String {
        match &cart.idempotency_key {
            Some(key) => format!("order:idem:{key}"),
            None => format!("order:buyer:{buyer_id}"),
        }
    }

    /// Creates an order for `buyer_id` from the selected cart.
    ///
    /// Fails fast with [`OrderError::Conflict`] when another checkout holds
    /// the same lock; it never waits or retries on the caller's behalf. The
    /// order, its items and its outbox record are committed atomically, and
    /// the lock is released on every path.
    #[tracing::instrument(skip(self, cart), fields(lines = cart.lines.len(), idempotency_key = ?cart.idempotency_key))]
    pub async fn create_order(&self, buyer_id: BuyerId, cart: CartSelection) -> Result<Order> {
        let started = Instant::now();
        let key = Self::lock_key(buyer_id, &cart);

        let result = self
            .locks
            .with_lock(&key, || self.create_locked(buyer_id, &cart))
            .await
            .and_then(|created| created.ok_or(OrderError::Conflict { key }));

        match &result {
            Ok(order) => {
                metrics::counter!("orders_created_total").increment(1);
                metrics::histogram!("order_creation_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                debug!(order_id = %order.id, "create_order finished");
            }
            Err(e) => {
                metrics::counter!("orders_rejected_total", "reason" => e.reason()).increment(1);
                if e.is_validation() {
                    debug!(error = %e, "Order rejected");
                } else {
                    warn!(error = %e, retryable = e.is_retryable(), "Order creation failed");
                }
            }
        }
        result
    }

    async fn create_locked(&self, buyer_id: BuyerId, cart: &CartSelection) -> Result<Order> {
        if let Some(key) = &cart.idempotency_key {
            Self::check_idempotency_key(key)?;
            if let Some(existing) = self.replayed(buyer_id, key).await? {
                return Ok(existing);
            }
        }

        let items = self.price(cart).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let order = NewOrder::new(buyer_id, items.clone(), cart.idempotency_key.clone());
            let payload = OrderConfirmation::for_order(&order).to_value()?;
            let outbox = NewOutboxRecord::new(ORDER_CONFIRMATION_EVENT, payload);

            match self.store.create_order(order, outbox).await {
                Ok(order) => {
                    info!(
                        order_id = %order.id,
                        reference = %order.reference,
                        total = %order.total_price,
                        "Order created"
                    );
                    return Ok(order);
                }
                Err(StoreError::DuplicateReference(reference)) if attempt < REFERENCE_ATTEMPTS => {
                    debug!(%reference, "Order reference collision, drawing another");
                }
                Err(StoreError::DuplicateIdempotencyKey(key)) => {
                    // Committed by a holder whose lock had already expired
                    return self
                        .replayed(buyer_id, &key)
                        .await?
                        .ok_or(OrderError::Store(StoreError::DuplicateIdempotencyKey(key)));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Returns the order already committed under `key`, if any.
    async fn replayed(&self, buyer_id: BuyerId, key: &str) -> Result<Option<Order>> {
        let Some(existing) = self.store.find_order_by_idempotency_key(key).await? else {
            return Ok(None);
        };
        if existing.buyer_id != buyer_id {
            return Err(OrderError::IdempotencyKeyReused {
                key: key.to_string(),
            });
        }
        info!(order_id = %existing.id, "Replayed checkout, returning existing order");
        Ok(Some(existing))
    }

    /// Validates the cart and prices every line from the current catalog.
    async fn price(&self, cart: &CartSelection) -> Result<Vec<OrderItem>> {
        if cart.is_empty() {
            return Err(OrderError::EmptyCart);
        }
        if let Some(line) = cart
            .lines
            .iter()
            .find(|l| l.quantity == 0 || l.quantity > MAX_LINE_QUANTITY)
        {
            return Err(OrderError::InvalidQuantity {
                product_id: line.product_id.to_string(),
                quantity: line.quantity,
            });
        }

        let ids: Vec<_> = cart.lines.iter().map(|l| l.product_id.clone()).collect();
        let products: HashMap<_, _> = self
            .catalog
            .get_products(&ids)
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let items = cart
            .lines
            .iter()
            .map(|line| {
                let product = products.get(&line.product_id).ok_or_else(|| {
                    OrderError::ProductNotFound {
                        product_id: line.product_id.to_string(),
                    }
                })?;
                if !product.purchasable {
                    return Err(OrderError::ProductUnavailable {
                        product_id: line.product_id.to_string(),
                    });
                }
                if product.price.checked_multiply(line.quantity).is_none() {
                    return Err(OrderError::TotalTooLarge);
                }
                Ok(OrderItem::new(
                    product.id.clone(),
                    product.name.clone(),
                    line.quantity,
                    product.price,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        items
            .iter()
            .try_fold(Money::zero(), |total, item| total.checked_add(item.line_price))
            .ok_or(OrderError::TotalTooLarge)?;
        Ok(items)
    }

    fn check_idempotency_key(key: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(OrderError::InvalidIdempotencyKey("must not be blank".into()));
        }
        if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(OrderError::InvalidIdempotencyKey(format!(
                "longer than {MAX_IDEMPOTENCY_KEY_LEN} bytes"
            )));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.store.get_order(id).await?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_order_by_reference(&self, reference: &str) -> Result<Option<Order>> {
        Ok(self.store.get_order_by_reference(reference).await?)
    }
}
