use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{BuyerId, Money, OrderId, OutboxId, PaymentId, ProductId};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::outbox::charge_failed_delivery;
use crate::store::ensure_forward;
use crate::{
    Catalog, FailedDeliveryOutcome, NewOrder, NewOutboxRecord, NewPayment, Order, OrderItem,
    OrderStore, OutboxRecord, OutboxStatus, OutboxStore, Payment, PaymentStatus, PaymentStore,
    Product, Result, StoreError,
};

const ORDER_COLUMNS: &str =
    "id, buyer_id, reference, idempotency_key, total_price_cents, created_at";
const OUTBOX_COLUMNS: &str =
    "id, order_id, event_type, payload, status, retry_count, relayed_at, created_at, updated_at";
const PAYMENT_COLUMNS: &str =
    "id, order_id, payment_key, amount_cents, status, requested_at, approved_at";

/// PostgreSQL-backed store implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a connection pool for `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Inserts or updates a catalog product.
    pub async fn upsert_product(&self, product: &Product) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, price_cents, purchasable)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                price_cents = EXCLUDED.price_cents,
                purchasable = EXCLUDED.purchasable
            "#,
        )
        .bind(product.id.as_str())
        .bind(&product.name)
        .bind(product.price.cents())
        .bind(product.purchasable)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn hydrate_order(&self, row: PgRow) -> Result<Order> {
        let id: Uuid = row.try_get("id")?;
        let items = sqlx::query(
            r#"
            SELECT product_id, product_name, quantity, unit_price_cents, line_price_cents
            FROM order_items
            WHERE order_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Self::row_to_item)
        .collect::<Result<Vec<_>>>()?;

        Ok(Order {
            id: OrderId::from_uuid(id),
            buyer_id: BuyerId::new(row.try_get("buyer_id")?),
            reference: row.try_get("reference")?,
            idempotency_key: row.try_get("idempotency_key")?,
            created_at: row.try_get("created_at")?,
            total_price: Money::from_cents(row.try_get("total_price_cents")?),
            items,
        })
    }

    fn row_to_item(row: PgRow) -> Result<OrderItem> {
        let product_id: Option<String> = row.try_get("product_id")?;
        let quantity: i32 = row.try_get("quantity")?;
        Ok(OrderItem {
            product_id: product_id.map(ProductId::from),
            product_name: row.try_get("product_name")?,
            quantity: u32::try_from(quantity)
                .map_err(|_| StoreError::CorruptRow(format!("negative quantity {quantity}")))?,
            unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
            line_price: Money::from_cents(row.try_get("line_price_cents")?),
        })
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxRecord> {
        let status: String = row.try_get("status")?;
        let retry_count: i32 = row.try_get("retry_count")?;
        Ok(OutboxRecord {
            id: OutboxId::from_uuid(row.try_get("id")?),
            order_id: OrderId::from_uuid(row.try_get("order_id")?),
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: status.parse()?,
            retry_count: retry_count.max(0) as u32,
            relayed_at: row.try_get("relayed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_payment(row: PgRow) -> Result<Payment> {
        let status: String = row.try_get("status")?;
        Ok(Payment {
            id: PaymentId::from_uuid(row.try_get("id")?),
            order_id: OrderId::from_uuid(row.try_get("order_id")?),
            payment_key: row.try_get("payment_key")?,
            amount: Money::from_cents(row.try_get("amount_cents")?),
            status: status.parse()?,
            requested_at: row.try_get("requested_at")?,
            approved_at: row.try_get("approved_at")?,
        })
    }
}

/// Maps unique-constraint violations on `orders` onto domain errors.
fn map_order_insert_error(e: sqlx::Error, order: &Order) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e {
        match db_err.constraint() {
            Some("orders_idempotency_key_key") => {
                return StoreError::DuplicateIdempotencyKey(
                    order.idempotency_key.clone().unwrap_or_default(),
                );
            }
            Some("orders_reference_key") => {
                return StoreError::DuplicateReference(order.reference.clone());
            }
            _ => {}
        }
    }
    StoreError::Database(e)
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn create_order(&self, order: NewOrder, outbox: NewOutboxRecord) -> Result<Order> {
        let now = Utc::now();
        let order = order.into_order(now);
        let record = outbox.into_record(order.id, now);

        // Start a transaction; dropping it on any early return rolls back.
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, buyer_id, reference, idempotency_key, total_price_cents, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.buyer_id.as_i64())
        .bind(&order.reference)
        .bind(&order.idempotency_key)
        .bind(order.total_price.cents())
        .bind(order.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_order_insert_error(e, &order))?;

        for item in &order.items {
            let quantity = i32::try_from(item.quantity).map_err(|_| {
                StoreError::OutOfRange(format!("quantity {} for {}", item.quantity, item.display_name()))
            })?;
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, product_id, product_name, quantity, unit_price_cents, line_price_cents)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(order.id.as_uuid())
            .bind(item.product_id.as_ref().map(|p| p.as_str().to_string()))
            .bind(&item.product_name)
            .bind(quantity)
            .bind(item.unit_price.cents())
            .bind(item.line_price.cents())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO outbox (id, order_id, event_type, payload, status, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $6)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(order.id.as_uuid())
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.status.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(order)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate_order(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_order_by_idempotency_key(&self, key: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate_order(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_order_by_reference(&self, reference: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate_order(row).await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OutboxStore for PostgresStore {
    async fn claim_pending(
        &self,
        limit: usize,
        redispatch_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>> {
        // SKIP LOCKED lets several relay instances claim disjoint batches.
        let rows = sqlx::query(&format!(
            r#"
            UPDATE outbox SET relayed_at = NOW(), updated_at = NOW()
            WHERE id IN (
                SELECT id FROM outbox
                WHERE status = 'PENDING' AND (relayed_at IS NULL OR relayed_at < $1)
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(redispatch_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .into_iter()
            .map(Self::row_to_outbox)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|r| r.created_at);
        if !records.is_empty() {
            tracing::debug!(count = records.len(), "Claimed pending outbox records");
        }
        Ok(records)
    }

    async fn release_claim(&self, id: OutboxId) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET relayed_at = NULL, updated_at = NOW() WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_outbox_record(&self, id: OutboxId) -> Result<Option<OutboxRecord>> {
        let row = sqlx::query(&format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_outbox).transpose()
    }

    async fn find_outbox_for_order(&self, order_id: OrderId) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE order_id = $1 ORDER BY created_at ASC"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_published(&self, id: OutboxId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox SET status = 'PUBLISHED', updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_outbox_record(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                entity: "Outbox record",
                id: id.to_string(),
            }),
        }
    }

    async fn record_failed_delivery(
        &self,
        id: OutboxId,
        attempts: u32,
        ceiling: u32,
    ) -> Result<FailedDeliveryOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status, retry_count FROM outbox WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "Outbox record",
                id: id.to_string(),
            })?;

        let status: OutboxStatus = row.try_get::<String, _>("status")?.parse()?;
        if status.is_terminal() {
            return Ok(FailedDeliveryOutcome::AlreadyTerminal(status));
        }

        let current: i32 = row.try_get("retry_count")?;
        let (retry_count, next) = charge_failed_delivery(current.max(0) as u32, attempts, ceiling);

        sqlx::query(
            r#"
            UPDATE outbox SET
                retry_count = $2,
                status = $3,
                relayed_at = CASE WHEN $4 THEN NULL ELSE relayed_at END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(retry_count as i32)
        .bind(next.as_str())
        .bind(next == OutboxStatus::Pending)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(match next {
            OutboxStatus::FailedToPublish => FailedDeliveryOutcome::FailedToPublish { retry_count },
            _ => FailedDeliveryOutcome::Rearmed { retry_count },
        })
    }

    async fn purge_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM outbox WHERE status = 'PUBLISHED' AND updated_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PaymentStore for PostgresStore {
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment> {
        let payment = payment.into_payment();

        sqlx::query(
            r#"
            INSERT INTO payments (id, order_id, payment_key, amount_cents, status, requested_at, approved_at)
            VALUES ($1, $2, $3, $4, $5, $6, NULL)
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.order_id.as_uuid())
        .bind(&payment.payment_key)
        .bind(payment.amount.cents())
        .bind(payment.status.as_str())
        .bind(payment.requested_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.is_unique_violation() {
                    return StoreError::DuplicatePayment(payment.payment_key.clone());
                }
                if db_err.is_foreign_key_violation() {
                    return StoreError::NotFound {
                        entity: "Order",
                        id: payment.order_id.to_string(),
                    };
                }
            }
            StoreError::Database(e)
        })?;

        Ok(payment)
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn get_payment_by_key(&self, payment_key: &str) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_key = $1"
        ))
        .bind(payment_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn find_stale_payments(
        &self,
        statuses: &[PaymentStatus],
        requested_before: DateTime<Utc>,
    ) -> Result<Vec<Payment>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS} FROM payments
            WHERE status = ANY($1) AND requested_at < $2
            ORDER BY requested_at ASC
            "#
        ))
        .bind(statuses)
        .bind(requested_before)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_payment).collect()
    }

    async fn transition_payment(
        &self,
        id: PaymentId,
        expected: PaymentStatus,
        next: PaymentStatus,
        approved_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        ensure_forward(expected, next)?;

        let result = sqlx::query(
            r#"
            UPDATE payments SET status = $3, approved_at = COALESCE($4, approved_at)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(approved_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl Catalog for PostgresStore {
    async fn get_products(&self, ids: &[ProductId]) -> Result<Vec<Product>> {
        let ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        let rows = sqlx::query(
            "SELECT id, name, price_cents, purchasable FROM products WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Product {
                    id: ProductId::new(row.try_get::<String, _>("id")?),
                    name: row.try_get("name")?,
                    price: Money::from_cents(row.try_get("price_cents")?),
                    purchasable: row.try_get("purchasable")?,
                })
            })
            .collect()
    }
}
