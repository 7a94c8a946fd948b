//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and truncate tables between
//! tests. They need a Docker daemon, so they are ignored by default:
//!
//! ```bash
//! cargo test -p order-store --test postgres_integration -- --ignored
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{BuyerId, Money, PaymentId};
use order_store::{
    Catalog, FailedDeliveryOutcome, NewOrder, NewOutboxRecord, NewPayment, OrderItem, OrderStore,
    OutboxStatus, OutboxStore, PaymentStatus, PaymentStore, PostgresStore, Product, StoreError,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let store = PostgresStore::new(PgPool::connect(&connection_string).await.unwrap());
            store.run_migrations().await.unwrap();
            store.pool().close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE payments, outbox, order_items, orders, products")
        .execute(&pool)
        .await
        .unwrap();

    PostgresStore::new(pool)
}

fn sample_order(key: Option<&str>) -> (NewOrder, NewOutboxRecord) {
    let items = vec![
        OrderItem::new("SKU-001", "Notebook", 1, Money::from_cents(1250)),
        OrderItem::new("SKU-002", "Pen", 1, Money::from_cents(725)),
    ];
    let order = NewOrder::new(BuyerId::new(7), items, key.map(str::to_string));
    let outbox = NewOutboxRecord::new(
        "OrderCreated",
        serde_json::json!({"order_id": order.id, "total_cents": 1975}),
    );
    (order, outbox)
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn order_and_outbox_commit_together() {
    let store = get_test_store().await;
    let (order, outbox) = sample_order(None);

    let created = store.create_order(order, outbox).await.unwrap();
    assert_eq!(created.total_price, Money::from_cents(1975));

    let loaded = store.get_order(created.id).await.unwrap().unwrap();
    assert_eq!(loaded.items.len(), 2);
    assert_eq!(loaded.reference, created.reference);

    let records = store.find_outbox_for_order(created.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, OutboxStatus::Pending);
    assert_eq!(records[0].retry_count, 0);
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn duplicate_idempotency_key_rolls_back_everything() {
    let store = get_test_store().await;

    let (first, outbox) = sample_order(Some("cart-42"));
    let created = store.create_order(first, outbox).await.unwrap();

    let (second, outbox) = sample_order(Some("cart-42"));
    let err = store.create_order(second, outbox).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateIdempotencyKey(ref k) if k == "cart-42"));

    let found = store
        .find_order_by_idempotency_key("cart-42")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, created.id);

    let outbox_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(outbox_rows, 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn claim_skips_recently_relayed_records() {
    let store = get_test_store().await;
    let (order, outbox) = sample_order(None);
    store.create_order(order, outbox).await.unwrap();

    let claimed = store
        .claim_pending(10, Utc::now() - Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(claimed[0].relayed_at.is_some());

    let again = store
        .claim_pending(10, Utc::now() - Duration::minutes(10))
        .await
        .unwrap();
    assert!(again.is_empty());

    // A redispatch window ending in the future makes the record eligible again
    let redispatched = store
        .claim_pending(10, Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(redispatched.len(), 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn published_records_never_regress() {
    let store = get_test_store().await;
    let (order, outbox) = sample_order(None);
    let outbox_id = outbox.id;
    store.create_order(order, outbox).await.unwrap();

    assert!(store.mark_published(outbox_id).await.unwrap());
    assert!(!store.mark_published(outbox_id).await.unwrap());

    let outcome = store.record_failed_delivery(outbox_id, 5, 5).await.unwrap();
    assert_eq!(
        outcome,
        FailedDeliveryOutcome::AlreadyTerminal(OutboxStatus::Published)
    );

    let record = store.get_outbox_record(outbox_id).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::Published);
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn failed_deliveries_rearm_then_exhaust() {
    let store = get_test_store().await;
    let (order, outbox) = sample_order(None);
    let outbox_id = outbox.id;
    store.create_order(order, outbox).await.unwrap();
    store
        .claim_pending(10, Utc::now() - Duration::minutes(10))
        .await
        .unwrap();

    let outcome = store.record_failed_delivery(outbox_id, 2, 5).await.unwrap();
    assert_eq!(outcome, FailedDeliveryOutcome::Rearmed { retry_count: 2 });
    let record = store.get_outbox_record(outbox_id).await.unwrap().unwrap();
    assert!(record.relayed_at.is_none());

    let outcome = store.record_failed_delivery(outbox_id, 5, 5).await.unwrap();
    assert_eq!(outcome, FailedDeliveryOutcome::FailedToPublish { retry_count: 5 });

    let record = store.get_outbox_record(outbox_id).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::FailedToPublish);
    assert_eq!(record.retry_count, 5);
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn purge_removes_only_old_published_records() {
    let store = get_test_store().await;

    let (order, outbox) = sample_order(None);
    let published = outbox.id;
    store.create_order(order, outbox).await.unwrap();
    store.mark_published(published).await.unwrap();

    let (order, outbox) = sample_order(None);
    let pending = outbox.id;
    store.create_order(order, outbox).await.unwrap();

    let purged = store
        .purge_published_before(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(store.get_outbox_record(published).await.unwrap().is_none());
    assert!(store.get_outbox_record(pending).await.unwrap().is_some());
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn payment_transitions_are_conditional() {
    let store = get_test_store().await;
    let (order, outbox) = sample_order(None);
    let order = store.create_order(order, outbox).await.unwrap();

    let payment = store
        .insert_payment(NewPayment {
            order_id: order.id,
            payment_key: "pay_123".into(),
            amount: order.total_price,
            requested_at: Utc::now() - Duration::hours(1),
        })
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Ready);

    assert!(
        store
            .transition_payment(payment.id, PaymentStatus::Ready, PaymentStatus::WaitingForDeposit, None)
            .await
            .unwrap()
    );

    let stale = store
        .find_stale_payments(&PaymentStatus::RECONCILABLE, Utc::now() - Duration::minutes(30))
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);

    let approved_at = Utc::now();
    assert!(
        store
            .transition_payment(
                payment.id,
                PaymentStatus::WaitingForDeposit,
                PaymentStatus::Done,
                Some(approved_at),
            )
            .await
            .unwrap()
    );

    // The second writer loses the race and changes nothing
    assert!(
        !store
            .transition_payment(payment.id, PaymentStatus::WaitingForDeposit, PaymentStatus::Failed, None)
            .await
            .unwrap()
    );

    let stored = store.get_payment_by_key("pay_123").await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Done);
    assert!(stored.approved_at.is_some());
    assert!(store.get_payment(PaymentId::new()).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn catalog_reads_products() {
    let store = get_test_store().await;
    store
        .upsert_product(&Product::new("SKU-001", "Notebook", Money::from_cents(1250)))
        .await
        .unwrap();

    let found = store
        .get_products(&["SKU-001".into(), "SKU-404".into()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].price, Money::from_cents(1250));
}
