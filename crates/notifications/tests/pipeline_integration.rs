//! End-to-end tests for the outbox relay, consumer and dead-letter handling.
//!
//! These run against the in-memory store, broker and mail transport with
//! immediate redelivery so every cycle can be driven explicitly.

use common::{BuyerId, Money, OutboxId};
use notifications::{
    Broker, ConsumeOutcome, ConsumerConfig, DEFAULT_DELIVERY_CEILING, DeadLetterReconciler,
    InMemoryBroker, InMemoryMailTransport, Message, NotificationConsumer, ORDER_CONFIRMATION_EVENT,
    OrderConfirmation, OutboxRelay, RedeliveryPolicy, RelayConfig,
};
use order_store::{
    InMemoryStore, NewOrder, NewOutboxRecord, Order, OrderItem, OrderStore, OutboxStatus,
    OutboxStore,
};

struct Pipeline {
    store: InMemoryStore,
    broker: InMemoryBroker,
    mail: InMemoryMailTransport,
    relay: OutboxRelay<InMemoryStore, InMemoryBroker>,
    consumer: NotificationConsumer<InMemoryStore, InMemoryBroker, InMemoryMailTransport>,
    dead_letters: DeadLetterReconciler<InMemoryStore, InMemoryBroker>,
}

fn pipeline() -> Pipeline {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new(RedeliveryPolicy::immediate(DEFAULT_DELIVERY_CEILING));
    let mail = InMemoryMailTransport::new();

    Pipeline {
        relay: OutboxRelay::new(store.clone(), broker.clone(), RelayConfig::default()),
        consumer: NotificationConsumer::new(
            store.clone(),
            broker.clone(),
            mail.clone(),
            ConsumerConfig::default(),
        ),
        dead_letters: DeadLetterReconciler::new(
            store.clone(),
            broker.clone(),
            DEFAULT_DELIVERY_CEILING,
        ),
        store,
        broker,
        mail,
    }
}

async fn place_order(store: &InMemoryStore) -> (Order, OutboxId) {
    let order = NewOrder::new(
        BuyerId::new(42),
        vec![
            OrderItem::new("SKU-001", "Notebook", 1, Money::from_cents(1250)),
            OrderItem::new("SKU-002", "Pen", 1, Money::from_cents(725)),
        ],
        None,
    );
    let payload = OrderConfirmation::for_order(&order).to_value().unwrap();
    let outbox = NewOutboxRecord::new(ORDER_CONFIRMATION_EVENT, payload);
    let outbox_id = outbox.id;
    (store.create_order(order, outbox).await.unwrap(), outbox_id)
}

async fn status_of(store: &InMemoryStore, id: OutboxId) -> (OutboxStatus, u32) {
    let record = store.get_outbox_record(id).await.unwrap().unwrap();
    (record.status, record.retry_count)
}

#[tokio::test]
async fn order_is_published_within_one_relay_cycle() {
    let p = pipeline();
    let (order, outbox_id) = place_order(&p.store).await;
    assert_eq!(order.total_price, Money::from_cents(1975));

    let record = p.store.get_outbox_record(outbox_id).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::Pending);
    assert_eq!(record.order_id, order.id);

    p.relay.run_once().await.unwrap();
    let report = p.consumer.poll_once().await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(status_of(&p.store, outbox_id).await.0, OutboxStatus::Published);

    let sent = p.mail.sent().await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].body.contains("Total: $19.75"));
}

#[tokio::test]
async fn transient_failures_recover_before_the_ceiling() {
    let p = pipeline();
    let (_, outbox_id) = place_order(&p.store).await;
    p.mail.fail_next(2);

    p.relay.run_once().await.unwrap();
    // Immediate redelivery: a single poll sees all three attempts
    let report = p.consumer.poll_once().await.unwrap();

    assert_eq!(report.retrying, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(p.mail.attempts(), 3);
    assert_eq!(status_of(&p.store, outbox_id).await.0, OutboxStatus::Published);
    assert_eq!(p.broker.dead_letter_len().await, 0);

    let dl = p.dead_letters.run_once().await.unwrap();
    assert_eq!(dl.failed, 0);
}

#[tokio::test]
async fn permanent_failure_ends_failed_to_publish_at_the_ceiling() {
    let p = pipeline();
    let (_, outbox_id) = place_order(&p.store).await;
    p.mail.set_always_fail(true);

    p.relay.run_once().await.unwrap();
    let report = p.consumer.poll_once().await.unwrap();
    assert_eq!(report.retrying, DEFAULT_DELIVERY_CEILING as usize);
    assert_eq!(p.broker.dead_letter_len().await, 1);

    let dl = p.dead_letters.run_once().await.unwrap();
    assert_eq!(dl.failed, 1);

    let (status, retry_count) = status_of(&p.store, outbox_id).await;
    assert_eq!(status, OutboxStatus::FailedToPublish);
    assert_eq!(retry_count, DEFAULT_DELIVERY_CEILING);

    // Terminal: never relayed again
    let again = p.relay.run_once().await.unwrap();
    assert_eq!(again.claimed, 0);
    assert_eq!(p.mail.attempts(), DEFAULT_DELIVERY_CEILING);
}

#[tokio::test]
async fn partially_spent_budget_is_rearmed_then_exhausted() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new(RedeliveryPolicy::immediate(2));
    let mail = InMemoryMailTransport::new();
    mail.set_always_fail(true);
    let relay = OutboxRelay::new(store.clone(), broker.clone(), RelayConfig::default());
    let consumer =
        NotificationConsumer::new(store.clone(), broker.clone(), mail.clone(), ConsumerConfig::default());
    let dead_letters = DeadLetterReconciler::new(store.clone(), broker.clone(), 5);
    let (_, outbox_id) = place_order(&store).await;

    // Each round the broker gives up after 2 attempts
    relay.run_once().await.unwrap();
    consumer.poll_once().await.unwrap();
    assert_eq!(dead_letters.run_once().await.unwrap().rearmed, 1);
    assert_eq!(status_of(&store, outbox_id).await, (OutboxStatus::Pending, 2));

    relay.run_once().await.unwrap();
    consumer.poll_once().await.unwrap();
    dead_letters.run_once().await.unwrap();
    assert_eq!(status_of(&store, outbox_id).await, (OutboxStatus::Pending, 4));

    relay.run_once().await.unwrap();
    consumer.poll_once().await.unwrap();
    assert_eq!(dead_letters.run_once().await.unwrap().failed, 1);
    assert_eq!(
        status_of(&store, outbox_id).await,
        (OutboxStatus::FailedToPublish, 5)
    );
}

#[tokio::test]
async fn redelivered_message_is_done_exactly_once() {
    let p = pipeline();
    let (_, outbox_id) = place_order(&p.store).await;

    p.relay.run_once().await.unwrap();
    // Simulate the broker delivering the same message several more times
    let record = p.store.get_outbox_record(outbox_id).await.unwrap().unwrap();
    for _ in 0..4 {
        p.broker
            .publish(Message {
                outbox_id,
                event_type: record.event_type.clone(),
                body: serde_json::to_vec(&record.payload).unwrap(),
            })
            .await
            .unwrap();
    }

    let report = p.consumer.poll_once().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.duplicates, 4);
    assert_eq!(p.mail.sent().await.len(), 1);
    assert_eq!(p.broker.in_flight_len().await, 0);
}

#[tokio::test]
async fn poison_payload_is_failed_without_retries() {
    let p = pipeline();
    let (_, outbox_id) = place_order(&p.store).await;

    p.broker
        .publish(Message {
            outbox_id,
            event_type: ORDER_CONFIRMATION_EVENT.into(),
            body: b"\x00not-json".to_vec(),
        })
        .await
        .unwrap();
    let delivery = p.broker.receive().await.unwrap().unwrap();
    let outcome = p.consumer.handle(delivery).await.unwrap();
    assert_eq!(outcome, ConsumeOutcome::Rejected);
    assert_eq!(p.mail.attempts(), 0);

    let dl = p.dead_letters.run_once().await.unwrap();
    assert_eq!(dl.failed, 1);
    assert_eq!(
        status_of(&p.store, outbox_id).await,
        (OutboxStatus::FailedToPublish, DEFAULT_DELIVERY_CEILING)
    );
}

#[tokio::test]
async fn late_dead_letter_cannot_regress_a_published_record() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new(RedeliveryPolicy::immediate(1));
    let mail = InMemoryMailTransport::new();
    let relay = OutboxRelay::new(
        store.clone(),
        broker.clone(),
        RelayConfig {
            redispatch_after: std::time::Duration::ZERO,
            ..RelayConfig::default()
        },
    );
    let consumer =
        NotificationConsumer::new(store.clone(), broker.clone(), mail.clone(), ConsumerConfig::default());
    let dead_letters = DeadLetterReconciler::new(store.clone(), broker.clone(), 5);
    let (_, outbox_id) = place_order(&store).await;

    // First copy fails and is dead-lettered; a redispatched copy succeeds
    mail.fail_next(1);
    relay.run_once().await.unwrap();
    consumer.poll_once().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    relay.run_once().await.unwrap();
    consumer.poll_once().await.unwrap();
    assert_eq!(status_of(&store, outbox_id).await.0, OutboxStatus::Published);

    let dl = dead_letters.run_once().await.unwrap();
    assert_eq!(dl.ignored, 1);
    assert_eq!(status_of(&store, outbox_id).await.0, OutboxStatus::Published);
}

#[tokio::test]
async fn store_outage_does_not_spend_the_delivery_budget() {
    let p = pipeline();
    let (_, outbox_id) = place_order(&p.store).await;
    p.relay.run_once().await.unwrap();

    p.store.set_unavailable(true);
    for _ in 0..DEFAULT_DELIVERY_CEILING * 2 {
        assert!(p.consumer.poll_once().await.is_err());
    }
    assert_eq!(p.broker.dead_letter_len().await, 0);
    assert_eq!(p.mail.attempts(), 0);

    p.store.set_unavailable(false);
    let report = p.consumer.poll_once().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(status_of(&p.store, outbox_id).await, (OutboxStatus::Published, 0));

    let dl = p.dead_letters.run_once().await.unwrap();
    assert_eq!(dl.failed, 0);
}
