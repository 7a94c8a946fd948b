//! Background workers that run beside the HTTP server.

use std::sync::Arc;

use common::{ShutdownTrigger, spawn_periodic};
use notifications::{
    Broker, DeadLetterReconciler, MailTransport, NotificationConsumer, OutboxPurger, OutboxRelay,
};
use order_store::{OutboxStore, PaymentStore};
use payments::{PaymentGateway, PaymentReconciler};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::config::Config;

/// Spawns the outbox relay, notification consumer, dead-letter reconciler,
/// outbox purger and, when a gateway is given, the payment reconciler.
///
/// Every task stops after its current cycle once `shutdown` fires. A failed
/// cycle is logged and retried on the next tick.
pub fn spawn_workers<S, B, M, G>(
    config: &Config,
    store: S,
    broker: B,
    mail: M,
    gateway: Option<G>,
    shutdown: &ShutdownTrigger,
) -> Vec<JoinHandle<()>>
where
    S: OutboxStore + PaymentStore + Clone + 'static,
    B: Broker + Clone + 'static,
    M: MailTransport + 'static,
    G: PaymentGateway + 'static,
{
    let relay = Arc::new(OutboxRelay::new(
        store.clone(),
        broker.clone(),
        config.relay_config(),
    ));
    let consumer_config = config.consumer_config();
    let poll_interval = consumer_config.poll_interval;
    let consumer = Arc::new(NotificationConsumer::new(
        store.clone(),
        broker.clone(),
        mail,
        consumer_config,
    ));
    let dead_letters = Arc::new(DeadLetterReconciler::new(
        store.clone(),
        broker,
        config.delivery_ceiling,
    ));
    let retention = config.retention_config();
    let retention_interval = retention.interval;
    let purger = Arc::new(OutboxPurger::new(store.clone(), retention));

    let mut workers = vec![
        spawn_periodic("outbox_relay", config.relay_interval, shutdown.subscribe(), move || {
            let relay = Arc::clone(&relay);
            async move {
                if let Err(e) = relay.run_once().await {
                    error!(error = %e, "Outbox relay cycle failed");
                }
            }
        }),
        spawn_periodic("notification_consumer", poll_interval, shutdown.subscribe(), move || {
            let consumer = Arc::clone(&consumer);
            async move {
                if let Err(e) = consumer.poll_once().await {
                    error!(error = %e, "Notification consumer poll failed");
                }
            }
        }),
        spawn_periodic("dead_letter_reconciler", config.relay_interval, shutdown.subscribe(), move || {
            let dead_letters = Arc::clone(&dead_letters);
            async move {
                if let Err(e) = dead_letters.run_once().await {
                    error!(error = %e, "Dead-letter reconciliation failed");
                }
            }
        }),
        spawn_periodic("outbox_purger", retention_interval, shutdown.subscribe(), move || {
            let purger = Arc::clone(&purger);
            async move {
                if let Err(e) = purger.run_once().await {
                    error!(error = %e, "Outbox purge failed");
                }
            }
        }),
    ];

    match gateway {
        Some(gateway) => {
            let reconciler = Arc::new(PaymentReconciler::new(
                store,
                gateway,
                config.reconciler_config(),
            ));
            workers.push(spawn_periodic(
                "payment_reconciler",
                config.reconcile_interval,
                shutdown.subscribe(),
                move || {
                    let reconciler = Arc::clone(&reconciler);
                    async move {
                        if let Err(e) = reconciler.sweep_once().await {
                            error!(error = %e, "Payment reconciliation sweep failed");
                        }
                    }
                },
            ));
        }
        None => warn!("No payment gateway configured, payment reconciler disabled"),
    }

    workers
}
