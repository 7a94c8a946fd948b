//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use common::{Money, ShutdownTrigger};
use locking::{InMemoryLockStore, LockCoordinator, LockStore, RedisLockStore};
use metrics_exporter_prometheus::PrometheusHandle;
use notifications::{InMemoryBroker, LogMailTransport};
use order_store::{
    Catalog, InMemoryCatalog, InMemoryStore, OrderStore, OutboxStore, PaymentStore, PostgresStore,
    Product,
};
use payments::InMemoryPaymentGateway;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn lock_coordinator(config: &Config) -> LockCoordinator {
    let store: Arc<dyn LockStore> = match &config.redis_url {
        Some(url) => {
            tracing::info!("using Redis lock store");
            Arc::new(RedisLockStore::new(url).expect("invalid REDIS_URL"))
        }
        None => {
            tracing::warn!("REDIS_URL not set, locks are local to this process");
            Arc::new(InMemoryLockStore::new())
        }
    };
    LockCoordinator::new(store, config.lock_config())
}

/// Serves HTTP and runs the background workers until a shutdown signal.
async fn run<S, C>(config: Config, store: S, catalog: C, metrics_handle: PrometheusHandle)
where
    S: OrderStore + OutboxStore + PaymentStore + Clone + 'static,
    C: Catalog + 'static,
{
    let shutdown = ShutdownTrigger::new();
    let broker = InMemoryBroker::new(config.redelivery_policy());
    let workers = api::spawn_workers(
        &config,
        store.clone(),
        broker,
        LogMailTransport,
        // No gateway client exists yet; callbacks still settle payments.
        None::<InMemoryPaymentGateway>,
        &shutdown,
    );

    let state = api::create_default_state(store, catalog, lock_coordinator(&config));
    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    shutdown.trigger();
    futures_util::future::join_all(workers).await;
    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the store and start serving
    match config.database_url.clone() {
        Some(url) => {
            let store = PostgresStore::connect(&url, 10)
                .await
                .expect("failed to connect to PostgreSQL");
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL store");
            run(config, store.clone(), store, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store with a demo catalog");
            let catalog = InMemoryCatalog::with_products([
                Product::new("SKU-001", "Notebook", Money::from_cents(1250)),
                Product::new("SKU-002", "Pen", Money::from_cents(725)),
            ]);
            run(config, InMemoryStore::new(), catalog, metrics_handle).await;
        }
    }
}
