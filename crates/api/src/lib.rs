//! HTTP surface and process wiring for the checkout system.
//!
//! Exposes order creation and payment callbacks over REST, with structured
//! logging (tracing) and Prometheus metrics. The outbox pipeline and payment
//! reconciliation run as background workers beside the server.

pub mod config;
pub mod error;
pub mod routes;
pub mod workers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use locking::LockCoordinator;
use metrics_exporter_prometheus::PrometheusHandle;
use order_store::{Catalog, OrderStore, PaymentStore};
use ordering::OrderService;
use payments::PaymentLedger;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use routes::orders::AppState;
pub use workers::spawn_workers;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, C>(state: Arc<AppState<S, C>>, metrics_handle: PrometheusHandle) -> Router
where
    S: OrderStore + PaymentStore + Clone + 'static,
    C: Catalog + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create::<S, C>))
        .route("/orders/{id}", get(routes::orders::get::<S, C>))
        .route("/payments", post(routes::payments::register::<S, C>))
        .route("/payments/callback", post(routes::payments::callback::<S, C>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the application state over a store, a catalog and a lock coordinator.
pub fn create_default_state<S, C>(store: S, catalog: C, locks: LockCoordinator) -> Arc<AppState<S, C>>
where
    S: OrderStore + PaymentStore + Clone + 'static,
    C: Catalog + 'static,
{
    Arc::new(AppState {
        order_service: OrderService::new(store.clone(), catalog, locks),
        payment_ledger: PaymentLedger::new(store),
    })
}
