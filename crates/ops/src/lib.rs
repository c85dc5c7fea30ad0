//! Operational HTTP surface for the saga engine.
//!
//! Exposes health, Prometheus metrics, saga lookup by business ID and
//! operator-triggered compensation, with request tracing on every route.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use payments::{
    CallbackSagaService, ChannelClient, MessageBus, OrderClient, PaymentRepository,
    PaymentSagaService, RefundSagaService,
};
use saga::{CompensationRegistry, SagaOrchestrator};
use tower_http::trace::TraceLayer;

pub use routes::sagas::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/sagas", get(routes::sagas::list))
        .route("/sagas/{business_id}", get(routes::sagas::get))
        .route(
            "/sagas/{business_id}/compensate",
            post(routes::sagas::compensate),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}

/// Collaborators the payment sagas talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub repo: Arc<dyn PaymentRepository>,
    pub orders: Arc<dyn OrderClient>,
    pub channel: Arc<dyn ChannelClient>,
    pub bus: Arc<dyn MessageBus>,
}

/// Registers the payment, refund and callback sagas for recovery and
/// manual compensation.
pub fn payment_registry(
    orchestrator: &SagaOrchestrator,
    collaborators: &Collaborators,
) -> CompensationRegistry {
    let Collaborators {
        repo,
        orders,
        channel,
        bus,
    } = collaborators.clone();

    CompensationRegistry::new()
        .with(Arc::new(PaymentSagaService::new(
            orchestrator.clone(),
            repo.clone(),
            orders.clone(),
            channel.clone(),
        )))
        .with(Arc::new(RefundSagaService::new(
            orchestrator.clone(),
            repo.clone(),
            channel,
        )))
        .with(Arc::new(CallbackSagaService::new(
            orchestrator.clone(),
            repo,
            orders,
            bus,
        )))
}

/// Creates application state over an orchestrator and a populated registry.
pub fn create_state(
    orchestrator: SagaOrchestrator,
    registry: Arc<CompensationRegistry>,
) -> Arc<AppState> {
    Arc::new(AppState {
        orchestrator,
        registry,
    })
}
