//! Ops server entry point: HTTP surface plus the compensation recovery worker.

use std::sync::Arc;

use ops::config::{LogFormat, OpsConfig};
use payments::{
    InMemoryChannelClient, InMemoryMessageBus, InMemoryOrderClient, InMemoryPaymentRepository,
};
use saga::{LoggingReviewSink, RecoveryWorker, ReviewQueue, SagaConfig, SagaOrchestrator};
use saga_journal::{InMemorySagaJournal, PostgresSagaJournal, SagaJournal};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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

fn init_tracing(config: &OpsConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = config.log_format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

async fn open_journal(config: &OpsConfig) -> Result<Arc<dyn SagaJournal>, BoxError> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let journal = PostgresSagaJournal::new(pool);
            journal.run_migrations().await?;
            tracing::info!("using PostgreSQL saga journal");
            Ok(Arc::new(journal))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, saga journal is in-memory");
            Ok(Arc::new(InMemorySagaJournal::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = OpsConfig::from_env();
    let saga_config = SagaConfig::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Journal, review queue and orchestrator
    let journal = open_journal(&config).await?;
    let (review_queue, _review_worker) = ReviewQueue::spawn(
        Arc::new(LoggingReviewSink),
        saga_config.review_queue_capacity,
    );
    let orchestrator = SagaOrchestrator::new(journal)
        .with_config(saga_config)
        .with_review_queue(review_queue);

    // 4. Step providers for every saga type
    tracing::warn!("payment collaborators are in-memory");
    let collaborators = ops::Collaborators {
        repo: Arc::new(InMemoryPaymentRepository::new()),
        orders: Arc::new(InMemoryOrderClient::new()),
        channel: Arc::new(InMemoryChannelClient::new()),
        bus: Arc::new(InMemoryMessageBus::new()),
    };
    let registry = Arc::new(ops::payment_registry(&orchestrator, &collaborators));

    // 5. Recovery worker
    let shutdown = CancellationToken::new();
    let recovery = tokio::spawn(
        RecoveryWorker::new(orchestrator.clone(), registry.clone()).run(shutdown.clone()),
    );

    // 6. Start server
    let app = ops::create_app(ops::create_state(orchestrator, registry), metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting ops server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Err(e) = recovery.await {
        tracing::error!(error = %e, "recovery worker panicked");
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}
