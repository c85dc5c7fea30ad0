//! Background retry of failed compensations.
//!
//! Sagas that ended `compensation_failed` are picked up periodically and
//! their compensation re-run. Anything older than the dead-letter threshold
//! is handed to an operator instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::aggregate::SagaInstance;
use crate::error::{Result, SagaError};
use crate::orchestrator::SagaOrchestrator;
use crate::state::SagaStatus;
use crate::step::StepDefinition;

/// Rebuilds the step definitions of a persisted saga of one type.
pub trait StepProvider: Send + Sync {
    fn saga_type(&self) -> &str;

    fn step_definitions(&self, saga: &SagaInstance) -> Result<Vec<StepDefinition>>;
}

/// Step providers keyed by saga type.
#[derive(Clone, Default)]
pub struct CompensationRegistry {
    providers: HashMap<String, Arc<dyn StepProvider>>,
}

impl CompensationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider, replacing any previous one for the same type.
    pub fn register(&mut self, provider: Arc<dyn StepProvider>) {
        self.providers
            .insert(provider.saga_type().to_string(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn StepProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn steps_for(&self, saga: &SagaInstance) -> Result<Vec<StepDefinition>> {
        self.providers
            .get(saga.saga_type())
            .ok_or_else(|| SagaError::UnknownSagaType(saga.saga_type().to_string()))?
            .step_definitions(saga)
    }

    pub fn saga_types(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

/// Outcome of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub recovered: usize,
    pub still_failing: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
}

pub struct RecoveryWorker {
    orchestrator: SagaOrchestrator,
    registry: Arc<CompensationRegistry>,
    interval: Duration,
    batch_size: usize,
    dead_letter_after: Duration,
}

impl RecoveryWorker {
    /// Creates a worker using the orchestrator's recovery settings.
    pub fn new(orchestrator: SagaOrchestrator, registry: Arc<CompensationRegistry>) -> Self {
        let config = orchestrator.config().clone();
        Self {
            orchestrator,
            registry,
            interval: config.recovery_interval,
            batch_size: config.recovery_batch_size,
            dead_letter_after: config.dead_letter_after,
        }
    }

    pub fn with_dead_letter_after(mut self, dead_letter_after: Duration) -> Self {
        self.dead_letter_after = dead_letter_after;
        self
    }

    /// Runs one scan over `compensation_failed` sagas.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<RecoveryReport> {
        let candidates = self
            .orchestrator
            .list_recoverable_sagas(self.batch_size)
            .await?;

        let mut report = RecoveryReport::default();
        let dead_letter_after =
            chrono::Duration::from_std(self.dead_letter_after).unwrap_or(chrono::Duration::MAX);

        for mut saga in candidates {
            report.scanned += 1;

            if Utc::now() - saga.created_at() > dead_letter_after {
                let reason = format!(
                    "compensation still failing {} hours after creation",
                    dead_letter_after.num_hours()
                );
                match self.orchestrator.mark_dead_lettered(&mut saga, reason).await {
                    Ok(()) => report.dead_lettered += 1,
                    Err(e) => tracing::error!(
                        saga_id = %saga.id(),
                        business_id = %saga.business_id(),
                        error = %e,
                        "failed to dead-letter saga"
                    ),
                }
                continue;
            }

            let steps = match self.registry.steps_for(&saga) {
                Ok(steps) => steps,
                Err(e) => {
                    tracing::warn!(
                        saga_id = %saga.id(),
                        saga_type = %saga.saga_type(),
                        error = %e,
                        "cannot rebuild saga steps, skipping"
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            match self.orchestrator.compensate(&mut saga, &steps).await {
                Ok(SagaStatus::Compensated) => {
                    tracing::info!(
                        saga_id = %saga.id(),
                        business_id = %saga.business_id(),
                        "failed compensation recovered"
                    );
                    report.recovered += 1;
                }
                Ok(_) => report.still_failing += 1,
                Err(e) => {
                    tracing::error!(
                        saga_id = %saga.id(),
                        business_id = %saga.business_id(),
                        error = %e,
                        "compensation retry aborted"
                    );
                    report.still_failing += 1;
                }
            }
        }

        metrics::counter!("saga_recovery_runs_total").increment(1);
        metrics::counter!("saga_recovery_recovered_total").increment(report.recovered as u64);
        Ok(report)
    }

    /// Scans on every tick until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval = ?self.interval,
            batch_size = self.batch_size,
            "saga recovery worker started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.scanned > 0 => {
                            tracing::info!(?report, "saga recovery pass finished");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "saga recovery pass failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("saga recovery worker shutting down");
                    break;
                }
            }
        }
    }
}
