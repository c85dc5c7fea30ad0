//! Saga orchestrator: forward execution, compensation, and lookup.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::SagaId;
use saga_journal::{AppendOptions, JournalEntry, JournalQuery, SagaJournal};
use tokio_util::sync::CancellationToken;

use crate::aggregate::SagaInstance;
use crate::builder::SagaBuilder;
use crate::config::SagaConfig;
use crate::context::StepContext;
use crate::error::{Result, SagaError};
use crate::events::SagaEvent;
use crate::payload::StepPayload;
use crate::review::{ReviewQueue, ReviewReason, ReviewTicket};
use crate::state::{SagaStatus, SagaTransition};
use crate::step::{StepDefinition, StepError};

/// Runs sagas step by step and unwinds them on failure.
///
/// The orchestrator is the only writer of a saga's journal while it runs it.
/// It does not serialize two executions for the same business ID; callers
/// check [`find_saga`](Self::find_saga) before building a new one.
#[derive(Clone)]
pub struct SagaOrchestrator {
    journal: Arc<dyn SagaJournal>,
    config: SagaConfig,
    review: Option<ReviewQueue>,
}

impl SagaOrchestrator {
    pub fn new(journal: Arc<dyn SagaJournal>) -> Self {
        Self {
            journal,
            config: SagaConfig::default(),
            review: None,
        }
    }

    pub fn with_config(mut self, config: SagaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_review_queue(mut self, review: ReviewQueue) -> Self {
        self.review = Some(review);
        self
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    pub fn journal(&self) -> &Arc<dyn SagaJournal> {
        &self.journal
    }

    pub fn review_queue(&self) -> Option<&ReviewQueue> {
        self.review.as_ref()
    }

    /// Starts building a saga. Fails if either key is empty.
    pub fn saga_builder(
        &self,
        business_id: impl Into<String>,
        saga_type: impl Into<String>,
    ) -> Result<SagaBuilder> {
        SagaBuilder::new(self.clone(), business_id, saga_type)
    }

    /// Runs every step in order.
    ///
    /// Returns `Ok(())` only if every step succeeded. On a terminal step
    /// failure the succeeded steps are compensated in reverse order and the
    /// original step error is returned, whatever the compensation outcome.
    pub async fn execute(&self, saga: &mut SagaInstance, steps: &[StepDefinition]) -> Result<()> {
        self.execute_with_cancellation(saga, steps, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute); cancelling `cancel` fails the running
    /// attempt the same way a timeout does.
    #[tracing::instrument(
        skip(self, saga, steps, cancel),
        fields(saga_id = %saga.id(), business_id = %saga.business_id(), saga_type = %saga.saga_type())
    )]
    pub async fn execute_with_cancellation(
        &self,
        saga: &mut SagaInstance,
        steps: &[StepDefinition],
        cancel: CancellationToken,
    ) -> Result<()> {
        ensure_steps_match(saga, steps)?;

        match saga.status() {
            SagaStatus::Pending => {
                saga.status().transition(SagaTransition::Start)?;
                self.record(saga, SagaEvent::saga_started()).await?;
            }
            SagaStatus::Running => {
                tracing::info!(
                    next_step = ?saga.next_step_index(),
                    "resuming saga left running"
                );
            }
            actual => {
                return Err(SagaError::InvalidState {
                    expected: "pending or running",
                    actual,
                });
            }
        }

        let saga_type = saga.saga_type().to_string();
        metrics::counter!("saga_executions_total", "saga_type" => saga_type.clone()).increment(1);
        metrics::gauge!("saga_in_progress", "saga_type" => saga_type.clone()).increment(1.0);
        let started = Instant::now();

        let result = self.run_forward(saga, steps, &cancel).await;

        metrics::gauge!("saga_in_progress", "saga_type" => saga_type.clone()).decrement(1.0);
        metrics::histogram!("saga_duration_seconds", "saga_type" => saga_type.clone())
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(()) => {
                metrics::counter!("saga_completed_total", "saga_type" => saga_type).increment(1);
                tracing::info!(status = %saga.status(), "saga completed");
            }
            Err(SagaError::StepFailed { step, .. }) => {
                tracing::warn!(%step, status = %saga.status(), "saga failed");
            }
            Err(e) => {
                tracing::error!(error = %e, "saga execution aborted");
            }
        }

        result
    }

    async fn run_forward(
        &self,
        saga: &mut SagaInstance,
        steps: &[StepDefinition],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ctx = self.context_for(saga, cancel.clone());
        let start = saga.next_step_index().unwrap_or(steps.len());

        for (index, def) in steps.iter().enumerate().skip(start) {
            let input = saga.input_for_step(index);
            let (attempts, outcome) = self.run_step(&ctx, def, input).await;

            match outcome {
                Ok(result) => {
                    self.record(saga, SagaEvent::step_succeeded(&def.name, attempts, result))
                        .await?;
                }
                Err(error) => {
                    metrics::counter!("saga_step_failures_total", "step" => def.name.clone())
                        .increment(1);
                    tracing::warn!(
                        step = %def.name,
                        attempts,
                        error = %error,
                        "saga step failed, compensating"
                    );

                    self.record(
                        saga,
                        SagaEvent::step_failed(&def.name, attempts, error.message()),
                    )
                    .await?;

                    // A cancelled caller still gets its completed steps unwound.
                    let compensation_ctx = self.context_for(saga, CancellationToken::new());
                    self.run_compensation(
                        saga,
                        steps,
                        &compensation_ctx,
                        Some(def.name.clone()),
                        error.message().to_string(),
                    )
                    .await?;

                    return Err(SagaError::StepFailed {
                        step: def.name.clone(),
                        attempts,
                        source: error,
                    });
                }
            }
        }

        saga.status().transition(SagaTransition::Complete)?;
        self.record(saga, SagaEvent::saga_completed()).await?;
        Ok(())
    }

    /// Attempts a forward step up to `max_retry_count + 1` times.
    async fn run_step(
        &self,
        ctx: &StepContext,
        def: &StepDefinition,
        input: StepPayload,
    ) -> (u32, std::result::Result<StepPayload, StepError>) {
        let max_attempts = def.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.backoff(attempt, ctx.cancellation_token()).await;

            let attempt_ctx = ctx.for_attempt(&def.name, attempt);
            let started = Instant::now();
            let outcome = guarded(
                &def.name,
                def.timeout,
                ctx.cancellation_token(),
                def.step.execute(&attempt_ctx, input.clone()),
            )
            .await;

            metrics::counter!("saga_step_attempts_total", "step" => def.name.clone()).increment(1);
            metrics::histogram!("saga_step_duration_seconds", "step" => def.name.clone())
                .record(started.elapsed().as_secs_f64());

            match outcome {
                Ok(result) => {
                    tracing::debug!(step = %def.name, attempt, "saga step succeeded");
                    return (attempt, Ok(result));
                }
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        step = %def.name,
                        attempt,
                        max_attempts,
                        error = %error,
                        "saga step attempt failed, retrying"
                    );
                }
                Err(error) => return (attempt, Err(error)),
            }
        }
    }

    /// Unwinds a saga on request, e.g. an operator cancelling after the fact.
    ///
    /// Steps whose compensation already succeeded are skipped, so this can be
    /// re-run on a `compensation_failed` saga. Returns the resulting status.
    pub async fn compensate(
        &self,
        saga: &mut SagaInstance,
        steps: &[StepDefinition],
    ) -> Result<SagaStatus> {
        self.compensate_with_cancellation(saga, steps, CancellationToken::new())
            .await
    }

    #[tracing::instrument(
        skip(self, saga, steps, cancel),
        fields(saga_id = %saga.id(), business_id = %saga.business_id(), saga_type = %saga.saga_type())
    )]
    pub async fn compensate_with_cancellation(
        &self,
        saga: &mut SagaInstance,
        steps: &[StepDefinition],
        cancel: CancellationToken,
    ) -> Result<SagaStatus> {
        ensure_steps_match(saga, steps)?;

        if !saga.status().can_compensate() {
            return Err(SagaError::InvalidState {
                expected: "any status but compensated",
                actual: saga.status(),
            });
        }

        let ctx = self.context_for(saga, cancel);
        self.run_compensation(saga, steps, &ctx, None, "manual compensation".to_string())
            .await
    }

    async fn run_compensation(
        &self,
        saga: &mut SagaInstance,
        steps: &[StepDefinition],
        ctx: &StepContext,
        from_step: Option<String>,
        reason: String,
    ) -> Result<SagaStatus> {
        if saga.status() != SagaStatus::Compensating {
            saga.status().transition(SagaTransition::BeginCompensation)?;
            self.record(saga, SagaEvent::compensation_started(from_step, reason))
                .await?;
        }

        let mut failed_steps = Vec::new();

        for (index, def) in steps.iter().enumerate().rev() {
            let Some(record) = saga.steps().get(index) else {
                continue;
            };
            if !record.status.needs_compensation() {
                continue;
            }
            let result = record.result.clone().unwrap_or_default();

            if !def.step.has_compensation() {
                self.record(saga, SagaEvent::step_compensated(&def.name, 0))
                    .await?;
                continue;
            }

            let (attempts, outcome) = self.run_compensation_step(ctx, def, &result).await;
            metrics::counter!("saga_compensations_total", "step" => def.name.clone()).increment(1);

            match outcome {
                Ok(()) => {
                    tracing::info!(step = %def.name, attempts, "step compensated");
                    self.record(saga, SagaEvent::step_compensated(&def.name, attempts))
                        .await?;
                }
                Err(error) => {
                    tracing::error!(
                        step = %def.name,
                        business_id = %saga.business_id(),
                        attempts,
                        error = %error,
                        "step compensation failed, continuing with remaining steps"
                    );
                    self.record(
                        saga,
                        SagaEvent::step_compensation_failed(&def.name, attempts, error.message()),
                    )
                    .await?;
                    failed_steps.push(def.name.clone());
                }
            }
        }

        let all_succeeded = failed_steps.is_empty();
        saga.status()
            .transition(SagaTransition::FinishCompensation { all_succeeded })?;

        let saga_type = saga.saga_type().to_string();
        if all_succeeded {
            self.record(saga, SagaEvent::saga_compensated()).await?;
            metrics::counter!("saga_compensated_total", "saga_type" => saga_type).increment(1);
        } else {
            let detail = format!("compensation failed for steps: {}", failed_steps.join(", "));
            self.record(saga, SagaEvent::saga_compensation_failed(failed_steps))
                .await?;
            metrics::counter!("saga_compensation_failed_total", "saga_type" => saga_type)
                .increment(1);
            self.raise_review(saga, ReviewReason::CompensationFailed, detail);
        }

        Ok(saga.status())
    }

    async fn run_compensation_step(
        &self,
        ctx: &StepContext,
        def: &StepDefinition,
        result: &StepPayload,
    ) -> (u32, std::result::Result<(), StepError>) {
        let max_attempts = self.config.compensation_max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.backoff(attempt, ctx.cancellation_token()).await;

            let attempt_ctx = ctx.for_attempt(&def.name, attempt);
            let outcome = guarded(
                &def.name,
                def.timeout,
                ctx.cancellation_token(),
                def.step.compensate(&attempt_ctx, None, result),
            )
            .await;

            match outcome {
                Ok(()) => return (attempt, Ok(())),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        step = %def.name,
                        attempt,
                        error = %error,
                        "compensation attempt failed, retrying"
                    );
                }
                Err(error) => return (attempt, Err(error)),
            }
        }
    }

    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) {
        let delay = self.config.backoff_for(attempt);
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {}
        }
    }

    /// Records that the recovery worker gave up on the saga.
    pub async fn mark_dead_lettered(
        &self,
        saga: &mut SagaInstance,
        reason: impl Into<String>,
    ) -> Result<()> {
        let reason = reason.into();
        self.record(saga, SagaEvent::saga_dead_lettered(&reason))
            .await?;
        metrics::counter!("saga_dead_lettered_total", "saga_type" => saga.saga_type().to_string())
            .increment(1);
        self.raise_review(saga, ReviewReason::DeadLettered, reason);
        Ok(())
    }

    /// Loads a saga by ID. Returns None if nothing was journaled for it.
    pub async fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        let entries = self.journal.entries_for_saga(saga_id).await?;
        SagaInstance::from_entries(entries)
    }

    /// The most recent saga of any type for a business ID.
    pub async fn get_saga_by_business_id(&self, business_id: &str) -> Result<SagaInstance> {
        let saga_id = self
            .journal
            .latest_saga_for_business_id(business_id, None)
            .await?
            .ok_or_else(|| SagaError::NotFound(business_id.to_string()))?;

        self.get_saga(saga_id)
            .await?
            .ok_or_else(|| SagaError::NotFound(business_id.to_string()))
    }

    /// The most recent saga of a given type for a business ID, if any.
    pub async fn find_saga(
        &self,
        business_id: &str,
        saga_type: &str,
    ) -> Result<Option<SagaInstance>> {
        match self
            .journal
            .latest_saga_for_business_id(business_id, Some(saga_type))
            .await?
        {
            Some(saga_id) => self.get_saga(saga_id).await,
            None => Ok(None),
        }
    }

    /// Newest-first list of sagas currently in `status`.
    pub async fn list_sagas_by_status(
        &self,
        status: SagaStatus,
        limit: usize,
    ) -> Result<Vec<SagaInstance>> {
        let mut candidates = self.sagas_that_entered(status).await?;
        candidates.reverse();
        self.load_in_status(candidates, status, limit).await
    }

    /// `compensation_failed` sagas that are not dead-lettered, least recently
    /// attempted first.
    pub async fn list_recoverable_sagas(&self, limit: usize) -> Result<Vec<SagaInstance>> {
        let dead_lettered: HashSet<SagaId> = self
            .journal
            .query(JournalQuery::for_entry_type("SagaDeadLettered"))
            .await?
            .into_iter()
            .map(|entry| entry.saga_id)
            .collect();

        let candidates = self
            .sagas_that_entered(SagaStatus::CompensationFailed)
            .await?
            .into_iter()
            .filter(|id| !dead_lettered.contains(id))
            .collect();
        self.load_in_status(candidates, SagaStatus::CompensationFailed, limit)
            .await
    }

    /// IDs of sagas with an entry moving them into `status`, ordered by the
    /// last such entry, oldest first.
    async fn sagas_that_entered(&self, status: SagaStatus) -> Result<Vec<SagaId>> {
        let entries = self
            .journal
            .query(JournalQuery::for_entry_type(entering_event_type(status)))
            .await?;

        let mut seen = HashSet::new();
        let mut ids: Vec<SagaId> = entries
            .into_iter()
            .rev()
            .map(|entry| entry.saga_id)
            .filter(|id| seen.insert(*id))
            .collect();
        ids.reverse();
        Ok(ids)
    }

    async fn load_in_status(
        &self,
        candidates: Vec<SagaId>,
        status: SagaStatus,
        limit: usize,
    ) -> Result<Vec<SagaInstance>> {
        let mut sagas = Vec::new();
        for saga_id in candidates {
            if sagas.len() >= limit {
                break;
            }
            if let Some(saga) = self.get_saga(saga_id).await?
                && saga.status() == status
            {
                sagas.push(saga);
            }
        }
        Ok(sagas)
    }

    /// Appends an event to the saga's journal, then applies it.
    pub(crate) async fn record(&self, saga: &mut SagaInstance, event: SagaEvent) -> Result<()> {
        let (saga_id, business_id, saga_type) = match &event {
            SagaEvent::SagaCreated(data) => (
                data.saga_id,
                data.business_id.clone(),
                data.saga_type.clone(),
            ),
            _ => (
                saga.id(),
                saga.business_id().to_string(),
                saga.saga_type().to_string(),
            ),
        };

        let expected = saga.sequence();
        let entry = JournalEntry::new(
            saga_id,
            business_id,
            saga_type,
            expected.next(),
            event.event_type(),
            serde_json::to_value(&event)?,
        );
        let recorded_at = entry.recorded_at;

        let sequence = self
            .journal
            .append(vec![entry], AppendOptions::expect_sequence(expected))
            .await?;

        saga.apply(event);
        saga.mark_persisted(sequence, recorded_at);
        Ok(())
    }

    fn context_for(&self, saga: &SagaInstance, cancel: CancellationToken) -> StepContext {
        StepContext::new(
            saga.id(),
            saga.business_id(),
            saga.saga_type(),
            Arc::new(saga.metadata().clone()),
            cancel,
            self.review.clone(),
        )
    }

    fn raise_review(&self, saga: &SagaInstance, reason: ReviewReason, detail: String) {
        let ticket = ReviewTicket {
            saga_id: saga.id(),
            business_id: saga.business_id().to_string(),
            saga_type: saga.saga_type().to_string(),
            step: None,
            reason,
            detail,
            raised_at: Utc::now(),
        };
        match &self.review {
            Some(queue) => queue.raise(ticket),
            None => tracing::warn!(
                saga_id = %ticket.saga_id,
                business_id = %ticket.business_id,
                reason = reason.as_str(),
                detail = %ticket.detail,
                "saga needs manual review"
            ),
        }
    }
}

impl std::fmt::Debug for SagaOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("config", &self.config)
            .field("review", &self.review.is_some())
            .finish_non_exhaustive()
    }
}

fn ensure_steps_match(saga: &SagaInstance, steps: &[StepDefinition]) -> Result<()> {
    let matches = saga.steps().len() == steps.len()
        && saga
            .steps()
            .iter()
            .zip(steps)
            .all(|(record, def)| record.name == def.name);

    if matches {
        Ok(())
    } else {
        Err(SagaError::StepMismatch {
            expected: saga.step_names(),
            actual: steps.iter().map(|s| s.name.clone()).collect(),
        })
    }
}

/// Journal entry type that moves a saga into `status`.
fn entering_event_type(status: SagaStatus) -> &'static str {
    match status {
        SagaStatus::Pending => "SagaCreated",
        SagaStatus::Running => "SagaStarted",
        SagaStatus::Completed => "SagaCompleted",
        SagaStatus::Compensating => "CompensationStarted",
        SagaStatus::Compensated => "SagaCompensated",
        SagaStatus::CompensationFailed => "SagaCompensationFailed",
    }
}

/// Bounds one attempt by `timeout` and by cancellation.
async fn guarded<T>(
    step: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    attempt: impl Future<Output = std::result::Result<T, StepError>>,
) -> std::result::Result<T, StepError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StepError::cancelled(step)),
        outcome = tokio::time::timeout(timeout, attempt) => match outcome {
            Ok(result) => result,
            Err(_) => Err(StepError::timeout(step, timeout)),
        },
    }
}
