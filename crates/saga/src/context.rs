//! Per-attempt context handed to steps.

use std::sync::Arc;

use chrono::Utc;
use common::SagaId;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::review::{ReviewQueue, ReviewReason, ReviewTicket};

/// What a step can see about the saga it runs in.
#[derive(Debug, Clone)]
pub struct StepContext {
    saga_id: SagaId,
    business_id: String,
    saga_type: String,
    step: String,
    attempt: u32,
    metadata: Arc<Map<String, Value>>,
    cancel: CancellationToken,
    review: Option<ReviewQueue>,
}

impl StepContext {
    pub(crate) fn new(
        saga_id: SagaId,
        business_id: impl Into<String>,
        saga_type: impl Into<String>,
        metadata: Arc<Map<String, Value>>,
        cancel: CancellationToken,
        review: Option<ReviewQueue>,
    ) -> Self {
        Self {
            saga_id,
            business_id: business_id.into(),
            saga_type: saga_type.into(),
            step: String::new(),
            attempt: 0,
            metadata,
            cancel,
            review,
        }
    }

    pub(crate) fn for_attempt(&self, step: &str, attempt: u32) -> Self {
        Self {
            step: step.to_string(),
            attempt,
            ..self.clone()
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn business_id(&self) -> &str {
        &self.business_id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    /// Name of the step currently running.
    pub fn step(&self) -> &str {
        &self.step
    }

    /// 1-based attempt number of the current call.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Flags a side effect that compensation could not undo.
    ///
    /// Never blocks and never fails the step; without a review queue the
    /// request is only logged.
    pub fn request_manual_review(&self, detail: impl Into<String>) {
        let ticket = ReviewTicket {
            saga_id: self.saga_id,
            business_id: self.business_id.clone(),
            saga_type: self.saga_type.clone(),
            step: Some(self.step.clone()),
            reason: ReviewReason::IrreversibleSideEffect,
            detail: detail.into(),
            raised_at: Utc::now(),
        };

        match &self.review {
            Some(queue) => queue.raise(ticket),
            None => tracing::warn!(
                saga_id = %ticket.saga_id,
                business_id = %ticket.business_id,
                step = %self.step,
                detail = %ticket.detail,
                "manual review requested but no review queue is configured"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> StepContext {
        let mut metadata = Map::new();
        metadata.insert("amount".to_string(), Value::from(1000));
        StepContext::new(
            SagaId::new(),
            "PAY-1",
            "payment",
            Arc::new(metadata),
            CancellationToken::new(),
            None,
        )
    }

    #[test]
    fn for_attempt_sets_step_and_attempt() {
        let base = ctx();
        let attempt = base.for_attempt("CreateOrder", 2);
        assert_eq!(attempt.step(), "CreateOrder");
        assert_eq!(attempt.attempt(), 2);
        assert_eq!(attempt.business_id(), "PAY-1");
        assert_eq!(attempt.metadata_value("amount"), Some(&Value::from(1000)));
    }

    #[test]
    fn cancellation_is_shared_across_attempts() {
        let base = ctx();
        let attempt = base.for_attempt("CreateOrder", 1);
        base.cancellation_token().cancel();
        assert!(attempt.is_cancelled());
    }

    #[test]
    fn manual_review_without_queue_does_not_panic() {
        ctx()
            .for_attempt("CallChannelRefund", 1)
            .request_manual_review("refund already issued");
    }
}
