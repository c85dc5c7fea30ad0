//! The step contract implemented by every saga participant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::StepContext;
use crate::payload::StepPayload;

/// Failure of a single step attempt.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StepError {
    message: String,
    retryable: bool,
}

impl StepError {
    /// A failure worth retrying (network blips, collaborator 5xx).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure no retry can fix (validation, decline, bad payload).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(step: &str, timeout: Duration) -> Self {
        Self::new(format!("step '{step}' timed out after {timeout:?}"))
    }

    pub fn cancelled(step: &str) -> Self {
        Self::new(format!("step '{step}' cancelled"))
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent(format!("payload error: {err}"))
    }
}

/// A unit of work with an optional compensating action.
///
/// `execute` receives the previous step's result (or the saga input for the
/// first step). `compensate` receives that step's own recorded result.
#[async_trait]
pub trait SagaStep: Send + Sync {
    async fn execute(&self, ctx: &StepContext, input: StepPayload)
    -> Result<StepPayload, StepError>;

    async fn compensate(
        &self,
        _ctx: &StepContext,
        _compensate_data: Option<StepPayload>,
        _result: &StepPayload,
    ) -> Result<(), StepError> {
        Ok(())
    }

    /// Steps without a compensation are recorded as trivially compensated.
    fn has_compensation(&self) -> bool {
        true
    }
}

/// A step registered for one execution: the step plus its retry/timeout policy.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub step: Arc<dyn SagaStep>,
    /// Additional forward attempts after the first one.
    pub max_retry_count: u32,
    /// Bound on a single attempt of `execute` and of `compensate`.
    pub timeout: Duration,
}

impl StepDefinition {
    pub fn new(
        name: impl Into<String>,
        step: Arc<dyn SagaStep>,
        max_retry_count: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            step,
            max_retry_count,
            timeout,
        }
    }

    /// Total forward attempts this step is allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max_retry_count.saturating_add(1)
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("max_retry_count", &self.max_retry_count)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
