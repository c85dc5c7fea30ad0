//! Saga error types.

use saga_journal::JournalError;
use thiserror::Error;

use crate::state::{SagaStatus, SagaTransition};
use crate::step::StepError;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("business id must not be empty")]
    EmptyBusinessId,

    #[error("saga type must not be empty")]
    EmptySagaType,

    /// Two steps registered under the same name.
    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    /// Saga is in an invalid state for the requested operation.
    #[error("Invalid saga state: expected {expected}, actual {actual}")]
    InvalidState {
        expected: &'static str,
        actual: SagaStatus,
    },

    #[error("cannot apply {transition:?} to a saga in status {from}")]
    InvalidTransition {
        from: SagaStatus,
        transition: SagaTransition,
    },

    /// A forward step exhausted its attempts. Returned from `execute` after
    /// compensation has run, whatever the compensation outcome.
    #[error("Saga step '{step}' failed after {attempts} attempt(s): {source}")]
    StepFailed {
        step: String,
        attempts: u32,
        #[source]
        source: StepError,
    },

    /// Step definitions handed to the orchestrator do not line up with the
    /// steps recorded when the saga was built.
    #[error("step definitions do not match saga: expected {expected:?}, got {actual:?}")]
    StepMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("no saga found for business id '{0}'")]
    NotFound(String),

    /// A saga type has no registered step provider.
    #[error("no step provider registered for saga type '{0}'")]
    UnknownSagaType(String),

    #[error("review ticket delivery failed: {0}")]
    ReviewDelivery(String),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// The forward step error, if this is a step failure.
    pub fn step_error(&self) -> Option<&StepError> {
        match self {
            SagaError::StepFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
