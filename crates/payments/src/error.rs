//! Payment error types.

use saga::{SagaError, SagaStatus, StepError};
use thiserror::Error;

use crate::model::{PaymentStatus, PaymentTransition, RefundStatus, RefundTransition};

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment '{0}' not found")]
    PaymentNotFound(String),

    #[error("refund '{0}' not found")]
    RefundNotFound(String),

    #[error("cannot apply {transition:?} to a payment in status {from}")]
    InvalidPaymentTransition {
        from: PaymentStatus,
        transition: PaymentTransition,
    },

    #[error("cannot apply {transition:?} to a refund in status {from}")]
    InvalidRefundTransition {
        from: RefundStatus,
        transition: RefundTransition,
    },

    #[error("unknown callback status: {0}")]
    UnknownCallbackStatus(String),

    #[error("invalid refund: {0}")]
    InvalidRefund(String),

    /// A saga for this business ID is still running.
    #[error("{saga_type} saga for '{business_id}' is still in progress ({status})")]
    SagaInProgress {
        business_id: String,
        saga_type: String,
        status: SagaStatus,
    },

    /// A saga for this business ID already ran and was unwound.
    #[error("{saga_type} saga for '{business_id}' already failed ({status})")]
    SagaAlreadyFailed {
        business_id: String,
        saga_type: String,
        status: SagaStatus,
    },

    /// A collaborator call failed in a way a retry may fix.
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    /// A collaborator refused the request.
    #[error("{service} rejected the request: {message}")]
    Rejected {
        service: &'static str,
        message: String,
    },

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PaymentError {
    pub fn unavailable(service: &'static str, message: impl Into<String>) -> Self {
        PaymentError::Unavailable {
            service,
            message: message.into(),
        }
    }

    pub fn rejected(service: &'static str, message: impl Into<String>) -> Self {
        PaymentError::Rejected {
            service,
            message: message.into(),
        }
    }

    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PaymentError::Unavailable { .. })
    }
}

impl From<PaymentError> for StepError {
    fn from(err: PaymentError) -> Self {
        if err.is_transient() {
            StepError::new(err.to_string())
        } else {
            StepError::permanent(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborator_outage_is_retryable() {
        let step: StepError = PaymentError::unavailable("channel", "connection reset").into();
        assert!(step.is_retryable());
        assert_eq!(step.message(), "channel unavailable: connection reset");
    }

    #[test]
    fn test_rejections_and_lookups_are_permanent() {
        let step: StepError = PaymentError::rejected("channel", "card declined").into();
        assert!(!step.is_retryable());

        let step: StepError = PaymentError::PaymentNotFound("PAY-1".into()).into();
        assert!(!step.is_retryable());
    }
}
