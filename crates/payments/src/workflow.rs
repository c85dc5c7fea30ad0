//! Helpers shared by the payment services.

use saga::{SagaInstance, SagaOrchestrator, SagaStatus, StepProvider};

use crate::error::{PaymentError, Result};
use crate::model::{Payment, Refund};
use crate::ports::PaymentRepository;

/// Outcome of looking for an earlier saga with the same business key.
pub(crate) enum Existing {
    /// Nothing ran yet; start a new saga.
    Fresh,
    /// A completed saga; hand it back instead of running again.
    Completed(SagaInstance),
}

/// What a new request may do when the previous saga was fully unwound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AfterRollback {
    Refuse,
    /// Build a fresh saga; the unwind left the records ready for another run.
    Restart,
}

pub(crate) async fn check_existing(
    orchestrator: &SagaOrchestrator,
    business_id: &str,
    saga_type: &str,
    after_rollback: AfterRollback,
) -> Result<Existing> {
    let Some(saga) = orchestrator.find_saga(business_id, saga_type).await? else {
        return Ok(Existing::Fresh);
    };

    match saga.status() {
        SagaStatus::Completed => {
            tracing::info!(
                saga_id = %saga.id(),
                business_id,
                saga_type,
                "saga already completed, returning existing instance"
            );
            Ok(Existing::Completed(saga))
        }
        status @ (SagaStatus::Pending | SagaStatus::Running | SagaStatus::Compensating) => {
            Err(PaymentError::SagaInProgress {
                business_id: business_id.to_string(),
                saga_type: saga_type.to_string(),
                status,
            })
        }
        SagaStatus::Compensated if after_rollback == AfterRollback::Restart => {
            tracing::info!(
                saga_id = %saga.id(),
                business_id,
                saga_type,
                "previous saga was compensated, starting a new one"
            );
            Ok(Existing::Fresh)
        }
        status @ (SagaStatus::Compensated | SagaStatus::CompensationFailed) => {
            Err(PaymentError::SagaAlreadyFailed {
                business_id: business_id.to_string(),
                saga_type: saga_type.to_string(),
                status,
            })
        }
    }
}

/// Unwinds the latest saga of `provider`'s type for `business_id`.
pub(crate) async fn compensate_latest(
    orchestrator: &SagaOrchestrator,
    provider: &dyn StepProvider,
    business_id: &str,
) -> Result<SagaStatus> {
    let mut saga = orchestrator
        .find_saga(business_id, provider.saga_type())
        .await?
        .ok_or_else(|| saga::SagaError::NotFound(business_id.to_string()))?;

    let steps = provider.step_definitions(&saga)?;
    Ok(orchestrator.compensate(&mut saga, &steps).await?)
}

pub(crate) async fn load_payment(
    repo: &dyn PaymentRepository,
    payment_no: &str,
) -> Result<Payment> {
    repo.get_payment(payment_no)
        .await?
        .ok_or_else(|| PaymentError::PaymentNotFound(payment_no.to_string()))
}

pub(crate) async fn load_refund(repo: &dyn PaymentRepository, refund_no: &str) -> Result<Refund> {
    repo.get_refund(refund_no)
        .await?
        .ok_or_else(|| PaymentError::RefundNotFound(refund_no.to_string()))
}
