//! Refunds: refund at the channel, then settle the local records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use saga::{
    BuiltSaga, SagaError, SagaInstance, SagaOrchestrator, SagaStatus, SagaStep, StepContext,
    StepDefinition, StepError, StepPayload, StepProvider,
};
use serde::{Deserialize, Serialize};

use crate::COMPENSATION_ERROR_MSG;
use crate::error::{PaymentError, Result};
use crate::model::{
    PaymentStatus, PaymentTransition, Refund, RefundStatus, RefundTransition,
};
use crate::ports::{ChannelClient, PaymentRepository, RefundRequest};
use crate::workflow::{self, AfterRollback, Existing};

pub const REFUND_SAGA_TYPE: &str = "refund";

const CALL_CHANNEL_REFUND: &str = "CallChannelRefund";
const UPDATE_PAYMENT_STATUS: &str = "UpdatePaymentStatus";
const UPDATE_REFUND_STATUS: &str = "UpdateRefundStatus";
const MAX_RETRY_COUNT: u32 = 3;
const CHANNEL_TIMEOUT: Duration = Duration::from_secs(60);
const LOCAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelRefundIssued {
    channel_refund_no: String,
    status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentRefunded {
    payment_no: String,
    original_status: PaymentStatus,
    new_status: PaymentStatus,
    refunded_amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefundSettled {
    status: RefundStatus,
    refunded_at: DateTime<Utc>,
}

struct CallChannelRefund {
    repo: Arc<dyn PaymentRepository>,
    channel: Arc<dyn ChannelClient>,
}

#[async_trait]
impl SagaStep for CallChannelRefund {
    async fn execute(
        &self,
        ctx: &StepContext,
        _input: StepPayload,
    ) -> std::result::Result<StepPayload, StepError> {
        let mut refund = workflow::load_refund(self.repo.as_ref(), ctx.business_id()).await?;
        let payment = workflow::load_payment(self.repo.as_ref(), &refund.payment_no).await?;
        tracing::info!(
            refund_no = %refund.refund_no,
            payment_no = %payment.payment_no,
            "calling channel refund"
        );

        let response = self
            .channel
            .create_refund(&RefundRequest {
                payment_no: payment.payment_no.clone(),
                refund_no: refund.refund_no.clone(),
                channel_order_no: payment.channel_order_no.clone(),
                amount: refund.amount,
                currency: payment.currency.clone(),
                reason: refund.reason.clone(),
            })
            .await?;

        refund.channel_refund_no = Some(response.channel_refund_no.clone());
        if refund.status == RefundStatus::Pending {
            refund.apply(RefundTransition::Process)?;
        }
        // The money has moved; failing here would only issue a second refund.
        if let Err(e) = self.repo.update_refund(&refund).await {
            tracing::error!(
                refund_no = %refund.refund_no,
                channel_refund_no = %response.channel_refund_no,
                error = %e,
                "failed to record channel refund number"
            );
        }

        StepPayload::encode(&ChannelRefundIssued {
            channel_refund_no: response.channel_refund_no,
            status: response.status,
        })
    }

    /// Channel refunds cannot be cancelled once issued.
    async fn compensate(
        &self,
        ctx: &StepContext,
        _compensate_data: Option<StepPayload>,
        result: &StepPayload,
    ) -> std::result::Result<(), StepError> {
        let issued: ChannelRefundIssued = result.decode()?;
        tracing::warn!(
            refund_no = %ctx.business_id(),
            channel_refund_no = %issued.channel_refund_no,
            "channel refund cannot be automatically cancelled, manual processing may be required"
        );
        ctx.request_manual_review(format!(
            "channel refund {} was issued and cannot be reversed automatically",
            issued.channel_refund_no
        ));
        Ok(())
    }
}

struct UpdatePaymentStatus {
    repo: Arc<dyn PaymentRepository>,
}

#[async_trait]
impl SagaStep for UpdatePaymentStatus {
    async fn execute(
        &self,
        ctx: &StepContext,
        _input: StepPayload,
    ) -> std::result::Result<StepPayload, StepError> {
        let refund = workflow::load_refund(self.repo.as_ref(), ctx.business_id()).await?;
        let mut payment = workflow::load_payment(self.repo.as_ref(), &refund.payment_no).await?;
        tracing::info!(
            refund_no = %refund.refund_no,
            payment_no = %payment.payment_no,
            "marking payment refunded"
        );

        let original_status = payment.status;
        if payment.status != PaymentStatus::Refunded {
            payment.apply(PaymentTransition::Refund)?;
        }
        self.repo.update_payment(&payment).await?;

        StepPayload::encode(&PaymentRefunded {
            payment_no: payment.payment_no,
            original_status,
            new_status: payment.status,
            refunded_amount: refund.amount,
        })
    }

    async fn compensate(
        &self,
        ctx: &StepContext,
        _compensate_data: Option<StepPayload>,
        result: &StepPayload,
    ) -> std::result::Result<(), StepError> {
        let refunded: PaymentRefunded = result.decode()?;
        let mut payment =
            workflow::load_payment(self.repo.as_ref(), &refunded.payment_no).await?;
        tracing::info!(
            refund_no = %ctx.business_id(),
            payment_no = %payment.payment_no,
            restore_to = %refunded.original_status,
            "restoring payment status"
        );

        if payment.status == PaymentStatus::Refunded {
            payment.apply(PaymentTransition::RevertRefund)?;
        }
        if let Err(e) = self.repo.update_payment(&payment).await {
            tracing::error!(
                refund_no = %ctx.business_id(),
                error = %e,
                "failed to restore payment status during compensation"
            );
            return Err(e.into());
        }
        Ok(())
    }
}

struct UpdateRefundStatus {
    repo: Arc<dyn PaymentRepository>,
}

#[async_trait]
impl SagaStep for UpdateRefundStatus {
    async fn execute(
        &self,
        ctx: &StepContext,
        _input: StepPayload,
    ) -> std::result::Result<StepPayload, StepError> {
        let mut refund = workflow::load_refund(self.repo.as_ref(), ctx.business_id()).await?;
        tracing::info!(refund_no = %refund.refund_no, "marking refund successful");

        if refund.status != RefundStatus::Success {
            refund.apply(RefundTransition::Succeed)?;
        }
        let refunded_at = Utc::now();
        refund.refunded_at = Some(refunded_at);
        self.repo.update_refund(&refund).await?;

        StepPayload::encode(&RefundSettled {
            status: refund.status,
            refunded_at,
        })
    }

    async fn compensate(
        &self,
        ctx: &StepContext,
        _compensate_data: Option<StepPayload>,
        _result: &StepPayload,
    ) -> std::result::Result<(), StepError> {
        let mut refund = workflow::load_refund(self.repo.as_ref(), ctx.business_id()).await?;
        if refund.status != RefundStatus::Failed {
            refund.apply(RefundTransition::Fail)?;
        }
        refund.error_msg = Some(COMPENSATION_ERROR_MSG.to_string());
        refund.refunded_at = None;

        if let Err(e) = self.repo.update_refund(&refund).await {
            tracing::error!(
                refund_no = %refund.refund_no,
                error = %e,
                "failed to restore refund status during compensation"
            );
            return Err(e.into());
        }
        Ok(())
    }
}

/// Runs refunds as a saga.
#[derive(Clone)]
pub struct RefundSagaService {
    orchestrator: SagaOrchestrator,
    repo: Arc<dyn PaymentRepository>,
    channel: Arc<dyn ChannelClient>,
}

impl RefundSagaService {
    pub fn new(
        orchestrator: SagaOrchestrator,
        repo: Arc<dyn PaymentRepository>,
        channel: Arc<dyn ChannelClient>,
    ) -> Self {
        Self {
            orchestrator,
            repo,
            channel,
        }
    }

    pub fn steps(&self) -> Vec<StepDefinition> {
        vec![
            StepDefinition::new(
                CALL_CHANNEL_REFUND,
                Arc::new(CallChannelRefund {
                    repo: self.repo.clone(),
                    channel: self.channel.clone(),
                }),
                MAX_RETRY_COUNT,
                CHANNEL_TIMEOUT,
            ),
            StepDefinition::new(
                UPDATE_PAYMENT_STATUS,
                Arc::new(UpdatePaymentStatus {
                    repo: self.repo.clone(),
                }),
                MAX_RETRY_COUNT,
                LOCAL_TIMEOUT,
            ),
            StepDefinition::new(
                UPDATE_REFUND_STATUS,
                Arc::new(UpdateRefundStatus {
                    repo: self.repo.clone(),
                }),
                MAX_RETRY_COUNT,
                LOCAL_TIMEOUT,
            ),
        ]
    }

    /// Runs the refund saga for a stored, pending refund of a successful
    /// payment.
    #[tracing::instrument(skip(self, refund), fields(refund_no = %refund.refund_no, payment_no = %refund.payment_no))]
    pub async fn execute_refund_saga(&self, refund: &Refund) -> Result<SagaInstance> {
        if let Existing::Completed(saga) =
            workflow::check_existing(
                &self.orchestrator,
                &refund.refund_no,
                REFUND_SAGA_TYPE,
                AfterRollback::Refuse,
            )
            .await?
        {
            return Ok(saga);
        }

        let stored = workflow::load_refund(self.repo.as_ref(), &refund.refund_no).await?;
        let payment = workflow::load_payment(self.repo.as_ref(), &stored.payment_no).await?;
        if payment.status != PaymentStatus::Success {
            return Err(PaymentError::InvalidRefund(format!(
                "payment {} is {}",
                payment.payment_no, payment.status
            )));
        }
        if stored.amount <= 0 || stored.amount > payment.amount {
            return Err(PaymentError::InvalidRefund(format!(
                "amount {} outside 1..={}",
                stored.amount, payment.amount
            )));
        }
        if stored.status != RefundStatus::Pending {
            return Err(PaymentError::InvalidRefund(format!(
                "refund {} is {}",
                stored.refund_no, stored.status
            )));
        }

        let mut builder = self
            .orchestrator
            .saga_builder(&stored.refund_no, REFUND_SAGA_TYPE)?
            .metadata("refund_no", stored.refund_no.as_str())
            .metadata("payment_no", payment.payment_no.as_str())
            .metadata("merchant_id", payment.merchant_id.to_string())
            .metadata("amount", stored.amount)
            .metadata("currency", payment.currency.as_str());
        for step in self.steps() {
            builder = builder.add_definition(step);
        }
        let BuiltSaga {
            mut instance,
            steps,
        } = builder.build().await?;

        tracing::info!(saga_id = %instance.id(), "refund saga created");

        match self.orchestrator.execute(&mut instance, &steps).await {
            Ok(()) => {
                tracing::info!(saga_id = %instance.id(), "refund saga completed");
                Ok(instance)
            }
            Err(e) => {
                tracing::error!(
                    saga_id = %instance.id(),
                    status = %instance.status(),
                    error = %e,
                    "refund saga execution failed"
                );
                if e.step_error().is_some() {
                    self.mark_failed(&stored.refund_no, &e).await;
                }
                Err(e.into())
            }
        }
    }

    pub async fn compensate_refund(&self, refund_no: &str) -> Result<SagaStatus> {
        workflow::compensate_latest(&self.orchestrator, self, refund_no).await
    }

    async fn mark_failed(&self, refund_no: &str, error: &SagaError) {
        let outcome: Result<()> = async {
            let mut refund = workflow::load_refund(self.repo.as_ref(), refund_no).await?;
            if refund.status == RefundStatus::Failed {
                return Ok(());
            }
            refund.apply(RefundTransition::Fail)?;
            refund.refunded_at = None;
            refund.error_msg = Some(
                error
                    .step_error()
                    .map(|e| e.message().to_string())
                    .unwrap_or_else(|| error.to_string()),
            );
            self.repo.update_refund(&refund).await
        }
        .await;

        if let Err(e) = outcome {
            tracing::error!(%refund_no, error = %e, "failed to mark refund failed");
        }
    }
}

impl StepProvider for RefundSagaService {
    fn saga_type(&self) -> &str {
        REFUND_SAGA_TYPE
    }

    fn step_definitions(&self, _saga: &SagaInstance) -> saga::Result<Vec<StepDefinition>> {
        Ok(self.steps())
    }
}

impl std::fmt::Debug for RefundSagaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefundSagaService")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}
