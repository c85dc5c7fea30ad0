//! Payment creation: create the order, then charge through the channel.

use std::sync::Arc;

use async_trait::async_trait;
use saga::{
    BuiltSaga, SagaError, SagaInstance, SagaOrchestrator, SagaStatus, SagaStep, StepContext,
    StepDefinition, StepError, StepPayload, StepProvider,
};
use serde::{Deserialize, Serialize};

use crate::COMPENSATION_ERROR_MSG;
use crate::error::Result;
use crate::model::{OrderStatus, Payment, PaymentStatus, PaymentTransition};
use crate::ports::{
    ChannelClient, CreateOrderRequest, CreatePaymentRequest, OrderClient, PaymentRepository,
};
use crate::workflow::{self, AfterRollback, Existing};

pub const PAYMENT_SAGA_TYPE: &str = "payment";

const CREATE_ORDER: &str = "CreateOrder";
const CALL_PAYMENT_CHANNEL: &str = "CallPaymentChannel";
const MAX_RETRY_COUNT: u32 = 3;
const ORDER_CANCEL_REASON: &str = "payment flow failed, auto cancel";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderCreated {
    order_id: String,
    order_no: String,
    status: OrderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChargeStarted {
    channel_order_no: Option<String>,
    payment_url: Option<String>,
    status: String,
}

struct CreateOrder {
    repo: Arc<dyn PaymentRepository>,
    orders: Arc<dyn OrderClient>,
}

#[async_trait]
impl SagaStep for CreateOrder {
    async fn execute(
        &self,
        ctx: &StepContext,
        _input: StepPayload,
    ) -> std::result::Result<StepPayload, StepError> {
        let payment = workflow::load_payment(self.repo.as_ref(), ctx.business_id()).await?;
        tracing::info!(
            payment_no = %payment.payment_no,
            order_no = %payment.order_no,
            "creating order"
        );

        let response = self
            .orders
            .create_order(&CreateOrderRequest::from(&payment))
            .await?;

        StepPayload::encode(&OrderCreated {
            order_id: response.order_id,
            order_no: payment.order_no,
            status: response.status,
        })
    }

    async fn compensate(
        &self,
        ctx: &StepContext,
        _compensate_data: Option<StepPayload>,
        result: &StepPayload,
    ) -> std::result::Result<(), StepError> {
        let created: OrderCreated = result.decode()?;
        tracing::info!(
            payment_no = %ctx.business_id(),
            order_no = %created.order_no,
            "cancelling order"
        );

        if let Err(e) = self
            .orders
            .cancel_order(&created.order_no, ORDER_CANCEL_REASON)
            .await
        {
            tracing::error!(
                payment_no = %ctx.business_id(),
                order_no = %created.order_no,
                error = %e,
                "failed to cancel order during compensation"
            );
            return Err(e.into());
        }
        Ok(())
    }
}

struct CallPaymentChannel {
    repo: Arc<dyn PaymentRepository>,
    channel: Arc<dyn ChannelClient>,
}

#[async_trait]
impl SagaStep for CallPaymentChannel {
    async fn execute(
        &self,
        ctx: &StepContext,
        _input: StepPayload,
    ) -> std::result::Result<StepPayload, StepError> {
        let mut payment = workflow::load_payment(self.repo.as_ref(), ctx.business_id()).await?;
        tracing::info!(
            payment_no = %payment.payment_no,
            channel = %payment.channel,
            "calling payment channel"
        );

        let response = self
            .channel
            .create_payment(&CreatePaymentRequest::from(&payment))
            .await?;

        if let Some(reference) = response.channel_reference() {
            payment.channel_order_no = Some(reference.to_string());
        }
        if let Some(url) = &response.payment_url {
            payment
                .extra
                .insert("payment_url".to_string(), url.clone().into());
        }
        if payment.status == PaymentStatus::Pending {
            payment.apply(PaymentTransition::Initiate)?;
        }

        // The charge is already live at the channel; a lost local update is
        // repaired by the channel callback.
        if let Err(e) = self.repo.update_payment(&payment).await {
            tracing::error!(
                payment_no = %payment.payment_no,
                error = %e,
                "failed to update payment after channel call"
            );
        }

        StepPayload::encode(&ChargeStarted {
            channel_order_no: payment.channel_order_no.clone(),
            payment_url: response.payment_url,
            status: response.status,
        })
    }

    async fn compensate(
        &self,
        ctx: &StepContext,
        _compensate_data: Option<StepPayload>,
        result: &StepPayload,
    ) -> std::result::Result<(), StepError> {
        let charge: ChargeStarted = result.decode()?;

        if let Some(channel_order_no) = &charge.channel_order_no {
            match self.channel.cancel_payment(channel_order_no).await {
                Ok(()) => tracing::info!(
                    payment_no = %ctx.business_id(),
                    %channel_order_no,
                    "charge cancelled at channel"
                ),
                Err(e) => {
                    tracing::error!(
                        payment_no = %ctx.business_id(),
                        %channel_order_no,
                        error = %e,
                        "failed to cancel charge at channel"
                    );
                    ctx.request_manual_review(format!(
                        "charge {channel_order_no} could not be cancelled at the channel: {e}"
                    ));
                }
            }
        }

        let mut payment = workflow::load_payment(self.repo.as_ref(), ctx.business_id()).await?;
        if payment.status != PaymentStatus::Failed {
            payment.apply(PaymentTransition::Fail)?;
        }
        payment.error_msg = Some(COMPENSATION_ERROR_MSG.to_string());

        if let Err(e) = self.repo.update_payment(&payment).await {
            tracing::error!(
                payment_no = %payment.payment_no,
                error = %e,
                "failed to mark payment failed during compensation"
            );
            return Err(e.into());
        }
        Ok(())
    }
}

/// Runs payment creation as a saga.
#[derive(Clone)]
pub struct PaymentSagaService {
    orchestrator: SagaOrchestrator,
    repo: Arc<dyn PaymentRepository>,
    orders: Arc<dyn OrderClient>,
    channel: Arc<dyn ChannelClient>,
}

impl PaymentSagaService {
    pub fn new(
        orchestrator: SagaOrchestrator,
        repo: Arc<dyn PaymentRepository>,
        orders: Arc<dyn OrderClient>,
        channel: Arc<dyn ChannelClient>,
    ) -> Self {
        Self {
            orchestrator,
            repo,
            orders,
            channel,
        }
    }

    pub fn steps(&self) -> Vec<StepDefinition> {
        let timeout = self.orchestrator.config().default_timeout;
        vec![
            StepDefinition::new(
                CREATE_ORDER,
                Arc::new(CreateOrder {
                    repo: self.repo.clone(),
                    orders: self.orders.clone(),
                }),
                MAX_RETRY_COUNT,
                timeout,
            ),
            StepDefinition::new(
                CALL_PAYMENT_CHANNEL,
                Arc::new(CallPaymentChannel {
                    repo: self.repo.clone(),
                    channel: self.channel.clone(),
                }),
                MAX_RETRY_COUNT,
                timeout,
            ),
        ]
    }

    /// Runs the payment saga for a stored payment.
    ///
    /// A payment whose saga already completed gets that saga back. On failure
    /// the payment is marked `failed` and the step error is returned.
    #[tracing::instrument(skip(self, payment), fields(payment_no = %payment.payment_no))]
    pub async fn execute_payment_saga(&self, payment: &Payment) -> Result<SagaInstance> {
        if let Existing::Completed(saga) =
            workflow::check_existing(
                &self.orchestrator,
                &payment.payment_no,
                PAYMENT_SAGA_TYPE,
                AfterRollback::Refuse,
            )
            .await?
        {
            return Ok(saga);
        }
        workflow::load_payment(self.repo.as_ref(), &payment.payment_no).await?;

        let mut builder = self
            .orchestrator
            .saga_builder(&payment.payment_no, PAYMENT_SAGA_TYPE)?
            .metadata("payment_no", payment.payment_no.as_str())
            .metadata("merchant_id", payment.merchant_id.to_string())
            .metadata("order_no", payment.order_no.as_str())
            .metadata("amount", payment.amount)
            .metadata("currency", payment.currency.as_str());
        for step in self.steps() {
            builder = builder.add_definition(step);
        }
        let BuiltSaga {
            mut instance,
            steps,
        } = builder.build().await?;

        tracing::info!(saga_id = %instance.id(), "payment saga created");

        match self.orchestrator.execute(&mut instance, &steps).await {
            Ok(()) => {
                tracing::info!(saga_id = %instance.id(), "payment saga completed");
                Ok(instance)
            }
            Err(e) => {
                tracing::error!(
                    saga_id = %instance.id(),
                    status = %instance.status(),
                    error = %e,
                    "payment saga execution failed"
                );
                if e.step_error().is_some() {
                    self.mark_failed(&payment.payment_no, &e).await;
                }
                Err(e.into())
            }
        }
    }

    /// Unwinds the payment saga on operator request.
    pub async fn compensate_payment(&self, payment_no: &str) -> Result<SagaStatus> {
        workflow::compensate_latest(&self.orchestrator, self, payment_no).await
    }

    async fn mark_failed(&self, payment_no: &str, error: &SagaError) {
        let outcome: Result<()> = async {
            let mut payment = workflow::load_payment(self.repo.as_ref(), payment_no).await?;
            if payment.status == PaymentStatus::Failed {
                return Ok(());
            }
            payment.apply(PaymentTransition::Fail)?;
            payment.error_msg = Some(
                error
                    .step_error()
                    .map(|e| e.message().to_string())
                    .unwrap_or_else(|| error.to_string()),
            );
            self.repo.update_payment(&payment).await
        }
        .await;

        if let Err(e) = outcome {
            tracing::error!(%payment_no, error = %e, "failed to mark payment failed");
        }
    }
}

impl StepProvider for PaymentSagaService {
    fn saga_type(&self) -> &str {
        PAYMENT_SAGA_TYPE
    }

    fn step_definitions(&self, _saga: &SagaInstance) -> saga::Result<Vec<StepDefinition>> {
        Ok(self.steps())
    }
}

impl std::fmt::Debug for PaymentSagaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentSagaService")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}
