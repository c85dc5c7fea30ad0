//! Channel callbacks: audit, settle the payment and order, announce it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use saga::{
    BuiltSaga, SagaInstance, SagaOrchestrator, SagaStatus, SagaStep, StepContext,
    StepDefinition, StepError, StepPayload, StepProvider,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    CallbackAudit, CallbackData, ChannelOutcome, OrderStatus, PaymentStatus, PaymentTransition,
};
use crate::ports::{MessageBus, OrderClient, OrderStatusUpdate, PaymentRepository};
use crate::workflow::{self, AfterRollback, Existing};

pub const CALLBACK_SAGA_TYPE: &str = "payment_callback";

/// Topic payment domain events are published on.
pub const PAYMENT_EVENTS_TOPIC: &str = "payment.events";

const RECORD_CALLBACK: &str = "RecordCallback";
const UPDATE_PAYMENT_STATUS: &str = "UpdatePaymentStatus";
const UPDATE_ORDER_STATUS: &str = "UpdateOrderStatus";
const PUBLISH_EVENT: &str = "PublishEvent";
const MAX_RETRY_COUNT: u32 = 3;

const CALLBACK_EVENT: &str = "payment.callback";
const CALLBACK_COMPENSATED_EVENT: &str = "payment.callback.compensated";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CallbackRecorded {
    callback_id: Uuid,
    recorded_at: DateTime<Utc>,
    callback: CallbackData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentSettled {
    original_status: PaymentStatus,
    new_status: PaymentStatus,
    outcome: ChannelOutcome,
    paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderUpdated {
    order_no: String,
    order_status: OrderStatus,
    outcome: ChannelOutcome,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventPublished {
    event_published: bool,
    event_type: String,
    published_at: DateTime<Utc>,
}

/// Payload of a `payment.callback` event.
#[derive(Debug, Serialize)]
struct PaymentCallbackEvent<'a> {
    event_type: &'a str,
    payment_no: &'a str,
    order_no: &'a str,
    merchant_id: Uuid,
    status: ChannelOutcome,
    amount: i64,
    currency: &'a str,
    paid_at: Option<DateTime<Utc>>,
    occurred_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct CallbackCompensatedEvent<'a> {
    event_type: &'a str,
    payment_no: &'a str,
    order_no: &'a str,
    merchant_id: Uuid,
    reason: &'a str,
    occurred_at: DateTime<Utc>,
}

struct RecordCallback {
    repo: Arc<dyn PaymentRepository>,
}

#[async_trait]
impl SagaStep for RecordCallback {
    async fn execute(
        &self,
        ctx: &StepContext,
        input: StepPayload,
    ) -> std::result::Result<StepPayload, StepError> {
        let callback: CallbackData = input.decode()?;
        let payment = workflow::load_payment(self.repo.as_ref(), ctx.business_id()).await?;
        tracing::info!(
            payment_no = %payment.payment_no,
            outcome = %callback.outcome,
            "recording callback"
        );

        let audit = CallbackAudit::record(&payment, &callback);
        self.repo.create_callback(&audit).await?;

        StepPayload::encode(&CallbackRecorded {
            callback_id: audit.id,
            recorded_at: audit.created_at,
            callback,
        })
    }

    /// The audit row is flagged, never deleted.
    async fn compensate(
        &self,
        ctx: &StepContext,
        _compensate_data: Option<StepPayload>,
        result: &StepPayload,
    ) -> std::result::Result<(), StepError> {
        let recorded: CallbackRecorded = result.decode()?;
        if let Err(e) = self.repo.mark_callback_compensated(recorded.callback_id).await {
            tracing::error!(
                payment_no = %ctx.business_id(),
                callback_id = %recorded.callback_id,
                error = %e,
                "failed to mark callback as compensated"
            );
            return Err(e.into());
        }
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
        input: StepPayload,
    ) -> std::result::Result<StepPayload, StepError> {
        let CallbackRecorded { callback, .. } = input.decode()?;
        let mut payment = workflow::load_payment(self.repo.as_ref(), ctx.business_id()).await?;
        tracing::info!(
            payment_no = %payment.payment_no,
            new_status = %callback.outcome,
            "updating payment status"
        );

        let original_status = payment.status;
        payment.apply(callback.outcome.payment_transition())?;
        match callback.outcome {
            ChannelOutcome::Success => {
                payment.paid_at = Some(callback.paid_at.unwrap_or_else(Utc::now));
                payment.error_msg = None;
            }
            ChannelOutcome::Failed => payment.error_msg = callback.failure_reason.clone(),
            ChannelOutcome::Cancelled => {}
        }
        if let Some(channel_order_no) = &callback.channel_order_no {
            payment.channel_order_no = Some(channel_order_no.clone());
        }
        self.repo.update_payment(&payment).await?;

        StepPayload::encode(&PaymentSettled {
            original_status,
            new_status: payment.status,
            outcome: callback.outcome,
            paid_at: payment.paid_at,
        })
    }

    async fn compensate(
        &self,
        ctx: &StepContext,
        _compensate_data: Option<StepPayload>,
        _result: &StepPayload,
    ) -> std::result::Result<(), StepError> {
        let mut payment = workflow::load_payment(self.repo.as_ref(), ctx.business_id()).await?;
        tracing::info!(payment_no = %payment.payment_no, "resetting payment to pending");

        payment.apply(PaymentTransition::Reset)?;
        payment.paid_at = None;
        payment.error_msg = None;

        if let Err(e) = self.repo.update_payment(&payment).await {
            tracing::error!(
                payment_no = %payment.payment_no,
                error = %e,
                "failed to restore payment status during compensation"
            );
            return Err(e.into());
        }
        Ok(())
    }
}

struct UpdateOrderStatus {
    repo: Arc<dyn PaymentRepository>,
    orders: Arc<dyn OrderClient>,
}

#[async_trait]
impl SagaStep for UpdateOrderStatus {
    async fn execute(
        &self,
        ctx: &StepContext,
        input: StepPayload,
    ) -> std::result::Result<StepPayload, StepError> {
        let settled: PaymentSettled = input.decode()?;
        let payment = workflow::load_payment(self.repo.as_ref(), ctx.business_id()).await?;
        let order_status = settled.outcome.order_status();
        tracing::info!(
            payment_no = %payment.payment_no,
            order_no = %payment.order_no,
            %order_status,
            "updating order status"
        );

        let update = OrderStatusUpdate {
            status: order_status,
            channel_order_no: payment.channel_order_no.clone(),
            paid_at: match settled.outcome {
                ChannelOutcome::Success => settled.paid_at,
                ChannelOutcome::Failed | ChannelOutcome::Cancelled => None,
            },
            error_code: None,
            error_msg: payment.error_msg.clone(),
        };
        self.orders
            .update_order_status(&payment.payment_no, &update)
            .await?;

        StepPayload::encode(&OrderUpdated {
            order_no: payment.order_no,
            order_status,
            outcome: settled.outcome,
            updated_at: Utc::now(),
        })
    }

    async fn compensate(
        &self,
        ctx: &StepContext,
        _compensate_data: Option<StepPayload>,
        result: &StepPayload,
    ) -> std::result::Result<(), StepError> {
        let updated: OrderUpdated = result.decode()?;
        tracing::info!(
            payment_no = %ctx.business_id(),
            order_no = %updated.order_no,
            "resetting order to pending"
        );

        if let Err(e) = self
            .orders
            .update_order_status(
                ctx.business_id(),
                &OrderStatusUpdate::status(OrderStatus::Pending),
            )
            .await
        {
            tracing::error!(
                payment_no = %ctx.business_id(),
                order_no = %updated.order_no,
                error = %e,
                "failed to restore order status during compensation"
            );
            return Err(e.into());
        }
        Ok(())
    }
}

/// Event delivery is not part of the money movement; publish failures are
/// logged and never fail the step.
struct PublishEvent {
    repo: Arc<dyn PaymentRepository>,
    bus: Arc<dyn MessageBus>,
}

impl PublishEvent {
    async fn publish(&self, payment_no: &str, event_type: &str, message: Vec<u8>) -> bool {
        match self.bus.publish(PAYMENT_EVENTS_TOPIC, message).await {
            Ok(()) => true,
            Err(e) => {
                metrics::counter!("payment_event_publish_failures_total", "event_type" => event_type.to_string())
                    .increment(1);
                tracing::error!(%payment_no, event_type, error = %e, "failed to publish payment event");
                false
            }
        }
    }
}

#[async_trait]
impl SagaStep for PublishEvent {
    async fn execute(
        &self,
        ctx: &StepContext,
        input: StepPayload,
    ) -> std::result::Result<StepPayload, StepError> {
        let updated: OrderUpdated = input.decode()?;
        let payment = workflow::load_payment(self.repo.as_ref(), ctx.business_id()).await?;
        tracing::info!(
            payment_no = %payment.payment_no,
            status = %updated.outcome,
            "publishing payment event"
        );

        let event = PaymentCallbackEvent {
            event_type: CALLBACK_EVENT,
            payment_no: &payment.payment_no,
            order_no: &payment.order_no,
            merchant_id: payment.merchant_id,
            status: updated.outcome,
            amount: payment.amount,
            currency: &payment.currency,
            paid_at: payment.paid_at,
            occurred_at: Utc::now(),
        };
        let published = self
            .publish(&payment.payment_no, CALLBACK_EVENT, serde_json::to_vec(&event)?)
            .await;

        StepPayload::encode(&EventPublished {
            event_published: published,
            event_type: CALLBACK_EVENT.to_string(),
            published_at: Utc::now(),
        })
    }

    async fn compensate(
        &self,
        ctx: &StepContext,
        _compensate_data: Option<StepPayload>,
        _result: &StepPayload,
    ) -> std::result::Result<(), StepError> {
        let payment = match workflow::load_payment(self.repo.as_ref(), ctx.business_id()).await {
            Ok(payment) => payment,
            Err(e) => {
                tracing::error!(
                    payment_no = %ctx.business_id(),
                    error = %e,
                    "cannot build compensation event"
                );
                return Ok(());
            }
        };

        let event = CallbackCompensatedEvent {
            event_type: CALLBACK_COMPENSATED_EVENT,
            payment_no: &payment.payment_no,
            order_no: &payment.order_no,
            merchant_id: payment.merchant_id,
            reason: "Saga compensation triggered",
            occurred_at: Utc::now(),
        };
        match serde_json::to_vec(&event) {
            Ok(message) => {
                self.publish(&payment.payment_no, CALLBACK_COMPENSATED_EVENT, message)
                    .await;
            }
            Err(e) => tracing::error!(error = %e, "failed to encode compensation event"),
        }
        Ok(())
    }
}

/// Applies channel callbacks as a saga.
#[derive(Clone)]
pub struct CallbackSagaService {
    orchestrator: SagaOrchestrator,
    repo: Arc<dyn PaymentRepository>,
    orders: Arc<dyn OrderClient>,
    bus: Arc<dyn MessageBus>,
}

impl CallbackSagaService {
    pub fn new(
        orchestrator: SagaOrchestrator,
        repo: Arc<dyn PaymentRepository>,
        orders: Arc<dyn OrderClient>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            orchestrator,
            repo,
            orders,
            bus,
        }
    }

    pub fn steps(&self) -> Vec<StepDefinition> {
        vec![
            StepDefinition::new(
                RECORD_CALLBACK,
                Arc::new(RecordCallback {
                    repo: self.repo.clone(),
                }),
                MAX_RETRY_COUNT,
                Duration::from_secs(10),
            ),
            StepDefinition::new(
                UPDATE_PAYMENT_STATUS,
                Arc::new(UpdatePaymentStatus {
                    repo: self.repo.clone(),
                }),
                MAX_RETRY_COUNT,
                Duration::from_secs(10),
            ),
            StepDefinition::new(
                UPDATE_ORDER_STATUS,
                Arc::new(UpdateOrderStatus {
                    repo: self.repo.clone(),
                    orders: self.orders.clone(),
                }),
                MAX_RETRY_COUNT,
                Duration::from_secs(30),
            ),
            StepDefinition::new(
                PUBLISH_EVENT,
                Arc::new(PublishEvent {
                    repo: self.repo.clone(),
                    bus: self.bus.clone(),
                }),
                MAX_RETRY_COUNT,
                Duration::from_secs(10),
            ),
        ]
    }

    /// Applies one verified callback to its payment.
    ///
    /// A redelivery after a compensated callback saga runs a new saga.
    #[tracing::instrument(skip(self, callback), fields(payment_no = %callback.payment_no, outcome = %callback.outcome))]
    pub async fn execute_callback_saga(&self, callback: CallbackData) -> Result<SagaInstance> {
        if let Existing::Completed(saga) =
            workflow::check_existing(
                &self.orchestrator,
                &callback.payment_no,
                CALLBACK_SAGA_TYPE,
                AfterRollback::Restart,
            )
            .await?
        {
            return Ok(saga);
        }
        let payment = workflow::load_payment(self.repo.as_ref(), &callback.payment_no).await?;

        let mut builder = self
            .orchestrator
            .saga_builder(&payment.payment_no, CALLBACK_SAGA_TYPE)?
            .metadata("payment_no", payment.payment_no.as_str())
            .metadata("merchant_id", payment.merchant_id.to_string())
            .metadata("channel_order_no", callback.channel_order_no.clone())
            .metadata("status", callback.outcome.as_str())
            .metadata("amount", payment.amount)
            .metadata("currency", payment.currency.as_str())
            .with_input(StepPayload::from(serde_json::to_value(&callback)?));
        for step in self.steps() {
            builder = builder.add_definition(step);
        }
        let BuiltSaga {
            mut instance,
            steps,
        } = builder.build().await?;

        tracing::info!(saga_id = %instance.id(), "payment callback saga created");

        match self.orchestrator.execute(&mut instance, &steps).await {
            Ok(()) => {
                tracing::info!(saga_id = %instance.id(), "payment callback saga completed");
                Ok(instance)
            }
            Err(e) => {
                tracing::error!(
                    saga_id = %instance.id(),
                    status = %instance.status(),
                    error = %e,
                    "payment callback saga execution failed"
                );
                Err(e.into())
            }
        }
    }

    pub async fn compensate_callback(&self, payment_no: &str) -> Result<SagaStatus> {
        workflow::compensate_latest(&self.orchestrator, self, payment_no).await
    }
}

impl StepProvider for CallbackSagaService {
    fn saga_type(&self) -> &str {
        CALLBACK_SAGA_TYPE
    }

    fn step_definitions(&self, _saga: &SagaInstance) -> saga::Result<Vec<StepDefinition>> {
        Ok(self.steps())
    }
}

impl std::fmt::Debug for CallbackSagaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSagaService")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use saga_journal::InMemorySagaJournal;

    use super::*;
    use crate::memory::{InMemoryMessageBus, InMemoryOrderClient, InMemoryPaymentRepository};

    #[test]
    fn test_steps_and_timeouts() {
        let service = CallbackSagaService::new(
            SagaOrchestrator::new(Arc::new(InMemorySagaJournal::new())),
            Arc::new(InMemoryPaymentRepository::new()),
            Arc::new(InMemoryOrderClient::new()),
            Arc::new(InMemoryMessageBus::new()),
        );
        let steps = service.steps();

        let timeouts: Vec<_> = steps
            .iter()
            .map(|s| (s.name.as_str(), s.timeout.as_secs()))
            .collect();
        assert_eq!(
            timeouts,
            vec![
                ("RecordCallback", 10),
                ("UpdatePaymentStatus", 10),
                ("UpdateOrderStatus", 30),
                ("PublishEvent", 10),
            ]
        );
    }

    #[test]
    fn test_published_event_shape() {
        let event = PaymentCallbackEvent {
            event_type: CALLBACK_EVENT,
            payment_no: "PAY-1",
            order_no: "ORD-1",
            merchant_id: Uuid::nil(),
            status: ChannelOutcome::Failed,
            amount: 500,
            currency: "USD",
            paid_at: None,
            occurred_at: Utc::now(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "payment.callback");
        assert_eq!(value["status"], "failed");
        assert!(value["paid_at"].is_null());
    }
}
