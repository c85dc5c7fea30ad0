//! In-memory collaborators for tests and local runs.
//!
//! Every fake records the operations called on it and can be told to fail
//! an operation a number of times, always, or only after some successful
//! calls.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{PaymentError, Result};
use crate::model::{CallbackAudit, OrderStatus, Payment, Refund};
use crate::ports::{
    ChannelClient, CreateOrderRequest, CreateOrderResponse, CreatePaymentRequest,
    CreatePaymentResponse, MessageBus, OrderClient, OrderStatusUpdate, PaymentRepository,
    RefundRequest, RefundResponse,
};

#[derive(Debug, Clone, Copy)]
struct Fault {
    skip: u32,
    remaining: u32,
    permanent: bool,
}

/// Call log plus the failures scheduled per operation.
#[derive(Debug, Default)]
struct Script {
    calls: Vec<&'static str>,
    faults: HashMap<&'static str, Fault>,
}

impl Script {
    fn schedule(&mut self, op: &'static str, skip: u32, times: u32, permanent: bool) {
        self.faults.insert(
            op,
            Fault {
                skip,
                remaining: times,
                permanent,
            },
        );
    }

    /// Records the call and returns the scheduled failure, if any.
    fn enter(&mut self, service: &'static str, op: &'static str) -> Result<()> {
        self.calls.push(op);

        let Some(fault) = self.faults.get_mut(op) else {
            return Ok(());
        };
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        if fault.remaining == 0 {
            return Ok(());
        }
        if fault.remaining != u32::MAX {
            fault.remaining -= 1;
        }

        let message = format!("injected failure in {op}");
        Err(if fault.permanent {
            PaymentError::rejected(service, message)
        } else {
            PaymentError::unavailable(service, message)
        })
    }

    fn count(&self, op: &str) -> usize {
        self.calls.iter().filter(|c| **c == op).count()
    }
}

macro_rules! fault_controls {
    ($ty:ty) => {
        impl $ty {
            /// Fails the next `times` calls of `op` with a transient error.
            pub async fn fail(&self, op: &'static str, times: u32) {
                self.state.lock().await.script.schedule(op, 0, times, false);
            }

            /// Lets `skip` calls of `op` through, then fails the next `times`.
            pub async fn fail_after(&self, op: &'static str, skip: u32, times: u32) {
                self.state.lock().await.script.schedule(op, skip, times, false);
            }

            pub async fn fail_always(&self, op: &'static str) {
                self.state
                    .lock()
                    .await
                    .script
                    .schedule(op, 0, u32::MAX, false);
            }

            /// Fails every call of `op` with a permanent rejection.
            pub async fn reject(&self, op: &'static str) {
                self.state
                    .lock()
                    .await
                    .script
                    .schedule(op, 0, u32::MAX, true);
            }

            pub async fn heal(&self, op: &'static str) {
                self.state.lock().await.script.faults.remove(op);
            }

            /// Number of calls of `op`, failed ones included.
            pub async fn call_count(&self, op: &str) -> usize {
                self.state.lock().await.script.count(op)
            }

            pub async fn calls(&self) -> Vec<&'static str> {
                self.state.lock().await.script.calls.clone()
            }
        }
    };
}

/// An order as the fake order service holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOrder {
    pub order_id: String,
    pub order_no: String,
    pub payment_no: String,
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,
}

#[derive(Debug, Default)]
struct OrderState {
    script: Script,
    orders: HashMap<String, StoredOrder>,
    cancellations: Vec<(String, String)>,
    status_updates: Vec<(String, OrderStatusUpdate)>,
    next_id: u32,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderClient {
    state: Arc<Mutex<OrderState>>,
}

fault_controls!(InMemoryOrderClient);

impl InMemoryOrderClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn order(&self, order_no: &str) -> Option<StoredOrder> {
        self.state.lock().await.orders.get(order_no).cloned()
    }

    /// Successful cancellations as `(order_no, reason)`.
    pub async fn cancellations(&self) -> Vec<(String, String)> {
        self.state.lock().await.cancellations.clone()
    }

    /// Accepted status pushes as `(payment_no, update)`.
    pub async fn status_updates(&self) -> Vec<(String, OrderStatusUpdate)> {
        self.state.lock().await.status_updates.clone()
    }
}

#[async_trait]
impl OrderClient for InMemoryOrderClient {
    async fn create_order(&self, request: &CreateOrderRequest) -> Result<CreateOrderResponse> {
        let mut state = self.state.lock().await;
        state.script.enter("order service", "create_order")?;

        if let Some(existing) = state.orders.get(&request.order_no) {
            return Ok(CreateOrderResponse {
                order_id: existing.order_id.clone(),
                status: existing.status,
            });
        }

        state.next_id += 1;
        let order = StoredOrder {
            order_id: format!("OID-{:04}", state.next_id),
            order_no: request.order_no.clone(),
            payment_no: request.payment_no.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            status: OrderStatus::Pending,
        };
        let response = CreateOrderResponse {
            order_id: order.order_id.clone(),
            status: order.status,
        };
        state.orders.insert(order.order_no.clone(), order);
        Ok(response)
    }

    async fn cancel_order(&self, order_no: &str, reason: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.script.enter("order service", "cancel_order")?;

        let order = state
            .orders
            .get_mut(order_no)
            .ok_or_else(|| PaymentError::rejected("order service", format!("no order {order_no}")))?;
        if !order.status.can_transition_to(OrderStatus::Cancelled) {
            return Err(PaymentError::rejected(
                "order service",
                format!("order {order_no} is {}", order.status),
            ));
        }
        order.status = OrderStatus::Cancelled;
        state
            .cancellations
            .push((order_no.to_string(), reason.to_string()));
        Ok(())
    }

    async fn update_order_status(
        &self,
        payment_no: &str,
        update: &OrderStatusUpdate,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.script.enter("order service", "update_order_status")?;

        if let Some(order) = state
            .orders
            .values_mut()
            .find(|o| o.payment_no == payment_no)
        {
            if !order.status.can_transition_to(update.status) {
                return Err(PaymentError::rejected(
                    "order service",
                    format!("order {} cannot go from {} to {}", order.order_no, order.status, update.status),
                ));
            }
            order.status = update.status;
        }
        state
            .status_updates
            .push((payment_no.to_string(), update.clone()));
        Ok(())
    }
}

/// A charge as the fake channel holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCharge {
    pub payment_no: String,
    pub amount: i64,
    pub cancelled: bool,
}

#[derive(Debug)]
struct ChannelState {
    script: Script,
    charges: HashMap<String, StoredCharge>,
    refunds: Vec<RefundRequest>,
    cancel_supported: bool,
    next_id: u32,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            script: Script::default(),
            charges: HashMap::new(),
            refunds: Vec::new(),
            cancel_supported: true,
            next_id: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryChannelClient {
    state: Arc<Mutex<ChannelState>>,
}

fault_controls!(InMemoryChannelClient);

impl InMemoryChannelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channels such as bank transfers cannot void a charge.
    pub async fn set_cancel_supported(&self, supported: bool) {
        self.state.lock().await.cancel_supported = supported;
    }

    pub async fn charge(&self, channel_order_no: &str) -> Option<StoredCharge> {
        self.state.lock().await.charges.get(channel_order_no).cloned()
    }

    pub async fn refunds(&self) -> Vec<RefundRequest> {
        self.state.lock().await.refunds.clone()
    }
}

#[async_trait]
impl ChannelClient for InMemoryChannelClient {
    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> Result<CreatePaymentResponse> {
        let mut state = self.state.lock().await;
        state.script.enter("channel", "create_payment")?;

        state.next_id += 1;
        let trade_no = format!("CH-{:06}", state.next_id);
        state.charges.insert(
            trade_no.clone(),
            StoredCharge {
                payment_no: request.payment_no.clone(),
                amount: request.amount,
                cancelled: false,
            },
        );

        Ok(CreatePaymentResponse {
            channel_trade_no: Some(trade_no),
            channel_order_no: None,
            payment_url: Some(format!("https://checkout.example/{}", request.payment_no)),
            status: "pending".to_string(),
        })
    }

    async fn cancel_payment(&self, channel_order_no: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.script.enter("channel", "cancel_payment")?;

        if !state.cancel_supported {
            return Err(PaymentError::rejected(
                "channel",
                "cancellation not supported",
            ));
        }
        let charge = state.charges.get_mut(channel_order_no).ok_or_else(|| {
            PaymentError::rejected("channel", format!("no charge {channel_order_no}"))
        })?;
        charge.cancelled = true;
        Ok(())
    }

    async fn create_refund(&self, request: &RefundRequest) -> Result<RefundResponse> {
        let mut state = self.state.lock().await;
        state.script.enter("channel", "create_refund")?;

        state.next_id += 1;
        let channel_refund_no = format!("RF-{:06}", state.next_id);
        state.refunds.push(request.clone());
        Ok(RefundResponse {
            channel_refund_no,
            status: "success".to_string(),
        })
    }
}

#[derive(Debug, Default)]
struct BusState {
    script: Script,
    published: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryMessageBus {
    state: Arc<Mutex<BusState>>,
}

fault_controls!(InMemoryMessageBus);

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Published messages as `(topic, decoded JSON)`.
    pub async fn published(&self) -> Vec<(String, Value)> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .map(|(topic, bytes)| {
                let value = serde_json::from_slice(bytes).unwrap_or(Value::Null);
                (topic.clone(), value)
            })
            .collect()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, topic: &str, message: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.script.enter("message bus", "publish")?;
        state.published.push((topic.to_string(), message));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RepositoryState {
    script: Script,
    payments: HashMap<String, Payment>,
    refunds: HashMap<String, Refund>,
    callbacks: Vec<CallbackAudit>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentRepository {
    state: Arc<Mutex<RepositoryState>>,
}

fault_controls!(InMemoryPaymentRepository);

impl InMemoryPaymentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentRepository for InMemoryPaymentRepository {
    async fn get_payment(&self, payment_no: &str) -> Result<Option<Payment>> {
        let mut state = self.state.lock().await;
        state.script.enter("payment store", "get_payment")?;
        Ok(state.payments.get(payment_no).cloned())
    }

    async fn save_payment(&self, payment: &Payment) -> Result<()> {
        let mut state = self.state.lock().await;
        state.script.enter("payment store", "save_payment")?;
        if state.payments.contains_key(&payment.payment_no) {
            return Err(PaymentError::rejected(
                "payment store",
                format!("payment {} already exists", payment.payment_no),
            ));
        }
        state
            .payments
            .insert(payment.payment_no.clone(), payment.clone());
        Ok(())
    }

    async fn update_payment(&self, payment: &Payment) -> Result<()> {
        let mut state = self.state.lock().await;
        state.script.enter("payment store", "update_payment")?;
        match state.payments.get_mut(&payment.payment_no) {
            Some(stored) => {
                *stored = payment.clone();
                Ok(())
            }
            None => Err(PaymentError::PaymentNotFound(payment.payment_no.clone())),
        }
    }

    async fn get_refund(&self, refund_no: &str) -> Result<Option<Refund>> {
        let mut state = self.state.lock().await;
        state.script.enter("payment store", "get_refund")?;
        Ok(state.refunds.get(refund_no).cloned())
    }

    async fn save_refund(&self, refund: &Refund) -> Result<()> {
        let mut state = self.state.lock().await;
        state.script.enter("payment store", "save_refund")?;
        if state.refunds.contains_key(&refund.refund_no) {
            return Err(PaymentError::rejected(
                "payment store",
                format!("refund {} already exists", refund.refund_no),
            ));
        }
        state
            .refunds
            .insert(refund.refund_no.clone(), refund.clone());
        Ok(())
    }

    async fn update_refund(&self, refund: &Refund) -> Result<()> {
        let mut state = self.state.lock().await;
        state.script.enter("payment store", "update_refund")?;
        match state.refunds.get_mut(&refund.refund_no) {
            Some(stored) => {
                *stored = refund.clone();
                Ok(())
            }
            None => Err(PaymentError::RefundNotFound(refund.refund_no.clone())),
        }
    }

    async fn create_callback(&self, callback: &CallbackAudit) -> Result<()> {
        let mut state = self.state.lock().await;
        state.script.enter("payment store", "create_callback")?;
        state.callbacks.push(callback.clone());
        Ok(())
    }

    async fn mark_callback_compensated(&self, callback_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .script
            .enter("payment store", "mark_callback_compensated")?;
        let callback = state
            .callbacks
            .iter_mut()
            .find(|c| c.id == callback_id)
            .ok_or_else(|| {
                PaymentError::rejected("payment store", format!("no callback {callback_id}"))
            })?;
        callback.compensated = true;
        callback.compensated_at = Some(Utc::now());
        Ok(())
    }

    async fn callbacks_for_payment(&self, payment_no: &str) -> Result<Vec<CallbackAudit>> {
        let mut state = self.state.lock().await;
        state.script.enter("payment store", "callbacks_for_payment")?;
        Ok(state
            .callbacks
            .iter()
            .filter(|c| c.payment_no == payment_no)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment() -> Payment {
        Payment::new("PAY-1", "ORD-1", Uuid::new_v4(), 1000, "USD", "stripe")
    }

    #[tokio::test]
    async fn test_fail_counts_down() {
        let orders = InMemoryOrderClient::new();
        orders.fail("create_order", 2).await;
        let request = CreateOrderRequest::from(&payment());

        assert!(orders.create_order(&request).await.is_err());
        assert!(orders.create_order(&request).await.is_err());
        assert!(orders.create_order(&request).await.is_ok());
        assert_eq!(orders.call_count("create_order").await, 3);
    }

    #[tokio::test]
    async fn test_fail_after_lets_calls_through_first() {
        let repo = InMemoryPaymentRepository::new();
        repo.save_payment(&payment()).await.unwrap();
        repo.fail_after("update_payment", 1, 1).await;

        assert!(repo.update_payment(&payment()).await.is_ok());
        let err = repo.update_payment(&payment()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(repo.update_payment(&payment()).await.is_ok());
    }

    #[tokio::test]
    async fn test_reject_is_permanent() {
        let bus = InMemoryMessageBus::new();
        bus.reject("publish").await;
        let err = bus.publish("t", b"{}".to_vec()).await.unwrap_err();
        assert!(!err.is_transient());

        bus.heal("publish").await;
        bus.publish("t", br#"{"a":1}"#.to_vec()).await.unwrap();
        assert_eq!(bus.published().await[0].1["a"], 1);
    }

    #[tokio::test]
    async fn test_create_order_is_idempotent_per_order_no() {
        let orders = InMemoryOrderClient::new();
        let request = CreateOrderRequest::from(&payment());
        let first = orders.create_order(&request).await.unwrap();
        let second = orders.create_order(&request).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
    }

    #[tokio::test]
    async fn test_cancelled_order_cannot_be_paid() {
        let orders = InMemoryOrderClient::new();
        orders
            .create_order(&CreateOrderRequest::from(&payment()))
            .await
            .unwrap();
        orders.cancel_order("ORD-1", "test").await.unwrap();

        let result = orders
            .update_order_status("PAY-1", &OrderStatusUpdate::status(OrderStatus::Paid))
            .await;
        assert!(result.is_err());
        assert_eq!(
            orders.order("ORD-1").await.unwrap().status,
            OrderStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_channel_without_cancellation() {
        let channel = InMemoryChannelClient::new();
        let response = channel
            .create_payment(&CreatePaymentRequest::from(&payment()))
            .await
            .unwrap();
        channel.set_cancel_supported(false).await;

        let trade_no = response.channel_reference().unwrap();
        assert!(channel.cancel_payment(trade_no).await.is_err());
        assert!(!channel.charge(trade_no).await.unwrap().cancelled);
    }
}
