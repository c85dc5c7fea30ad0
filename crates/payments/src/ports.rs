//! Collaborators the payment sagas call out to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{CallbackAudit, Customer, OrderStatus, Payment, Refund};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub merchant_id: Uuid,
    pub order_no: String,
    pub payment_no: String,
    pub amount: i64,
    pub currency: String,
    pub channel: String,
    pub pay_method: String,
    pub customer: Customer,
    pub description: Option<String>,
    pub extra: Map<String, Value>,
}

impl From<&Payment> for CreateOrderRequest {
    fn from(payment: &Payment) -> Self {
        Self {
            merchant_id: payment.merchant_id,
            order_no: payment.order_no.clone(),
            payment_no: payment.payment_no.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            channel: payment.channel.clone(),
            pay_method: payment.pay_method.clone(),
            customer: payment.customer.clone(),
            description: payment.description.clone(),
            extra: payment.extra.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderResponse {
    pub order_id: String,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusUpdate {
    pub status: OrderStatus,
    pub channel_order_no: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_msg: Option<String>,
}

impl OrderStatusUpdate {
    pub fn status(status: OrderStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

/// The order service.
#[async_trait]
pub trait OrderClient: Send + Sync {
    async fn create_order(&self, request: &CreateOrderRequest) -> Result<CreateOrderResponse>;

    async fn cancel_order(&self, order_no: &str, reason: &str) -> Result<()>;

    /// Pushes a status change for the order paid by `payment_no`.
    async fn update_order_status(&self, payment_no: &str, update: &OrderStatusUpdate)
    -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    pub payment_no: String,
    pub merchant_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub channel: String,
    pub pay_method: String,
    pub customer: Customer,
    pub description: Option<String>,
    pub notify_url: Option<String>,
    pub return_url: Option<String>,
    pub extra: Map<String, Value>,
}

impl From<&Payment> for CreatePaymentRequest {
    fn from(payment: &Payment) -> Self {
        Self {
            payment_no: payment.payment_no.clone(),
            merchant_id: payment.merchant_id,
            amount: payment.amount,
            currency: payment.currency.clone(),
            channel: payment.channel.clone(),
            pay_method: payment.pay_method.clone(),
            customer: payment.customer.clone(),
            description: payment.description.clone(),
            notify_url: payment.notify_url.clone(),
            return_url: payment.return_url.clone(),
            extra: payment.extra.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreatePaymentResponse {
    pub channel_trade_no: Option<String>,
    pub channel_order_no: Option<String>,
    pub payment_url: Option<String>,
    pub status: String,
}

impl CreatePaymentResponse {
    /// The channel's identifier for the charge; the trade number wins when
    /// both are present.
    pub fn channel_reference(&self) -> Option<&str> {
        [&self.channel_trade_no, &self.channel_order_no]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub payment_no: String,
    pub refund_no: String,
    pub channel_order_no: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundResponse {
    pub channel_refund_no: String,
    pub status: String,
}

/// A payment channel adapter (Stripe, PayPal, Alipay, ...).
#[async_trait]
pub trait ChannelClient: Send + Sync {
    async fn create_payment(&self, request: &CreatePaymentRequest)
    -> Result<CreatePaymentResponse>;

    /// Not every channel supports this; callers treat a failure as a
    /// reconciliation problem rather than a fatal error.
    async fn cancel_payment(&self, channel_order_no: &str) -> Result<()>;

    async fn create_refund(&self, request: &RefundRequest) -> Result<RefundResponse>;
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, message: Vec<u8>) -> Result<()>;
}

/// Local storage of payments, refunds and callback audit rows.
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn get_payment(&self, payment_no: &str) -> Result<Option<Payment>>;

    async fn save_payment(&self, payment: &Payment) -> Result<()>;

    async fn update_payment(&self, payment: &Payment) -> Result<()>;

    async fn get_refund(&self, refund_no: &str) -> Result<Option<Refund>>;

    async fn save_refund(&self, refund: &Refund) -> Result<()>;

    async fn update_refund(&self, refund: &Refund) -> Result<()>;

    async fn create_callback(&self, callback: &CallbackAudit) -> Result<()>;

    async fn mark_callback_compensated(&self, callback_id: Uuid) -> Result<()>;

    async fn callbacks_for_payment(&self, payment_no: &str) -> Result<Vec<CallbackAudit>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_number_preferred_over_order_number() {
        let response = CreatePaymentResponse {
            channel_trade_no: Some("TRADE-1".into()),
            channel_order_no: Some("ORDER-1".into()),
            ..Default::default()
        };
        assert_eq!(response.channel_reference(), Some("TRADE-1"));

        let response = CreatePaymentResponse {
            channel_order_no: Some("ORDER-1".into()),
            ..Default::default()
        };
        assert_eq!(response.channel_reference(), Some("ORDER-1"));

        assert_eq!(CreatePaymentResponse::default().channel_reference(), None);
    }

    #[test]
    fn test_order_request_mirrors_payment() {
        let payment = Payment::new("PAY-1", "ORD-1", Uuid::new_v4(), 500, "EUR", "paypal")
            .with_pay_method("wallet");
        let request = CreateOrderRequest::from(&payment);
        assert_eq!(request.order_no, "ORD-1");
        assert_eq!(request.payment_no, "PAY-1");
        assert_eq!(request.amount, 500);
        assert_eq!(request.pay_method, "wallet");
    }
}
