//! Payment, refund and callback records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::status::{ChannelOutcome, PaymentStatus, PaymentTransition, RefundStatus, RefundTransition};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub ip: Option<String>,
}

/// A payment as stored by the gateway. Amounts are in minor units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub payment_no: String,
    pub order_no: String,
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
    pub channel_order_no: Option<String>,
    pub status: PaymentStatus,
    pub error_msg: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(
        payment_no: impl Into<String>,
        order_no: impl Into<String>,
        merchant_id: Uuid,
        amount: i64,
        currency: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payment_no: payment_no.into(),
            order_no: order_no.into(),
            merchant_id,
            amount,
            currency: currency.into(),
            channel: channel.into(),
            pay_method: String::new(),
            customer: Customer::default(),
            description: None,
            notify_url: None,
            return_url: None,
            extra: Map::new(),
            channel_order_no: None,
            status: PaymentStatus::Pending,
            error_msg: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_pay_method(mut self, pay_method: impl Into<String>) -> Self {
        self.pay_method = pay_method.into();
        self
    }

    pub fn with_customer(mut self, customer: Customer) -> Self {
        self.customer = customer;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Moves the payment to a new status and touches `updated_at`.
    pub fn apply(&mut self, transition: PaymentTransition) -> Result<()> {
        self.status = self.status.transition(transition)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// URL the customer is redirected to, if the channel returned one.
    pub fn payment_url(&self) -> Option<&str> {
        self.extra.get("payment_url").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: Uuid,
    pub refund_no: String,
    pub payment_no: String,
    pub amount: i64,
    pub reason: Option<String>,
    pub channel_refund_no: Option<String>,
    pub status: RefundStatus,
    pub error_msg: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Refund {
    pub fn new(refund_no: impl Into<String>, payment_no: impl Into<String>, amount: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            refund_no: refund_no.into(),
            payment_no: payment_no.into(),
            amount,
            reason: None,
            channel_refund_no: None,
            status: RefundStatus::Pending,
            error_msg: None,
            refunded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn apply(&mut self, transition: RefundTransition) -> Result<()> {
        self.status = self.status.transition(transition)?;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Immutable audit row for an inbound channel callback.
///
/// Never deleted; an unwound callback is only flagged `compensated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackAudit {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub payment_no: String,
    pub channel: String,
    pub event: String,
    pub raw_data: String,
    pub is_verified: bool,
    pub compensated: bool,
    pub created_at: DateTime<Utc>,
    pub compensated_at: Option<DateTime<Utc>>,
}

impl CallbackAudit {
    pub fn record(payment: &Payment, callback: &CallbackData) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            payment_no: payment.payment_no.clone(),
            channel: payment.channel.clone(),
            event: format!("payment.{}", callback.outcome),
            raw_data: callback.raw_data.clone(),
            is_verified: true,
            compensated: false,
            created_at: Utc::now(),
            compensated_at: None,
        }
    }
}

/// A verified channel webhook, already parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackData {
    pub payment_no: String,
    pub outcome: ChannelOutcome,
    pub channel_order_no: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub raw_data: String,
}

impl CallbackData {
    /// Parses the channel's status string; unknown statuses are rejected
    /// before any saga is built.
    pub fn parse(
        payment_no: impl Into<String>,
        status: &str,
        raw_data: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            payment_no: payment_no.into(),
            outcome: status.parse()?,
            channel_order_no: None,
            paid_at: None,
            failure_reason: None,
            raw_data: raw_data.into(),
        })
    }

    pub fn with_channel_order_no(mut self, channel_order_no: impl Into<String>) -> Self {
        self.channel_order_no = Some(channel_order_no.into());
        self
    }

    pub fn with_paid_at(mut self, paid_at: DateTime<Utc>) -> Self {
        self.paid_at = Some(paid_at);
        self
    }

    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }
}
