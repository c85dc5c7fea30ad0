//! Payment, refund and order status machines.

use serde::{Deserialize, Serialize};

use crate::error::PaymentError;

/// The status of a payment.
///
/// ```text
/// Pending ──► Processing ──┬──► Success ◄──► Refunded
///    │                     ├──► Failed
///    └─────────────────────┼──► Cancelled
///                          └──► Expired
/// ```
///
/// A callback compensation resets any settled status back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Processing,
    Success,
    Failed,
    Cancelled,
    Expired,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentTransition {
    /// The channel accepted the charge request.
    Initiate,
    Succeed,
    Fail,
    Cancel,
    Expire,
    Refund,
    /// Undo of a refund that did not go through.
    RevertRefund,
    /// Undo of a callback that was applied.
    Reset,
}

impl PaymentStatus {
    pub fn transition(self, transition: PaymentTransition) -> Result<PaymentStatus, PaymentError> {
        use PaymentStatus::*;
        use PaymentTransition::*;

        let next = match (self, transition) {
            (Pending, Initiate) => Processing,
            (Pending | Processing, Succeed) => Success,
            (Pending | Processing, Fail) => Failed,
            (Pending | Processing, Cancel) => Cancelled,
            (Pending | Processing, Expire) => Expired,
            (Success, Refund) => Refunded,
            (Refunded, RevertRefund) => Success,
            (Pending | Processing | Success | Failed | Cancelled, Reset) => Pending,
            (
                Pending | Processing | Success | Failed | Cancelled | Expired | Refunded,
                Initiate | Succeed | Fail | Cancel | Expire | Refund | RevertRefund | Reset,
            ) => {
                return Err(PaymentError::InvalidPaymentTransition {
                    from: self,
                    transition,
                });
            }
        };
        Ok(next)
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Failed
                | PaymentStatus::Cancelled
                | PaymentStatus::Expired
                | PaymentStatus::Refunded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Expired => "expired",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The status of a refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    #[default]
    Pending,
    Processing,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundTransition {
    /// The channel accepted the refund.
    Process,
    Succeed,
    Fail,
}

impl RefundStatus {
    pub fn transition(self, transition: RefundTransition) -> Result<RefundStatus, PaymentError> {
        use RefundStatus::*;
        use RefundTransition::*;

        let next = match (self, transition) {
            (Pending, Process) => Processing,
            (Pending | Processing, Succeed) => Success,
            (Pending | Processing | Success, Fail) => Failed,
            (Processing | Success | Failed, Process | Succeed | Fail) => {
                return Err(PaymentError::InvalidRefundTransition {
                    from: self,
                    transition,
                });
            }
        };
        Ok(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Processing => "processing",
            RefundStatus::Success => "success",
            RefundStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order status in the order service's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    Paid,
    PaymentFailed,
    Cancelled,
}

impl OrderStatus {
    /// Orders settle once from `Pending`; a settled order may only go back to
    /// `Pending` when a callback is unwound.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        match (self, next) {
            (Pending, Paid | PaymentFailed | Cancelled) => true,
            (Paid | PaymentFailed | Cancelled, Pending) => true,
            (Pending, Pending) => true,
            (Paid, Paid) | (PaymentFailed, PaymentFailed) | (Cancelled, Cancelled) => true,
            (Paid, PaymentFailed | Cancelled)
            | (PaymentFailed, Paid | Cancelled)
            | (Cancelled, Paid | PaymentFailed) => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::PaymentFailed => "payment_failed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment outcome reported by a channel webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOutcome {
    Success,
    Failed,
    Cancelled,
}

impl ChannelOutcome {
    pub fn payment_transition(&self) -> PaymentTransition {
        match self {
            ChannelOutcome::Success => PaymentTransition::Succeed,
            ChannelOutcome::Failed => PaymentTransition::Fail,
            ChannelOutcome::Cancelled => PaymentTransition::Cancel,
        }
    }

    pub fn order_status(&self) -> OrderStatus {
        match self {
            ChannelOutcome::Success => OrderStatus::Paid,
            ChannelOutcome::Failed => OrderStatus::PaymentFailed,
            ChannelOutcome::Cancelled => OrderStatus::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelOutcome::Success => "success",
            ChannelOutcome::Failed => "failed",
            ChannelOutcome::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ChannelOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChannelOutcome {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ChannelOutcome::Success),
            "failed" => Ok(ChannelOutcome::Failed),
            "cancelled" => Ok(ChannelOutcome::Cancelled),
            other => Err(PaymentError::UnknownCallbackStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_happy_path() {
        let status = PaymentStatus::Pending
            .transition(PaymentTransition::Initiate)
            .unwrap()
            .transition(PaymentTransition::Succeed)
            .unwrap();
        assert_eq!(status, PaymentStatus::Success);

        let refunded = status.transition(PaymentTransition::Refund).unwrap();
        assert_eq!(refunded, PaymentStatus::Refunded);
        assert!(refunded.is_final());
        assert_eq!(
            refunded.transition(PaymentTransition::RevertRefund).unwrap(),
            PaymentStatus::Success
        );
    }

    #[test]
    fn test_only_successful_payments_refund() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Processing,
            PaymentStatus::Failed,
            PaymentStatus::Cancelled,
            PaymentStatus::Expired,
            PaymentStatus::Refunded,
        ] {
            assert!(matches!(
                status.transition(PaymentTransition::Refund),
                Err(PaymentError::InvalidPaymentTransition { .. })
            ));
        }
    }

    #[test]
    fn test_settled_payment_cannot_fail() {
        assert!(
            PaymentStatus::Success
                .transition(PaymentTransition::Fail)
                .is_err()
        );
        assert!(
            PaymentStatus::Failed
                .transition(PaymentTransition::Succeed)
                .is_err()
        );
    }

    #[test]
    fn test_reset_returns_to_pending() {
        for status in [
            PaymentStatus::Success,
            PaymentStatus::Failed,
            PaymentStatus::Cancelled,
        ] {
            assert_eq!(
                status.transition(PaymentTransition::Reset).unwrap(),
                PaymentStatus::Pending
            );
        }
        assert!(
            PaymentStatus::Refunded
                .transition(PaymentTransition::Reset)
                .is_err()
        );
    }

    #[test]
    fn test_refund_transitions() {
        let status = RefundStatus::Pending
            .transition(RefundTransition::Process)
            .unwrap();
        assert_eq!(status, RefundStatus::Processing);
        let status = status.transition(RefundTransition::Succeed).unwrap();
        assert_eq!(status, RefundStatus::Success);
        assert_eq!(
            status.transition(RefundTransition::Fail).unwrap(),
            RefundStatus::Failed
        );
        assert!(
            RefundStatus::Failed
                .transition(RefundTransition::Succeed)
                .is_err()
        );
    }

    #[test]
    fn test_pending_refund_accepts_every_transition() {
        let table = [
            (RefundTransition::Process, RefundStatus::Processing),
            (RefundTransition::Succeed, RefundStatus::Success),
            (RefundTransition::Fail, RefundStatus::Failed),
        ];
        for (transition, expected) in table {
            assert_eq!(
                RefundStatus::Pending.transition(transition).unwrap(),
                expected
            );
        }
        assert!(
            RefundStatus::Processing
                .transition(RefundTransition::Process)
                .is_err()
        );
    }

    #[test]
    fn test_order_status_transitions() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Paid));
        assert!(OrderStatus::Paid.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Paid.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Paid));
    }

    #[test]
    fn test_channel_outcome_mapping() {
        assert_eq!(ChannelOutcome::Success.order_status(), OrderStatus::Paid);
        assert_eq!(
            ChannelOutcome::Failed.order_status(),
            OrderStatus::PaymentFailed
        );
        assert_eq!(
            ChannelOutcome::Cancelled.order_status(),
            OrderStatus::Cancelled
        );
        assert_eq!(OrderStatus::PaymentFailed.as_str(), "payment_failed");
    }

    #[test]
    fn test_channel_outcome_parsing() {
        assert_eq!(
            "success".parse::<ChannelOutcome>().unwrap(),
            ChannelOutcome::Success
        );
        assert!(matches!(
            "refunded".parse::<ChannelOutcome>(),
            Err(PaymentError::UnknownCallbackStatus(s)) if s == "refunded"
        ));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(PaymentStatus::Processing).unwrap(),
            "processing"
        );
        assert_eq!(
            serde_json::to_value(OrderStatus::PaymentFailed).unwrap(),
            "payment_failed"
        );
    }
}
