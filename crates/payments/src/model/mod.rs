//! Payment domain model.

mod records;
mod status;

pub use records::{CallbackAudit, CallbackData, Customer, Payment, Refund};
pub use status::{
    ChannelOutcome, OrderStatus, PaymentStatus, PaymentTransition, RefundStatus,
    RefundTransition,
};
