//! Payment workflows run as sagas.
//!
//! Three sagas share one set of collaborator ports:
//!
//! ```text
//! payment           CreateOrder ──► CallPaymentChannel
//! refund            CallChannelRefund ──► UpdatePaymentStatus ──► UpdateRefundStatus
//! payment_callback  RecordCallback ──► UpdatePaymentStatus ──► UpdateOrderStatus ──► PublishEvent
//! ```
//!
//! Steps hold no per-payment state. They look records up by the saga's
//! business ID and hand typed results to the next step, so any saga can be
//! rebuilt from its journal and compensated later.

pub mod callback_saga;
pub mod error;
pub mod memory;
pub mod model;
pub mod payment_saga;
pub mod ports;
pub mod refund_saga;
mod workflow;

pub use callback_saga::{CALLBACK_SAGA_TYPE, CallbackSagaService, PAYMENT_EVENTS_TOPIC};
pub use error::{PaymentError, Result};
pub use memory::{
    InMemoryChannelClient, InMemoryMessageBus, InMemoryOrderClient, InMemoryPaymentRepository,
};
pub use model::{
    CallbackAudit, CallbackData, ChannelOutcome, Customer, OrderStatus, Payment, PaymentStatus,
    PaymentTransition, Refund, RefundStatus, RefundTransition,
};
pub use payment_saga::{PAYMENT_SAGA_TYPE, PaymentSagaService};
pub use ports::{
    ChannelClient, CreateOrderRequest, CreateOrderResponse, CreatePaymentRequest,
    CreatePaymentResponse, MessageBus, OrderClient, OrderStatusUpdate, PaymentRepository,
    RefundRequest, RefundResponse,
};
pub use refund_saga::{REFUND_SAGA_TYPE, RefundSagaService};

/// Error message written to records unwound by a saga compensation.
pub const COMPENSATION_ERROR_MSG: &str = "Saga compensation: distributed transaction rollback";
