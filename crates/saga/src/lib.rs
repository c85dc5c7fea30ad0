//! Saga orchestration for multi-step distributed transactions.
//!
//! A saga is a fixed, linear list of steps. The [`SagaOrchestrator`] runs
//! them in order, retrying each attempt within its budget, and when a step
//! fails for good it compensates every step that succeeded, newest first.
//! Every state change is appended to a [`saga_journal::SagaJournal`], so a
//! saga can be looked up by business ID and resumed or unwound later.
//!
//! ```text
//! SagaBuilder ──build──► SagaInstance (pending)
//!                              │
//!                  SagaOrchestrator::execute
//!                              │
//!              ┌───────────────┴───────────────┐
//!          all steps ok                  step k fails
//!              │                               │
//!          completed              compensate k-1 .. 1
//!                                              │
//!                              compensated | compensation_failed
//! ```

pub mod aggregate;
pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod payload;
pub mod recovery;
pub mod review;
pub mod state;
pub mod step;

pub use aggregate::{CompensationRecord, SagaInstance, StepRecord};
pub use builder::{BuiltSaga, SagaBuilder};
pub use common::SagaId;
pub use config::{DEFAULT_MAX_RETRY_COUNT, DEFAULT_STEP_TIMEOUT, SagaConfig};
pub use context::StepContext;
pub use error::{Result, SagaError};
pub use events::SagaEvent;
pub use orchestrator::SagaOrchestrator;
pub use payload::StepPayload;
pub use recovery::{CompensationRegistry, RecoveryReport, RecoveryWorker, StepProvider};
pub use review::{
    InMemoryReviewSink, LoggingReviewSink, ReviewQueue, ReviewReason, ReviewSink, ReviewTicket,
};
pub use state::{SagaStatus, SagaTransition, StepStatus};
pub use step::{SagaStep, StepDefinition, StepError};
