//! Saga journal events.

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::payload::StepPayload;

/// Facts recorded about a saga, in the order they happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// Saga built and persisted in `pending`.
    SagaCreated(SagaCreatedData),

    SagaStarted(TimestampData),

    /// A forward step succeeded; its result is kept forever.
    StepSucceeded(StepSucceededData),

    /// A forward step exhausted its attempts.
    StepFailed(StepFailedData),

    CompensationStarted(CompensationStartedData),

    StepCompensated(StepCompensatedData),

    StepCompensationFailed(StepFailedData),

    SagaCompleted(TimestampData),

    SagaCompensated(TimestampData),

    SagaCompensationFailed(SagaCompensationFailedData),

    /// The recovery worker stopped retrying this saga.
    SagaDeadLettered(SagaDeadLetteredData),
}

impl SagaEvent {
    /// Discriminator stored alongside the payload in the journal.
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaCreated(_) => "SagaCreated",
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::StepSucceeded(_) => "StepSucceeded",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::CompensationStarted(_) => "CompensationStarted",
            SagaEvent::StepCompensated(_) => "StepCompensated",
            SagaEvent::StepCompensationFailed(_) => "StepCompensationFailed",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaCompensated(_) => "SagaCompensated",
            SagaEvent::SagaCompensationFailed(_) => "SagaCompensationFailed",
            SagaEvent::SagaDeadLettered(_) => "SagaDeadLettered",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaCreatedData {
    pub saga_id: SagaId,
    pub business_id: String,
    pub saga_type: String,
    /// Step names in execution order.
    pub steps: Vec<String>,
    pub metadata: Map<String, Value>,
    /// Input handed to the first step.
    pub input: StepPayload,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampData {
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSucceededData {
    pub step: String,
    pub attempts: u32,
    pub result: StepPayload,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationStartedData {
    /// The forward step whose failure triggered compensation; None when
    /// compensation was requested manually.
    pub from_step: Option<String>,
    pub reason: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompensatedData {
    pub step: String,
    /// Zero when the step had no compensating action.
    pub attempts: u32,
    pub compensated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaCompensationFailedData {
    pub failed_steps: Vec<String>,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaDeadLetteredData {
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

// Convenience constructors
impl SagaEvent {
    pub fn saga_created(
        saga_id: SagaId,
        business_id: impl Into<String>,
        saga_type: impl Into<String>,
        steps: Vec<String>,
        metadata: Map<String, Value>,
        input: StepPayload,
    ) -> Self {
        SagaEvent::SagaCreated(SagaCreatedData {
            saga_id,
            business_id: business_id.into(),
            saga_type: saga_type.into(),
            steps,
            metadata,
            input,
            created_at: Utc::now(),
        })
    }

    pub fn saga_started() -> Self {
        SagaEvent::SagaStarted(TimestampData { at: Utc::now() })
    }

    pub fn step_succeeded(step: impl Into<String>, attempts: u32, result: StepPayload) -> Self {
        SagaEvent::StepSucceeded(StepSucceededData {
            step: step.into(),
            attempts,
            result,
            executed_at: Utc::now(),
        })
    }

    pub fn step_failed(step: impl Into<String>, attempts: u32, error: impl Into<String>) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            step: step.into(),
            attempts,
            error: error.into(),
            failed_at: Utc::now(),
        })
    }

    pub fn compensation_started(from_step: Option<String>, reason: impl Into<String>) -> Self {
        SagaEvent::CompensationStarted(CompensationStartedData {
            from_step,
            reason: reason.into(),
            started_at: Utc::now(),
        })
    }

    pub fn step_compensated(step: impl Into<String>, attempts: u32) -> Self {
        SagaEvent::StepCompensated(StepCompensatedData {
            step: step.into(),
            attempts,
            compensated_at: Utc::now(),
        })
    }

    pub fn step_compensation_failed(
        step: impl Into<String>,
        attempts: u32,
        error: impl Into<String>,
    ) -> Self {
        SagaEvent::StepCompensationFailed(StepFailedData {
            step: step.into(),
            attempts,
            error: error.into(),
            failed_at: Utc::now(),
        })
    }

    pub fn saga_completed() -> Self {
        SagaEvent::SagaCompleted(TimestampData { at: Utc::now() })
    }

    pub fn saga_compensated() -> Self {
        SagaEvent::SagaCompensated(TimestampData { at: Utc::now() })
    }

    pub fn saga_compensation_failed(failed_steps: Vec<String>) -> Self {
        SagaEvent::SagaCompensationFailed(SagaCompensationFailedData {
            failed_steps,
            failed_at: Utc::now(),
        })
    }

    pub fn saga_dead_lettered(reason: impl Into<String>) -> Self {
        SagaEvent::SagaDeadLettered(SagaDeadLetteredData {
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        })
    }
}
