//! Saga instance aggregate.

use chrono::{DateTime, Utc};
use common::SagaId;
use saga_journal::{JournalEntry, Sequence};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::events::SagaEvent;
use crate::payload::StepPayload;
use crate::state::{SagaStatus, StepStatus};

/// One attempt to undo a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub succeeded: bool,
    pub attempts: u32,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// History of one step. Never removed; compensations are appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    /// Forward attempts across every execution of this step.
    pub attempts: u32,
    pub result: Option<StepPayload>,
    pub last_error: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub compensations: Vec<CompensationRecord>,
}

impl StepRecord {
    fn new(name: String) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            attempts: 0,
            result: None,
            last_error: None,
            executed_at: None,
            compensations: Vec::new(),
        }
    }
}

/// An event-sourced saga instance.
///
/// Rebuilt by replaying its journal; every mutation goes through [`apply`](Self::apply).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SagaInstance {
    id: SagaId,
    business_id: String,
    saga_type: String,
    status: SagaStatus,
    steps: Vec<StepRecord>,
    metadata: Map<String, Value>,
    input: StepPayload,
    failed_step: Option<String>,
    last_error: Option<String>,
    dead_lettered: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sequence: Sequence,
}

impl SagaInstance {
    /// Replays journal entries. Returns None for an empty journal.
    pub fn from_entries(entries: Vec<JournalEntry>) -> Result<Option<Self>> {
        if entries.is_empty() {
            return Ok(None);
        }

        let mut saga = SagaInstance::default();
        for entry in entries {
            let event: SagaEvent = serde_json::from_value(entry.payload)?;
            saga.apply(event);
            saga.mark_persisted(entry.sequence, entry.recorded_at);
        }
        Ok(Some(saga))
    }

    pub fn apply(&mut self, event: SagaEvent) {
        match event {
            SagaEvent::SagaCreated(data) => {
                self.id = data.saga_id;
                self.business_id = data.business_id;
                self.saga_type = data.saga_type;
                self.status = SagaStatus::Pending;
                self.steps = data.steps.into_iter().map(StepRecord::new).collect();
                self.metadata = data.metadata;
                self.input = data.input;
                self.created_at = data.created_at;
                self.updated_at = data.created_at;
            }
            SagaEvent::SagaStarted(_) => {
                self.status = SagaStatus::Running;
            }
            SagaEvent::StepSucceeded(data) => {
                if let Some(record) = self.step_mut(&data.step) {
                    record.status = StepStatus::Succeeded;
                    record.attempts += data.attempts;
                    record.result = Some(data.result);
                    record.last_error = None;
                    record.executed_at = Some(data.executed_at);
                }
            }
            SagaEvent::StepFailed(data) => {
                if let Some(record) = self.step_mut(&data.step) {
                    record.status = StepStatus::Failed;
                    record.attempts += data.attempts;
                    record.last_error = Some(data.error.clone());
                    record.executed_at = Some(data.failed_at);
                }
                self.failed_step = Some(data.step);
                self.last_error = Some(data.error);
            }
            SagaEvent::CompensationStarted(_) => {
                self.status = SagaStatus::Compensating;
            }
            SagaEvent::StepCompensated(data) => {
                if let Some(record) = self.step_mut(&data.step) {
                    record.status = StepStatus::Compensated;
                    record.compensations.push(CompensationRecord {
                        succeeded: true,
                        attempts: data.attempts,
                        error: None,
                        at: data.compensated_at,
                    });
                }
            }
            SagaEvent::StepCompensationFailed(data) => {
                if let Some(record) = self.step_mut(&data.step) {
                    record.status = StepStatus::CompensationFailed;
                    record.compensations.push(CompensationRecord {
                        succeeded: false,
                        attempts: data.attempts,
                        error: Some(data.error),
                        at: data.failed_at,
                    });
                }
            }
            SagaEvent::SagaCompleted(_) => {
                self.status = SagaStatus::Completed;
            }
            SagaEvent::SagaCompensated(_) => {
                self.status = SagaStatus::Compensated;
            }
            SagaEvent::SagaCompensationFailed(_) => {
                self.status = SagaStatus::CompensationFailed;
            }
            SagaEvent::SagaDeadLettered(_) => {
                self.dead_lettered = true;
            }
        }
    }

    pub(crate) fn mark_persisted(&mut self, sequence: Sequence, at: DateTime<Utc>) {
        self.sequence = sequence;
        self.updated_at = at;
    }

    fn step_mut(&mut self, name: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.name == name)
    }
}

// Query methods
impl SagaInstance {
    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn business_id(&self) -> &str {
        &self.business_id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn input(&self) -> &StepPayload {
        &self.input
    }

    /// The forward step whose failure triggered compensation, if any.
    pub fn failed_step(&self) -> Option<&str> {
        self.failed_step.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.dead_lettered
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Sequence of the last journal entry applied.
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Index of the first step without a recorded success.
    pub fn next_step_index(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status != StepStatus::Succeeded)
    }

    /// Result of the most recent successful step before `index`, or the saga input.
    pub fn input_for_step(&self, index: usize) -> StepPayload {
        self.steps[..index.min(self.steps.len())]
            .iter()
            .rev()
            .find_map(|s| s.result.clone())
            .unwrap_or_else(|| self.input.clone())
    }

    /// Names of steps whose forward action succeeded at some point.
    pub fn succeeded_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.result.is_some())
            .map(|s| s.name.as_str())
            .collect()
    }
}
