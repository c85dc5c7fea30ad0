use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SagaId;

/// Unique identifier of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Creates a new random entry ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an entry ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an entry within one saga's journal.
///
/// The first entry of a saga has sequence 1; [`Sequence::initial`] (0) stands
/// for "nothing written yet" and is what a brand new saga expects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(i64);

impl Sequence {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn initial() -> Self {
        Self(0)
    }

    pub fn first() -> Self {
        Self(1)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Sequence {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// One immutable fact about a saga.
///
/// The business ID and saga type are denormalised onto every entry so that
/// lookups by business key never need to replay a stream first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entry_id: EntryId,
    pub saga_id: SagaId,
    pub business_id: String,
    pub saga_type: String,
    pub sequence: Sequence,
    /// Discriminator of the payload (e.g. "SagaCreated", "StepSucceeded").
    pub entry_type: String,
    pub recorded_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl JournalEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(
        saga_id: SagaId,
        business_id: impl Into<String>,
        saga_type: impl Into<String>,
        sequence: Sequence,
        entry_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entry_id: EntryId::new(),
            saga_id,
            business_id: business_id.into(),
            saga_type: saga_type.into(),
            sequence,
            entry_type: entry_type.into(),
            recorded_at: Utc::now(),
            payload,
        }
    }

    /// Overrides the recording time. Mostly useful for backfills and tests.
    pub fn recorded_at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }
}
