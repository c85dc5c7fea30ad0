use async_trait::async_trait;

use crate::{JournalEntry, JournalError, JournalQuery, Result, SagaId, Sequence};

/// Options for appending entries to the journal.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Sequence the saga is expected to be at before the append.
    /// If None, no check is performed.
    pub expected_sequence: Option<Sequence>,
}

impl AppendOptions {
    /// Creates options with no sequence check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expects the saga's latest entry to be at `sequence`.
    pub fn expect_sequence(sequence: Sequence) -> Self {
        Self {
            expected_sequence: Some(sequence),
        }
    }

    /// Expects the saga to have no entries yet.
    pub fn expect_new() -> Self {
        Self {
            expected_sequence: Some(Sequence::initial()),
        }
    }
}

/// Durable, append-only storage of saga history.
///
/// Implementations must be safe to share across tasks; the orchestrator holds
/// one behind an `Arc` and every saga execution writes through it.
#[async_trait]
pub trait SagaJournal: Send + Sync {
    /// Appends entries atomically.
    ///
    /// All entries must belong to the same saga and carry consecutive
    /// sequences. When `options.expected_sequence` is set and the saga has
    /// moved on, fails with `ConcurrencyConflict` and writes nothing.
    ///
    /// Returns the sequence of the last appended entry.
    async fn append(&self, entries: Vec<JournalEntry>, options: AppendOptions)
    -> Result<Sequence>;

    /// Every entry of one saga, oldest first.
    async fn entries_for_saga(&self, saga_id: SagaId) -> Result<Vec<JournalEntry>>;

    /// The most recently created saga recorded under `business_id`.
    ///
    /// When `saga_type` is given only sagas of that type are considered.
    async fn latest_saga_for_business_id(
        &self,
        business_id: &str,
        saga_type: Option<&str>,
    ) -> Result<Option<SagaId>>;

    /// Entries matching a query.
    async fn query(&self, query: JournalQuery) -> Result<Vec<JournalEntry>>;

    /// Sequence of the saga's latest entry, or None if nothing was written.
    async fn latest_sequence(&self, saga_id: SagaId) -> Result<Option<Sequence>>;
}

/// Convenience methods available on every journal.
#[async_trait]
pub trait SagaJournalExt: SagaJournal {
    /// Appends a single entry.
    async fn append_entry(&self, entry: JournalEntry, options: AppendOptions) -> Result<Sequence> {
        self.append(vec![entry], options).await
    }

    /// Checks whether anything has been written for the saga.
    async fn saga_exists(&self, saga_id: SagaId) -> Result<bool> {
        Ok(self.latest_sequence(saga_id).await?.is_some())
    }
}

impl<T: SagaJournal + ?Sized> SagaJournalExt for T {}

/// Rejects batches that could not have come from a single saga writer.
pub fn validate_entries_for_append(entries: &[JournalEntry]) -> Result<()> {
    let Some(first) = entries.first() else {
        return Err(JournalError::InvalidAppend(
            "cannot append an empty entry list".to_string(),
        ));
    };

    let mut expected = first.sequence;
    for entry in entries.iter().skip(1) {
        if entry.saga_id != first.saga_id {
            return Err(JournalError::InvalidAppend(
                "all entries must belong to the same saga".to_string(),
            ));
        }
        expected = expected.next();
        if entry.sequence != expected {
            return Err(JournalError::InvalidAppend(format!(
                "entry sequences must be consecutive: expected {expected}, got {}",
                entry.sequence
            )));
        }
    }

    Ok(())
}
