use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    JournalEntry, JournalError, JournalQuery, Result, SagaId, Sequence,
    store::{AppendOptions, SagaJournal, validate_entries_for_append},
};

/// In-memory journal for tests and single-process deployments.
///
/// Entries are kept in insertion order; the same consistency rules as the
/// PostgreSQL journal apply.
#[derive(Clone, Default)]
pub struct InMemorySagaJournal {
    entries: Arc<RwLock<Vec<JournalEntry>>>,
}

impl InMemorySagaJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries across all sagas.
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

fn current_sequence(entries: &[JournalEntry], saga_id: SagaId) -> Sequence {
    entries
        .iter()
        .filter(|e| e.saga_id == saga_id)
        .map(|e| e.sequence)
        .max()
        .unwrap_or(Sequence::initial())
}

fn matches(entry: &JournalEntry, query: &JournalQuery) -> bool {
    if let Some(id) = query.saga_id
        && entry.saga_id != id
    {
        return false;
    }
    if let Some(ref business_id) = query.business_id
        && &entry.business_id != business_id
    {
        return false;
    }
    if let Some(ref saga_type) = query.saga_type
        && &entry.saga_type != saga_type
    {
        return false;
    }
    if let Some(ref types) = query.entry_types
        && !types.contains(&entry.entry_type)
    {
        return false;
    }
    if let Some(from) = query.from_timestamp
        && entry.recorded_at < from
    {
        return false;
    }
    if let Some(to) = query.to_timestamp
        && entry.recorded_at > to
    {
        return false;
    }
    true
}

#[async_trait]
impl SagaJournal for InMemorySagaJournal {
    async fn append(
        &self,
        entries: Vec<JournalEntry>,
        options: AppendOptions,
    ) -> Result<Sequence> {
        validate_entries_for_append(&entries)?;

        let mut store = self.entries.write().await;

        let (saga_id, first_new, last_new) = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => (first.saga_id, first.sequence, last.sequence),
            _ => return Err(JournalError::InvalidAppend("empty batch".to_string())),
        };

        let current = current_sequence(&store, saga_id);

        if let Some(expected) = options.expected_sequence
            && current != expected
        {
            return Err(JournalError::ConcurrencyConflict {
                saga_id,
                expected,
                actual: current,
            });
        }

        // Same guarantee the unique (saga_id, sequence) constraint gives in Postgres.
        if first_new <= current {
            return Err(JournalError::ConcurrencyConflict {
                saga_id,
                expected: options.expected_sequence.unwrap_or(current),
                actual: current,
            });
        }

        store.extend(entries);
        Ok(last_new)
    }

    async fn entries_for_saga(&self, saga_id: SagaId) -> Result<Vec<JournalEntry>> {
        let store = self.entries.read().await;
        let mut entries: Vec<_> = store
            .iter()
            .filter(|e| e.saga_id == saga_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn latest_saga_for_business_id(
        &self,
        business_id: &str,
        saga_type: Option<&str>,
    ) -> Result<Option<SagaId>> {
        let store = self.entries.read().await;
        let latest = store
            .iter()
            .enumerate()
            .filter(|(_, e)| e.sequence == Sequence::first() && e.business_id == business_id)
            .filter(|(_, e)| saga_type.is_none_or(|t| e.saga_type == t))
            .max_by_key(|(position, e)| (e.recorded_at, *position))
            .map(|(_, e)| e.saga_id);
        Ok(latest)
    }

    async fn query(&self, query: JournalQuery) -> Result<Vec<JournalEntry>> {
        let store = self.entries.read().await;
        let mut entries: Vec<_> = store
            .iter()
            .filter(|e| matches(e, &query))
            .cloned()
            .collect();

        entries.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then(a.sequence.cmp(&b.sequence))
        });

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn latest_sequence(&self, saga_id: SagaId) -> Result<Option<Sequence>> {
        let store = self.entries.read().await;
        Ok(store
            .iter()
            .filter(|e| e.saga_id == saga_id)
            .map(|e| e.sequence)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::SagaJournalExt;

    fn entry(saga_id: SagaId, business_id: &str, sequence: i64, entry_type: &str) -> JournalEntry {
        JournalEntry::new(
            saga_id,
            business_id,
            "payment",
            Sequence::new(sequence),
            entry_type,
            serde_json::json!({"test": true}),
        )
    }

    #[tokio::test]
    async fn append_single_entry() {
        let journal = InMemorySagaJournal::new();
        let saga_id = SagaId::new();

        let seq = journal
            .append_entry(
                entry(saga_id, "PAY-1", 1, "SagaCreated"),
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
        assert_eq!(seq, Sequence::first());

        let entries = journal.entries_for_saga(saga_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(journal.saga_exists(saga_id).await.unwrap());
    }

    #[tokio::test]
    async fn append_batch_returns_last_sequence() {
        let journal = InMemorySagaJournal::new();
        let saga_id = SagaId::new();

        let batch = vec![
            entry(saga_id, "PAY-1", 1, "SagaCreated"),
            entry(saga_id, "PAY-1", 2, "SagaStarted"),
            entry(saga_id, "PAY-1", 3, "StepSucceeded"),
        ];
        let seq = journal
            .append(batch, AppendOptions::expect_new())
            .await
            .unwrap();
        assert_eq!(seq, Sequence::new(3));
        assert_eq!(journal.entry_count().await, 3);
    }

    #[tokio::test]
    async fn stale_writer_gets_conflict() {
        let journal = InMemorySagaJournal::new();
        let saga_id = SagaId::new();

        journal
            .append_entry(
                entry(saga_id, "PAY-1", 1, "SagaCreated"),
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let result = journal
            .append_entry(
                entry(saga_id, "PAY-1", 2, "SagaStarted"),
                AppendOptions::expect_sequence(Sequence::initial()),
            )
            .await;

        assert!(matches!(
            result,
            Err(JournalError::ConcurrencyConflict { .. })
        ));
        assert_eq!(journal.entry_count().await, 1);
    }

    #[tokio::test]
    async fn rewriting_a_sequence_is_a_conflict_without_expectation() {
        let journal = InMemorySagaJournal::new();
        let saga_id = SagaId::new();

        journal
            .append_entry(entry(saga_id, "PAY-1", 1, "SagaCreated"), AppendOptions::new())
            .await
            .unwrap();
        let result = journal
            .append_entry(entry(saga_id, "PAY-1", 1, "SagaCreated"), AppendOptions::new())
            .await;

        assert!(matches!(
            result,
            Err(JournalError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn latest_saga_for_business_id_prefers_newest() {
        let journal = InMemorySagaJournal::new();
        let older = SagaId::new();
        let newer = SagaId::new();
        let now = Utc::now();

        journal
            .append_entry(
                entry(older, "PAY-1", 1, "SagaCreated").recorded_at(now - Duration::seconds(10)),
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
        journal
            .append_entry(
                entry(newer, "PAY-1", 1, "SagaCreated").recorded_at(now),
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let found = journal
            .latest_saga_for_business_id("PAY-1", None)
            .await
            .unwrap();
        assert_eq!(found, Some(newer));

        let missing = journal
            .latest_saga_for_business_id("PAY-2", None)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn latest_saga_for_business_id_filters_by_type() {
        let journal = InMemorySagaJournal::new();
        let payment = SagaId::new();
        let callback = SagaId::new();

        journal
            .append_entry(
                entry(payment, "PAY-1", 1, "SagaCreated"),
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
        let mut callback_entry = entry(callback, "PAY-1", 1, "SagaCreated");
        callback_entry.saga_type = "callback".to_string();
        journal
            .append_entry(callback_entry, AppendOptions::expect_new())
            .await
            .unwrap();

        let found = journal
            .latest_saga_for_business_id("PAY-1", Some("payment"))
            .await
            .unwrap();
        assert_eq!(found, Some(payment));
    }

    #[tokio::test]
    async fn query_filters_and_paginates() {
        let journal = InMemorySagaJournal::new();
        let saga_id = SagaId::new();

        let batch = vec![
            entry(saga_id, "PAY-1", 1, "SagaCreated"),
            entry(saga_id, "PAY-1", 2, "StepSucceeded"),
            entry(saga_id, "PAY-1", 3, "StepSucceeded"),
            entry(saga_id, "PAY-1", 4, "SagaCompleted"),
        ];
        journal.append(batch, AppendOptions::new()).await.unwrap();

        let steps = journal
            .query(JournalQuery::for_saga(saga_id).entry_type("StepSucceeded"))
            .await
            .unwrap();
        assert_eq!(steps.len(), 2);

        let page = journal
            .query(JournalQuery::for_saga(saga_id).offset(1).limit(2))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].sequence, Sequence::new(2));
    }

    #[tokio::test]
    async fn latest_sequence_tracks_appends() {
        let journal = InMemorySagaJournal::new();
        let saga_id = SagaId::new();

        assert!(journal.latest_sequence(saga_id).await.unwrap().is_none());

        journal
            .append(
                vec![
                    entry(saga_id, "PAY-1", 1, "SagaCreated"),
                    entry(saga_id, "PAY-1", 2, "SagaStarted"),
                ],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            journal.latest_sequence(saga_id).await.unwrap(),
            Some(Sequence::new(2))
        );
    }
}
