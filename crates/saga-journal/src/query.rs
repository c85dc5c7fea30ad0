use chrono::{DateTime, Utc};

use crate::SagaId;

/// Filter over journal entries.
///
/// All set filters must match. Results come back ordered by recording time,
/// then by sequence.
#[derive(Debug, Clone, Default)]
pub struct JournalQuery {
    pub saga_id: Option<SagaId>,
    pub business_id: Option<String>,
    pub saga_type: Option<String>,
    /// Matches if the entry type is any of these.
    pub entry_types: Option<Vec<String>>,
    /// Inclusive lower bound on `recorded_at`.
    pub from_timestamp: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `recorded_at`.
    pub to_timestamp: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JournalQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query for every entry of one saga.
    pub fn for_saga(saga_id: SagaId) -> Self {
        Self {
            saga_id: Some(saga_id),
            ..Default::default()
        }
    }

    /// Query for entries of a single type.
    pub fn for_entry_type(entry_type: impl Into<String>) -> Self {
        Self {
            entry_types: Some(vec![entry_type.into()]),
            ..Default::default()
        }
    }

    pub fn business_id(mut self, business_id: impl Into<String>) -> Self {
        self.business_id = Some(business_id.into());
        self
    }

    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    pub fn entry_type(mut self, entry_type: impl Into<String>) -> Self {
        self.entry_types = Some(vec![entry_type.into()]);
        self
    }

    pub fn entry_types(mut self, entry_types: Vec<String>) -> Self {
        self.entry_types = Some(entry_types);
        self
    }

    pub fn from_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(timestamp);
        self
    }

    pub fn to_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.to_timestamp = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_filters() {
        let saga_id = SagaId::new();
        let query = JournalQuery::for_saga(saga_id)
            .business_id("PAY-1")
            .saga_type("payment")
            .entry_types(vec!["StepSucceeded".into(), "StepFailed".into()])
            .limit(10)
            .offset(5);

        assert_eq!(query.saga_id, Some(saga_id));
        assert_eq!(query.business_id.as_deref(), Some("PAY-1"));
        assert_eq!(query.saga_type.as_deref(), Some("payment"));
        assert_eq!(query.entry_types.as_ref().map(Vec::len), Some(2));
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.offset, Some(5));
    }

    #[test]
    fn for_entry_type_only_sets_type() {
        let query = JournalQuery::for_entry_type("SagaCreated");
        assert!(query.saga_id.is_none());
        assert_eq!(query.entry_types, Some(vec!["SagaCreated".to_string()]));
    }
}
