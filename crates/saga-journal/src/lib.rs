//! Append-only persistence for saga instances.
//!
//! Every state change of a saga is recorded as a [`JournalEntry`]. Entries are
//! never updated or deleted, so the journal doubles as the audit trail of
//! every money-moving step and its compensation.

pub mod entry;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use common::SagaId;
pub use entry::{EntryId, JournalEntry, Sequence};
pub use error::{JournalError, Result};
pub use memory::InMemorySagaJournal;
pub use postgres::PostgresSagaJournal;
pub use query::JournalQuery;
pub use store::{AppendOptions, SagaJournal, SagaJournalExt};
