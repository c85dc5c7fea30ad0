use thiserror::Error;

use crate::{SagaId, Sequence};

/// Errors raised by journal backends.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Another writer appended to the saga since it was loaded.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected sequence {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Sequence,
        actual: Sequence,
    },

    /// The batch handed to `append` was malformed.
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for journal operations.
pub type Result<T> = std::result::Result<T, JournalError>;
