use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    EntryId, JournalEntry, JournalError, JournalQuery, Result, SagaId, Sequence,
    store::{AppendOptions, SagaJournal, validate_entries_for_append},
};

const SELECT_COLUMNS: &str =
    "SELECT id, saga_id, business_id, saga_type, sequence, entry_type, recorded_at, payload FROM saga_journal";

/// PostgreSQL-backed saga journal.
#[derive(Clone)]
pub struct PostgresSagaJournal {
    pool: PgPool,
}

impl PostgresSagaJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_entry(row: PgRow) -> Result<JournalEntry> {
        Ok(JournalEntry {
            entry_id: EntryId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            business_id: row.try_get("business_id")?,
            saga_type: row.try_get("saga_type")?,
            sequence: Sequence::new(row.try_get("sequence")?),
            entry_type: row.try_get("entry_type")?,
            recorded_at: row.try_get("recorded_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

#[async_trait]
impl SagaJournal for PostgresSagaJournal {
    async fn append(
        &self,
        entries: Vec<JournalEntry>,
        options: AppendOptions,
    ) -> Result<Sequence> {
        validate_entries_for_append(&entries)?;

        let Some(saga_id) = entries.first().map(|e| e.saga_id) else {
            return Err(JournalError::InvalidAppend("empty batch".to_string()));
        };

        let mut tx = self.pool.begin().await?;

        if let Some(expected) = options.expected_sequence {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT MAX(sequence) FROM saga_journal WHERE saga_id = $1")
                    .bind(saga_id.as_uuid())
                    .fetch_one(&mut *tx)
                    .await?;

            let actual = Sequence::new(current.unwrap_or(0));
            if actual != expected {
                metrics::counter!("saga_journal_conflicts_total").increment(1);
                return Err(JournalError::ConcurrencyConflict {
                    saga_id,
                    expected,
                    actual,
                });
            }
        }

        let mut last = Sequence::initial();
        for entry in &entries {
            sqlx::query(
                r#"
                INSERT INTO saga_journal (id, saga_id, business_id, saga_type, sequence, entry_type, recorded_at, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(entry.entry_id.as_uuid())
            .bind(entry.saga_id.as_uuid())
            .bind(&entry.business_id)
            .bind(&entry.saga_type)
            .bind(entry.sequence.as_i64())
            .bind(&entry.entry_type)
            .bind(entry.recorded_at)
            .bind(&entry.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_saga_sequence")
                {
                    metrics::counter!("saga_journal_conflicts_total").increment(1);
                    return JournalError::ConcurrencyConflict {
                        saga_id,
                        expected: options.expected_sequence.unwrap_or(Sequence::initial()),
                        actual: entry.sequence,
                    };
                }
                JournalError::Database(e)
            })?;

            last = entry.sequence;
        }

        tx.commit().await?;
        tracing::trace!(%saga_id, sequence = %last, count = entries.len(), "journal append");
        Ok(last)
    }

    async fn entries_for_saga(&self, saga_id: SagaId) -> Result<Vec<JournalEntry>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE saga_id = $1 ORDER BY sequence ASC"
        ))
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn latest_saga_for_business_id(
        &self,
        business_id: &str,
        saga_type: Option<&str>,
    ) -> Result<Option<SagaId>> {
        let saga_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT saga_id FROM saga_journal
            WHERE business_id = $1
              AND sequence = 1
              AND ($2::TEXT IS NULL OR saga_type = $2)
            ORDER BY recorded_at DESC
            LIMIT 1
            "#,
        )
        .bind(business_id)
        .bind(saga_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(saga_id.map(SagaId::from_uuid))
    }

    async fn query(&self, query: JournalQuery) -> Result<Vec<JournalEntry>> {
        let mut sql = format!("{SELECT_COLUMNS} WHERE 1=1");
        let mut param_count = 0;

        if query.saga_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_id = ${param_count}"));
        }
        if query.business_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND business_id = ${param_count}"));
        }
        if query.saga_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_type = ${param_count}"));
        }
        if query.entry_types.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND entry_type = ANY(${param_count})"));
        }
        if query.from_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND recorded_at >= ${param_count}"));
        }
        if query.to_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND recorded_at <= ${param_count}"));
        }

        sql.push_str(" ORDER BY recorded_at ASC, sequence ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = query.saga_id {
            sqlx_query = sqlx_query.bind(id.as_uuid());
        }
        if let Some(business_id) = query.business_id {
            sqlx_query = sqlx_query.bind(business_id);
        }
        if let Some(saga_type) = query.saga_type {
            sqlx_query = sqlx_query.bind(saga_type);
        }
        if let Some(entry_types) = query.entry_types {
            sqlx_query = sqlx_query.bind(entry_types);
        }
        if let Some(from_ts) = query.from_timestamp {
            sqlx_query = sqlx_query.bind(from_ts);
        }
        if let Some(to_ts) = query.to_timestamp {
            sqlx_query = sqlx_query.bind(to_ts);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn latest_sequence(&self, saga_id: SagaId) -> Result<Option<Sequence>> {
        let sequence: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM saga_journal WHERE saga_id = $1")
                .bind(saga_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;

        Ok(sequence.map(Sequence::new))
    }
}
