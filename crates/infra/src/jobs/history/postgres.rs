//! Postgres-backed job history.
//!
//! One row per tracked job in `job_history`, keyed by the UUID the producer embeds in the
//! payload as `historyId`. Status is stored as its upper-case name.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;

use courier_core::HistoryId;

use super::query::{HistoryFilter, HistoryPage, Pagination};
use super::r#trait::{
    HistoryError, HistoryStats, HistoryStatus, HistoryStore, JobHistoryRecord, JobHistoryUpdate,
    NewJobHistory,
};

const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS job_history (
        id            UUID PRIMARY KEY,
        queue_name    TEXT NOT NULL,
        job_type      TEXT NOT NULL,
        job_data      JSONB NOT NULL,
        status        TEXT NOT NULL DEFAULT 'PENDING',
        attempts      INTEGER NOT NULL DEFAULT 0,
        max_attempts  INTEGER NOT NULL DEFAULT 3,
        error         TEXT NULL,
        result        JSONB NULL,
        started_at    TIMESTAMPTZ NULL,
        completed_at  TIMESTAMPTZ NULL,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS job_history_queue_name_idx ON job_history (queue_name)",
    "CREATE INDEX IF NOT EXISTS job_history_job_type_idx ON job_history (job_type)",
    "CREATE INDEX IF NOT EXISTS job_history_status_idx ON job_history (status)",
    "CREATE INDEX IF NOT EXISTS job_history_created_at_idx ON job_history (created_at)",
];

const COLUMNS: &str = "id, queue_name, job_type, job_data, status, attempts, max_attempts, \
                       error, result, started_at, completed_at, created_at, updated_at";

/// Postgres-backed history store.
///
/// Cheap to clone; all clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresHistoryStore {
    pool: Arc<PgPool>,
}

impl PostgresHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, HistoryError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `job_history` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), HistoryError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> HistoryError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            HistoryError::Serialization(format!("{operation}: {err}"))
        }
        other => HistoryError::Unavailable(format!("{operation}: {other}")),
    }
}

struct HistoryRow {
    id: uuid::Uuid,
    queue_name: String,
    job_type: String,
    job_data: JsonValue,
    status: String,
    attempts: i32,
    max_attempts: i32,
    error: Option<String>,
    result: Option<JsonValue>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for HistoryRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(HistoryRow {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            job_type: row.try_get("job_type")?,
            job_data: row.try_get("job_data")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            error: row.try_get("error")?,
            result: row.try_get("result")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<HistoryRow> for JobHistoryRecord {
    type Error = HistoryError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(JobHistoryRecord {
            id: HistoryId::from_uuid(row.id),
            queue_name: row.queue_name,
            job_type: row.job_type,
            job_data: row.job_data,
            status: row.status.parse().map_err(HistoryError::Serialization)?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            error: row.error,
            result: row.result,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<JobHistoryRecord, HistoryError> {
    use sqlx::FromRow;
    HistoryRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_row", e))?
        .try_into()
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait::async_trait]
impl HistoryStore for PostgresHistoryStore {
    #[instrument(skip(self, new), fields(queue = %new.queue_name, job_type = %new.job_type), err)]
    async fn create(&self, new: NewJobHistory) -> Result<JobHistoryRecord, HistoryError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO job_history (id, queue_name, job_type, job_data, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(*HistoryId::new().as_uuid())
        .bind(&new.queue_name)
        .bind(&new.job_type)
        .bind(&new.job_data)
        .bind(to_i32(new.max_attempts))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create", e))?;

        decode(&row)
    }

    #[instrument(skip(self, update), fields(history_id = %id), err)]
    async fn update(&self, id: HistoryId, update: JobHistoryUpdate) -> Result<(), HistoryError> {
        let result = sqlx::query(
            r#"
            UPDATE job_history SET
                status       = COALESCE($2, status),
                attempts     = COALESCE($3, attempts),
                error        = COALESCE($4, error),
                result       = COALESCE($5, result),
                started_at   = COALESCE($6, started_at),
                completed_at = COALESCE($7, completed_at),
                updated_at   = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.attempts.map(to_i32))
        .bind(update.error)
        .bind(update.result)
        .bind(update.started_at)
        .bind(update.completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(HistoryError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(history_id = %id), err)]
    async fn get(&self, id: HistoryId) -> Result<Option<JobHistoryRecord>, HistoryError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM job_history WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip(self), err)]
    async fn query(
        &self,
        filter: HistoryFilter,
        pagination: Pagination,
    ) -> Result<HistoryPage, HistoryError> {
        let status = filter.status.map(|s| s.as_str());

        let count_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM job_history
            WHERE ($1::text IS NULL OR queue_name = $1)
                AND ($2::text IS NULL OR job_type = $2)
                AND ($3::text IS NULL OR status = $3)
            "#,
        )
        .bind(filter.queue_name.as_deref())
        .bind(filter.job_type.as_deref())
        .bind(status)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_history", e))?;

        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| map_sqlx_error("count_history", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM job_history
            WHERE ($1::text IS NULL OR queue_name = $1)
                AND ($2::text IS NULL OR job_type = $2)
                AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.queue_name.as_deref())
        .bind(filter.job_type.as_deref())
        .bind(status)
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("query_history", e))?;

        let records = rows.iter().map(decode).collect::<Result<Vec<_>, _>>()?;
        Ok(HistoryPage::new(records, total.max(0) as u64, pagination))
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, queue_name: Option<&str>) -> Result<HistoryStats, HistoryError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM job_history
            WHERE ($1::text IS NULL OR queue_name = $1)
            GROUP BY status
            "#,
        )
        .bind(queue_name)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("history_stats", e))?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("history_stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("history_stats", e))?;
            let status: HistoryStatus = status.parse().map_err(HistoryError::Serialization)?;
            counts.push((status, count.max(0) as u64));
        }
        Ok(HistoryStats::from_counts(counts))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn store() -> PostgresHistoryStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PostgresHistoryStore::connect(&url).await.unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn create_update_and_query() {
        let store = store().await;
        let queue = format!("test-queue-{}", HistoryId::new());

        let record = store
            .create(NewJobHistory::new(&queue, "welcome-email", json!({"email": "a@b.c"})))
            .await
            .unwrap();
        assert_eq!(record.status, HistoryStatus::Pending);

        store
            .update(
                record.id,
                JobHistoryUpdate::status(HistoryStatus::Failed)
                    .attempts(3)
                    .error("smtp down"),
            )
            .await
            .unwrap();

        let page = store
            .query(HistoryFilter::queue(&queue), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].attempts, 3);
        assert_eq!(page.records[0].error.as_deref(), Some("smtp down"));

        let stats = store.stats(Some(&queue)).await.unwrap();
        assert_eq!(stats.get(HistoryStatus::Failed), 1);
        assert_eq!(stats.get(HistoryStatus::Pending), 0);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn update_of_missing_row_is_not_found() {
        let store = store().await;
        assert!(matches!(
            store.update(HistoryId::new(), JobHistoryUpdate::default()).await,
            Err(HistoryError::NotFound(_))
        ));
    }
}
