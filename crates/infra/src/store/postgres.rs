//! Postgres-backed job store implementation.
//!
//! ## Atomicity
//!
//! - Conditional decrements are a single `UPDATE ... WHERE id = $1 AND
//!   attempts = $2 RETURNING ...`; zero rows returned means the caller's view
//!   of the job was stale.
//! - Archiving deletes the queued row and inserts the archived row inside one
//!   transaction. If the `DELETE` returns nothing the transaction is rolled
//!   back and nothing is written.
//! - `acquire` claims with `FOR UPDATE SKIP LOCKED`, so concurrent
//!   dispatchers never claim the same row. Stale in-progress rows of
//!   at-least-once types are claimable again once `updated_at` is older than
//!   the lease.
//! - `enqueue` inserts only when no archived row carries the same id.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (foreign key violation) | `23503` | `UnknownJobType` |
//! | Database (check constraint violation) | `23514` | `InvalidRecord` |
//! | Database (other) | Any other | `Storage` |
//! | RowNotFound | N/A | `NotFound` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use relayq_core::{
    ArchivedJob, ArchivedJobStatus, EnqueueJobParams, JobId, JobType, QueuedJob,
};

use super::{JobStore, StoreError};

/// Schema for the three job tables. Idempotent.
pub const MIGRATION: &str = include_str!("../../migrations/0001_create_jobs.sql");

/// Postgres-backed job store.
///
/// `PostgresJobStore` is `Send + Sync` and cheap to clone; all operations go
/// through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a new PostgresJobStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a pool of up to `max_connections` to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the job tables if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job_type), fields(job_name = %job_type.name), err)]
    async fn create_job_type(&self, job_type: JobType) -> Result<JobType, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_types (name, delivery_strategy, attempts, concurrency, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING name, delivery_strategy, attempts, concurrency, created_at
            "#,
        )
        .bind(&job_type.name)
        .bind(job_type.delivery_strategy.as_str())
        .bind(job_type.attempts)
        .bind(job_type.concurrency)
        .bind(job_type.created_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_job_type", e))?;

        decode::<JobTypeRow>(&row)?.try_into()
    }

    #[instrument(skip(self), err)]
    async fn get_job_type(&self, name: &str) -> Result<JobType, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT name, delivery_strategy, attempts, concurrency, created_at
            FROM job_types
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job_type", e))?
        .ok_or_else(|| StoreError::not_found(name))?;

        decode::<JobTypeRow>(&row)?.try_into()
    }

    #[instrument(skip(self, params), fields(job_id = %params.id, job_name = %params.name), err)]
    async fn enqueue(&self, params: EnqueueJobParams) -> Result<QueuedJob, StoreError> {
        // Attempts come from the job type. No row back means either no such
        // type or an id that has already been archived.
        let row = sqlx::query(
            r#"
            INSERT INTO queued_jobs (id, name, attempts, run_after, expires_at, status, data)
            SELECT $1, name, attempts, $3, $4, 'queued', $5
            FROM job_types
            WHERE name = $2
              AND NOT EXISTS (SELECT 1 FROM archived_jobs WHERE id = $1)
            RETURNING id, name, attempts, run_after, expires_at, created_at, updated_at, status, data
            "#,
        )
        .bind(params.id.to_string())
        .bind(&params.name)
        .bind(params.run_after)
        .bind(params.expires_at)
        .bind(&params.data)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        match row {
            Some(row) => decode::<QueuedJobRow>(&row)?.try_into(),
            None => {
                let archived: bool =
                    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM archived_jobs WHERE id = $1)")
                        .bind(params.id.to_string())
                        .fetch_one(&*self.pool)
                        .await
                        .map_err(|e| map_sqlx_error("enqueue", e))?;
                if archived {
                    Err(StoreError::AlreadyExists(params.id.to_string()))
                } else {
                    Err(StoreError::UnknownJobType(params.name))
                }
            }
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_queued_job(&self, id: &JobId) -> Result<QueuedJob, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, attempts, run_after, expires_at, created_at, updated_at, status, data
            FROM queued_jobs
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_queued_job", e))?
        .ok_or_else(|| StoreError::not_found(id))?;

        decode::<QueuedJobRow>(&row)?.try_into()
    }

    #[instrument(skip(self), err)]
    async fn acquire(&self, reclaim_after: Duration) -> Result<Option<QueuedJob>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE queued_jobs
            SET status = 'in-progress', updated_at = now()
            WHERE id = (
                SELECT q.id
                FROM queued_jobs q
                JOIN job_types t ON t.name = q.name
                WHERE q.attempts > 0
                  AND q.run_after <= now()
                  AND (
                      q.status = 'queued'
                      OR (
                          q.status = 'in-progress'
                          AND t.delivery_strategy = 'at_least_once'
                          AND q.updated_at <= now() - make_interval(secs => $1)
                      )
                  )
                ORDER BY q.run_after ASC, q.created_at ASC
                LIMIT 1
                FOR UPDATE OF q SKIP LOCKED
            )
            RETURNING id, name, attempts, run_after, expires_at, created_at, updated_at, status, data
            "#,
        )
        .bind(reclaim_after.as_secs_f64())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("acquire", e))?;

        match row {
            Some(row) => Ok(Some(decode::<QueuedJobRow>(&row)?.try_into()?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn update_attempts(
        &self,
        id: &JobId,
        expected_attempts: i16,
        new_attempts: i16,
        run_after: DateTime<Utc>,
    ) -> Result<QueuedJob, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE queued_jobs
            SET attempts = $3, run_after = $4, status = 'queued', updated_at = now()
            WHERE id = $1 AND attempts = $2
            RETURNING id, name, attempts, run_after, expires_at, created_at, updated_at, status, data
            "#,
        )
        .bind(id.to_string())
        .bind(expected_attempts)
        .bind(new_attempts)
        .bind(run_after)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_attempts", e))?
        .ok_or_else(|| StoreError::NoRowsAffected {
            id: id.clone(),
            expected: expected_attempts,
        })?;

        decode::<QueuedJobRow>(&row)?.try_into()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn move_to_archive(
        &self,
        id: &JobId,
        name: &str,
        status: ArchivedJobStatus,
        attempt: i16,
    ) -> Result<ArchivedJob, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM queued_jobs
            WHERE id = $1 AND name = $2
            RETURNING id, name, attempts, run_after, expires_at, created_at, updated_at, status, data
            "#,
        )
        .bind(id.to_string())
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_queued_job", e))?;

        let Some(deleted) = deleted else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::not_found(id));
        };
        let queued: QueuedJob = decode::<QueuedJobRow>(&deleted)?.try_into()?;

        let row = sqlx::query(
            r#"
            INSERT INTO archived_jobs (id, name, attempt, status, data, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, name, attempt, status, data, expires_at, created_at, archived_at
            "#,
        )
        .bind(queued.id.to_string())
        .bind(&queued.name)
        .bind(attempt)
        .bind(status.as_str())
        .bind(&queued.data)
        .bind(queued.expires_at)
        .bind(queued.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_archived_job", e))?;

        let archived: ArchivedJob = decode::<ArchivedJobRow>(&row)?.try_into()?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(archived)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_archived_job(&self, id: &JobId) -> Result<ArchivedJob, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, attempt, status, data, expires_at, created_at, archived_at
            FROM archived_jobs
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_archived_job", e))?
        .ok_or_else(|| StoreError::not_found(id))?;

        decode::<ArchivedJobRow>(&row)?.try_into()
    }
}

fn decode<'r, T: FromRow<'r, PgRow>>(row: &'r PgRow) -> Result<T, StoreError> {
    T::from_row(row).map_err(|e| StoreError::InvalidRecord(format!("failed to decode row: {e}")))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::AlreadyExists(msg),
                Some("23503") => StoreError::UnknownJobType(msg),
                Some("23514") => StoreError::InvalidRecord(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("unexpected row not found in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobTypeRow {
    name: String,
    delivery_strategy: String,
    attempts: i16,
    concurrency: i16,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobTypeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobTypeRow {
            name: row.try_get("name")?,
            delivery_strategy: row.try_get("delivery_strategy")?,
            attempts: row.try_get("attempts")?,
            concurrency: row.try_get("concurrency")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobTypeRow> for JobType {
    type Error = StoreError;

    fn try_from(row: JobTypeRow) -> Result<Self, Self::Error> {
        Ok(JobType {
            name: row.name,
            delivery_strategy: row
                .delivery_strategy
                .parse()
                .map_err(|e| StoreError::InvalidRecord(format!("{e}")))?,
            attempts: row.attempts,
            concurrency: row.concurrency,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct QueuedJobRow {
    id: String,
    name: String,
    attempts: i16,
    run_after: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: String,
    data: Vec<u8>,
}

impl<'r> FromRow<'r, PgRow> for QueuedJobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(QueuedJobRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            attempts: row.try_get("attempts")?,
            run_after: row.try_get("run_after")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            status: row.try_get("status")?,
            data: row.try_get("data")?,
        })
    }
}

impl TryFrom<QueuedJobRow> for QueuedJob {
    type Error = StoreError;

    fn try_from(row: QueuedJobRow) -> Result<Self, Self::Error> {
        Ok(QueuedJob {
            id: row
                .id
                .parse()
                .map_err(|e| StoreError::InvalidRecord(format!("{e}")))?,
            name: row.name,
            attempts: row.attempts,
            run_after: row.run_after,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            status: row
                .status
                .parse()
                .map_err(|e| StoreError::InvalidRecord(format!("{e}")))?,
            data: row.data,
        })
    }
}

#[derive(Debug)]
struct ArchivedJobRow {
    id: String,
    name: String,
    attempt: i16,
    status: String,
    data: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    archived_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ArchivedJobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ArchivedJobRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            attempt: row.try_get("attempt")?,
            status: row.try_get("status")?,
            data: row.try_get("data")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            archived_at: row.try_get("archived_at")?,
        })
    }
}

impl TryFrom<ArchivedJobRow> for ArchivedJob {
    type Error = StoreError;

    fn try_from(row: ArchivedJobRow) -> Result<Self, Self::Error> {
        Ok(ArchivedJob {
            id: row
                .id
                .parse()
                .map_err(|e| StoreError::InvalidRecord(format!("{e}")))?,
            name: row.name,
            attempt: row.attempt,
            status: row
                .status
                .parse()
                .map_err(|e| StoreError::InvalidRecord(format!("{e}")))?,
            data: row.data,
            expires_at: row.expires_at,
            created_at: row.created_at,
            archived_at: row.archived_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_creates_all_three_tables() {
        for table in ["job_types", "queued_jobs", "archived_jobs"] {
            assert!(
                MIGRATION.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing table {table}"
            );
        }
    }

    #[test]
    fn row_with_unknown_status_is_an_invalid_record() {
        let row = QueuedJobRow {
            id: "job_6740b44e-13b9-475d-af06-979627e0e0d6".to_string(),
            name: "echo".to_string(),
            attempts: 1,
            run_after: Utc::now(),
            expires_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            status: "paused".to_string(),
            data: vec![],
        };
        assert!(matches!(
            QueuedJob::try_from(row),
            Err(StoreError::InvalidRecord(_))
        ));
    }
}
