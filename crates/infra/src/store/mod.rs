//! Job store boundary.
//!
//! Three record kinds live behind this trait: job types, queued jobs and
//! archived jobs. Every mutation is a single atomic conditional operation;
//! the dispatch core never holds a lock across a network call.
//!
//! ## Conditional updates
//!
//! - `update_attempts` only applies when the stored attempts-remaining equals
//!   the caller's expected value. Zero rows affected (stale attempt, or the
//!   job is gone) is reported as [`StoreError::NoRowsAffected`].
//! - `move_to_archive` deletes the queued row and inserts the archived row in
//!   one transaction. If no queued row matched, nothing is written and
//!   [`StoreError::NotFound`] is returned. A job is never in both tables, or
//!   neither.
//! - `enqueue` refuses an id that is already queued or archived.
//!
//! ## In-progress is a lease
//!
//! `acquire` marks a job in-progress, but the mark is not a lock. An
//! at-least-once job that has sat in-progress for longer than the caller's
//! `reclaim_after` (its dispatch timed out, its dispatcher shut down or
//! crashed, or its worker never called back) is ready again. At-most-once jobs
//! are never reclaimed: a second delivery would break their guarantee.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use relayq_core::{ArchivedJob, ArchivedJobStatus, EnqueueJobParams, JobId, JobType, QueuedJob};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No record with this key.
    #[error("not found: {0}")]
    NotFound(String),
    /// A conditional update matched no row.
    #[error("no rows affected updating {id} (expected attempts {expected})")]
    NoRowsAffected { id: JobId, expected: i16 },
    /// Enqueue named a job type that does not exist.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The backend returned a row it could not decode.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn not_found(key: impl std::fmt::Display) -> Self {
        Self::NotFound(key.to_string())
    }
}

/// Persistence for job types, queued jobs and archived jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job type. Names are unique.
    async fn create_job_type(&self, job_type: JobType) -> Result<JobType, StoreError>;

    async fn get_job_type(&self, name: &str) -> Result<JobType, StoreError>;

    /// Place a job on the queue with its type's default attempts.
    async fn enqueue(&self, params: EnqueueJobParams) -> Result<QueuedJob, StoreError>;

    async fn get_queued_job(&self, id: &JobId) -> Result<QueuedJob, StoreError>;

    /// Claim the oldest ready job (run-after reached, attempts left, and
    /// either queued or an at-least-once job in-progress for at least
    /// `reclaim_after`) and mark it in-progress. `None` when nothing is ready.
    async fn acquire(&self, reclaim_after: Duration) -> Result<Option<QueuedJob>, StoreError>;

    /// Set attempts-remaining to `new_attempts` (and push run-after out,
    /// status back to queued) iff the stored value equals `expected_attempts`.
    async fn update_attempts(
        &self,
        id: &JobId,
        expected_attempts: i16,
        new_attempts: i16,
        run_after: DateTime<Utc>,
    ) -> Result<QueuedJob, StoreError>;

    /// Atomically delete the queued job `id` of type `name` and insert its
    /// archived record.
    async fn move_to_archive(
        &self,
        id: &JobId,
        name: &str,
        status: ArchivedJobStatus,
        attempt: i16,
    ) -> Result<ArchivedJob, StoreError>;

    async fn get_archived_job(&self, id: &JobId) -> Result<ArchivedJob, StoreError>;
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for std::sync::Arc<S> {
    async fn create_job_type(&self, job_type: JobType) -> Result<JobType, StoreError> {
        (**self).create_job_type(job_type).await
    }

    async fn get_job_type(&self, name: &str) -> Result<JobType, StoreError> {
        (**self).get_job_type(name).await
    }

    async fn enqueue(&self, params: EnqueueJobParams) -> Result<QueuedJob, StoreError> {
        (**self).enqueue(params).await
    }

    async fn get_queued_job(&self, id: &JobId) -> Result<QueuedJob, StoreError> {
        (**self).get_queued_job(id).await
    }

    async fn acquire(&self, reclaim_after: Duration) -> Result<Option<QueuedJob>, StoreError> {
        (**self).acquire(reclaim_after).await
    }

    async fn update_attempts(
        &self,
        id: &JobId,
        expected_attempts: i16,
        new_attempts: i16,
        run_after: DateTime<Utc>,
    ) -> Result<QueuedJob, StoreError> {
        (**self)
            .update_attempts(id, expected_attempts, new_attempts, run_after)
            .await
    }

    async fn move_to_archive(
        &self,
        id: &JobId,
        name: &str,
        status: ArchivedJobStatus,
        attempt: i16,
    ) -> Result<ArchivedJob, StoreError> {
        (**self).move_to_archive(id, name, status, attempt).await
    }

    async fn get_archived_job(&self, id: &JobId) -> Result<ArchivedJob, StoreError> {
        (**self).get_archived_job(id).await
    }
}
