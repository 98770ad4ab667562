//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use relayq_core::{
    ArchivedJob, ArchivedJobStatus, DeliveryStrategy, EnqueueJobParams, JobId, JobType, QueuedJob,
    QueuedJobStatus,
};

use super::{JobStore, StoreError};

#[derive(Debug, Default)]
struct Tables {
    job_types: HashMap<String, JobType>,
    queued: HashMap<JobId, QueuedJob>,
    archived: HashMap<JobId, ArchivedJob>,
}

/// In-memory job store.
///
/// All three tables sit behind a single lock, so a queue → archive move is
/// observed atomically by every reader. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of jobs currently queued (any status).
    pub fn queued_len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.queued.len())
    }

    /// Number of archived jobs.
    pub fn archived_len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.archived.len())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job_type(&self, job_type: JobType) -> Result<JobType, StoreError> {
        let mut tables = self.write()?;
        if tables.job_types.contains_key(&job_type.name) {
            return Err(StoreError::AlreadyExists(job_type.name));
        }
        tables
            .job_types
            .insert(job_type.name.clone(), job_type.clone());
        Ok(job_type)
    }

    async fn get_job_type(&self, name: &str) -> Result<JobType, StoreError> {
        self.read()?
            .job_types
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(name))
    }

    async fn enqueue(&self, params: EnqueueJobParams) -> Result<QueuedJob, StoreError> {
        let mut tables = self.write()?;
        let job_type = tables
            .job_types
            .get(&params.name)
            .ok_or_else(|| StoreError::UnknownJobType(params.name.clone()))?;

        if tables.queued.contains_key(&params.id) || tables.archived.contains_key(&params.id) {
            return Err(StoreError::AlreadyExists(params.id.to_string()));
        }

        let job = QueuedJob::from_params(params, job_type, Utc::now());
        tables.queued.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get_queued_job(&self, id: &JobId) -> Result<QueuedJob, StoreError> {
        self.read()?
            .queued
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id))
    }

    async fn acquire(&self, reclaim_after: Duration) -> Result<Option<QueuedJob>, StoreError> {
        let mut tables = self.write()?;
        let now = Utc::now();
        let stale_before = chrono::Duration::from_std(reclaim_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d));

        let reclaimable = |job: &QueuedJob| {
            job.status == QueuedJobStatus::InProgress
                && job.attempts > 0
                && job.run_after <= now
                && stale_before.is_some_and(|cutoff| job.updated_at <= cutoff)
                && tables
                    .job_types
                    .get(&job.name)
                    .is_some_and(|t| t.delivery_strategy == DeliveryStrategy::AtLeastOnce)
        };

        // Oldest ready job first: earliest run-after, then creation time.
        let next = tables
            .queued
            .values()
            .filter(|j| j.is_ready_at(now) || reclaimable(j))
            .min_by_key(|j| (j.run_after, j.created_at))
            .map(|j| j.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = tables.queued.get_mut(&id) else {
            return Ok(None);
        };
        job.status = QueuedJobStatus::InProgress;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn update_attempts(
        &self,
        id: &JobId,
        expected_attempts: i16,
        new_attempts: i16,
        run_after: DateTime<Utc>,
    ) -> Result<QueuedJob, StoreError> {
        if new_attempts < 0 {
            return Err(StoreError::InvalidRecord(format!(
                "attempts must not be negative (got {new_attempts})"
            )));
        }

        let mut tables = self.write()?;
        match tables.queued.get_mut(id) {
            Some(job) if job.attempts == expected_attempts => {
                job.attempts = new_attempts;
                job.run_after = run_after;
                job.status = QueuedJobStatus::Queued;
                job.updated_at = Utc::now();
                Ok(job.clone())
            }
            _ => Err(StoreError::NoRowsAffected {
                id: id.clone(),
                expected: expected_attempts,
            }),
        }
    }

    async fn move_to_archive(
        &self,
        id: &JobId,
        name: &str,
        status: ArchivedJobStatus,
        attempt: i16,
    ) -> Result<ArchivedJob, StoreError> {
        let mut tables = self.write()?;

        match tables.queued.get(id) {
            Some(job) if job.name == name => {}
            _ => return Err(StoreError::not_found(id)),
        }
        if tables.archived.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }

        let job = tables
            .queued
            .remove(id)
            .ok_or_else(|| StoreError::not_found(id))?;
        let archived = ArchivedJob::from_queued(job, status, attempt, Utc::now());
        tables.archived.insert(id.clone(), archived.clone());
        Ok(archived)
    }

    async fn get_archived_job(&self, id: &JobId) -> Result<ArchivedJob, StoreError> {
        self.read()?
            .archived
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id))
    }
}
