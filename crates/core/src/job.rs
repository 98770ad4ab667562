//! Job type, queued job and archived job records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// How hard the dispatcher tries to deliver jobs of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStrategy {
    /// Retry until attempts are exhausted.
    AtLeastOnce,
    /// Never dispatch twice; requires exactly one attempt.
    AtMostOnce,
}

impl DeliveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStrategy::AtLeastOnce => "at_least_once",
            DeliveryStrategy::AtMostOnce => "at_most_once",
        }
    }
}

impl FromStr for DeliveryStrategy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "at_least_once" => Ok(Self::AtLeastOnce),
            "at_most_once" => Ok(Self::AtMostOnce),
            other => Err(DomainError::validation(format!(
                "unknown delivery strategy: {other}"
            ))),
        }
    }
}

/// Definition of a class of work. Read-only to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobType {
    /// Unique name, also the first path segment of the worker URL.
    pub name: String,
    pub delivery_strategy: DeliveryStrategy,
    /// Attempts every new job of this type starts with.
    pub attempts: i16,
    /// Hint for how many jobs of this type may be in flight at once.
    pub concurrency: i16,
    pub created_at: DateTime<Utc>,
}

impl JobType {
    pub fn new(
        name: impl Into<String>,
        delivery_strategy: DeliveryStrategy,
        attempts: i16,
        concurrency: i16,
    ) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("job type name must not be empty"));
        }
        if name.contains('/') {
            return Err(DomainError::validation("job type name must not contain '/'"));
        }
        if attempts < 1 {
            return Err(DomainError::validation("attempts must be greater than zero"));
        }
        if concurrency < 1 {
            return Err(DomainError::validation(
                "concurrency must be greater than zero",
            ));
        }
        if delivery_strategy == DeliveryStrategy::AtMostOnce && attempts != 1 {
            return Err(DomainError::validation(
                "at_most_once job types must have exactly one attempt",
            ));
        }

        Ok(Self {
            name,
            delivery_strategy,
            attempts,
            concurrency,
            created_at: Utc::now(),
        })
    }
}

/// Dispatch status of a queued job. `InProgress` is advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuedJobStatus {
    Queued,
    InProgress,
}

impl QueuedJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueuedJobStatus::Queued => "queued",
            QueuedJobStatus::InProgress => "in-progress",
        }
    }
}

impl FromStr for QueuedJobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in-progress" => Ok(Self::InProgress),
            other => Err(DomainError::invalid_status(other)),
        }
    }
}

/// Parameters for placing a new job on the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueJobParams {
    pub id: JobId,
    pub name: String,
    pub run_after: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub data: Vec<u8>,
}

impl EnqueueJobParams {
    /// Params for a job that may run immediately and never expires.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            run_after: Utc::now(),
            expires_at: None,
            data,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = at;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

/// A job awaiting or undergoing dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    /// Job type name.
    pub name: String,
    /// Attempts remaining. Never negative; zero means never dispatch again.
    pub attempts: i16,
    pub run_after: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: QueuedJobStatus,
    /// Opaque payload, forwarded to the worker untouched.
    pub data: Vec<u8>,
}

impl QueuedJob {
    /// Build the queued record for `params`, starting with the job type's
    /// default number of attempts.
    pub fn from_params(params: EnqueueJobParams, job_type: &JobType, now: DateTime<Utc>) -> Self {
        Self {
            id: params.id,
            name: params.name,
            attempts: job_type.attempts,
            run_after: params.run_after,
            expires_at: params.expires_at,
            created_at: now,
            updated_at: now,
            status: QueuedJobStatus::Queued,
            data: params.data,
        }
    }

    /// True when the job carries an expiry time that is not in the future.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// True when the job may be picked up by a dispatch cycle at `now`.
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.status == QueuedJobStatus::Queued && self.attempts > 0 && self.run_after <= now
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivedJobStatus {
    Succeeded,
    Failed,
}

impl ArchivedJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchivedJobStatus::Succeeded => "succeeded",
            ArchivedJobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for ArchivedJobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchivedJobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::invalid_status(other)),
        }
    }
}

/// Terminal, immutable record of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedJob {
    pub id: JobId,
    pub name: String,
    /// Attempt number at which the terminal status was recorded.
    pub attempt: i16,
    pub status: ArchivedJobStatus,
    pub data: Vec<u8>,
    pub expires_at: Option<DateTime<Utc>>,
    /// When the originating queued job was created.
    pub created_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

impl ArchivedJob {
    pub fn from_queued(
        job: QueuedJob,
        status: ArchivedJobStatus,
        attempt: i16,
        archived_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: job.id,
            name: job.name,
            attempt,
            status,
            data: job.data,
            expires_at: job.expires_at,
            created_at: job.created_at,
            archived_at,
        }
    }
}
