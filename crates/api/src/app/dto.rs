use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relayq_core::{ArchivedJob, ArchivedJobStatus, QueuedJob, RestError};

// -------------------------
// Request DTOs
// -------------------------

/// Status callback body as sent by a worker. Every field is optional so
/// missing values can be reported precisely.
#[derive(Debug, Default, Deserialize)]
pub struct JobStatusRequest {
    pub status: Option<String>,
    pub attempt: Option<i16>,
    pub retryable: Option<bool>,
}

/// A validated status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: ArchivedJobStatus,
    pub attempt: i16,
    pub retryable: bool,
}

impl JobStatusRequest {
    pub fn resolve(self) -> Result<StatusUpdate, RestError> {
        let status = self
            .status
            .filter(|s| !s.is_empty())
            .ok_or_else(|| missing("status"))?;
        let attempt = self.attempt.ok_or_else(|| missing("attempt"))?;
        let status = status.parse::<ArchivedJobStatus>().map_err(|e| {
            RestError::new(
                "invalid_status",
                "Status must be \"succeeded\" or \"failed\"",
            )
            .with_detail(e.to_string())
        })?;

        Ok(StatusUpdate {
            status,
            attempt,
            retryable: self.retryable.unwrap_or(true),
        })
    }
}

fn missing(field: &str) -> RestError {
    RestError::new(
        "missing_parameter",
        format!("Missing required field: {field}"),
    )
    .with_detail(format!("Please include a {field} in the request body"))
}

// -------------------------
// Response DTOs
// -------------------------

/// Where a job currently lives.
#[derive(Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobView {
    Queued(QueuedJobView),
    Archived(ArchivedJobView),
}

#[derive(Debug, Serialize)]
pub struct QueuedJobView {
    pub id: String,
    pub name: String,
    pub attempts: i16,
    pub status: &'static str,
    pub run_after: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ArchivedJobView {
    pub id: String,
    pub name: String,
    pub attempt: i16,
    pub status: &'static str,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl From<QueuedJob> for JobView {
    fn from(job: QueuedJob) -> Self {
        JobView::Queued(QueuedJobView {
            id: job.id.to_string(),
            status: job.status.as_str(),
            data: payload_json(&job.data),
            name: job.name,
            attempts: job.attempts,
            run_after: job.run_after,
            expires_at: job.expires_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
        })
    }
}

impl From<ArchivedJob> for JobView {
    fn from(job: ArchivedJob) -> Self {
        JobView::Archived(ArchivedJobView {
            id: job.id.to_string(),
            status: job.status.as_str(),
            data: payload_json(&job.data),
            name: job.name,
            attempt: job.attempt,
            expires_at: job.expires_at,
            created_at: job.created_at,
            archived_at: job.archived_at,
        })
    }
}

/// Payloads are usually JSON; anything else is shown as text.
fn payload_json(data: &[u8]) -> serde_json::Value {
    serde_json::from_slice(data)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(data).into_owned()))
}
