//! Downstream handler: sends one queued job to a worker over HTTP.
//!
//! ## Protocol
//!
//! `PUT <base>/jobs/<name>/<id>` with basic auth, the job payload as the body
//! and the job's attempts-remaining in `X-Job-Attempts`. The worker replies:
//!
//! | Response | Outcome |
//! |---|---|
//! | 2xx (normally 202) | [`DispatchOutcome::Accepted`]: the worker reports status later |
//! | 503 (structured error body) | [`DispatchOutcome::Unavailable`]: back off and retry |
//! | other status | [`DispatchOutcome::Rejected`]: permanent failure |
//! | connection / transport error | [`DispatchOutcome::ConnectionFailed`]: permanent failure |
//! | context deadline or cancellation | [`DispatchOutcome::TimedOut`]: ambiguous, no decision |
//!
//! The handler never touches persisted state.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, instrument};

use relayq_core::{QueuedJob, RestError};

use crate::context::WorkContext;

/// Basic-auth user the dispatcher presents to workers.
pub const DOWNSTREAM_USER: &str = "jobs";

/// Header carrying the job's attempts-remaining, echoed back by the worker in
/// its status callback.
pub const ATTEMPTS_HEADER: &str = "x-job-attempts";

/// Errors building a [`DownstreamHandler`].
#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error("invalid downstream url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Classified result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The worker accepted the job and will report status later.
    Accepted,
    /// The worker is temporarily overloaded; retry after backing off.
    Unavailable(Option<RestError>),
    /// The worker answered with a non-2xx, non-503 status.
    Rejected { status: u16, body: String },
    /// No connection could be made, or the transport failed.
    ConnectionFailed(String),
    /// The deadline passed (or the context was cancelled) before the worker
    /// answered. The worker may still be running the job.
    TimedOut,
}

impl DispatchOutcome {
    /// True for outcomes that finalize the job as failed right away.
    pub fn is_permanent_failure(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Rejected { .. } | DispatchOutcome::ConnectionFailed(_)
        )
    }
}

/// HTTP client for downstream workers.
#[derive(Debug, Clone)]
pub struct DownstreamHandler {
    client: reqwest::Client,
    base_url: String,
    password: String,
}

impl DownstreamHandler {
    /// Create a handler for workers under `base_url`, authenticating with
    /// `password`.
    pub fn new(
        base_url: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, DownstreamError> {
        let base_url = base_url.into();
        let parsed = reqwest::Url::parse(&base_url).map_err(|e| DownstreamError::InvalidUrl {
            url: base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownstreamError::InvalidUrl {
                url: base_url,
                reason: "scheme must be http or https".to_string(),
            });
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            password: password.into(),
        })
    }

    /// Worker URL for `job`.
    pub fn job_url(&self, job: &QueuedJob) -> String {
        format!("{}/jobs/{}/{}", self.base_url, job.name, job.id)
    }

    /// Send `job` to its worker, bounded by `ctx`.
    #[instrument(skip_all, fields(job_id = %job.id, job_name = %job.name, attempts = job.attempts))]
    pub async fn dispatch(&self, ctx: &WorkContext, job: &QueuedJob) -> DispatchOutcome {
        let request = self
            .client
            .put(self.job_url(job))
            .basic_auth(DOWNSTREAM_USER, Some(&self.password))
            .header(CONTENT_TYPE, "application/json")
            .header(ATTEMPTS_HEADER, job.attempts.to_string())
            .body(job.data.clone());

        let response = match ctx.run(request.send()).await {
            Err(reason) => {
                debug!(%reason, "dispatch interrupted before the worker answered");
                return DispatchOutcome::TimedOut;
            }
            Ok(Err(err)) => return classify_transport_error(err),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status.is_success() {
            return DispatchOutcome::Accepted;
        }

        // The body is only diagnostic; an interrupted read still leaves the
        // status code to classify on.
        let body = match ctx.run(response.bytes()).await {
            Ok(Ok(bytes)) => bytes.to_vec(),
            _ => Vec::new(),
        };

        if status == StatusCode::SERVICE_UNAVAILABLE {
            let detail = serde_json::from_slice::<RestError>(&body).ok();
            return DispatchOutcome::Unavailable(detail);
        }

        DispatchOutcome::Rejected {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> DispatchOutcome {
    if err.is_timeout() && !err.is_connect() {
        return DispatchOutcome::TimedOut;
    }
    DispatchOutcome::ConnectionFailed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relayq_core::{DeliveryStrategy, EnqueueJobParams, JobId, JobType};

    fn job() -> QueuedJob {
        let job_type = JobType::new("echo", DeliveryStrategy::AtLeastOnce, 3, 1).unwrap();
        let id: JobId = "job_6740b44e-13b9-475d-af06-979627e0e0d6".parse().unwrap();
        QueuedJob::from_params(
            EnqueueJobParams::new("echo", vec![]).with_id(id),
            &job_type,
            Utc::now(),
        )
    }

    #[test]
    fn job_url_joins_type_and_id() {
        let handler = DownstreamHandler::new("http://worker.local:9091/", "pw").unwrap();
        assert_eq!(
            handler.job_url(&job()),
            "http://worker.local:9091/jobs/echo/job_6740b44e-13b9-475d-af06-979627e0e0d6"
        );
    }

    #[test]
    fn rejects_non_http_base_urls() {
        assert!(matches!(
            DownstreamHandler::new("not a url", "pw"),
            Err(DownstreamError::InvalidUrl { .. })
        ));
        assert!(matches!(
            DownstreamHandler::new("ftp://worker.local", "pw"),
            Err(DownstreamError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn only_rejections_and_connection_failures_are_permanent() {
        assert!(DispatchOutcome::ConnectionFailed("refused".into()).is_permanent_failure());
        assert!(
            DispatchOutcome::Rejected {
                status: 400,
                body: String::new()
            }
            .is_permanent_failure()
        );
        assert!(!DispatchOutcome::Accepted.is_permanent_failure());
        assert!(!DispatchOutcome::TimedOut.is_permanent_failure());
        assert!(!DispatchOutcome::Unavailable(None).is_permanent_failure());
    }
}
