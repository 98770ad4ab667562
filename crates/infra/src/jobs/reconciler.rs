//! Status reconciler: applies a reported outcome to a queued job.
//!
//! A worker (or the processor, on a permanent dispatch failure) reports
//! `succeeded` or `failed` for a given attempt. The reconciler turns that into
//! exactly one store mutation:
//!
//! ```text
//! succeeded                     -> move to archive (succeeded)
//! failed, not retryable         -> move to archive (failed)
//! failed, retryable, attempt>1  -> attempts := attempt - 1   (iff stored == attempt)
//! failed, retryable, attempt<=1 -> move to archive (failed)
//! ```
//!
//! The decrement is conditioned on the stored attempts matching the reported
//! attempt, so duplicate or racing reports for the same attempt cannot both
//! apply: the loser gets [`StatusCallbackError::FailedDecrement`].

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use relayq_core::{ArchivedJobStatus, JobId};
use relayq_observability::Metrics;

use crate::context::{ContextError, WorkContext};
use crate::jobs::retry::RetryPolicy;
use crate::store::{JobStore, StoreError};

/// Why a status callback was not applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusCallbackError {
    /// The job is not queued: already archived (duplicate report) or never
    /// queued. Callers treat this as an idempotent no-op.
    #[error("job {id} has already been archived, or was never queued")]
    NotFound { id: JobId },
    /// The conditional decrement matched no row: another report for this
    /// attempt already applied. Retrying with the same attempt fails again.
    #[error("could not decrement attempts for job {id}: attempt {attempt} is stale")]
    FailedDecrement { id: JobId, attempt: i16 },
    /// The context ended before the store answered.
    #[error("status callback interrupted: {0}")]
    Interrupted(#[from] ContextError),
    #[error(transparent)]
    Store(StoreError),
}

/// Applies reported outcomes to queued jobs.
#[derive(Clone)]
pub struct StatusReconciler<S> {
    store: S,
    metrics: Arc<dyn Metrics>,
    requeue_backoff: RetryPolicy,
}

impl<S> std::fmt::Debug for StatusReconciler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReconciler")
            .field("metrics", &self.metrics)
            .field("requeue_backoff", &self.requeue_backoff)
            .finish_non_exhaustive()
    }
}

impl<S: JobStore> StatusReconciler<S> {
    pub fn new(store: S, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            store,
            metrics,
            requeue_backoff: RetryPolicy::default(),
        }
    }

    /// Delay schedule for run-after when a retryable failure requeues a job.
    pub fn with_requeue_backoff(mut self, policy: RetryPolicy) -> Self {
        self.requeue_backoff = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Apply `status` for `attempt` to the queued job `id` of type `name`.
    #[instrument(skip_all, fields(job_id = %id, job_name = %name, %status, attempt, retryable))]
    pub async fn handle_status_callback(
        &self,
        ctx: &WorkContext,
        id: &JobId,
        name: &str,
        status: ArchivedJobStatus,
        attempt: i16,
        retryable: bool,
    ) -> Result<(), StatusCallbackError> {
        let result = self
            .reconcile(ctx, id, name, status, attempt, retryable)
            .await;

        match &result {
            Ok(()) => self
                .metrics
                .increment(&format!("status_callback.{}", status.as_str())),
            Err(StatusCallbackError::NotFound { .. }) => {
                info!("status callback for a job that is not queued");
                self.metrics.increment("status_callback.duplicate");
            }
            Err(StatusCallbackError::FailedDecrement { .. }) => {
                warn!("status callback lost the race to decrement attempts");
                self.metrics.increment("status_callback.failed_decrement");
            }
            Err(err) => {
                warn!(error = %err, "status callback failed");
                self.metrics.increment("status_callback.error");
            }
        }

        result
    }

    async fn reconcile(
        &self,
        ctx: &WorkContext,
        id: &JobId,
        name: &str,
        status: ArchivedJobStatus,
        attempt: i16,
        retryable: bool,
    ) -> Result<(), StatusCallbackError> {
        let job = match ctx.run(self.store.get_queued_job(id)).await? {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                return Err(StatusCallbackError::NotFound { id: id.clone() });
            }
            Err(err) => return Err(StatusCallbackError::Store(err)),
        };
        if job.name != name {
            return Err(StatusCallbackError::NotFound { id: id.clone() });
        }

        match status {
            ArchivedJobStatus::Succeeded => self.archive(ctx, id, name, status, attempt).await,
            ArchivedJobStatus::Failed if !retryable => {
                self.archive(ctx, id, name, status, attempt).await
            }
            ArchivedJobStatus::Failed => {
                let remaining = attempt.saturating_sub(1);
                if remaining <= 0 {
                    info!("attempts exhausted; archiving as failed");
                    return self.archive(ctx, id, name, status, attempt).await;
                }
                self.decrement(ctx, id, name, attempt, remaining).await
            }
        }
    }

    async fn archive(
        &self,
        ctx: &WorkContext,
        id: &JobId,
        name: &str,
        status: ArchivedJobStatus,
        attempt: i16,
    ) -> Result<(), StatusCallbackError> {
        match ctx
            .run(self.store.move_to_archive(id, name, status, attempt))
            .await?
        {
            Ok(archived) => {
                info!(archived_status = %archived.status, "job archived");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Err(StatusCallbackError::NotFound { id: id.clone() }),
            Err(err) => Err(StatusCallbackError::Store(err)),
        }
    }

    async fn decrement(
        &self,
        ctx: &WorkContext,
        id: &JobId,
        name: &str,
        attempt: i16,
        remaining: i16,
    ) -> Result<(), StatusCallbackError> {
        // Attempts consumed so far index the backoff schedule; without the
        // job type this is the first retry.
        let consumed = match ctx.run(self.store.get_job_type(name)).await? {
            Ok(job_type) => job_type.attempts.saturating_sub(remaining).max(1) as u32,
            Err(StoreError::NotFound(_)) => 1,
            Err(err) => return Err(StatusCallbackError::Store(err)),
        };
        let delay = self.requeue_backoff.delay_for_attempt(consumed);
        let run_after =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        match ctx
            .run(self.store.update_attempts(id, attempt, remaining, run_after))
            .await?
        {
            Ok(job) => {
                info!(attempts_remaining = job.attempts, %run_after, "job requeued");
                Ok(())
            }
            Err(StoreError::NoRowsAffected { .. }) => Err(StatusCallbackError::FailedDecrement {
                id: id.clone(),
                attempt,
            }),
            Err(err) => Err(StatusCallbackError::Store(err)),
        }
    }
}
