//! Job processor: drives one queued job through a dispatch cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use relayq_core::{ArchivedJobStatus, JobId, QueuedJob};
use relayq_observability::Metrics;

use super::downstream::{DispatchOutcome, DownstreamHandler};
use super::reconciler::{StatusCallbackError, StatusReconciler};
use super::retry::RetryPolicy;
use crate::context::WorkContext;
use crate::store::{JobStore, StoreError};

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Delay schedule between dispatches while the worker answers 503.
    pub unavailable_backoff: RetryPolicy,
    /// Multiplier applied to every unavailable backoff. Zero disables the
    /// sleep entirely (tests).
    pub unavailable_sleep_factor: u32,
    /// Deadline for archiving a permanently failed job, counted from when the
    /// failure is known rather than from the start of the cycle.
    pub finalize_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            unavailable_backoff: RetryPolicy::exponential(
                Duration::from_millis(100),
                Duration::from_secs(10),
            ),
            unavailable_sleep_factor: 1,
            finalize_timeout: Duration::from_secs(5),
        }
    }
}

impl ProcessorConfig {
    pub fn with_sleep_factor(mut self, factor: u32) -> Self {
        self.unavailable_sleep_factor = factor;
        self
    }

    pub fn with_finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = timeout;
        self
    }

    pub fn with_unavailable_backoff(mut self, policy: RetryPolicy) -> Self {
        self.unavailable_backoff = policy;
        self
    }

    fn unavailable_delay(&self, consecutive: u32) -> Duration {
        self.unavailable_backoff
            .delay_for_attempt(consecutive)
            .saturating_mul(self.unavailable_sleep_factor)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Recording a permanent dispatch failure hit a store error.
    #[error("failed to finalize job {id}: {source}")]
    Finalize {
        id: JobId,
        #[source]
        source: StoreError,
    },
}

/// Runs dispatch cycles. Cheap to clone; one instance serves every job.
#[derive(Debug, Clone)]
pub struct JobProcessor<S> {
    handler: DownstreamHandler,
    reconciler: StatusReconciler<S>,
    metrics: Arc<dyn Metrics>,
    config: ProcessorConfig,
}

impl<S: JobStore> JobProcessor<S> {
    pub fn new(
        handler: DownstreamHandler,
        reconciler: StatusReconciler<S>,
        metrics: Arc<dyn Metrics>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            handler,
            reconciler,
            metrics,
            config,
        }
    }

    pub fn reconciler(&self) -> &StatusReconciler<S> {
        &self.reconciler
    }

    /// Dispatch `job` to its worker, bounded by `ctx`.
    ///
    /// Returns `Ok` once the cycle has a result: accepted, timed out or
    /// cancelled (the job stays in-progress for the worker's callback until
    /// the store's reclaim lease runs out), expired (skipped), or finalized as
    /// failed. Only a store error while finalizing is reported as `Err`.
    #[instrument(skip_all, fields(job_id = %job.id, job_name = %job.name, attempts = job.attempts))]
    pub async fn do_work(&self, ctx: &WorkContext, job: &QueuedJob) -> Result<(), ProcessError> {
        if job.is_expired_at(Utc::now()) {
            info!(expires_at = ?job.expires_at, "job expired; skipping dispatch");
            self.metrics.increment("dispatch.expired");
            return Ok(());
        }

        let mut unavailable = 0u32;
        loop {
            let started = Instant::now();
            let outcome = self.handler.dispatch(ctx, job).await;

            match outcome {
                DispatchOutcome::Accepted => {
                    self.metrics.timing("dispatch.latency", started.elapsed());
                    self.metrics.increment("dispatch.accepted");
                    debug!("worker accepted job");
                    return Ok(());
                }
                DispatchOutcome::TimedOut => {
                    info!("no answer from worker before the deadline");
                    self.metrics.increment("dispatch.timeout");
                    return Ok(());
                }
                DispatchOutcome::Unavailable(detail) => {
                    unavailable += 1;
                    self.metrics.increment("dispatch.unavailable");
                    let delay = self.config.unavailable_delay(unavailable);
                    debug!(
                        consecutive = unavailable,
                        delay_ms = delay.as_millis() as u64,
                        detail = ?detail,
                        "worker unavailable; backing off"
                    );
                    if delay.is_zero() {
                        if let Some(reason) = ctx.err() {
                            info!(%reason, "stopped retrying an unavailable worker");
                            self.metrics.increment("dispatch.timeout");
                            return Ok(());
                        }
                        continue;
                    }
                    if let Err(reason) = ctx.sleep(delay).await {
                        info!(%reason, "stopped retrying an unavailable worker");
                        self.metrics.increment("dispatch.timeout");
                        return Ok(());
                    }
                }
                outcome @ (DispatchOutcome::Rejected { .. }
                | DispatchOutcome::ConnectionFailed(_)) => {
                    warn!(?outcome, "dispatch failed permanently");
                    self.metrics.increment("dispatch.failed");
                    let finalize = ctx.child_with_fresh_deadline(self.config.finalize_timeout);
                    return self.finalize_failed(&finalize, job).await;
                }
            }
        }
    }

    async fn finalize_failed(&self, ctx: &WorkContext, job: &QueuedJob) -> Result<(), ProcessError> {
        let result = self
            .reconciler
            .handle_status_callback(
                ctx,
                &job.id,
                &job.name,
                ArchivedJobStatus::Failed,
                job.attempts,
                false,
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            // Already archived by a racing callback.
            Err(StatusCallbackError::NotFound { .. }) => Ok(()),
            Err(err @ StatusCallbackError::FailedDecrement { .. })
            | Err(err @ StatusCallbackError::Interrupted(_)) => {
                warn!(error = %err, "could not record dispatch failure");
                Ok(())
            }
            Err(StatusCallbackError::Store(source)) => Err(ProcessError::Finalize {
                id: job.id.clone(),
                source,
            }),
        }
    }
}
