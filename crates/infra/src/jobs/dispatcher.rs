//! Polling dispatcher: claims ready jobs and runs a dispatch cycle for each.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use super::processor::JobProcessor;
use crate::context::WorkContext;
use crate::store::JobStore;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    /// How often to poll when no job is ready
    pub poll_interval: Duration,
    /// Deadline for one dispatch cycle
    pub dispatch_timeout: Duration,
    /// Maximum dispatch cycles in flight
    pub max_concurrent: usize,
    /// How long an in-progress job may go without a status callback before
    /// it is claimed again
    pub reclaim_after: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "job-dispatcher".to_string(),
            poll_interval: Duration::from_millis(100),
            dispatch_timeout: Duration::from_secs(30),
            max_concurrent: 10,
            reclaim_after: Duration::from_secs(300),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_reclaim_after(mut self, lease: Duration) -> Self {
        self.reclaim_after = lease;
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatcherStats {
    pub jobs_claimed: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct JobDispatcherHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl JobDispatcherHandle {
    /// Stop claiming jobs, cancel in-flight cycles and wait for them to end.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.join.await {
            error!(error = %err, "dispatcher task ended abnormally");
        }
    }

    /// Current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Background dispatcher.
///
/// Polls a job store for ready jobs and hands each to the [`JobProcessor`]
/// on its own task, with at most `max_concurrent` cycles in flight.
pub struct JobDispatcher<S> {
    store: S,
    processor: JobProcessor<S>,
}

impl<S: JobStore + Clone + 'static> JobDispatcher<S> {
    pub fn new(store: S, processor: JobProcessor<S>) -> Self {
        Self { store, processor }
    }

    /// Spawn the dispatch loop on the current tokio runtime.
    pub fn spawn(self, config: DispatcherConfig) -> JobDispatcherHandle {
        let shutdown = CancellationToken::new();
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));

        let span = tracing::info_span!("dispatcher", name = %config.name);
        let join = tokio::spawn(
            dispatch_loop(self, config, shutdown.clone(), stats.clone()).instrument(span),
        );

        JobDispatcherHandle {
            shutdown,
            join,
            stats,
        }
    }
}

fn update_stats(stats: &Mutex<DispatcherStats>, f: impl FnOnce(&mut DispatcherStats)) {
    match stats.lock() {
        Ok(mut s) => f(&mut s),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

async fn dispatch_loop<S: JobStore + Clone + 'static>(
    dispatcher: JobDispatcher<S>,
    config: DispatcherConfig,
    shutdown: CancellationToken,
    stats: Arc<Mutex<DispatcherStats>>,
) {
    info!("job dispatcher started");
    let start_time = Instant::now();
    let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
    let mut in_flight = tokio::task::JoinSet::new();

    loop {
        update_stats(&stats, |s| s.uptime_secs = start_time.elapsed().as_secs());

        // Reap finished cycles so the set does not grow unbounded.
        while in_flight.try_join_next().is_some() {}

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let claimed = tokio::select! {
            _ = shutdown.cancelled() => break,
            claimed = dispatcher.store.acquire(config.reclaim_after) => claimed,
        };

        match claimed {
            Ok(Some(job)) => {
                debug!(job_id = %job.id, job_name = %job.name, "claimed job");
                update_stats(&stats, |s| {
                    s.jobs_claimed += 1;
                    s.current_running += 1;
                });

                let processor = dispatcher.processor.clone();
                let ctx = WorkContext::with_token(&shutdown, config.dispatch_timeout);
                let stats = stats.clone();
                in_flight.spawn(
                    async move {
                        let result = processor.do_work(&ctx, &job).await;
                        if let Err(err) = &result {
                            error!(job_id = %job.id, error = %err, "dispatch cycle failed");
                        }
                        update_stats(&stats, |s| {
                            s.current_running = s.current_running.saturating_sub(1);
                            match result {
                                Ok(()) => s.cycles_completed += 1,
                                Err(_) => s.cycles_failed += 1,
                            }
                        });
                        drop(permit);
                    }
                    .in_current_span(),
                );
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            Err(e) => {
                drop(permit);
                error!(error = %e, "failed to claim job");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }

    // In-flight contexts are children of the shutdown token and end promptly.
    while in_flight.join_next().await.is_some() {}
    info!("job dispatcher stopped");
}
