use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::put;
use chrono::{DateTime, Utc};

use relayq_core::{
    ArchivedJob, ArchivedJobStatus, DeliveryStrategy, EnqueueJobParams, JobId, JobType, QueuedJob,
    QueuedJobStatus,
};
use relayq_infra::WorkContext;
use relayq_infra::jobs::{
    ATTEMPTS_HEADER, DispatcherConfig, DownstreamHandler, JobDispatcher, JobProcessor,
    ProcessorConfig, RetryPolicy, StatusReconciler,
};
use relayq_infra::store::{InMemoryJobStore, JobStore, StoreError};
use relayq_observability::RecordingMetrics;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(app: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Clone)]
struct SeenRequest {
    path: (String, String),
    attempts: Option<String>,
    authorization: Option<String>,
    body: Vec<u8>,
}

/// Stub worker answering from a script; the last entry repeats.
struct ScriptedWorker {
    script: Vec<(StatusCode, &'static str)>,
    delay: Duration,
    hits: AtomicUsize,
    seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedWorker {
    fn new(script: Vec<(StatusCode, &'static str)>) -> Arc<Self> {
        Self::delayed(script, Duration::ZERO)
    }

    fn delayed(script: Vec<(StatusCode, &'static str)>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script,
            delay,
            hits: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/jobs/:name/:id", put(scripted_handler))
            .with_state(self.clone())
    }
}

async fn scripted_handler(
    State(worker): State<Arc<ScriptedWorker>>,
    Path(path): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let n = worker.hits.fetch_add(1, Ordering::SeqCst);
    worker.seen.lock().unwrap().push(SeenRequest {
        path,
        attempts: header(&headers, ATTEMPTS_HEADER),
        authorization: header(&headers, "authorization"),
        body: body.to_vec(),
    });
    if !worker.delay.is_zero() {
        tokio::time::sleep(worker.delay).await;
    }
    let (status, body) = worker.script[n.min(worker.script.len() - 1)];
    (status, body.to_string())
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

type Store = Arc<InMemoryJobStore>;

struct Harness {
    store: Store,
    metrics: Arc<RecordingMetrics>,
    processor: JobProcessor<Store>,
}

async fn harness(base_url: &str, job_type: JobType, sleep_factor: u32) -> Harness {
    let store = InMemoryJobStore::arc();
    store.create_job_type(job_type).await.unwrap();
    let metrics = Arc::new(RecordingMetrics::new());
    let reconciler = StatusReconciler::new(store.clone(), metrics.clone())
        .with_requeue_backoff(RetryPolicy::immediate());
    let handler = DownstreamHandler::new(base_url, "secret").unwrap();
    let config = ProcessorConfig::default()
        .with_unavailable_backoff(RetryPolicy::fixed(Duration::from_millis(10)))
        .with_sleep_factor(sleep_factor);
    let processor = JobProcessor::new(handler, reconciler, metrics.clone(), config);
    Harness {
        store,
        metrics,
        processor,
    }
}

fn echo_type() -> JobType {
    JobType::new("echo", DeliveryStrategy::AtLeastOnce, 3, 1).unwrap()
}

async fn enqueue(store: &Store, params: EnqueueJobParams) -> QueuedJob {
    store.enqueue(params).await.unwrap()
}

fn ctx(timeout: Duration) -> WorkContext {
    WorkContext::with_timeout(timeout)
}

const LEASE: Duration = Duration::from_secs(300);

/// Processor over `store` whose 503 backoff is long enough that only
/// cancellation or the deadline can end it.
fn patient_processor(
    base_url: &str,
    store: Store,
    metrics: Arc<RecordingMetrics>,
) -> JobProcessor<Store> {
    let reconciler = StatusReconciler::new(store, metrics.clone());
    let handler = DownstreamHandler::new(base_url, "secret").unwrap();
    let config = ProcessorConfig::default()
        .with_unavailable_backoff(RetryPolicy::fixed(Duration::from_secs(30)));
    JobProcessor::new(handler, reconciler, metrics, config)
}

/// Cancel `ctx` once `ready` holds, polling briefly.
fn cancel_when(ctx: &WorkContext, ready: impl Fn() -> bool + Send + 'static) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cancel();
    });
}

async fn assert_untouched(store: &Store, job: &QueuedJob) {
    let queued = store.get_queued_job(&job.id).await.unwrap();
    assert_eq!(queued.attempts, job.attempts);
    assert!(matches!(
        store.get_archived_job(&job.id).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn expired_job_is_never_dispatched() {
    let worker = ScriptedWorker::new(vec![(StatusCode::ACCEPTED, "")]);
    let server = TestServer::spawn(worker.router()).await;
    let h = harness(&server.base_url, echo_type(), 0).await;

    let job = enqueue(
        &h.store,
        EnqueueJobParams::new("echo", b"{}".to_vec())
            .expires_at(Utc::now() - chrono::Duration::seconds(1)),
    )
    .await;

    h.processor
        .do_work(&ctx(Duration::from_secs(5)), &job)
        .await
        .unwrap();

    assert_eq!(worker.hits(), 0);
    assert_eq!(h.metrics.count("dispatch.expired"), 1);
    // Skipped, not finalized.
    assert!(h.store.get_queued_job(&job.id).await.is_ok());
    assert!(h.store.get_archived_job(&job.id).await.is_err());
}

#[tokio::test]
async fn accepted_dispatch_carries_payload_auth_and_attempts() {
    let worker = ScriptedWorker::new(vec![(StatusCode::ACCEPTED, "")]);
    let server = TestServer::spawn(worker.router()).await;
    let h = harness(&server.base_url, echo_type(), 0).await;

    let job = enqueue(
        &h.store,
        EnqueueJobParams::new("echo", br#"{"msg":"hi"}"#.to_vec())
            .expires_at(Utc::now() + chrono::Duration::minutes(5)),
    )
    .await;

    h.processor
        .do_work(&ctx(Duration::from_secs(5)), &job)
        .await
        .unwrap();

    assert_eq!(worker.hits(), 1);
    let seen = worker.seen.lock().unwrap()[0].clone();
    assert_eq!(seen.path, ("echo".to_string(), job.id.to_string()));
    assert_eq!(seen.attempts.as_deref(), Some("3"));
    assert!(seen.authorization.unwrap().starts_with("Basic "));
    assert_eq!(seen.body, br#"{"msg":"hi"}"#.to_vec());

    assert_eq!(h.metrics.count("dispatch.accepted"), 1);
    assert_eq!(h.metrics.timing_count("dispatch.latency"), 1);
    // The worker owns the job until it calls back.
    assert!(h.store.get_queued_job(&job.id).await.is_ok());
}

#[tokio::test]
async fn unavailable_worker_is_retried_until_accepted() {
    let worker = ScriptedWorker::new(vec![
        (
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"id":"service_unavailable","title":"busy"}"#,
        ),
        (StatusCode::SERVICE_UNAVAILABLE, "not json"),
        (StatusCode::ACCEPTED, ""),
    ]);
    let server = TestServer::spawn(worker.router()).await;
    let h = harness(&server.base_url, echo_type(), 0).await;
    let job = enqueue(&h.store, EnqueueJobParams::new("echo", vec![])).await;

    h.processor
        .do_work(&ctx(Duration::from_secs(5)), &job)
        .await
        .unwrap();

    assert_eq!(worker.hits(), 3);
    assert_eq!(h.metrics.count("dispatch.unavailable"), 2);
    assert_eq!(h.metrics.count("dispatch.accepted"), 1);
}

#[tokio::test]
async fn unavailable_worker_backs_off_until_deadline() {
    let worker = ScriptedWorker::new(vec![(StatusCode::SERVICE_UNAVAILABLE, "")]);
    let server = TestServer::spawn(worker.router()).await;
    let h = harness(&server.base_url, echo_type(), 1).await;
    let job = enqueue(&h.store, EnqueueJobParams::new("echo", vec![])).await;

    h.processor
        .do_work(&ctx(Duration::from_millis(150)), &job)
        .await
        .unwrap();

    assert!(worker.hits() >= 1);
    assert_eq!(h.metrics.count("dispatch.timeout"), 1);
    assert_eq!(h.store.get_queued_job(&job.id).await.unwrap().attempts, 3);
}

#[tokio::test]
async fn timed_out_dispatch_leaves_job_for_the_callback() {
    let worker =
        ScriptedWorker::delayed(vec![(StatusCode::ACCEPTED, "")], Duration::from_millis(300));
    let server = TestServer::spawn(worker.router()).await;
    let h = harness(&server.base_url, echo_type(), 0).await;
    let job = enqueue(&h.store, EnqueueJobParams::new("echo", vec![])).await;

    h.processor
        .do_work(&ctx(Duration::from_millis(40)), &job)
        .await
        .unwrap();

    assert_eq!(h.metrics.count("dispatch.timeout"), 1);
    assert!(h.store.get_queued_job(&job.id).await.is_ok());

    // The worker finished anyway and reports success.
    h.processor
        .reconciler()
        .handle_status_callback(
            &ctx(Duration::from_secs(5)),
            &job.id,
            "echo",
            ArchivedJobStatus::Succeeded,
            job.attempts,
            true,
        )
        .await
        .unwrap();
    assert_eq!(
        h.store.get_archived_job(&job.id).await.unwrap().status,
        ArchivedJobStatus::Succeeded
    );
}

#[tokio::test]
async fn timed_out_job_is_claimable_again_once_its_lease_runs_out() {
    let worker =
        ScriptedWorker::delayed(vec![(StatusCode::ACCEPTED, "")], Duration::from_millis(300));
    let server = TestServer::spawn(worker.router()).await;
    let h = harness(&server.base_url, echo_type(), 0).await;
    enqueue(&h.store, EnqueueJobParams::new("echo", vec![])).await;
    let job = h.store.acquire(LEASE).await.unwrap().unwrap();

    h.processor
        .do_work(&ctx(Duration::from_millis(40)), &job)
        .await
        .unwrap();

    let stranded = h.store.get_queued_job(&job.id).await.unwrap();
    assert_eq!(stranded.status, QueuedJobStatus::InProgress);
    assert_eq!(stranded.attempts, 3);
    assert!(h.store.acquire(LEASE).await.unwrap().is_none());

    let reclaimed = h.store.acquire(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.attempts, 3);
}

#[tokio::test]
async fn cancellation_interrupts_unavailable_backoff() {
    let worker = ScriptedWorker::new(vec![(StatusCode::SERVICE_UNAVAILABLE, "")]);
    let server = TestServer::spawn(worker.router()).await;
    let h = harness(&server.base_url, echo_type(), 1).await;
    let processor = patient_processor(&server.base_url, h.store.clone(), h.metrics.clone());
    let job = enqueue(&h.store, EnqueueJobParams::new("echo", vec![])).await;

    let ctx = ctx(Duration::from_secs(30));
    cancel_when(&ctx, {
        let worker = worker.clone();
        move || worker.hits() >= 1
    });

    let started = Instant::now();
    processor.do_work(&ctx, &job).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(worker.hits(), 1);
    assert_eq!(h.metrics.count("dispatch.timeout"), 1);
    assert_untouched(&h.store, &job).await;
}

#[tokio::test]
async fn cancellation_interrupts_a_slow_worker_call() {
    let worker =
        ScriptedWorker::delayed(vec![(StatusCode::ACCEPTED, "")], Duration::from_secs(30));
    let server = TestServer::spawn(worker.router()).await;
    let h = harness(&server.base_url, echo_type(), 0).await;
    let job = enqueue(&h.store, EnqueueJobParams::new("echo", vec![])).await;

    let ctx = ctx(Duration::from_secs(30));
    cancel_when(&ctx, {
        let worker = worker.clone();
        move || worker.hits() >= 1
    });

    let started = Instant::now();
    h.processor.do_work(&ctx, &job).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(h.metrics.count("dispatch.timeout"), 1);
    assert_eq!(h.metrics.count("dispatch.accepted"), 0);
    assert_untouched(&h.store, &job).await;
}

/// Delegates to an in-memory store, but archives slowly.
struct SlowArchive {
    inner: Store,
    delay: Duration,
}

#[async_trait]
impl JobStore for SlowArchive {
    async fn create_job_type(&self, job_type: JobType) -> Result<JobType, StoreError> {
        self.inner.create_job_type(job_type).await
    }

    async fn get_job_type(&self, name: &str) -> Result<JobType, StoreError> {
        self.inner.get_job_type(name).await
    }

    async fn enqueue(&self, params: EnqueueJobParams) -> Result<QueuedJob, StoreError> {
        self.inner.enqueue(params).await
    }

    async fn get_queued_job(&self, id: &JobId) -> Result<QueuedJob, StoreError> {
        self.inner.get_queued_job(id).await
    }

    async fn acquire(&self, reclaim_after: Duration) -> Result<Option<QueuedJob>, StoreError> {
        self.inner.acquire(reclaim_after).await
    }

    async fn update_attempts(
        &self,
        id: &JobId,
        expected_attempts: i16,
        new_attempts: i16,
        run_after: DateTime<Utc>,
    ) -> Result<QueuedJob, StoreError> {
        self.inner
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
        tokio::time::sleep(self.delay).await;
        self.inner.move_to_archive(id, name, status, attempt).await
    }

    async fn get_archived_job(&self, id: &JobId) -> Result<ArchivedJob, StoreError> {
        self.inner.get_archived_job(id).await
    }
}

#[tokio::test]
async fn late_permanent_failure_is_still_archived() {
    let worker = ScriptedWorker::new(vec![(StatusCode::BAD_REQUEST, "bad payload")]);
    let server = TestServer::spawn(worker.router()).await;

    let inner = InMemoryJobStore::arc();
    inner.create_job_type(echo_type()).await.unwrap();
    let store = Arc::new(SlowArchive {
        inner: inner.clone(),
        delay: Duration::from_millis(200),
    });
    let metrics = Arc::new(RecordingMetrics::new());
    let processor = JobProcessor::new(
        DownstreamHandler::new(&server.base_url, "secret").unwrap(),
        StatusReconciler::new(store.clone(), metrics.clone()),
        metrics.clone(),
        ProcessorConfig::default().with_finalize_timeout(Duration::from_secs(5)),
    );
    let job = store
        .enqueue(EnqueueJobParams::new("echo", vec![]))
        .await
        .unwrap();

    // The cycle's own deadline passes while the archive is in progress.
    processor
        .do_work(&ctx(Duration::from_millis(100)), &job)
        .await
        .unwrap();

    let archived = inner.get_archived_job(&job.id).await.unwrap();
    assert_eq!(archived.status, ArchivedJobStatus::Failed);
    assert_eq!(metrics.count("status_callback.failed"), 1);
}

#[tokio::test]
async fn connection_refused_archives_at_most_once_job_as_failed() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let h = harness(
        &format!("http://127.0.0.1:{port}"),
        JobType::new("echo", DeliveryStrategy::AtMostOnce, 1, 1).unwrap(),
        0,
    )
    .await;
    let job = enqueue(&h.store, EnqueueJobParams::new("echo", vec![])).await;

    h.processor
        .do_work(&ctx(Duration::from_secs(5)), &job)
        .await
        .unwrap();

    let archived = h.store.get_archived_job(&job.id).await.unwrap();
    assert_eq!(archived.status, ArchivedJobStatus::Failed);
    assert_eq!(archived.attempt, 1);
    assert!(matches!(
        h.store.get_queued_job(&job.id).await,
        Err(StoreError::NotFound(_))
    ));
    assert_eq!(h.metrics.count("dispatch.failed"), 1);
}

#[tokio::test]
async fn rejected_dispatch_archives_without_consuming_retries() {
    let worker = ScriptedWorker::new(vec![(StatusCode::BAD_REQUEST, "bad payload")]);
    let server = TestServer::spawn(worker.router()).await;
    let h = harness(&server.base_url, echo_type(), 0).await;
    let job = enqueue(&h.store, EnqueueJobParams::new("echo", vec![])).await;

    h.processor
        .do_work(&ctx(Duration::from_secs(5)), &job)
        .await
        .unwrap();

    assert_eq!(worker.hits(), 1);
    let archived = h.store.get_archived_job(&job.id).await.unwrap();
    assert_eq!(archived.status, ArchivedJobStatus::Failed);
    assert_eq!(archived.attempt, 3);
}

#[tokio::test]
async fn failure_after_job_already_archived_is_ignored() {
    let worker = ScriptedWorker::new(vec![(StatusCode::INTERNAL_SERVER_ERROR, "")]);
    let server = TestServer::spawn(worker.router()).await;
    let h = harness(&server.base_url, echo_type(), 0).await;
    let job = enqueue(&h.store, EnqueueJobParams::new("echo", vec![])).await;

    h.store
        .move_to_archive(&job.id, "echo", ArchivedJobStatus::Succeeded, 3)
        .await
        .unwrap();

    h.processor
        .do_work(&ctx(Duration::from_secs(5)), &job)
        .await
        .unwrap();
    assert_eq!(
        h.store.get_archived_job(&job.id).await.unwrap().status,
        ArchivedJobStatus::Succeeded
    );
}

struct CallbackWorker {
    reconciler: StatusReconciler<Store>,
    fail_first: bool,
    hits: AtomicUsize,
}

/// Accepts the job, then reports on it from a separate task.
async fn callback_handler(
    State(worker): State<Arc<CallbackWorker>>,
    Path((name, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> StatusCode {
    let n = worker.hits.fetch_add(1, Ordering::SeqCst);
    let attempt: i16 = header(&headers, ATTEMPTS_HEADER)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let id: JobId = id.parse().unwrap();
    let status = if worker.fail_first && n == 0 {
        ArchivedJobStatus::Failed
    } else {
        ArchivedJobStatus::Succeeded
    };

    let worker = worker.clone();
    tokio::spawn(async move {
        let ctx = WorkContext::with_timeout(Duration::from_secs(5));
        let _ = worker
            .reconciler
            .handle_status_callback(&ctx, &id, &name, status, attempt, true)
            .await;
    });
    StatusCode::ACCEPTED
}

async fn wait_for_archive(store: &Store, id: &JobId) -> relayq_core::ArchivedJob {
    for _ in 0..200 {
        if let Ok(archived) = store.get_archived_job(id).await {
            return archived;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job was not archived in time");
}

#[tokio::test]
async fn dispatcher_runs_jobs_through_to_archive() {
    let store = InMemoryJobStore::arc();
    store.create_job_type(echo_type()).await.unwrap();
    let metrics = Arc::new(RecordingMetrics::new());
    let reconciler = StatusReconciler::new(store.clone(), metrics.clone())
        .with_requeue_backoff(RetryPolicy::immediate());

    let worker = Arc::new(CallbackWorker {
        reconciler: reconciler.clone(),
        fail_first: true,
        hits: AtomicUsize::new(0),
    });
    let app = Router::new()
        .route("/jobs/:name/:id", put(callback_handler))
        .with_state(worker.clone());
    let server = TestServer::spawn(app).await;

    let handler = DownstreamHandler::new(&server.base_url, "secret").unwrap();
    let processor = JobProcessor::new(
        handler,
        reconciler,
        metrics.clone(),
        ProcessorConfig::default().with_sleep_factor(0),
    );
    let dispatcher = JobDispatcher::new(store.clone(), processor).spawn(
        DispatcherConfig::default()
            .with_name("test-dispatcher")
            .with_poll_interval(Duration::from_millis(5))
            .with_dispatch_timeout(Duration::from_secs(5))
            .with_max_concurrent(2),
    );

    let job = enqueue(&store, EnqueueJobParams::new("echo", b"{}".to_vec())).await;
    let archived = wait_for_archive(&store, &job.id).await;

    // First attempt failed and was requeued; the second succeeded.
    assert_eq!(archived.status, ArchivedJobStatus::Succeeded);
    assert_eq!(archived.attempt, 2);
    assert_eq!(worker.hits.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.count("status_callback.failed"), 1);
    assert_eq!(metrics.count("status_callback.succeeded"), 1);

    let stats = dispatcher.stats();
    assert!(stats.jobs_claimed >= 2);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn dispatcher_redispatches_jobs_left_without_a_callback() {
    // Accepts slowly and never calls back.
    let worker =
        ScriptedWorker::delayed(vec![(StatusCode::ACCEPTED, "")], Duration::from_millis(200));
    let server = TestServer::spawn(worker.router()).await;
    let h = harness(&server.base_url, echo_type(), 0).await;

    let dispatcher = JobDispatcher::new(h.store.clone(), h.processor.clone()).spawn(
        DispatcherConfig::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_dispatch_timeout(Duration::from_millis(30))
            .with_reclaim_after(Duration::from_millis(50)),
    );
    let job = enqueue(&h.store, EnqueueJobParams::new("echo", vec![])).await;

    for _ in 0..200 {
        if worker.hits() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    dispatcher.shutdown().await;

    assert!(worker.hits() >= 2, "job was dispatched only once");
    let seen = worker.seen.lock().unwrap().clone();
    assert!(seen.iter().all(|r| r.path.1 == job.id.to_string()));
    assert_eq!(h.store.get_queued_job(&job.id).await.unwrap().attempts, 3);
}
