use std::sync::Arc;

use anyhow::Context;

use relayq_api::app::{self, AppServices, services::DynJobStore};
use relayq_api::config::ServerConfig;
use relayq_infra::jobs::{
    DispatcherConfig, DownstreamHandler, JobDispatcher, JobProcessor, ProcessorConfig,
    StatusReconciler,
};
use relayq_infra::store::{InMemoryJobStore, PostgresJobStore};
use relayq_observability::{Metrics, TracingMetrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relayq_observability::init();

    let config = ServerConfig::from_env().context("invalid configuration")?;

    let store: DynJobStore = match &config.database_url {
        Some(url) => {
            let store = PostgresJobStore::connect(url, config.pool_size())
                .await
                .context("failed to connect to postgres")?;
            store.migrate().await.context("failed to run migrations")?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory job store");
            Arc::new(InMemoryJobStore::new())
        }
    };

    let metrics: Arc<dyn Metrics> = Arc::new(TracingMetrics);
    let reconciler = StatusReconciler::new(store.clone(), metrics.clone());

    let handler = DownstreamHandler::new(&config.downstream_url, &config.downstream_password)
        .context("invalid downstream configuration")?;
    let processor = JobProcessor::new(
        handler,
        reconciler.clone(),
        metrics.clone(),
        ProcessorConfig::default().with_sleep_factor(config.unavailable_sleep_factor),
    );
    let dispatcher = JobDispatcher::new(store.clone(), processor).spawn(
        DispatcherConfig::default()
            .with_poll_interval(config.poll_interval)
            .with_dispatch_timeout(config.dispatch_timeout)
            .with_max_concurrent(config.max_concurrent_dispatches)
            .with_reclaim_after(config.reclaim_after),
    );

    let services = Arc::new(AppServices::new(store, metrics).with_reconciler(reconciler));
    let app = app::build_app(services, config.auth.clone());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
        .context("server error")?;

    tracing::info!("shutting down dispatcher");
    dispatcher.shutdown().await;
    Ok(())
}
