//! HTTP surface for the optimization service: submission endpoints, the
//! single-shot poll, the SSE progress stream, and the synchronous custom
//! fitness endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::routing::post;
use opthub_core::AlgorithmRunner;
use opthub_core::Config;
use opthub_core::JobStore;
use opthub_core::WorkerPool;
use opthub_sandbox::SandboxExecutor;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod api;
mod custom;
mod stream;

/// Uploads are capped at 1 MiB per file; leave headroom for two files plus
/// multipart framing.
const MAX_BODY_BYTES: usize = 3 * 1024 * 1024;

pub struct AppState {
    pub config: Config,
    pub store: Arc<JobStore>,
    pub pool: Arc<WorkerPool>,
    /// Absent when the sandbox child binary could not be located; the
    /// user-fitness paths then fail with a `container` error.
    pub sandbox: Option<Arc<SandboxExecutor>>,
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

/// Wire up the store, runner, and pool from one config.
pub fn build_state(config: Config) -> Arc<AppState> {
    let store = Arc::new(JobStore::new(config.subscriber_buffer));
    let sandbox = match SandboxExecutor::new(config.sandbox_config()) {
        Ok(executor) => Some(Arc::new(executor)),
        Err(err) => {
            warn!("sandbox executor unavailable: {err}");
            None
        }
    };
    let runner = Arc::new(AlgorithmRunner::new(sandbox.clone()));
    let pool = WorkerPool::start(&config, Arc::clone(&store), runner);
    Arc::new(AppState {
        config,
        store,
        pool,
        sandbox,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/async/optimize", post(api::submit))
        .route("/async/tasks/{id}", get(api::poll))
        .route("/async/tasks/{id}/cancel", post(api::cancel))
        .route("/api/async/tasks/{id}/stream", get(stream::stream_task))
        .route("/api/optimize/custom", post(custom::optimize_custom))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Periodically garbage-collect terminal records past the retention window.
pub fn spawn_eviction_loop(state: Arc<AppState>) {
    let Some(retention) = state.config.retention else {
        info!("result retention is unlimited; eviction loop disabled");
        return;
    };
    let interval = retention.clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let evicted = state.store.evict_expired(chrono::Utc::now(), retention);
            if evicted > 0 {
                info!("evicted {evicted} expired job records");
            }
        }
    });
}

pub async fn run_main(listen: SocketAddr, config: Config) -> anyhow::Result<()> {
    let state = build_state(config);
    spawn_eviction_loop(Arc::clone(&state));
    let app = router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    state.pool.shutdown().await;
    Ok(())
}
