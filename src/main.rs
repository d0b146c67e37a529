use anyhow::Context;
use dotenvy::dotenv;
use hls_backend::config::settings::AppConfig;
use hls_backend::infrastructure::db::pool::{connect_to_db, run_migrations};
use hls_backend::infrastructure::queue::memory::MemoryQueue;
use hls_backend::infrastructure::queue::rabbitmq::RabbitMqService;
use hls_backend::infrastructure::queue::TaskQueue;
use hls_backend::infrastructure::storage::local::FileLayout;
use hls_backend::modules::jobs::memory::InMemoryJobStore;
use hls_backend::modules::jobs::repository::{JobStore, PgJobStore};
use hls_backend::state::AppState;
use hls_backend::workers::dispatcher::Dispatcher;
use hls_backend::workers::encoder::FfmpegEncoder;
use hls_backend::workers::pool::WorkerPool;
use hls_backend::workers::reconciler::Reconciler;
use hls_backend::workers::transcoder::TranscodeWorker;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting server...");

    let config = AppConfig::new().context("Invalid configuration")?;

    let files = FileLayout::new(&config.static_root, &config.uploads_dir, &config.streams_dir);
    files.ensure_roots().await.context("Failed to create static folders")?;

    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => {
            let max_connections = u32::try_from(config.worker_concurrency + 8).unwrap_or(u32::MAX);
            let pool = connect_to_db(url, max_connections)
                .await
                .context("Failed to connect to PostgreSQL")?;
            run_migrations(&pool).await.context("Failed to run migrations")?;
            Arc::new(PgJobStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, job records live in memory only");
            Arc::new(InMemoryJobStore::new())
        }
    };

    let queue: Arc<dyn TaskQueue> = match &config.rabbitmq_url {
        Some(url) => Arc::new(
            RabbitMqService::new(url, &config.transcode_queue)
                .await
                .context("Failed to connect to RabbitMQ")?,
        ),
        None => {
            warn!("RABBITMQ_URL not set, using the in-process task queue");
            Arc::new(MemoryQueue::new())
        }
    };

    let shutdown = CancellationToken::new();

    let encoder = Arc::new(FfmpegEncoder::new(&config.ffmpeg_bin, config.encode_timeout));
    let transcoder = TranscodeWorker::new(store.clone(), files.clone(), encoder)
        .clear_stale_output(config.clear_stale_output);
    let dispatcher = Arc::new(Dispatcher::new().register(Arc::new(transcoder)));

    let pool = WorkerPool::new(queue.clone(), dispatcher, config.worker_concurrency);
    let mut background = pool.spawn(shutdown.clone());

    if config.reconcile_interval.is_zero() {
        info!("Reconciler disabled");
    } else {
        let reconciler = Reconciler::new(
            store.clone(),
            queue.clone(),
            config.stale_after(),
            config.pending_requeue_after,
        );
        background.push(tokio::spawn(reconciler.run(config.reconcile_interval, shutdown.clone())));
    }

    let port = config.server_port;
    let state = AppState::new(config, store, queue, files);
    let app = hls_backend::app::create_app(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Server running on http://0.0.0.0:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("Server error")?;

    shutdown.cancel();
    info!("Waiting for workers to finish their current jobs...");
    for handle in background {
        if let Err(e) = handle.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
                shutdown.cancelled().await;
            }
        }
        _ = shutdown.cancelled() => {}
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
