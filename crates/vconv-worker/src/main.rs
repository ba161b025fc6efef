//! Video conversion worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vconv_media::{check_ffmpeg, DashConfig, FfmpegDashTranscoder};
use vconv_queue::{QueueConfig, RedisCompletionPublisher, RedisTaskLocker, TaskQueue};
use vconv_store::{PgErrorLog, PgLedger, StoreConfig};
use vconv_worker::{ProcessorDeps, TaskExecutor, TaskProcessor, WorkerConfig};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();
    info!("Starting vconv-worker");

    if let Err(e) = run().await {
        error!(error = %e, "Worker failed to start");
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}

/// Colored output for dev, JSON for production.
fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vconv=info,sqlx=warn"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn run() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env();
    config.validate()?;
    let queue_config = QueueConfig::from_env();
    let store_config = StoreConfig::from_env();
    let dash_config = DashConfig::from_env();
    info!(?config, "Worker config");

    if let Some(addr) = std::env::var("METRICS_ADDR").ok().filter(|v| !v.is_empty()) {
        let addr: SocketAddr = addr.parse()?;
        vconv_worker::metrics::init_prometheus(addr)?;
        info!(%addr, "Prometheus exporter listening");
    }

    let ffmpeg = check_ffmpeg()?;
    info!(path = %ffmpeg.display(), "Found ffmpeg");

    let pool = vconv_store::connect(&store_config).await?;

    let queue = TaskQueue::new(queue_config.clone())?;
    queue.init().await?;

    let publisher =
        RedisCompletionPublisher::new(&queue_config.redis_url, &queue_config.confirmation_stream)?;
    let locker = RedisTaskLocker::new(&queue_config.redis_url, config.lock_ttl)?;
    let transcoder = FfmpegDashTranscoder::new(dash_config)
        .with_process_limit(Arc::new(Semaphore::new(config.max_ffmpeg_processes)));

    let deps = ProcessorDeps {
        transcoder: Arc::new(transcoder),
        ledger: Arc::new(PgLedger::new(pool.clone())),
        errors: Arc::new(PgErrorLog::new(pool.clone())),
        publisher: Arc::new(publisher),
        locker: Arc::new(locker),
    };
    let processor = TaskProcessor::new(config.clone(), deps);
    let executor = Arc::new(TaskExecutor::new(config, Arc::new(queue), processor));

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_executor.shutdown();
    });

    executor.run().await?;
    pool.close().await;
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown"),
        _ = terminate => info!("Received terminate signal, starting graceful shutdown"),
    }
}
