use std::path::Path;

use vconv_media::check_ffmpeg;
use vconv_queue::{QueueConfig, TaskQueue};
use vconv_store::StoreConfig;
use vconv_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env();

    println!(
        "worker-selfcheck: starting with max_tasks={} max_ffmpeg={} chunk_extension={}",
        config.max_concurrent_tasks, config.max_ffmpeg_processes, config.chunk_extension
    );
    ensure_env_present(&["REDIS_URL", "DATABASE_URL"])?;
    ensure_ffmpeg()?;
    ensure_store().await?;
    ensure_queue().await?;
    if let Some(dir) = std::env::args().nth(1) {
        ensure_writable(&dir).await?;
    }

    println!("worker-selfcheck: ok");
    Ok(())
}

fn ensure_ffmpeg() -> anyhow::Result<()> {
    let path = check_ffmpeg().map_err(|e| anyhow::anyhow!("ffmpeg not available: {}", e))?;
    let output = std::process::Command::new(&path).arg("-version").output()?;

    if !output.status.success() {
        return Err(anyhow::anyhow!("ffmpeg -version failed: {:?}", output.status));
    }
    println!("worker-selfcheck: ffmpeg at {}", path.display());
    Ok(())
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        if std::env::var(var).is_err() {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}

async fn ensure_store() -> anyhow::Result<()> {
    let config = StoreConfig {
        run_migrations: false,
        max_connections: 1,
        ..StoreConfig::from_env()
    };
    let pool = vconv_store::create_pool(&config).await?;
    let one: i32 = sqlx_ping(&pool).await?;
    anyhow::ensure!(one == 1, "unexpected database reply");
    pool.close().await;
    println!("worker-selfcheck: database reachable");
    Ok(())
}

async fn sqlx_ping(pool: &vconv_store::PgPool) -> anyhow::Result<i32> {
    let row: (i32,) = vconv_store::sqlx::query_as("SELECT 1").fetch_one(pool).await?;
    Ok(row.0)
}

async fn ensure_queue() -> anyhow::Result<()> {
    let queue = TaskQueue::new(QueueConfig::from_env())?;
    queue.ping().await?;
    println!(
        "worker-selfcheck: redis reachable, {} message(s) in {}",
        queue.len().await?,
        queue.config().stream_name
    );
    Ok(())
}

/// The worker writes merged files and packages next to the chunks.
async fn ensure_writable<P: AsRef<Path>>(dir: P) -> anyhow::Result<()> {
    let probe = dir.as_ref().join(".vconv-selfcheck");
    tokio::fs::write(&probe, b"ok").await?;
    tokio::fs::remove_file(&probe).await?;
    println!("worker-selfcheck: {} is writable", dir.as_ref().display());
    Ok(())
}
