//! Enqueue a conversion task by hand, e.g. to replay a failed upload.
//!
//! Usage: `vconv-enqueue <video_id> <path>`

use anyhow::Context;
use vconv_models::{VideoId, VideoTask};
use vconv_queue::TaskQueue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let mut args = std::env::args().skip(1);
    let (Some(video_id), Some(path)) = (args.next(), args.next()) else {
        anyhow::bail!("usage: vconv-enqueue <video_id> <path>");
    };
    let video_id: i64 = video_id
        .parse()
        .with_context(|| format!("video_id must be an integer, got {video_id:?}"))?;

    let queue = TaskQueue::from_env()?;
    queue.init().await?;
    let task = VideoTask::new(VideoId(video_id), path);
    let message_id = queue.enqueue(&task).await?;

    println!(
        "enqueued video {} ({}) as {} on {}",
        task.video_id,
        task.path.display(),
        message_id,
        queue.config().stream_name
    );
    Ok(())
}
