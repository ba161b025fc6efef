//! Worker configuration.

use std::time::Duration;

use vconv_media::DEFAULT_CHUNK_EXTENSION;
use vconv_queue::DEFAULT_LOCK_TTL_SECS;

use crate::error::{WorkerError, WorkerResult};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent tasks
    pub max_concurrent_tasks: usize,
    /// Maximum concurrent FFmpeg processes across all tasks
    pub max_ffmpeg_processes: usize,
    /// Deadline for one processing attempt (assembly and transcoding)
    pub task_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// How often the worker should scan for orphaned pending messages
    pub claim_interval: Duration,
    /// Minimum idle time before a pending message can be claimed (crash recovery)
    pub claim_min_idle: Duration,
    /// Expiry of a per-video task lock
    pub lock_ttl: Duration,
    /// Chunk file extension, without the dot
    pub chunk_extension: String,
    /// Name of the merged file inside the task directory
    pub merged_file_name: String,
    /// Name of the package directory inside the task directory
    pub output_dir_name: String,
    /// How long one read from the message source may block
    pub consume_block: Duration,
    /// Upper bound on messages fetched per read
    pub consume_batch: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            max_ffmpeg_processes: 2,
            task_timeout: Duration::from_secs(3600), // 1 hour
            shutdown_timeout: Duration::from_secs(60),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(300), // 5 minutes
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            chunk_extension: DEFAULT_CHUNK_EXTENSION.to_string(),
            merged_file_name: "merged.mp4".to_string(),
            output_dir_name: "mpeg-dash".to_string(),
            consume_block: Duration::from_secs(1),
            consume_batch: 5,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_concurrent_tasks: env_parse("WORKER_MAX_TASKS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_tasks),
            max_ffmpeg_processes: env_parse("WORKER_MAX_FFMPEG")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_ffmpeg_processes),
            task_timeout: env_parse("WORKER_TASK_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.task_timeout),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            claim_interval: env_parse("WORKER_CLAIM_INTERVAL_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_interval),
            claim_min_idle: env_parse("WORKER_CLAIM_MIN_IDLE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_min_idle),
            lock_ttl: env_parse("WORKER_LOCK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_ttl),
            chunk_extension: env_string("CHUNK_EXTENSION").unwrap_or(defaults.chunk_extension),
            merged_file_name: env_string("MERGED_FILE_NAME").unwrap_or(defaults.merged_file_name),
            output_dir_name: env_string("DASH_OUTPUT_DIR").unwrap_or(defaults.output_dir_name),
            consume_block: defaults.consume_block,
            consume_batch: defaults.consume_batch,
        }
    }

    /// Reject settings that would let a live attempt be claimed by another consumer.
    ///
    /// In-flight messages are refreshed once per claim interval, so the idle
    /// threshold must leave room for at least one refresh.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.claim_min_idle <= self.claim_interval * 2 {
            return Err(WorkerError::config(format!(
                "claim min idle ({}s) must exceed twice the claim interval ({}s)",
                self.claim_min_idle.as_secs(),
                self.claim_interval.as_secs()
            )));
        }
        Ok(())
    }
}
