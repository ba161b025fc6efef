//! Structured task logging utilities.

use std::path::Path;

use tracing::{error, info, warn, Span};
use vconv_models::VideoId;

/// Per-attempt logger carrying the task's identity on every line.
#[derive(Debug, Clone)]
pub struct TaskLogger {
    video_id: VideoId,
    path: String,
}

impl TaskLogger {
    pub fn new(video_id: VideoId, path: &Path) -> Self {
        Self {
            video_id,
            path: path.display().to_string(),
        }
    }

    /// Log the start of an attempt.
    pub fn log_start(&self, message: &str) {
        info!(video_id = %self.video_id, path = %self.path, "Task started: {}", message);
    }

    /// Log a progress update during the attempt.
    pub fn log_progress(&self, message: &str) {
        info!(video_id = %self.video_id, path = %self.path, "Task progress: {}", message);
    }

    /// Log a task that was skipped without doing work.
    pub fn log_skip(&self, reason: &str) {
        info!(video_id = %self.video_id, path = %self.path, "Task skipped: {}", reason);
    }

    pub fn log_warning(&self, message: &str) {
        warn!(video_id = %self.video_id, path = %self.path, "Task warning: {}", message);
    }

    pub fn log_error(&self, stage: &str, message: &str) {
        error!(
            video_id = %self.video_id,
            path = %self.path,
            stage = stage,
            "Task error: {}", message
        );
    }

    /// Log the completion of an attempt.
    pub fn log_completion(&self, message: &str) {
        info!(video_id = %self.video_id, path = %self.path, "Task completed: {}", message);
    }

    pub fn video_id(&self) -> VideoId {
        self.video_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create a tracing span for this attempt.
    pub fn create_span(&self) -> Span {
        tracing::info_span!("task", video_id = %self.video_id, path = %self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_logger_creation() {
        let logger = TaskLogger::new(VideoId(42), Path::new("/media/42"));

        assert_eq!(logger.video_id(), VideoId(42));
        assert_eq!(logger.path(), "/media/42");
    }

    #[test]
    fn test_logging_without_subscriber() {
        let logger = TaskLogger::new(VideoId(1), Path::new("/media/1"));
        let _span = logger.create_span().entered();
        logger.log_start("merging");
        logger.log_error("assembly", "no chunks");
    }
}
