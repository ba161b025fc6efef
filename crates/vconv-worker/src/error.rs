//! Worker error types.

use thiserror::Error;
use vconv_media::MediaError;
use vconv_models::{ProcessingStage, TaskError};
use vconv_queue::QueueError;
use vconv_store::StoreError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Invalid task message: {0}")]
    Parse(#[from] TaskError),

    #[error("Chunk assembly failed: {0}")]
    Assembly(#[source] MediaError),

    #[error("Transcoding failed: {0}")]
    Transcode(#[source] MediaError),

    #[error("Cleanup failed: {0}")]
    Cleanup(#[source] MediaError),

    #[error("Ledger update failed: {0}")]
    Ledger(#[source] StoreError),

    #[error("Completion publish failed: {0}")]
    Publish(#[source] QueueError),

    #[error("Task timed out after {secs}s during {stage}")]
    Timeout { stage: ProcessingStage, secs: u64 },

    #[error("Task aborted by shutdown during {0}")]
    Aborted(ProcessingStage),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl WorkerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Pipeline stage the failure is attributed to.
    pub fn stage(&self) -> ProcessingStage {
        match self {
            WorkerError::Parse(_) => ProcessingStage::Parse,
            WorkerError::Assembly(_) => ProcessingStage::Assembly,
            WorkerError::Transcode(_) => ProcessingStage::Transcode,
            WorkerError::Cleanup(_) => ProcessingStage::Cleanup,
            WorkerError::Ledger(_) | WorkerError::Store(_) => ProcessingStage::Ledger,
            WorkerError::Publish(_) | WorkerError::Queue(_) => ProcessingStage::Publish,
            WorkerError::Timeout { stage, .. } | WorkerError::Aborted(stage) => *stage,
            WorkerError::ConfigError(_) => ProcessingStage::Parse,
        }
    }

    /// Underlying error text for the error log, including captured command output.
    pub fn details(&self) -> String {
        match self {
            WorkerError::Assembly(e) | WorkerError::Transcode(e) | WorkerError::Cleanup(e) => {
                e.details()
            }
            WorkerError::Parse(e) => e.to_string(),
            WorkerError::Ledger(e) | WorkerError::Store(e) => e.to_string(),
            WorkerError::Publish(e) | WorkerError::Queue(e) => e.to_string(),
            other => other.to_string(),
        }
    }

    /// True when the attempt stopped because it was asked to, not because it broke.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, WorkerError::Timeout { .. } | WorkerError::Aborted(_))
    }

    /// The media error behind an assembly or transcode failure.
    pub fn media_error(&self) -> Option<&MediaError> {
        match self {
            WorkerError::Assembly(e) | WorkerError::Transcode(e) | WorkerError::Cleanup(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_mapping() {
        let parse: WorkerError = vconv_models::VideoTask::from_slice(b"nope").unwrap_err().into();
        assert_eq!(parse.stage(), ProcessingStage::Parse);

        let assembly = WorkerError::Assembly(MediaError::NoChunks("/media/42".into()));
        assert_eq!(assembly.stage(), ProcessingStage::Assembly);

        let timeout = WorkerError::Timeout {
            stage: ProcessingStage::Transcode,
            secs: 3600,
        };
        assert_eq!(timeout.stage(), ProcessingStage::Transcode);
        assert!(timeout.is_interrupted());
    }

    #[test]
    fn test_details_include_command_output() {
        let err = WorkerError::Transcode(MediaError::ffmpeg_failed(
            "FFmpeg exited with status 1",
            Some("Invalid data found when processing input".to_string()),
            Some(1),
        ));

        let details = err.details();
        assert!(details.contains("exited with status 1"));
        assert!(details.contains("Invalid data found"));
    }
}
