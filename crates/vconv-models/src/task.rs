//! Conversion task definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::VideoId;

pub type TaskResult<T> = Result<T, TaskError>;

/// Reasons an inbound message cannot become a task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Malformed task message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Task for video {0} has an empty chunk path")]
    EmptyPath(VideoId),
}

/// One conversion job: a video and the directory holding its chunks.
///
/// Wire format: `{"video_id": 42, "path": "/media/uploads/42"}`. Unknown
/// fields are ignored; `video_path` is accepted as an alias of `path`.
/// A message carrying both `path` and `video_path` is ambiguous and is
/// rejected as malformed (duplicate field).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VideoTask {
    /// Video being converted
    pub video_id: VideoId,
    /// Directory containing the uploaded chunks
    #[serde(alias = "video_path")]
    pub path: PathBuf,
}

impl VideoTask {
    pub fn new(video_id: impl Into<VideoId>, path: impl Into<PathBuf>) -> Self {
        Self {
            video_id: video_id.into(),
            path: path.into(),
        }
    }

    /// Parse a raw queue payload.
    pub fn from_slice(payload: &[u8]) -> TaskResult<Self> {
        let task: VideoTask = serde_json::from_slice(payload)?;
        if task.path.as_os_str().is_empty() {
            return Err(TaskError::EmptyPath(task.video_id));
        }
        Ok(task)
    }

    /// Serialize for enqueueing.
    pub fn to_json(&self) -> TaskResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Location of the merged intermediate file.
    pub fn merged_file(&self, file_name: impl AsRef<Path>) -> PathBuf {
        self.path.join(file_name)
    }

    /// Directory the streaming package is written to.
    pub fn output_dir(&self, dir_name: impl AsRef<Path>) -> PathBuf {
        self.path.join(dir_name)
    }
}
