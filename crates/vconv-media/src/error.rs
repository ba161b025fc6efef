//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while assembling chunks or packaging video.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found: {0}")]
    FfmpegNotFound(String),

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        output: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("No chunk files found in {0}")]
    NoChunks(PathBuf),

    #[error("Failed to read chunk directory {path}: {source}")]
    ChunkDirUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Chunk file name has no sequence number: {0}")]
    InvalidChunkName(PathBuf),

    #[error("Duplicate chunk sequence {sequence}: {first} and {second}")]
    DuplicateChunk {
        sequence: u64,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Failed to open chunk {path}: {source}")]
    ChunkOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write chunk {path} to output: {source}")]
    ChunkCopy {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write merged file {path}: {source}")]
    MergeOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Manifest not produced: {0}")]
    ManifestMissing(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    /// Create an FFmpeg failure error.
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        output: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            output,
            exit_code,
        }
    }

    /// Output captured from the external command, if any.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            MediaError::FfmpegFailed { output, .. } => output.as_deref(),
            _ => None,
        }
    }

    /// Full diagnostic text for error records.
    pub fn details(&self) -> String {
        match self.captured_output() {
            Some(output) if !output.is_empty() => format!("{}, output: {}", self, output),
            _ => self.to_string(),
        }
    }

    /// True for failures raised while reassembling chunks.
    pub fn is_assembly(&self) -> bool {
        matches!(
            self,
            MediaError::NoChunks(_)
                | MediaError::ChunkDirUnreadable { .. }
                | MediaError::InvalidChunkName(_)
                | MediaError::DuplicateChunk { .. }
                | MediaError::ChunkOpen { .. }
                | MediaError::ChunkCopy { .. }
                | MediaError::MergeOutput { .. }
        )
    }
}
