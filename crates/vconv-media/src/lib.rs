//! Chunk reassembly and FFmpeg DASH packaging.
//!
//! This crate provides:
//! - Ordered merging of numbered upload chunks
//! - Type-safe FFmpeg command building
//! - FFmpeg execution with output capture, cancellation and timeout
//! - The [`Transcoder`] seam used by the worker, with an FFmpeg DASH implementation

pub mod chunks;
pub mod command;
pub mod dash;
pub mod error;
pub mod fs_utils;
pub mod progress;

pub use chunks::{chunk_sequence, Chunk, ChunkAssembler, DEFAULT_CHUNK_EXTENSION};
pub use command::{check_ffmpeg, FfmpegCommand, FfmpegRunner};
pub use dash::{DashConfig, FfmpegDashTranscoder, Transcoder, DEFAULT_MANIFEST_NAME};
pub use error::{MediaError, MediaResult};
pub use progress::FfmpegProgress;
