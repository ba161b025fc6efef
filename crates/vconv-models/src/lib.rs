//! Shared data models for the vconv conversion worker.
//!
//! This crate provides Serde-serializable types for:
//! - Conversion tasks as they arrive on the queue
//! - Ledger records for completed videos
//! - Structured error records
//! - Completion events for downstream consumers

pub mod completion;
pub mod error_record;
pub mod task;
pub mod video;

// Re-export common types
pub use completion::CompletionEvent;
pub use error_record::{ErrorRecord, ProcessingStage};
pub use task::{TaskError, TaskResult, VideoTask};
pub use video::{ProcessedRecord, ProcessedStatus, VideoId};
