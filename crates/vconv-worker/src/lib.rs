//! Chunked-upload video conversion worker.
//!
//! This crate provides:
//! - The task processor: parse, dedupe, merge, transcode, record, announce
//! - A bounded executor with acknowledgement, stale-message reclaim and graceful shutdown
//! - Retry helpers and structured task logging

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod retry;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::TaskExecutor;
pub use logging::TaskLogger;
pub use processor::{ProcessorDeps, TaskOutcome, TaskProcessor};
pub use retry::{retry_async, retry_async_when, FailureTracker, RetryConfig, RetryResult};
