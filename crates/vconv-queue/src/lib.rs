//! Message plumbing for the conversion worker.
//!
//! This crate provides:
//! - Task intake from a Redis Streams consumer group
//! - Completion events on a separate confirmation stream
//! - Per-video task locks
//! - In-memory stand-ins for all three

pub mod completion;
pub mod error;
pub mod lock;
pub mod memory;
pub mod queue;

pub use completion::{CompletionPublisher, RedisCompletionPublisher, EVENT_FIELD};
pub use error::{QueueError, QueueResult};
pub use lock::{LocalTaskLocker, LockGuard, RedisTaskLocker, TaskLocker, DEFAULT_LOCK_TTL_SECS};
pub use memory::{MemoryCompletionSink, MemoryTaskQueue};
pub use queue::{Delivery, MessageSource, QueueConfig, TaskQueue, TASK_FIELD};
