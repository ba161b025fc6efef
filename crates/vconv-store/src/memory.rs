//! In-process ledger and error log, used by tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use vconv_models::{ErrorRecord, ProcessedRecord, ProcessingStage, VideoId};

use crate::error::{StoreError, StoreResult};
use crate::error_log::ErrorReporter;
use crate::ledger::{IdempotencyLedger, MarkOutcome};

/// Ledger kept in a map.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<VideoId, ProcessedRecord>>,
    mark_calls: AtomicUsize,
    failing_marks: AtomicUsize,
    failing_lookups: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a success record.
    pub fn with_processed(self, video_id: VideoId) -> Self {
        self.lock()
            .insert(video_id, ProcessedRecord::success(video_id));
        self
    }

    /// Make the next `count` calls to `mark_processed` fail with a transient error.
    pub fn fail_next_marks(&self, count: usize) {
        self.failing_marks.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` lookups behave as if the store were unreachable.
    pub fn fail_next_lookups(&self, count: usize) {
        self.failing_lookups.store(count, Ordering::SeqCst);
    }

    pub fn record(&self, video_id: VideoId) -> Option<ProcessedRecord> {
        self.lock().get(&video_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `mark_processed` calls, failed ones included.
    pub fn mark_calls(&self) -> usize {
        self.mark_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<VideoId, ProcessedRecord>> {
        // A panicking test thread must not hide the ledger from the others.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl IdempotencyLedger for MemoryLedger {
    async fn is_processed(&self, video_id: VideoId) -> bool {
        let failing = self
            .failing_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return false;
        }
        self.lock()
            .get(&video_id)
            .is_some_and(ProcessedRecord::is_success)
    }

    async fn mark_processed(&self, video_id: VideoId) -> StoreResult<MarkOutcome> {
        self.mark_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_marks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut records = self.lock();
        if records.contains_key(&video_id) {
            return Ok(MarkOutcome::AlreadyProcessed);
        }
        records.insert(video_id, ProcessedRecord::success(video_id));
        Ok(MarkOutcome::Inserted)
    }
}

/// Error log kept in a vector.
#[derive(Debug, Default)]
pub struct MemoryErrorLog {
    records: Mutex<Vec<ErrorRecord>>,
}

impl MemoryErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        self.lock().clone()
    }

    pub fn records_for(&self, video_id: VideoId) -> Vec<ErrorRecord> {
        self.lock()
            .iter()
            .filter(|r| r.video_id == Some(video_id))
            .cloned()
            .collect()
    }

    pub fn count_stage(&self, stage: ProcessingStage) -> usize {
        self.lock().iter().filter(|r| r.stage == stage).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ErrorRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ErrorReporter for MemoryErrorLog {
    async fn record_error(&self, record: &ErrorRecord) {
        self.lock().push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_video_is_not_processed() {
        let ledger = MemoryLedger::new();
        assert!(!ledger.is_processed(VideoId(1)).await);
    }

    #[tokio::test]
    async fn test_mark_then_processed() {
        let ledger = MemoryLedger::new();

        assert_eq!(ledger.mark_processed(VideoId(7)).await.unwrap(), MarkOutcome::Inserted);
        assert!(ledger.is_processed(VideoId(7)).await);
        assert!(!ledger.is_processed(VideoId(8)).await);
    }

    #[tokio::test]
    async fn test_repeated_mark_is_not_an_error() {
        let ledger = MemoryLedger::new();

        ledger.mark_processed(VideoId(7)).await.unwrap();
        let second = ledger.mark_processed(VideoId(7)).await.unwrap();

        assert_eq!(second, MarkOutcome::AlreadyProcessed);
        assert!(ledger.is_processed(VideoId(7)).await);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.mark_calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_mark_failures() {
        let ledger = MemoryLedger::new();
        ledger.fail_next_marks(1);

        let err = ledger.mark_processed(VideoId(3)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!ledger.is_processed(VideoId(3)).await);

        assert!(ledger.mark_processed(VideoId(3)).await.unwrap().inserted());
    }

    #[tokio::test]
    async fn test_injected_lookup_failures() {
        let ledger = MemoryLedger::new().with_processed(VideoId(4));
        ledger.fail_next_lookups(1);

        assert!(!ledger.is_processed(VideoId(4)).await);
        assert!(ledger.is_processed(VideoId(4)).await);
    }

    #[tokio::test]
    async fn test_error_log_filters() {
        let log = MemoryErrorLog::new();
        log.record_error(&ErrorRecord::new(None, ProcessingStage::Parse, "bad json"))
            .await;
        log.record_error(&ErrorRecord::new(
            Some(VideoId(42)),
            ProcessingStage::Assembly,
            "no chunks",
        ))
        .await;

        assert_eq!(log.len(), 2);
        assert_eq!(log.records_for(VideoId(42)).len(), 1);
        assert_eq!(log.count_stage(ProcessingStage::Parse), 1);
        assert_eq!(log.records()[1].error, "failed to merge chunks");
    }
}
