//! Idempotency ledger.
//!
//! A video counts as processed once a `success` row exists for it. The
//! conditional insert in [`IdempotencyLedger::mark_processed`] is the point
//! where concurrent attempts for the same video are serialized.

use std::time::Instant;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, warn};
use vconv_models::{ProcessedStatus, VideoId};

use crate::error::StoreResult;
use crate::metrics::record_query;

/// Result of a conditional insert into the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// This call created the record.
    Inserted,
    /// A record already existed; nothing changed.
    AlreadyProcessed,
}

impl MarkOutcome {
    pub fn inserted(&self) -> bool {
        matches!(self, MarkOutcome::Inserted)
    }
}

/// Per-video completion state.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// True only when a success record exists.
    ///
    /// Lookup failures are logged and reported as `false` so the task is
    /// reprocessed rather than dropped.
    async fn is_processed(&self, video_id: VideoId) -> bool;

    /// Insert a success record unless one already exists.
    async fn mark_processed(&self, video_id: VideoId) -> StoreResult<MarkOutcome>;
}

/// PostgreSQL-backed ledger over `processed_videos`.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyLedger for PgLedger {
    async fn is_processed(&self, video_id: VideoId) -> bool {
        let start = Instant::now();
        let result = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM processed_videos WHERE video_id = $1 AND status = $2)",
        )
        .bind(video_id.as_i64())
        .bind(ProcessedStatus::Success.as_str())
        .fetch_one(&self.pool)
        .await;
        record_query("is_processed", result.is_ok(), start.elapsed().as_secs_f64());

        match result {
            Ok(processed) => processed,
            Err(e) => {
                warn!(video_id = %video_id, error = %e, "Ledger lookup failed, treating as unprocessed");
                false
            }
        }
    }

    async fn mark_processed(&self, video_id: VideoId) -> StoreResult<MarkOutcome> {
        let start = Instant::now();
        let result = sqlx::query(
            "INSERT INTO processed_videos (video_id, status, processed_at) \
             VALUES ($1, $2, NOW()) \
             ON CONFLICT (video_id) DO NOTHING",
        )
        .bind(video_id.as_i64())
        .bind(ProcessedStatus::Success.as_str())
        .execute(&self.pool)
        .await;
        record_query("mark_processed", result.is_ok(), start.elapsed().as_secs_f64());

        let outcome = if result?.rows_affected() > 0 {
            MarkOutcome::Inserted
        } else {
            MarkOutcome::AlreadyProcessed
        };
        debug!(video_id = %video_id, ?outcome, "Ledger updated");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use std::time::Duration;

    fn unreachable_ledger() -> PgLedger {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(500))
            .connect_lazy("postgres://postgres@127.0.0.1:1/converter")
            .unwrap();
        PgLedger::new(pool)
    }

    #[tokio::test]
    async fn test_failed_lookup_reports_unprocessed() {
        let ledger = unreachable_ledger();

        assert!(!ledger.is_processed(VideoId(7)).await);
    }

    #[tokio::test]
    async fn test_failed_mark_is_an_error() {
        let ledger = unreachable_ledger();

        let err = ledger.mark_processed(VideoId(7)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_mark_outcome_inserted() {
        assert!(MarkOutcome::Inserted.inserted());
        assert!(!MarkOutcome::AlreadyProcessed.inserted());
    }
}
