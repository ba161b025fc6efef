//! Append-only store of structured failure records.

use std::time::Instant;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::error;
use vconv_models::{ErrorRecord, VideoId};

use crate::error::StoreResult;
use crate::metrics::record_query;

/// Sink for failure records.
///
/// Reporting never fails the caller: serialization and storage problems
/// are logged and the record is dropped.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn record_error(&self, record: &ErrorRecord);
}

/// PostgreSQL-backed error log over `process_errors_log`.
#[derive(Debug, Clone)]
pub struct PgErrorLog {
    pool: PgPool,
}

impl PgErrorLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Records stored for one video, oldest first.
    pub async fn records_for(&self, video_id: VideoId) -> StoreResult<Vec<ErrorRecord>> {
        let rows = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT error_details FROM process_errors_log \
             WHERE (error_details ->> 'video_id')::BIGINT = $1 \
             ORDER BY id",
        )
        .bind(video_id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(Into::into))
            .collect()
    }
}

#[async_trait]
impl ErrorReporter for PgErrorLog {
    async fn record_error(&self, record: &ErrorRecord) {
        let details = match record.to_json() {
            Ok(details) => details,
            Err(e) => {
                error!(video_id = ?record.video_id, error = %e, "Failed to serialize error record");
                return;
            }
        };

        let start = Instant::now();
        let result = sqlx::query(
            "INSERT INTO process_errors_log (error_details, created_at) VALUES ($1, NOW())",
        )
        .bind(details)
        .execute(&self.pool)
        .await;
        record_query("record_error", result.is_ok(), start.elapsed().as_secs_f64());

        if let Err(e) = result {
            error!(
                video_id = ?record.video_id,
                stage = record.stage.as_str(),
                error = %e,
                "Failed to store error record"
            );
        }
    }
}
