//! Video identifiers and ledger records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an uploaded video, assigned by the upload service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct VideoId(pub i64);

impl VideoId {
    /// Create from a raw integer.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner integer.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for VideoId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Status stored alongside a ledger row.
///
/// Only `Success` rows exist today; the column is kept as text so the ledger
/// table stays readable by the upload service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedStatus {
    #[default]
    Success,
}

impl ProcessedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessedStatus::Success => "success",
        }
    }
}

impl fmt::Display for ProcessedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the idempotency ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProcessedRecord {
    pub video_id: VideoId,
    #[serde(default)]
    pub status: ProcessedStatus,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedRecord {
    /// Success record stamped with the current time.
    pub fn success(video_id: VideoId) -> Self {
        Self {
            video_id,
            status: ProcessedStatus::Success,
            processed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ProcessedStatus::Success
    }
}
