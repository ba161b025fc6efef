//! Structured failure records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::VideoId;

/// Pipeline stage a failure was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    /// Inbound message could not be decoded
    Parse,
    /// Chunk reassembly
    Assembly,
    /// External transcoder invocation
    Transcode,
    /// Removing the merged intermediate
    Cleanup,
    /// Ledger query or update
    Ledger,
    /// Completion notification
    Publish,
}

impl ProcessingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::Parse => "parse",
            ProcessingStage::Assembly => "assembly",
            ProcessingStage::Transcode => "transcode",
            ProcessingStage::Cleanup => "cleanup",
            ProcessingStage::Ledger => "ledger",
            ProcessingStage::Publish => "publish",
        }
    }

    /// Human readable summary stored in the `error` field.
    pub fn description(&self) -> &'static str {
        match self {
            ProcessingStage::Parse => "failed to unmarshal task",
            ProcessingStage::Assembly => "failed to merge chunks",
            ProcessingStage::Transcode => "failed to convert video to mpeg-dash",
            ProcessingStage::Cleanup => "failed to remove merged file",
            ProcessingStage::Ledger => "failed to mark video as processed",
            ProcessingStage::Publish => "failed to publish completion event",
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One append-only entry in the error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorRecord {
    /// Video the failure belongs to; `None` when the message never parsed
    pub video_id: Option<VideoId>,
    pub stage: ProcessingStage,
    /// Stage description
    pub error: String,
    /// Underlying error text, including captured command output
    pub details: String,
    pub time: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(video_id: Option<VideoId>, stage: ProcessingStage, details: impl Into<String>) -> Self {
        Self {
            video_id,
            stage,
            error: stage.description().to_string(),
            details: details.into(),
            time: Utc::now(),
        }
    }

    /// Override the stage description.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    /// JSON blob persisted in the error store.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}
