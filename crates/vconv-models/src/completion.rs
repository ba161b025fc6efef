//! Completion events emitted after a video is converted.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::VideoId;

/// Event published on the confirmation channel once a video is recorded as
/// processed. Consumers key on `video_id`; `event_id` is unique per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CompletionEvent {
    pub event_id: String,
    pub video_id: VideoId,
    /// Directory holding the streaming package
    pub output_dir: PathBuf,
    /// Manifest inside `output_dir`
    pub manifest_path: PathBuf,
    pub processed_at: DateTime<Utc>,
}

impl CompletionEvent {
    pub fn new(video_id: VideoId, output_dir: impl Into<PathBuf>, manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            video_id,
            output_dir: output_dir.into(),
            manifest_path: manifest_path.into(),
            processed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_carries_video_id() {
        let event = CompletionEvent::new(VideoId(7), "/media/7/mpeg-dash", "/media/7/mpeg-dash/output.mpd");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["video_id"], 7);
        assert_eq!(json["manifest_path"], "/media/7/mpeg-dash/output.mpd");
        assert!(!event.event_id.is_empty());
    }
}
