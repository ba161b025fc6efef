//! Completion events on the confirmation stream.

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::info;
use vconv_models::CompletionEvent;

use crate::error::QueueResult;

/// Stream entry field holding the event JSON.
pub const EVENT_FIELD: &str = "event";

/// Announces finished conversions to downstream consumers.
#[async_trait]
pub trait CompletionPublisher: Send + Sync {
    async fn publish_completion(&self, event: &CompletionEvent) -> QueueResult<()>;
}

/// Appends events to a Redis stream.
pub struct RedisCompletionPublisher {
    client: redis::Client,
    stream_name: String,
}

impl RedisCompletionPublisher {
    pub fn new(redis_url: &str, stream_name: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            stream_name: stream_name.into(),
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }
}

#[async_trait]
impl CompletionPublisher for RedisCompletionPublisher {
    async fn publish_completion(&self, event: &CompletionEvent) -> QueueResult<()> {
        let payload = serde_json::to_string(event)?;
        let video_id = event.video_id.to_string();
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let message_id: String = conn
            .xadd(
                &self.stream_name,
                "*",
                &[("video_id", video_id.as_str()), (EVENT_FIELD, payload.as_str())],
            )
            .await?;

        info!(
            video_id = %event.video_id,
            event_id = %event.event_id,
            message_id = %message_id,
            "Published completion event"
        );
        Ok(())
    }
}
