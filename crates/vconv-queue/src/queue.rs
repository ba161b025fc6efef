//! Task intake using Redis Streams.

use async_trait::async_trait;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};
use vconv_models::VideoTask;

use crate::error::{QueueError, QueueResult};

/// Stream entry field holding the task JSON.
pub const TASK_FIELD: &str = "task";

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for conversion tasks
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Stream name for completion events
    pub confirmation_stream: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "vconv:conversions".to_string(),
            consumer_group: "vconv:converters".to_string(),
            confirmation_stream: "vconv:confirmations".to_string(),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            stream_name: std::env::var("CONVERSION_STREAM")
                .unwrap_or_else(|_| "vconv:conversions".to_string()),
            consumer_group: std::env::var("CONVERSION_GROUP")
                .unwrap_or_else(|_| "vconv:converters".to_string()),
            confirmation_stream: std::env::var("CONFIRMATION_STREAM")
                .unwrap_or_else(|_| "vconv:confirmations".to_string()),
        }
    }
}

/// One message handed to the worker.
///
/// The payload is passed through unparsed; decoding it is the processor's job
/// so malformed messages are reported like any other failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Transport message ID, used for the acknowledgement
    pub id: String,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }

    fn from_stream_entry(entry: &StreamId) -> Self {
        let payload = match entry.map.get(TASK_FIELD) {
            Some(redis::Value::BulkString(bytes)) => bytes.clone(),
            Some(redis::Value::SimpleString(s)) => s.clone().into_bytes(),
            other => {
                warn!(message_id = %entry.id, field = ?other, "Stream entry has no task field");
                Vec::new()
            }
        };
        Self::new(entry.id.clone(), payload)
    }
}

/// Source of task messages with explicit acknowledgement.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Read up to `count` new messages, waiting at most `block_ms`.
    async fn receive(&self, consumer: &str, block_ms: u64, count: usize)
        -> QueueResult<Vec<Delivery>>;

    /// Acknowledge a message so it is never redelivered.
    async fn ack(&self, delivery_id: &str) -> QueueResult<()>;

    /// Take over messages another consumer left unacknowledged for `min_idle_ms`.
    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Reset the idle time of messages `consumer` is still working on, so
    /// `claim_stale` elsewhere does not take them over.
    async fn keep_alive(&self, consumer: &str, delivery_ids: &[String]) -> QueueResult<()>;
}

/// Task queue client.
pub struct TaskQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl TaskQueue {
    /// Create a new task queue.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Initialize the queue (create consumer group if not exists).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!(group = %self.config.consumer_group, "Created consumer group"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(group = %self.config.consumer_group, "Consumer group already exists");
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Check connectivity.
    pub async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply != "PONG" {
            return Err(QueueError::connection_failed(format!(
                "unexpected PING reply: {reply}"
            )));
        }
        Ok(())
    }

    /// Enqueue a conversion task. Returns the stream message ID.
    pub async fn enqueue(&self, task: &VideoTask) -> QueueResult<String> {
        let payload = task.to_json()?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let message_id: String = conn
            .xadd(&self.config.stream_name, "*", &[(TASK_FIELD, payload.as_str())])
            .await?;

        info!(
            video_id = %task.video_id,
            message_id = %message_id,
            "Enqueued conversion task"
        );
        Ok(message_id)
    }

    /// Get queue length.
    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        Ok(len)
    }
}

#[async_trait]
impl MessageSource for TaskQueue {
    async fn receive(
        &self,
        consumer: &str,
        block_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let result: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await?;

        let deliveries: Vec<Delivery> = result
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(|entry| Delivery::from_stream_entry(&entry))
            .collect();

        if !deliveries.is_empty() {
            debug!(count = deliveries.len(), "Received messages from stream");
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery_id: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(delivery_id)
            .query_async::<()>(&mut conn)
            .await?;

        // Delete the message from the stream
        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(delivery_id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!(message_id = %delivery_id, "Acknowledged message");
        Ok(())
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        for entry in &pending.ids {
            debug!(
                message_id = %entry.id,
                previous_consumer = %entry.consumer,
                times_delivered = entry.times_delivered,
                "Claiming stale message"
            );
        }

        let mut claim = redis::cmd("XCLAIM");
        claim
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            claim.arg(&entry.id);
        }
        let claimed: StreamClaimReply = claim.query_async(&mut conn).await?;

        let deliveries: Vec<Delivery> = claimed.ids.iter().map(Delivery::from_stream_entry).collect();
        if !deliveries.is_empty() {
            info!(count = deliveries.len(), "Claimed stale messages");
        }
        Ok(deliveries)
    }

    async fn keep_alive(&self, consumer: &str, delivery_ids: &[String]) -> QueueResult<()> {
        if delivery_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // Re-claiming with min-idle 0 resets the idle clock; JUSTID leaves the delivery count alone.
        let mut claim = redis::cmd("XCLAIM");
        claim
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(0);
        for id in delivery_ids {
            claim.arg(id);
        }
        let refreshed: Vec<String> = claim.arg("JUSTID").query_async(&mut conn).await?;

        debug!(
            requested = delivery_ids.len(),
            refreshed = refreshed.len(),
            "Refreshed in-flight messages"
        );
        Ok(())
    }
}
