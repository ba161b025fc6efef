//! In-process message source and completion sink, used by tests and dry runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use vconv_models::{CompletionEvent, VideoId, VideoTask};

use crate::completion::CompletionPublisher;
use crate::error::{QueueError, QueueResult};
use crate::queue::{Delivery, MessageSource};

/// Longest a `receive` on an empty queue waits before returning.
const EMPTY_POLL_MS: u64 = 20;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// FIFO message source that counts acknowledgements per message.
///
/// Delivered messages stay outstanding until acknowledged and become
/// claimable once idle, like entries in a Redis pending list.
#[derive(Debug, Default)]
pub struct MemoryTaskQueue {
    pending: Mutex<VecDeque<Delivery>>,
    outstanding: Mutex<HashMap<String, (Delivery, Instant)>>,
    acks: Mutex<HashMap<String, usize>>,
    delivered: Mutex<Vec<String>>,
    claimed: AtomicUsize,
    next_id: AtomicU64,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw payload and return its message ID.
    pub fn push(&self, payload: impl Into<Vec<u8>>) -> String {
        let id = format!("{}-0", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.pending).push_back(Delivery::new(id.clone(), payload));
        id
    }

    /// Queue a task serialized the way producers send it.
    pub fn push_task(&self, task: &VideoTask) -> QueueResult<String> {
        Ok(self.push(task.to_json()?))
    }

    /// Messages not yet handed out.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// IDs handed out by `receive`, in order.
    pub fn delivered(&self) -> Vec<String> {
        lock(&self.delivered).clone()
    }

    pub fn ack_count(&self, id: &str) -> usize {
        lock(&self.acks).get(id).copied().unwrap_or(0)
    }

    pub fn total_acks(&self) -> usize {
        lock(&self.acks).values().sum()
    }

    /// Deliveries handed out again by `claim_stale`.
    pub fn claimed(&self) -> usize {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Delivered messages that were never acknowledged.
    pub fn unacked(&self) -> Vec<String> {
        let acks = lock(&self.acks);
        self.delivered()
            .into_iter()
            .filter(|id| !acks.contains_key(id))
            .collect()
    }
}

#[async_trait]
impl MessageSource for MemoryTaskQueue {
    async fn receive(
        &self,
        _consumer: &str,
        block_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let batch: Vec<Delivery> = {
            let mut pending = lock(&self.pending);
            let take = count.min(pending.len());
            pending.drain(..take).collect()
        };

        if batch.is_empty() {
            tokio::time::sleep(Duration::from_millis(block_ms.min(EMPTY_POLL_MS))).await;
        } else {
            let now = Instant::now();
            let mut outstanding = lock(&self.outstanding);
            for delivery in &batch {
                outstanding.insert(delivery.id.clone(), (delivery.clone(), now));
            }
            lock(&self.delivered).extend(batch.iter().map(|d| d.id.clone()));
        }
        Ok(batch)
    }

    async fn ack(&self, delivery_id: &str) -> QueueResult<()> {
        lock(&self.outstanding).remove(delivery_id);
        *lock(&self.acks).entry(delivery_id.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn claim_stale(
        &self,
        _consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let min_idle = Duration::from_millis(min_idle_ms);
        let order = self.delivered();
        let mut outstanding = lock(&self.outstanding);
        let now = Instant::now();

        let mut claimed = Vec::new();
        for id in order {
            if claimed.len() == count {
                break;
            }
            if let Some((delivery, since)) = outstanding.get_mut(&id) {
                if now.duration_since(*since) >= min_idle {
                    *since = now;
                    claimed.push(delivery.clone());
                }
            }
        }

        self.claimed.fetch_add(claimed.len(), Ordering::SeqCst);
        Ok(claimed)
    }

    async fn keep_alive(&self, _consumer: &str, delivery_ids: &[String]) -> QueueResult<()> {
        let now = Instant::now();
        let mut outstanding = lock(&self.outstanding);
        for id in delivery_ids {
            if let Some((_, since)) = outstanding.get_mut(id) {
                *since = now;
            }
        }
        Ok(())
    }
}

/// Completion publisher that keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryCompletionSink {
    events: Mutex<Vec<CompletionEvent>>,
    failing: AtomicUsize,
}

impl MemoryCompletionSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.failing.store(count, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<CompletionEvent> {
        lock(&self.events).clone()
    }

    pub fn events_for(&self, video_id: VideoId) -> Vec<CompletionEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| e.video_id == video_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CompletionPublisher for MemoryCompletionSink {
    async fn publish_completion(&self, event: &CompletionEvent) -> QueueResult<()> {
        let failing = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::publish_failed("confirmation channel unavailable"));
        }
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_respects_count() {
        let queue = MemoryTaskQueue::new();
        let first = queue.push(b"a".to_vec());
        queue.push(b"b".to_vec());
        queue.push(b"c".to_vec());

        let batch = queue.receive("c1", 10, 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, first);
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test]
    async fn test_empty_receive_returns_nothing() {
        let queue = MemoryTaskQueue::new();
        assert!(queue.receive("c1", 5, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_counting() {
        let queue = MemoryTaskQueue::new();
        let id = queue.push_task(&VideoTask::new(VideoId(1), "/media/1")).unwrap();
        let other = queue.push(b"{}".to_vec());
        queue.receive("c1", 10, 10).await.unwrap();

        queue.ack(&id).await.unwrap();

        assert_eq!(queue.ack_count(&id), 1);
        assert_eq!(queue.unacked(), vec![other]);
    }

    #[tokio::test]
    async fn test_claim_returns_idle_unacked_deliveries() {
        let queue = MemoryTaskQueue::new();
        let stale = queue.push(b"a".to_vec());
        let acked = queue.push(b"b".to_vec());
        queue.receive("dead", 10, 10).await.unwrap();
        queue.ack(&acked).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let claimed = queue.claim_stale("live", 10, 10).await.unwrap();

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, stale);
        // Claiming resets the idle clock
        assert!(queue.claim_stale("live", 10, 10).await.unwrap().is_empty());
        assert_eq!(queue.claimed(), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_prevents_claim() {
        let queue = MemoryTaskQueue::new();
        let id = queue.push(b"a".to_vec());
        queue.receive("owner", 10, 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.keep_alive("owner", &[id]).await.unwrap();

        assert!(queue.claim_stale("other", 25, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_injection() {
        let sink = MemoryCompletionSink::new();
        sink.fail_next(1);
        let event = CompletionEvent::new(VideoId(7), "/media/7/mpeg-dash", "/media/7/mpeg-dash/output.mpd");

        assert!(sink.publish_completion(&event).await.unwrap_err().is_retryable());
        sink.publish_completion(&event).await.unwrap();

        assert_eq!(sink.events_for(VideoId(7)).len(), 1);
    }
}
