//! Per-video task locks.
//!
//! A lock keeps two deliveries of the same video from working in the same
//! directory at once. Locks expire so a crashed worker cannot hold one forever.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;
use vconv_models::VideoId;

use crate::error::QueueResult;

/// Default lock TTL (2 hours).
pub const DEFAULT_LOCK_TTL_SECS: u64 = 2 * 60 * 60;

/// Proof of ownership for an acquired lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub video_id: VideoId,
    token: String,
}

impl LockGuard {
    fn new(video_id: VideoId) -> Self {
        Self {
            video_id,
            token: Uuid::new_v4().to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Exclusive claim on a video for the duration of one attempt.
#[async_trait]
pub trait TaskLocker: Send + Sync {
    /// Returns `None` when another attempt holds the lock.
    async fn try_acquire(&self, video_id: VideoId) -> QueueResult<Option<LockGuard>>;

    /// Release a lock; a lock that already expired or changed owner is left alone.
    async fn release(&self, guard: LockGuard) -> QueueResult<()>;
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Locks stored as Redis keys with a TTL.
pub struct RedisTaskLocker {
    client: redis::Client,
    ttl: Duration,
}

impl RedisTaskLocker {
    pub fn new(redis_url: &str, ttl: Duration) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, ttl })
    }

    fn lock_key(video_id: VideoId) -> String {
        format!("vconv:lock:{}", video_id)
    }
}

#[async_trait]
impl TaskLocker for RedisTaskLocker {
    async fn try_acquire(&self, video_id: VideoId) -> QueueResult<Option<LockGuard>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let guard = LockGuard::new(video_id);

        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::lock_key(video_id))
            .arg(guard.token())
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        if reply.is_some() {
            debug!(video_id = %video_id, "Acquired task lock");
            Ok(Some(guard))
        } else {
            debug!(video_id = %video_id, "Task lock held elsewhere");
            Ok(None)
        }
    }

    async fn release(&self, guard: LockGuard) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::lock_key(guard.video_id))
            .arg(guard.token())
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            warn!(video_id = %guard.video_id, "Task lock expired before release");
        } else {
            debug!(video_id = %guard.video_id, "Released task lock");
        }
        Ok(())
    }
}

/// Locks held in process memory; only excludes attempts within one worker.
#[derive(Debug, Default)]
pub struct LocalTaskLocker {
    held: Mutex<HashSet<VideoId>>,
}

impl LocalTaskLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, video_id: VideoId) -> bool {
        self.lock().contains(&video_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<VideoId>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TaskLocker for LocalTaskLocker {
    async fn try_acquire(&self, video_id: VideoId) -> QueueResult<Option<LockGuard>> {
        if self.lock().insert(video_id) {
            Ok(Some(LockGuard::new(video_id)))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, guard: LockGuard) -> QueueResult<()> {
        self.lock().remove(&guard.video_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_lock_is_exclusive() {
        let locker = LocalTaskLocker::new();

        let guard = locker.try_acquire(VideoId(7)).await.unwrap().unwrap();
        assert!(locker.try_acquire(VideoId(7)).await.unwrap().is_none());
        assert!(locker.try_acquire(VideoId(8)).await.unwrap().is_some());

        locker.release(guard).await.unwrap();
        assert!(!locker.is_held(VideoId(7)));
        assert!(locker.try_acquire(VideoId(7)).await.unwrap().is_some());
    }

    #[test]
    fn test_guard_tokens_are_unique() {
        let a = LockGuard::new(VideoId(1));
        let b = LockGuard::new(VideoId(1));
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn test_lock_key() {
        assert_eq!(RedisTaskLocker::lock_key(VideoId(42)), "vconv:lock:42");
    }
}
