#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

use vconv_media::fs_utils::reset_dir;
use vconv_media::{MediaError, MediaResult, Transcoder, DEFAULT_MANIFEST_NAME};
use vconv_queue::{LocalTaskLocker, MemoryCompletionSink};
use vconv_store::{MemoryErrorLog, MemoryLedger};
use vconv_worker::{ProcessorDeps, RetryConfig, TaskProcessor, WorkerConfig};

/// What the fake transcoder does after reading its input.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Delay(Duration),
    Fail { output: String, exit_code: i32 },
    WaitForCancel,
}

/// Transcoder double that records its inputs and writes a stub manifest.
#[derive(Debug)]
pub struct FakeTranscoder {
    behavior: Behavior,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    inputs: Mutex<Vec<Vec<u8>>>,
}

impl FakeTranscoder {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Bytes of each merged file handed to the transcoder.
    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn convert(
        &self,
        input: &Path,
        output_dir: &Path,
        mut cancel: watch::Receiver<bool>,
    ) -> MediaResult<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = tokio::fs::read(input).await?;
        self.inputs.lock().unwrap().push(bytes);

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let result = match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(())
            }
            Behavior::Fail { output, exit_code } => Err(MediaError::ffmpeg_failed(
                format!("FFmpeg exited with status {}", exit_code),
                Some(output.clone()),
                Some(*exit_code),
            )),
            Behavior::WaitForCancel => {
                let _ = cancel.wait_for(|cancelled| *cancelled).await;
                Err(MediaError::Cancelled)
            }
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result?;

        reset_dir(output_dir).await?;
        let manifest = output_dir.join(DEFAULT_MANIFEST_NAME);
        tokio::fs::write(&manifest, b"<MPD/>").await?;
        Ok(manifest)
    }
}

/// Processor collaborators, all in memory.
pub struct Harness {
    pub config: WorkerConfig,
    pub transcoder: Arc<FakeTranscoder>,
    pub ledger: Arc<MemoryLedger>,
    pub errors: Arc<MemoryErrorLog>,
    pub sink: Arc<MemoryCompletionSink>,
    pub locker: Arc<LocalTaskLocker>,
}

pub fn test_config() -> WorkerConfig {
    WorkerConfig {
        task_timeout: Duration::from_secs(10),
        shutdown_timeout: Duration::from_secs(10),
        claim_interval: Duration::from_secs(3600),
        consume_block: Duration::from_millis(10),
        ..WorkerConfig::default()
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig::new("test")
        .with_max_retries(3)
        .with_base_delay(Duration::from_millis(1))
}

impl Harness {
    pub fn new(behavior: Behavior) -> Self {
        Self::with_config(behavior, test_config())
    }

    pub fn with_config(behavior: Behavior, config: WorkerConfig) -> Self {
        Self {
            config,
            transcoder: Arc::new(FakeTranscoder::new(behavior)),
            ledger: Arc::new(MemoryLedger::new()),
            errors: Arc::new(MemoryErrorLog::new()),
            sink: Arc::new(MemoryCompletionSink::new()),
            locker: Arc::new(LocalTaskLocker::new()),
        }
    }

    pub fn deps(&self) -> ProcessorDeps {
        ProcessorDeps {
            transcoder: self.transcoder.clone(),
            ledger: self.ledger.clone(),
            errors: self.errors.clone(),
            publisher: self.sink.clone(),
            locker: self.locker.clone(),
        }
    }

    pub fn processor(&self) -> TaskProcessor {
        TaskProcessor::new(self.config.clone(), self.deps()).with_retry(fast_retry())
    }
}

/// Create `<root>/<video_id>` holding the given chunk files.
pub fn task_dir(root: &Path, video_id: i64, chunks: &[(&str, &[u8])]) -> PathBuf {
    let dir = root.join(video_id.to_string());
    std::fs::create_dir_all(&dir).unwrap();
    for (name, content) in chunks {
        std::fs::write(dir.join(name), content).unwrap();
    }
    dir
}

/// Task message as the upload service sends it.
pub fn task_json(video_id: i64, path: &Path) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "video_id": video_id,
        "path": path.display().to_string(),
    }))
    .unwrap()
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
