//! Task processor: one delivery in, one outcome out.
//!
//! Every failure is turned into an error record and a log line here; nothing
//! propagates to the executor, which acknowledges the message regardless.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{warn, Instrument};
use vconv_media::fs_utils::remove_file_if_exists;
use vconv_media::{ChunkAssembler, MediaError, Transcoder};
use vconv_models::{CompletionEvent, ErrorRecord, ProcessingStage, VideoId, VideoTask};
use vconv_queue::{CompletionPublisher, QueueError, TaskLocker};
use vconv_store::{ErrorReporter, IdempotencyLedger, MarkOutcome, StoreError};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::TaskLogger;
use crate::metrics;
use crate::retry::{retry_async_when, RetryConfig};

/// How long an interrupted attempt gets to wind down before it is dropped.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Result of handling one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The message could not be parsed.
    Rejected,
    /// A success record already existed; no work was done.
    AlreadyProcessed,
    /// Another attempt holds the task lock.
    InProgress,
    /// A stage failed and an error record was written.
    Failed(ProcessingStage),
    /// Converted and recorded in the ledger.
    Completed {
        /// False when the completion event could not be delivered
        published: bool,
    },
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Rejected => "rejected",
            TaskOutcome::AlreadyProcessed => "already_processed",
            TaskOutcome::InProgress => "in_progress",
            TaskOutcome::Failed(_) => "failed",
            TaskOutcome::Completed { .. } => "completed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }
}

/// Collaborators the processor drives.
#[derive(Clone)]
pub struct ProcessorDeps {
    pub transcoder: Arc<dyn Transcoder>,
    pub ledger: Arc<dyn IdempotencyLedger>,
    pub errors: Arc<dyn ErrorReporter>,
    pub publisher: Arc<dyn CompletionPublisher>,
    pub locker: Arc<dyn TaskLocker>,
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Timeout,
    Abort,
}

struct Converted {
    merged: PathBuf,
    output_dir: PathBuf,
    manifest: PathBuf,
}

/// Runs the conversion pipeline for a single task message.
pub struct TaskProcessor {
    config: WorkerConfig,
    deps: ProcessorDeps,
    assembler: ChunkAssembler,
    retry: RetryConfig,
    abort_rx: Option<watch::Receiver<bool>>,
}

impl TaskProcessor {
    pub fn new(config: WorkerConfig, deps: ProcessorDeps) -> Self {
        let assembler = ChunkAssembler::new().with_extension(config.chunk_extension.clone());
        Self {
            config,
            deps,
            assembler,
            retry: RetryConfig::default(),
            abort_rx: None,
        }
    }

    /// Backoff policy for the ledger update and completion publish.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Signal that interrupts in-flight attempts, raised when shutdown runs out of time.
    pub fn with_abort(mut self, abort_rx: watch::Receiver<bool>) -> Self {
        self.abort_rx = Some(abort_rx);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Handle one raw message. Never fails; the outcome says what happened.
    pub async fn handle(&self, payload: &[u8]) -> TaskOutcome {
        let started = Instant::now();

        let outcome = match VideoTask::from_slice(payload) {
            Ok(task) => {
                let logger = TaskLogger::new(task.video_id, &task.path);
                let span = logger.create_span();
                self.process(&task, &logger).instrument(span).await
            }
            Err(e) => {
                let err = WorkerError::from(e);
                warn!(error = %err, bytes = payload.len(), "Rejecting malformed task message");
                self.report(None, &err).await;
                TaskOutcome::Rejected
            }
        };

        metrics::record_outcome(outcome.as_str(), started.elapsed().as_secs_f64());
        outcome
    }

    async fn process(&self, task: &VideoTask, logger: &TaskLogger) -> TaskOutcome {
        let video_id = task.video_id;

        if self.deps.ledger.is_processed(video_id).await {
            logger.log_skip("already processed");
            return TaskOutcome::AlreadyProcessed;
        }

        let guard = match self.deps.locker.try_acquire(video_id).await {
            Ok(Some(guard)) => Some(guard),
            Ok(None) => {
                logger.log_skip("another attempt holds the task lock");
                return TaskOutcome::InProgress;
            }
            Err(e) => {
                logger.log_warning(&format!("task lock unavailable, continuing unlocked: {}", e));
                None
            }
        };

        // The previous lock holder may have finished between the check and the lock.
        let outcome = if self.deps.ledger.is_processed(video_id).await {
            logger.log_skip("already processed");
            TaskOutcome::AlreadyProcessed
        } else {
            self.process_locked(task, logger).await
        };

        if let Some(guard) = guard {
            if let Err(e) = self.deps.locker.release(guard).await {
                logger.log_warning(&format!("failed to release task lock: {}", e));
            }
        }

        outcome
    }

    async fn process_locked(&self, task: &VideoTask, logger: &TaskLogger) -> TaskOutcome {
        let video_id = task.video_id;
        logger.log_start("converting chunked upload");

        let converted = match self.convert(task, logger).await {
            Ok(converted) => converted,
            Err(err) => return self.fail(video_id, logger, err).await,
        };

        if let Err(e) = remove_file_if_exists(&converted.merged).await {
            // The package is complete, so a stray merged file does not block completion.
            let err = WorkerError::Cleanup(e);
            logger.log_error(err.stage().as_str(), &err.to_string());
            self.report(Some(video_id), &err).await;
        }

        let marked = retry_async_when(
            &self.retry.named("mark_processed"),
            || self.deps.ledger.mark_processed(video_id),
            StoreError::is_retryable,
        )
        .await
        .into_result();

        match marked {
            Ok(MarkOutcome::Inserted) => {}
            Ok(MarkOutcome::AlreadyProcessed) => {
                logger.log_skip("another attempt recorded the video first");
                return TaskOutcome::AlreadyProcessed;
            }
            Err(e) => return self.fail(video_id, logger, WorkerError::Ledger(e)).await,
        }

        let event = CompletionEvent::new(
            video_id,
            converted.output_dir.clone(),
            converted.manifest.clone(),
        );
        let published = retry_async_when(
            &self.retry.named("publish_completion"),
            || self.deps.publisher.publish_completion(&event),
            QueueError::is_retryable,
        )
        .await
        .into_result();

        match published {
            Ok(()) => {
                logger.log_completion(&format!("manifest at {}", converted.manifest.display()));
                TaskOutcome::Completed { published: true }
            }
            Err(e) => {
                let err = WorkerError::Publish(e);
                logger.log_error(err.stage().as_str(), &err.to_string());
                self.report(Some(video_id), &err).await;
                TaskOutcome::Completed { published: false }
            }
        }
    }

    /// Merge the chunks and package the result, under the task deadline.
    async fn convert(&self, task: &VideoTask, logger: &TaskLogger) -> WorkerResult<Converted> {
        let merged = task.merged_file(&self.config.merged_file_name);
        let output_dir = task.output_dir(&self.config.output_dir_name);
        let deadline = tokio::time::Instant::now() + self.config.task_timeout;
        let (cancel_tx, cancel_rx) = watch::channel(false);

        logger.log_progress("merging chunks");
        let assembler = self.assembler.clone().with_cancel(cancel_rx.clone());
        let assembled = self
            .interruptible(
                ProcessingStage::Assembly,
                deadline,
                &cancel_tx,
                assembler.merge(&task.path, &merged),
            )
            .await;

        if let Err(err) = assembled {
            // Never leave a partial merge behind for the next attempt to trip over.
            if let Err(e) = remove_file_if_exists(&merged).await {
                logger.log_warning(&format!("failed to remove partial merged file: {}", e));
            }
            return Err(err);
        }

        logger.log_progress("converting to mpeg-dash");
        let manifest = self
            .interruptible(
                ProcessingStage::Transcode,
                deadline,
                &cancel_tx,
                self.deps.transcoder.convert(&merged, &output_dir, cancel_rx),
            )
            .await?;

        Ok(Converted {
            merged,
            output_dir,
            manifest,
        })
    }

    /// Drive `work` until it finishes, the deadline passes or shutdown aborts it.
    ///
    /// On interruption the cancel signal is raised and `work` gets a short grace
    /// period to stop FFmpeg or the merge loop cleanly.
    async fn interruptible<T, F>(
        &self,
        stage: ProcessingStage,
        deadline: tokio::time::Instant,
        cancel_tx: &watch::Sender<bool>,
        work: F,
    ) -> WorkerResult<T>
    where
        F: Future<Output = Result<T, MediaError>>,
    {
        let mut work = std::pin::pin!(work);

        let interrupt = tokio::select! {
            result = &mut work => return result.map_err(|e| stage_error(stage, e)),
            _ = tokio::time::sleep_until(deadline) => Interrupt::Timeout,
            _ = wait_for_abort(self.abort_rx.clone()) => Interrupt::Abort,
        };

        warn!(stage = stage.as_str(), ?interrupt, "Interrupting task");
        let _ = cancel_tx.send(true);

        // Work that completed right at the deadline still counts.
        if let Ok(Ok(value)) = tokio::time::timeout(CANCEL_GRACE, &mut work).await {
            return Ok(value);
        }

        Err(match interrupt {
            Interrupt::Timeout => WorkerError::Timeout {
                stage,
                secs: self.config.task_timeout.as_secs(),
            },
            Interrupt::Abort => WorkerError::Aborted(stage),
        })
    }

    async fn fail(&self, video_id: VideoId, logger: &TaskLogger, err: WorkerError) -> TaskOutcome {
        let stage = err.stage();
        logger.log_error(stage.as_str(), &err.to_string());
        self.report(Some(video_id), &err).await;
        TaskOutcome::Failed(stage)
    }

    async fn report(&self, video_id: Option<VideoId>, err: &WorkerError) {
        let record = ErrorRecord::new(video_id, err.stage(), err.details());
        metrics::record_stage_failure(record.stage);
        self.deps.errors.record_error(&record).await;
    }
}

fn stage_error(stage: ProcessingStage, err: MediaError) -> WorkerError {
    match stage {
        ProcessingStage::Assembly => WorkerError::Assembly(err),
        _ => WorkerError::Transcode(err),
    }
}

/// Resolves once the abort flag is raised; never resolves without one.
async fn wait_for_abort(abort_rx: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = abort_rx {
        if rx.wait_for(|aborted| *aborted).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}
