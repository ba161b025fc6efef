//! Task executor.
//!
//! Pulls deliveries from the message source into a bounded pool, hands each
//! one to the [`TaskProcessor`] and acknowledges it exactly once afterwards.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vconv_queue::{Delivery, MessageSource, QueueError};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::processor::{TaskOutcome, TaskProcessor};
use crate::retry::{retry_async_when, FailureTracker, RetryConfig};

/// Consecutive consume failures logged before the rest are suppressed.
const MAX_LOGGED_CONSUME_FAILURES: u32 = 5;

/// Delivery IDs this executor is currently handling.
#[derive(Debug, Default)]
struct InFlight {
    ids: Mutex<HashSet<String>>,
}

impl InFlight {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false if the delivery is already being handled.
    fn register(&self, id: &str) -> bool {
        self.lock().insert(id.to_string())
    }

    fn release(&self, id: &str) {
        self.lock().remove(id);
    }

    fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    fn ids(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }
}

/// Task executor that processes messages from the source.
pub struct TaskExecutor {
    config: WorkerConfig,
    source: Arc<dyn MessageSource>,
    processor: Arc<TaskProcessor>,
    task_semaphore: Arc<Semaphore>,
    in_flight_ids: Arc<InFlight>,
    shutdown: watch::Sender<bool>,
    abort: watch::Sender<bool>,
    consumer_name: String,
    ack_retry: RetryConfig,
}

impl TaskExecutor {
    /// Create a new task executor.
    pub fn new(config: WorkerConfig, source: Arc<dyn MessageSource>, processor: TaskProcessor) -> Self {
        let task_semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        let (shutdown, _) = watch::channel(false);
        let (abort, abort_rx) = watch::channel(false);
        let consumer_name = format!("converter-{}", Uuid::new_v4());

        Self {
            config,
            source,
            processor: Arc::new(processor.with_abort(abort_rx)),
            task_semaphore,
            in_flight_ids: Arc::new(InFlight::default()),
            shutdown,
            abort,
            consumer_name,
            ack_retry: RetryConfig::new("ack"),
        }
    }

    /// Backoff policy for acknowledgements.
    pub fn with_ack_retry(mut self, retry: RetryConfig) -> Self {
        self.ack_retry = retry;
        self
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Deliveries currently being handled.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent_tasks - self.task_semaphore.available_permits()
    }

    /// Start the executor. Returns once shutdown was signalled and in-flight tasks drained.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            consumer = %self.consumer_name,
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            "Starting task executor"
        );

        let claim_task = self.spawn_claim_task();
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut failures = FailureTracker::new(MAX_LOGGED_CONSUME_FAILURES);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_tasks() => {
                    match result {
                        Ok(()) => failures.record_success(),
                        Err(e) => {
                            if failures.record_failure() {
                                error!(error = %e, "Error consuming tasks");
                            }
                            let backoff = failures.backoff(Duration::from_millis(500), Duration::from_secs(30));
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
        }

        claim_task.abort();
        self.drain().await;

        info!("Task executor stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Read as many messages as there are free slots and dispatch them.
    async fn consume_tasks(&self) -> WorkerResult<()> {
        let available = self.task_semaphore.available_permits();
        if available == 0 {
            // All slots busy, wait a bit
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let deliveries = self
            .source
            .receive(
                &self.consumer_name,
                self.config.consume_block.as_millis() as u64,
                available.min(self.config.consume_batch),
            )
            .await?;

        if deliveries.is_empty() {
            return Ok(());
        }
        debug!(count = deliveries.len(), "Consumed messages");

        for delivery in deliveries {
            self.dispatch(delivery).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, delivery: Delivery) -> WorkerResult<()> {
        let permit = Arc::clone(&self.task_semaphore)
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::config("task semaphore closed"))?;
        self.worker().spawn(permit, delivery);
        Ok(())
    }

    fn worker(&self) -> Worker {
        Worker {
            processor: Arc::clone(&self.processor),
            source: Arc::clone(&self.source),
            in_flight: Arc::clone(&self.in_flight_ids),
            ack_retry: self.ack_retry.clone(),
        }
    }

    /// Periodically take over messages left pending by dead consumers.
    ///
    /// Each tick first refreshes the idle time of this executor's own
    /// in-flight messages so no other consumer claims them mid-attempt.
    fn spawn_claim_task(&self) -> JoinHandle<()> {
        let worker = self.worker();
        let semaphore = Arc::clone(&self.task_semaphore);
        let consumer_name = self.consumer_name.clone();
        let claim_interval = self.config.claim_interval;
        let min_idle_ms = self.config.claim_min_idle.as_millis() as u64;
        let batch = self.config.consume_batch;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(claim_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let owned = worker.in_flight.ids();
                        if let Err(e) = worker.source.keep_alive(&consumer_name, &owned).await {
                            warn!(error = %e, count = owned.len(), "Failed to refresh in-flight messages");
                        }

                        let free = semaphore.available_permits().min(batch);
                        if free == 0 {
                            continue;
                        }
                        match worker.source.claim_stale(&consumer_name, min_idle_ms, free).await {
                            Ok(deliveries) if !deliveries.is_empty() => {
                                info!(count = deliveries.len(), "Claimed stale messages");
                                metrics::record_claimed(deliveries.len());
                                for delivery in deliveries {
                                    if worker.in_flight.contains(&delivery.id) {
                                        debug!(message_id = %delivery.id, "Claimed message is still in flight here");
                                        continue;
                                    }
                                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                                        break;
                                    };
                                    worker.spawn(permit, delivery);
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Failed to claim stale messages"),
                        }
                    }
                }
            }
        })
    }

    /// Wait for in-flight tasks; abort them if the shutdown timeout runs out.
    async fn drain(&self) {
        if self.in_flight() == 0 {
            return;
        }

        info!(in_flight = self.in_flight(), "Waiting for in-flight tasks to complete");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_tasks())
            .await
            .is_ok()
        {
            return;
        }

        warn!(
            in_flight = self.in_flight(),
            "Shutdown timeout reached, aborting in-flight tasks"
        );
        let _ = self.abort.send(true);
        // Aborted attempts still record their failure and ack their message.
        let _ = tokio::time::timeout(Duration::from_secs(30), self.wait_for_tasks()).await;
    }

    /// Wait for all in-flight tasks to complete.
    async fn wait_for_tasks(&self) {
        while self.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Everything a spawned attempt needs, shared by the consume and claim paths.
#[derive(Clone)]
struct Worker {
    processor: Arc<TaskProcessor>,
    source: Arc<dyn MessageSource>,
    in_flight: Arc<InFlight>,
    ack_retry: RetryConfig,
}

impl Worker {
    /// Run one delivery on the pool. Skipped if this executor already handles it.
    fn spawn(&self, permit: OwnedSemaphorePermit, delivery: Delivery) {
        if !self.in_flight.register(&delivery.id) {
            debug!(message_id = %delivery.id, "Message already in flight");
            return;
        }
        let worker = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let id = delivery.id.clone();
            worker.execute(delivery).await;
            worker.in_flight.release(&id);
        });
    }

    /// Handle one delivery and acknowledge it.
    async fn execute(&self, delivery: Delivery) -> TaskOutcome {
        metrics::task_started();
        let started = Instant::now();

        let outcome = self.processor.handle(&delivery.payload).await;

        // Acked whatever the outcome; the ledger decides whether work is repeated.
        let acked = retry_async_when(
            &self.ack_retry,
            || self.source.ack(&delivery.id),
            QueueError::is_retryable,
        )
        .await
        .into_result();

        if let Err(e) = acked {
            metrics::record_ack_failure();
            error!(message_id = %delivery.id, error = %e, "Failed to acknowledge message");
        }

        info!(
            message_id = %delivery.id,
            outcome = outcome.as_str(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Message handled"
        );
        metrics::task_finished();
        outcome
    }
}
