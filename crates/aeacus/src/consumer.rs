//! Redis Stream consumer for evaluation jobs
//!
//! A semaphore with `worker_concurrency` permits gates reads from the stream,
//! so at most that many sandboxes run at once regardless of queue depth. Each
//! job runs in its own task and gives its permit back when it settles.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agon_common::jobs::EvaluationJob;
use agon_common::queue::{self, RetryPolicy, Settled, StreamMessage, StreamQueue};
use agon_common::Disposition;
use anyhow::Result;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::metrics::{ACTIVE_JOBS, JOBS_FAILED, JOBS_PROCESSED, JOBS_RETRIED};
use crate::pipeline::EvaluationPipeline;

/// Pending messages idle this long belong to a dead consumer.
const STALE_IDLE_MS: u64 = 60_000;
const RECLAIM_BATCH: usize = 10;

/// Evaluation consumer that processes jobs from Redis Stream
pub struct EvaluationConsumer {
    queue: StreamQueue,
    pipeline: Arc<EvaluationPipeline>,
    slots: Arc<Semaphore>,
    block_timeout_ms: usize,
    policy: RetryPolicy,
    shutdown: Arc<AtomicBool>,
}

impl EvaluationConsumer {
    pub fn new(
        queue: StreamQueue,
        pipeline: Arc<EvaluationPipeline>,
        worker_concurrency: usize,
        block_timeout_ms: usize,
        policy: RetryPolicy,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            queue,
            pipeline,
            slots: Arc::new(Semaphore::new(worker_concurrency.max(1))),
            block_timeout_ms,
            policy,
            shutdown,
        }
    }

    /// Initialize consumer group
    pub async fn initialize(&self) -> Result<()> {
        self.queue.initialize().await?;
        Ok(())
    }

    /// Run the consumer loop until shutdown, then drain in-flight jobs.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            "Starting evaluation consumer on '{}' with {} slot(s)",
            self.queue.stream(),
            self.slots.available_permits()
        );

        let mut tasks = JoinSet::new();

        // First, pick up messages abandoned by dead workers.
        match self.queue.reclaim_stale(STALE_IDLE_MS, RECLAIM_BATCH).await {
            Ok(stale) => {
                for msg in stale {
                    let permit = self.slots.clone().acquire_owned().await?;
                    self.spawn(&mut tasks, msg, permit);
                }
            }
            Err(e) if queue::is_missing_group(&e) => {
                tracing::warn!("Consumer group not found during reclaim, re-initializing...");
                self.initialize().await?;
            }
            Err(e) => return Err(e.into()),
        }

        while !self.shutdown.load(Ordering::SeqCst) {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!("Evaluation task aborted: {}", e);
                }
            }

            let now_ms = chrono::Utc::now().timestamp_millis();
            match self.queue.promote_due(now_ms).await {
                Ok(0) => {}
                Ok(n) => tracing::debug!("Promoted {} delayed retries", n),
                Err(e) => tracing::warn!("Failed to promote delayed retries: {}", e),
            }

            // Wait for a free slot before taking a message off the stream.
            let permit = self.slots.clone().acquire_owned().await?;

            match self.queue.read_next(self.block_timeout_ms).await {
                Ok(Some(msg)) => self.spawn(&mut tasks, msg, permit),
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    tracing::error!("Error reading evaluation stream: {}", e);

                    if queue::is_missing_group(&e) {
                        tracing::warn!("Consumer group missing, re-initializing...");
                        if let Err(init_err) = self.initialize().await {
                            tracing::error!("Failed to re-initialize consumer group: {}", init_err);
                        }
                    }

                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        tracing::info!("Evaluation consumer draining {} in-flight job(s)", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Evaluation task aborted: {}", e);
            }
        }

        tracing::info!("Evaluation consumer shutting down");
        Ok(())
    }

    fn spawn(&self, tasks: &mut JoinSet<()>, msg: StreamMessage, permit: OwnedSemaphorePermit) {
        let queue = self.queue.clone();
        let pipeline = self.pipeline.clone();
        let policy = self.policy;

        tasks.spawn(async move {
            handle_message(&queue, &pipeline, &msg, policy).await;
            drop(permit);
        });
    }
}

/// Run one message through the pipeline and settle it on the stream.
async fn handle_message(
    queue: &StreamQueue,
    pipeline: &EvaluationPipeline,
    msg: &StreamMessage,
    policy: RetryPolicy,
) {
    ACTIVE_JOBS.inc();

    let disposition = match serde_json::from_str::<EvaluationJob>(&msg.payload) {
        Ok(job) => {
            tracing::info!(
                submission_id = %job.submission_id,
                problem_id = %job.problem_id,
                message_id = %msg.id,
                retry = msg.retry_count,
                run_only = job.is_run_only(),
                "Processing evaluation job"
            );
            pipeline.process(&job).await
        }
        Err(e) => Disposition::Fatal(format!("malformed evaluation payload: {}", e)),
    };

    ACTIVE_JOBS.dec();

    match queue.settle(msg, &disposition, policy).await {
        Ok(Settled::Completed) => {
            JOBS_PROCESSED.inc();
            tracing::info!(message_id = %msg.id, "Evaluation job completed");
        }
        Ok(Settled::Retried(_)) => JOBS_RETRIED.inc(),
        Ok(Settled::DeadLettered) => JOBS_FAILED.inc(),
        Err(e) => {
            // Left pending; reclaimed by the next worker start.
            tracing::error!(message_id = %msg.id, "Failed to settle evaluation job: {}", e);
        }
    }
}
