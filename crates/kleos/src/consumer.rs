//! Redis Stream consumer for leaderboard updates

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agon_common::Disposition;
use agon_common::jobs::LeaderboardUpdateJob;
use agon_common::queue::{self, RetryPolicy, Settled, StreamMessage, StreamQueue};
use anyhow::Result;

use crate::config::ScoreMode;
use crate::score;
use crate::store::RankingStore;

const STALE_IDLE_MS: u64 = 60_000;
const RECLAIM_BATCH: usize = 50;

/// Applies one update to the ranking store.
pub struct UpdateApplier {
    store: Arc<dyn RankingStore>,
    mode: ScoreMode,
}

impl UpdateApplier {
    pub fn new(store: Arc<dyn RankingStore>, mode: ScoreMode) -> Self {
        Self { store, mode }
    }

    pub async fn apply(&self, job: &LeaderboardUpdateJob) -> Disposition {
        if !job.score.is_finite() || job.score < 0.0 {
            return Disposition::Fatal(format!(
                "invalid score {} for submission {}",
                job.score, job.submission_id
            ));
        }

        let applied = match self.mode {
            ScoreMode::Replace => self
                .store
                .update(job.contest_id, job.user_id, job.score, job.contest_end_time)
                .await
                .map(|_| Some(job.score)),
            ScoreMode::Accumulate => {
                self.store
                    .accumulate(
                        job.contest_id,
                        job.user_id,
                        job.submission_id,
                        score::decode(job.score),
                        job.contest_end_time,
                    )
                    .await
            }
        };

        match applied {
            Ok(Some(total)) => {
                let standing = score::decode(total);
                tracing::info!(
                    contest_id = %job.contest_id,
                    user_id = %job.user_id,
                    submission_id = %job.submission_id,
                    points = standing.points,
                    penalty_minutes = standing.penalty_minutes,
                    "Leaderboard updated"
                );
                Disposition::Completed
            }
            Ok(None) => {
                tracing::debug!(
                    submission_id = %job.submission_id,
                    "Update already applied, skipping"
                );
                Disposition::Completed
            }
            Err(e) => e.into(),
        }
    }
}

/// Leaderboard consumer that processes updates from Redis Stream
pub struct LeaderboardConsumer {
    queue: StreamQueue,
    applier: UpdateApplier,
    block_timeout_ms: usize,
    policy: RetryPolicy,
    shutdown: Arc<AtomicBool>,
}

impl LeaderboardConsumer {
    pub fn new(
        queue: StreamQueue,
        applier: UpdateApplier,
        block_timeout_ms: usize,
        policy: RetryPolicy,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            queue,
            applier,
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

    /// Run the consumer loop
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting leaderboard consumer on '{}'", self.queue.stream());

        match self.queue.reclaim_stale(STALE_IDLE_MS, RECLAIM_BATCH).await {
            Ok(stale) => {
                for msg in stale {
                    self.handle(msg).await;
                }
            }
            Err(e) if queue::is_missing_group(&e) => {
                tracing::warn!("Consumer group not found during reclaim, re-initializing...");
                self.initialize().await?;
            }
            Err(e) => return Err(e.into()),
        }

        while !self.shutdown.load(Ordering::SeqCst) {
            let now_ms = chrono::Utc::now().timestamp_millis();
            match self.queue.promote_due(now_ms).await {
                Ok(0) => {}
                Ok(n) => tracing::debug!("Promoted {} delayed updates", n),
                Err(e) => tracing::warn!("Failed to promote delayed updates: {}", e),
            }

            match self.queue.read_next(self.block_timeout_ms).await {
                Ok(Some(msg)) => self.handle(msg).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Error reading leaderboard stream: {}", e);

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

        tracing::info!("Leaderboard consumer shutting down");
        Ok(())
    }

    async fn handle(&self, msg: StreamMessage) {
        let disposition = match serde_json::from_str::<LeaderboardUpdateJob>(&msg.payload) {
            Ok(job) => self.applier.apply(&job).await,
            Err(e) => Disposition::Fatal(format!("malformed leaderboard payload: {}", e)),
        };

        match self.queue.settle(&msg, &disposition, self.policy).await {
            Ok(Settled::DeadLettered) => {
                tracing::error!(message_id = %msg.id, "Leaderboard update dead-lettered: {:?}", disposition);
            }
            Ok(_) => {}
            // Left pending; reclaimed on the next start.
            Err(e) => tracing::error!(message_id = %msg.id, "Failed to settle leaderboard update: {}", e),
        }
    }
}
