//! Cron scheduler for the snapshot job

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::snapshot::SnapshotJob;

/// Scheduler that archives leaderboard snapshots on a cron schedule
pub struct SnapshotScheduler {
    job: Arc<SnapshotJob>,
    cron_expr: String,
    scheduler: JobScheduler,
}

impl SnapshotScheduler {
    pub async fn new(job: Arc<SnapshotJob>, cron_expr: impl Into<String>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            job,
            cron_expr: cron_expr.into(),
            scheduler,
        })
    }

    /// Register the snapshot job with the scheduler
    pub async fn setup_jobs(&mut self) -> Result<()> {
        let job = self.job.clone();
        // One snapshot at a time; a tick that lands mid-run is skipped.
        let running = Arc::new(Mutex::new(()));

        tracing::info!("Adding leaderboard snapshot job: {}", self.cron_expr);

        let cron_job = Job::new_async(self.cron_expr.as_str(), move |_uuid, _lock| {
            let job = job.clone();
            let running = running.clone();

            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    tracing::warn!("Previous snapshot still running, skipping this tick");
                    return;
                };

                tracing::debug!("Running leaderboard snapshot job");
                if let Err(e) = job.run_once(chrono::Utc::now()).await {
                    tracing::error!("Leaderboard snapshot failed: {:#}", e);
                }
            })
        })?;

        self.scheduler.add(cron_job).await?;
        Ok(())
    }

    /// Start the scheduler
    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await?;
        Ok(())
    }

    /// Shutdown the scheduler gracefully
    pub async fn shutdown(&mut self) -> Result<()> {
        self.scheduler.shutdown().await?;
        Ok(())
    }
}
