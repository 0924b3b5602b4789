//! Kleos - leaderboard engine for Agon

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use agon_common::queue::{RetryPolicy, StreamQueue};
use anyhow::{Context, Result};
use kleos::scheduler::SnapshotScheduler;
use kleos::{Config, LeaderboardConsumer, PgSnapshotSink, RedisLeaderboard, SnapshotJob, UpdateApplier};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kleos=debug,agon_common=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Kleos leaderboard engine");

    let config = Config::from_env()?;
    tracing::info!("Environment: {}", config.environment);
    tracing::info!("Score mode: {:?}", config.score_mode);

    tracing::info!("Connecting to database...");
    let db_pool = sqlx::PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    sqlx::migrate!("./migrations").run(&db_pool).await?;
    tracing::info!("Database connected, migrations applied");

    tracing::info!("Connecting to Redis...");
    let redis_cfg = deadpool_redis::Config::from_url(&config.redis_url);
    let redis_pool = redis_cfg
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .context("Failed to create Redis pool")?;
    tracing::info!("Redis connected");

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        tracing::info!("Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let grace = config.contest_grace()?;
    let lookback = config.snapshot_lookback()?;
    let store = Arc::new(RedisLeaderboard::new(redis_pool.clone(), grace));

    let snapshot_job = Arc::new(SnapshotJob::new(
        store.clone(),
        Arc::new(PgSnapshotSink::new(db_pool)),
        lookback,
        grace,
    ));
    let mut scheduler = SnapshotScheduler::new(snapshot_job, config.snapshot_cron.clone()).await?;
    scheduler.setup_jobs().await?;
    scheduler.start().await?;

    let queue = StreamQueue::new(
        redis_pool,
        config.leaderboard_stream.clone(),
        config.consumer_group.clone(),
        config.worker_id.clone(),
    );
    let consumer = LeaderboardConsumer::new(
        queue,
        UpdateApplier::new(store, config.score_mode),
        config.block_timeout_ms,
        RetryPolicy {
            max_retries: config.max_retries,
            base_backoff_ms: config.retry_backoff_ms,
        },
        shutdown,
    );
    consumer.initialize().await?;

    tracing::info!(worker_id = %config.worker_id, "Kleos ready, consuming leaderboard updates");

    let result = consumer.run().await;

    tracing::info!("Shutting down scheduler...");
    scheduler.shutdown().await?;

    result?;
    tracing::info!("Kleos shutdown complete");
    Ok(())
}
