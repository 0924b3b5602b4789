//! Aeacus - evaluation worker for Agon

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use aeacus::broker::RedisBroker;
use aeacus::metrics::MetricsServer;
use aeacus::services::HttpServices;
use aeacus::{Collaborators, Config, EvaluationConsumer, EvaluationPipeline};
use agon_common::queue::{RetryPolicy, StreamQueue};
use anyhow::{Context, Result};
use tartarus::{DockerCli, Sandbox};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aeacus=debug,tartarus=debug,agon_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Aeacus evaluation worker");

    let config = Config::from_env()?;
    tracing::info!("Environment: {}", config.environment);

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

        tracing::info!("Shutdown signal received, finishing in-flight jobs...");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = MetricsServer::run(metrics_port).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    let runtime = Arc::new(DockerCli::new(&config.sandbox));
    let sandbox = Arc::new(Sandbox::new(config.sandbox.clone(), runtime));
    sandbox.prepare_images().await;

    let services = Arc::new(
        HttpServices::new(config.services.clone()).context("Failed to build HTTP client")?,
    );
    let leaderboard = StreamQueue::new(
        redis_pool.clone(),
        config.leaderboard_stream.clone(),
        config.consumer_group.clone(),
        config.worker_id.clone(),
    );
    let broker = Arc::new(RedisBroker::new(
        redis_pool.clone(),
        leaderboard,
        config.run_result_ttl_secs,
    ));

    let pipeline = Arc::new(EvaluationPipeline::new(
        Collaborators {
            directory: services.clone(),
            store: services,
            evaluator: sandbox,
            markers: broker.clone(),
            outbox: broker,
        },
        config.solved_marker_grace_secs,
    ));

    let queue = StreamQueue::new(
        redis_pool,
        config.evaluation_stream.clone(),
        config.consumer_group.clone(),
        config.worker_id.clone(),
    );
    let consumer = EvaluationConsumer::new(
        queue,
        pipeline,
        config.worker_concurrency,
        config.block_timeout_ms,
        RetryPolicy {
            max_retries: config.max_retries,
            base_backoff_ms: config.retry_backoff_ms,
        },
        shutdown,
    );
    consumer.initialize().await?;

    tracing::info!(worker_id = %config.worker_id, "Aeacus ready, starting evaluation loop");

    consumer.run().await?;

    tracing::info!("Aeacus shutdown complete");
    Ok(())
}
