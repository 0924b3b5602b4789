//! Prometheus metrics for Aeacus

use std::sync::LazyLock;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// End-to-end job latency, labelled by job kind
pub static JOB_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        "evaluation_job_duration_seconds",
        "Time from job receipt to final disposition",
    )
    .buckets(vec![0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]);

    HistogramVec::new(opts, &["kind"]).expect("Failed to create histogram")
});

/// Verdict counter by type
pub static VERDICT_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let opts = Opts::new("evaluation_verdict_total", "Total verdicts by type");
    IntCounterVec::new(opts, &["verdict"]).expect("Failed to create counter")
});

/// Jobs processed counter
pub static JOBS_PROCESSED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("evaluation_jobs_processed_total", "Total jobs processed")
        .expect("Failed to create counter")
});

/// Jobs failed counter
pub static JOBS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("evaluation_jobs_failed_total", "Total jobs that failed")
        .expect("Failed to create counter")
});

/// Jobs scheduled for redelivery
pub static JOBS_RETRIED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("evaluation_jobs_retried_total", "Total jobs scheduled for retry")
        .expect("Failed to create counter")
});

/// Result upserts that failed and were skipped
pub static PERSIST_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "evaluation_persist_failures_total",
        "Results that could not be stored on the submission",
    )
    .expect("Failed to create counter")
});

/// Leaderboard updates forwarded
pub static LEADERBOARD_FORWARDED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "evaluation_leaderboard_forwarded_total",
        "First solves forwarded to the leaderboard",
    )
    .expect("Failed to create counter")
});

/// Currently active jobs gauge
pub static ACTIVE_JOBS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("evaluation_active_jobs", "Currently running evaluation jobs")
        .expect("Failed to create gauge")
});

/// Initialize and register all metrics
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(JOB_DURATION.clone()))
        .expect("Failed to register metric");
    REGISTRY
        .register(Box::new(VERDICT_TOTAL.clone()))
        .expect("Failed to register metric");
    REGISTRY
        .register(Box::new(JOBS_PROCESSED.clone()))
        .expect("Failed to register metric");
    REGISTRY
        .register(Box::new(JOBS_FAILED.clone()))
        .expect("Failed to register metric");
    REGISTRY
        .register(Box::new(JOBS_RETRIED.clone()))
        .expect("Failed to register metric");
    REGISTRY
        .register(Box::new(PERSIST_FAILURES.clone()))
        .expect("Failed to register metric");
    REGISTRY
        .register(Box::new(LEADERBOARD_FORWARDED.clone()))
        .expect("Failed to register metric");
    REGISTRY
        .register(Box::new(ACTIVE_JOBS.clone()))
        .expect("Failed to register metric");
}

/// Record a verdict
pub fn record_verdict(verdict: &str) {
    VERDICT_TOTAL.with_label_values(&[verdict]).inc();
}

/// Record end-to-end latency of one job
pub fn record_duration(kind: &str, duration_secs: f64) {
    JOB_DURATION.with_label_values(&[kind]).observe(duration_secs);
}

/// HTTP server for Prometheus metrics endpoint
pub struct MetricsServer;

impl MetricsServer {
    /// Run the metrics server
    pub async fn run(port: u16) -> anyhow::Result<()> {
        use axum::{Router, routing::get};
        use std::net::SocketAddr;

        init_metrics();

        let app = Router::new()
            .route("/metrics", get(Self::metrics_handler))
            .route("/health", get(|| async { "OK" }));

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tracing::info!("Metrics server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    async fn metrics_handler() -> String {
        let encoder = TextEncoder::new();
        let metric_families = REGISTRY.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
