//! Configuration for the Aeacus evaluation worker

use std::env;

use anyhow::{Context, Result};
use tartarus::SandboxConfig;

/// Aeacus configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Environment (development, staging, production)
    pub environment: String,

    /// Redis connection URL
    pub redis_url: String,

    /// Worker ID for consumer group
    pub worker_id: String,

    /// Consumer group name
    pub consumer_group: String,

    /// Stream carrying evaluation jobs
    pub evaluation_stream: String,

    /// Stream the leaderboard engine consumes
    pub leaderboard_stream: String,

    /// Block timeout for XREADGROUP (milliseconds)
    pub block_timeout_ms: usize,

    /// Jobs evaluated at the same time
    pub worker_concurrency: usize,

    /// Maximum retries before sending to dead letter stream
    pub max_retries: u32,

    /// First retry delay; doubled on every further attempt
    pub retry_backoff_ms: u64,

    /// Prometheus metrics port
    pub metrics_port: u16,

    /// External collaborators
    pub services: ServicesConfig,

    /// Extra lifetime of a first-solve marker past contest end
    pub solved_marker_grace_secs: u64,

    /// Lifetime of a published run-only result
    pub run_result_ttl_secs: u64,

    /// Sandbox settings
    pub sandbox: SandboxConfig,
}

/// Base URLs and credentials of the HTTP collaborators
#[derive(Debug, Clone)]
pub struct ServicesConfig {
    pub problem_service_url: String,
    pub contest_service_url: String,
    pub submission_service_url: String,
    pub internal_api_key: String,
    pub http_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            worker_id: env::var("WORKER_ID").unwrap_or_else(|_| {
                let id = uuid::Uuid::new_v4().simple().to_string();
                format!("aeacus_worker_{}", &id[..8])
            }),
            consumer_group: env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| "aeacus_group".to_string()),
            evaluation_stream: env::var("EVALUATION_STREAM")
                .unwrap_or_else(|_| "evaluation_queue".to_string()),
            leaderboard_stream: env::var("LEADERBOARD_STREAM")
                .unwrap_or_else(|_| "leaderboard_queue".to_string()),
            block_timeout_ms: parse_or("BLOCK_TIMEOUT_MS", 5000),
            worker_concurrency: parse_or("WORKER_CONCURRENCY", 2).max(1),
            max_retries: parse_or("MAX_RETRIES", 3),
            retry_backoff_ms: parse_or("RETRY_BACKOFF_MS", 1000),
            metrics_port: parse_or("METRICS_PORT", 9092),
            services: ServicesConfig {
                problem_service_url: required("PROBLEM_SERVICE_URL")?,
                contest_service_url: required("CONTEST_SERVICE_URL")?,
                submission_service_url: required("SUBMISSION_SERVICE_URL")?,
                internal_api_key: required("INTERNAL_API_KEY")?,
                http_timeout_ms: parse_or("HTTP_TIMEOUT_MS", 10_000),
            },
            solved_marker_grace_secs: parse_or("SOLVED_MARKER_GRACE_SECS", 3600),
            run_result_ttl_secs: parse_or("RUN_RESULT_TTL_SECS", 300),
            sandbox: SandboxConfig::from_env(),
        })
    }
}

fn required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{} must be set", key))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
