//! Configuration for the Kleos leaderboard service

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};

/// How a forwarded first solve changes the stored standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreMode {
    /// Add the solve's points and penalty to the user's total
    #[default]
    Accumulate,
    /// Overwrite the user's score with the forwarded one
    Replace,
}

impl FromStr for ScoreMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accumulate" => Ok(ScoreMode::Accumulate),
            "replace" => Ok(ScoreMode::Replace),
            other => Err(anyhow!("unknown score mode '{}'", other)),
        }
    }
}

/// Kleos configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Environment (development, staging, production)
    pub environment: String,

    /// Redis connection URL
    pub redis_url: String,

    /// PostgreSQL connection URL (snapshot storage)
    pub database_url: String,

    /// Worker ID for consumer group
    pub worker_id: String,

    /// Consumer group name
    pub consumer_group: String,

    /// Stream carrying leaderboard updates
    pub leaderboard_stream: String,

    /// Block timeout for XREADGROUP (milliseconds)
    pub block_timeout_ms: usize,

    /// Delivery attempts after the first one
    pub max_retries: u32,

    /// First retry delay; doubled on every further attempt
    pub retry_backoff_ms: u64,

    /// Cron expression of the snapshot job (with seconds field)
    pub snapshot_cron: String,

    /// How long after its end a contest is still snapshotted
    pub snapshot_lookback_secs: u64,

    /// Lifetime of contest keys past contest end
    pub contest_grace_secs: u64,

    pub score_mode: ScoreMode,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let score_mode = match env::var("SCORE_MODE") {
            Ok(v) => v.parse()?,
            Err(_) => ScoreMode::default(),
        };

        Ok(Self {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            worker_id: env::var("WORKER_ID").unwrap_or_else(|_| {
                let id = uuid::Uuid::new_v4().simple().to_string();
                format!("kleos_worker_{}", &id[..8])
            }),
            consumer_group: env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| "kleos_group".to_string()),
            leaderboard_stream: env::var("LEADERBOARD_STREAM")
                .unwrap_or_else(|_| "leaderboard_queue".to_string()),
            block_timeout_ms: parse_or("BLOCK_TIMEOUT_MS", 5000),
            max_retries: parse_or("MAX_RETRIES", 3),
            retry_backoff_ms: parse_or("RETRY_BACKOFF_MS", 1000),
            snapshot_cron: env::var("SNAPSHOT_CRON")
                .unwrap_or_else(|_| "0 */2 * * * *".to_string()),
            snapshot_lookback_secs: parse_or("SNAPSHOT_LOOKBACK_SECS", 120),
            contest_grace_secs: parse_or("CONTEST_GRACE_SECS", 86_400),
            score_mode,
        })
    }

    /// Lifetime of contest keys past contest end
    pub fn contest_grace(&self) -> Result<chrono::Duration> {
        seconds("CONTEST_GRACE_SECS", self.contest_grace_secs)
    }

    pub fn snapshot_lookback(&self) -> Result<chrono::Duration> {
        seconds("SNAPSHOT_LOOKBACK_SECS", self.snapshot_lookback_secs)
    }
}

fn seconds(key: &str, secs: u64) -> Result<chrono::Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .with_context(|| format!("{} is out of range", key))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
