//! Kleos - leaderboard engine for Agon
//!
//! Applies first-solve updates to per-contest Redis rankings and archives
//! periodic snapshots of active contests into Postgres.

pub mod config;
pub mod consumer;
pub mod scheduler;
pub mod score;
pub mod snapshot;
pub mod store;

pub use config::{Config, ScoreMode};
pub use consumer::{LeaderboardConsumer, UpdateApplier};
pub use score::Standing;
pub use snapshot::{PgSnapshotSink, SnapshotJob};
pub use store::{RankedEntry, RankingStore, RedisLeaderboard};
