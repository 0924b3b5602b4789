//! Live contest rankings in Redis sorted sets.
//!
//! Keys:
//! - `leaderboard:<contest>`: member user id, score the combined score
//! - `leaderboard:<contest>:applied`: submission ids already credited
//! - `leaderboard:active`: member contest id, score contest end in ms

use agon_common::{AppError, AppResult, ContestId, SubmissionId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use deadpool_redis::redis;
use serde::Serialize;

use crate::score::{self, MAX_PENALTY_UNITS, Standing};

pub const ACTIVE_CONTESTS_KEY: &str = "leaderboard:active";

/// Adds one solve to the stored standing, once per submission.
///
/// KEYS: board, applied set, active index.
/// ARGV: user, submission, points, penalty minutes, max units, expire-at
/// (unix seconds), contest end (ms), contest id.
const ACCUMULATE_SCRIPT: &str = r#"
if redis.call('SADD', KEYS[2], ARGV[2]) == 0 then
  return false
end
local max = tonumber(ARGV[5])
local points = tonumber(ARGV[3])
local penalty = tonumber(ARGV[4])
local current = redis.call('ZSCORE', KEYS[1], ARGV[1])
if current then
  local stored = tonumber(current)
  local whole = math.floor(stored)
  points = points + whole
  penalty = penalty + (max - math.floor((stored - whole) * (max + 1) + 0.5))
end
if penalty > max - 1 then penalty = max - 1 end
if penalty < 0 then penalty = 0 end
local combined = string.format('%.17g', points + (max - penalty) / (max + 1))
redis.call('ZADD', KEYS[1], combined, ARGV[1])
redis.call('EXPIREAT', KEYS[1], ARGV[6])
redis.call('EXPIREAT', KEYS[2], ARGV[6])
redis.call('ZADD', KEYS[3], ARGV[7], ARGV[8])
return combined
"#;

/// One ranked user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedEntry {
    pub user_id: UserId,
    /// 1-based, in descending score order
    pub rank: u64,
    pub score: f64,
    pub standing: Standing,
}

impl RankedEntry {
    fn new(user_id: UserId, rank: u64, score: f64) -> Self {
        Self {
            user_id,
            rank,
            score,
            standing: score::decode(score),
        }
    }
}

/// Ordered per-contest ranking.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RankingStore: Send + Sync {
    /// Overwrite the user's combined score.
    async fn update(
        &self,
        contest: ContestId,
        user: UserId,
        score: f64,
        contest_end: Option<DateTime<Utc>>,
    ) -> AppResult<()>;

    /// Add a solve to the user's standing. `None` when the submission was
    /// already applied.
    async fn accumulate(
        &self,
        contest: ContestId,
        user: UserId,
        submission: SubmissionId,
        solve: Standing,
        contest_end: Option<DateTime<Utc>>,
    ) -> AppResult<Option<f64>>;

    async fn top_n(&self, contest: ContestId, n: usize) -> AppResult<Vec<RankedEntry>>;

    /// `None` when the user is not ranked.
    async fn rank(&self, contest: ContestId, user: UserId) -> AppResult<Option<RankedEntry>>;

    async fn full_ranking(&self, contest: ContestId) -> AppResult<Vec<RankedEntry>>;

    /// Contests that have not ended, or ended less than `lookback` ago.
    async fn active_contests(&self, now: DateTime<Utc>, lookback: Duration) -> AppResult<Vec<ContestId>>;

    /// Drop contests that ended before `cutoff` from the active index.
    async fn prune_ended(&self, cutoff: DateTime<Utc>) -> AppResult<usize>;
}

pub fn board_key(contest: ContestId) -> String {
    format!("leaderboard:{}", contest)
}

pub fn applied_key(contest: ContestId) -> String {
    format!("leaderboard:{}:applied", contest)
}

/// [`RankingStore`] over a Redis pool.
#[derive(Clone)]
pub struct RedisLeaderboard {
    pool: deadpool_redis::Pool,
    grace: Duration,
}

impl RedisLeaderboard {
    pub fn new(pool: deadpool_redis::Pool, grace: Duration) -> Self {
        Self { pool, grace }
    }

    /// Key expiry and active-index score for a contest.
    fn lifetime(&self, contest_end: Option<DateTime<Utc>>, now: DateTime<Utc>) -> (i64, i64) {
        match contest_end {
            Some(end) => ((end + self.grace).timestamp(), end.timestamp_millis()),
            None => {
                let horizon = now + self.grace;
                (horizon.timestamp(), horizon.timestamp_millis())
            }
        }
    }

    async fn range(&self, contest: ContestId, stop: isize) -> AppResult<Vec<RankedEntry>> {
        let mut conn = self.pool.get().await?;

        let members: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(board_key(contest))
            .arg(0)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut *conn)
            .await?;

        let mut entries = Vec::with_capacity(members.len());
        for (position, (member, score)) in members.into_iter().enumerate() {
            match member.parse() {
                Ok(user) => entries.push(RankedEntry::new(user, position as u64 + 1, score)),
                Err(_) => tracing::warn!(contest_id = %contest, member = %member, "Skipping malformed leaderboard member"),
            }
        }

        Ok(entries)
    }
}

#[async_trait]
impl RankingStore for RedisLeaderboard {
    async fn update(
        &self,
        contest: ContestId,
        user: UserId,
        score: f64,
        contest_end: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let (expire_at, end_ms) = self.lifetime(contest_end, Utc::now());
        let mut conn = self.pool.get().await?;

        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(board_key(contest))
            .arg(score)
            .arg(user.to_string())
            .ignore()
            .cmd("EXPIREAT")
            .arg(board_key(contest))
            .arg(expire_at)
            .ignore()
            .cmd("ZADD")
            .arg(ACTIVE_CONTESTS_KEY)
            .arg(end_ms)
            .arg(contest.to_string())
            .ignore()
            .query_async::<()>(&mut *conn)
            .await?;

        Ok(())
    }

    async fn accumulate(
        &self,
        contest: ContestId,
        user: UserId,
        submission: SubmissionId,
        solve: Standing,
        contest_end: Option<DateTime<Utc>>,
    ) -> AppResult<Option<f64>> {
        let (expire_at, end_ms) = self.lifetime(contest_end, Utc::now());
        let mut conn = self.pool.get().await?;

        let combined: Option<String> = redis::cmd("EVAL")
            .arg(ACCUMULATE_SCRIPT)
            .arg(3)
            .arg(board_key(contest))
            .arg(applied_key(contest))
            .arg(ACTIVE_CONTESTS_KEY)
            .arg(user.to_string())
            .arg(submission.to_string())
            .arg(solve.points)
            .arg(solve.penalty_minutes)
            .arg(MAX_PENALTY_UNITS)
            .arg(expire_at)
            .arg(end_ms)
            .arg(contest.to_string())
            .query_async(&mut *conn)
            .await?;

        combined
            .map(|s| {
                s.parse::<f64>()
                    .map_err(|e| AppError::CacheError(format!("bad score '{}' from script: {}", s, e)))
            })
            .transpose()
    }

    async fn top_n(&self, contest: ContestId, n: usize) -> AppResult<Vec<RankedEntry>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        self.range(contest, n as isize - 1).await
    }

    async fn rank(&self, contest: ContestId, user: UserId) -> AppResult<Option<RankedEntry>> {
        let mut conn = self.pool.get().await?;
        let member = user.to_string();

        let (position, score): (Option<u64>, Option<f64>) = redis::pipe()
            .cmd("ZREVRANK")
            .arg(board_key(contest))
            .arg(&member)
            .cmd("ZSCORE")
            .arg(board_key(contest))
            .arg(&member)
            .query_async(&mut *conn)
            .await?;

        Ok(match (position, score) {
            (Some(position), Some(score)) => Some(RankedEntry::new(user, position + 1, score)),
            _ => None,
        })
    }

    async fn full_ranking(&self, contest: ContestId) -> AppResult<Vec<RankedEntry>> {
        self.range(contest, -1).await
    }

    async fn active_contests(&self, now: DateTime<Utc>, lookback: Duration) -> AppResult<Vec<ContestId>> {
        let mut conn = self.pool.get().await?;

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(ACTIVE_CONTESTS_KEY)
            .arg((now - lookback).timestamp_millis())
            .arg("+inf")
            .query_async(&mut *conn)
            .await?;

        Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
    }

    async fn prune_ended(&self, cutoff: DateTime<Utc>) -> AppResult<usize> {
        let mut conn = self.pool.get().await?;

        let removed: usize = redis::cmd("ZREMRANGEBYSCORE")
            .arg(ACTIVE_CONTESTS_KEY)
            .arg("-inf")
            .arg(format!("({}", cutoff.timestamp_millis()))
            .query_async(&mut *conn)
            .await?;

        Ok(removed)
    }
}
