//! Redis-side effects of the pipeline: first-solve markers, leaderboard
//! forwarding and run-result publication.

use agon_common::jobs::LeaderboardUpdateJob;
use agon_common::queue::StreamQueue;
use agon_common::{AppResult, ContestId, ProblemId, SubmissionId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis;
use tartarus::EvaluationOutcome;

/// Shortest lifetime given to a marker, whatever the contest end.
const MIN_MARKER_TTL_SECS: i64 = 60;

/// Result of trying to take the first-solve marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerClaim {
    /// This submission is the first accepted solve.
    First,
    /// The marker already names this submission; the job is a redelivery.
    Redelivered,
    /// Another submission solved the problem first.
    AlreadySolved,
}

impl MarkerClaim {
    pub fn earns_credit(self) -> bool {
        !matches!(self, MarkerClaim::AlreadySolved)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SolveMarkers: Send + Sync {
    /// Atomically set the marker for `(contest, user, problem)` unless one
    /// exists.
    async fn claim(
        &self,
        contest: ContestId,
        user: UserId,
        problem: ProblemId,
        submission: SubmissionId,
        expire_at: DateTime<Utc>,
    ) -> AppResult<MarkerClaim>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Enqueue a leaderboard update.
    async fn forward_update(&self, job: &LeaderboardUpdateJob) -> AppResult<()>;

    /// Hand a run-only outcome back to the caller.
    async fn publish_run(&self, submission: SubmissionId, outcome: &EvaluationOutcome) -> AppResult<()>;
}

pub fn marker_key(contest: ContestId, user: UserId, problem: ProblemId) -> String {
    format!("solved:{}:{}:{}", contest, user, problem)
}

pub fn run_result_key(submission: SubmissionId) -> String {
    format!("run_result:{}", submission)
}

/// Seconds until `expire_at`, never less than a minute.
fn ttl_secs(expire_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expire_at - now).num_seconds().max(MIN_MARKER_TTL_SECS)
}

/// [`SolveMarkers`] and [`Outbox`] over one Redis pool.
#[derive(Clone)]
pub struct RedisBroker {
    pool: deadpool_redis::Pool,
    leaderboard: StreamQueue,
    run_result_ttl_secs: u64,
}

impl RedisBroker {
    pub fn new(pool: deadpool_redis::Pool, leaderboard: StreamQueue, run_result_ttl_secs: u64) -> Self {
        Self {
            pool,
            leaderboard,
            run_result_ttl_secs,
        }
    }
}

#[async_trait]
impl SolveMarkers for RedisBroker {
    async fn claim(
        &self,
        contest: ContestId,
        user: UserId,
        problem: ProblemId,
        submission: SubmissionId,
        expire_at: DateTime<Utc>,
    ) -> AppResult<MarkerClaim> {
        let key = marker_key(contest, user, problem);
        let mut conn = self.pool.get().await?;

        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(submission.to_string())
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(expire_at, Utc::now()))
            .query_async(&mut *conn)
            .await?;

        if set.is_some() {
            return Ok(MarkerClaim::First);
        }

        let holder: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut *conn).await?;
        if holder.as_deref() == Some(submission.to_string().as_str()) {
            Ok(MarkerClaim::Redelivered)
        } else {
            Ok(MarkerClaim::AlreadySolved)
        }
    }
}

#[async_trait]
impl Outbox for RedisBroker {
    async fn forward_update(&self, job: &LeaderboardUpdateJob) -> AppResult<()> {
        let payload = serde_json::to_string(job)?;
        let id = self.leaderboard.publish(&payload).await?;
        tracing::debug!(
            submission_id = %job.submission_id,
            contest_id = %job.contest_id,
            message_id = %id,
            "Forwarded leaderboard update"
        );
        Ok(())
    }

    async fn publish_run(&self, submission: SubmissionId, outcome: &EvaluationOutcome) -> AppResult<()> {
        let body = serde_json::to_string(outcome)?;
        let mut conn = self.pool.get().await?;

        redis::cmd("SET")
            .arg(run_result_key(submission))
            .arg(body)
            .arg("EX")
            .arg(self.run_result_ttl_secs)
            .query_async::<()>(&mut *conn)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    #[test]
    fn test_marker_key_layout() {
        let (c, u, p) = (Uuid::nil(), Uuid::nil(), Uuid::nil());
        assert_eq!(
            marker_key(c, u, p),
            format!("solved:{}:{}:{}", Uuid::nil(), Uuid::nil(), Uuid::nil())
        );
    }

    #[test]
    fn test_ttl_floor() {
        let now = Utc::now();
        assert_eq!(ttl_secs(now - Duration::hours(1), now), MIN_MARKER_TTL_SECS);
        assert_eq!(ttl_secs(now + Duration::hours(2), now), 7200);
    }

    #[test]
    fn test_claim_credit() {
        assert!(MarkerClaim::First.earns_credit());
        assert!(MarkerClaim::Redelivered.earns_credit());
        assert!(!MarkerClaim::AlreadySolved.earns_credit());
    }
}
