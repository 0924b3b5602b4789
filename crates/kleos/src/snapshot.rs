//! Point-in-time archival of live rankings into Postgres.

use std::sync::Arc;

use agon_common::{ContestId, UserId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::store::{RankedEntry, RankingStore};

/// Rows per INSERT; keeps the bind count well under the Postgres limit.
const INSERT_CHUNK: usize = 1000;

/// One archived ranking row.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub contest_id: ContestId,
    pub user_id: UserId,
    /// Decoded points
    pub score: i64,
    pub rank: i64,
    /// Accumulated penalty in milliseconds
    pub time_taken_ms: i64,
    pub captured_at: DateTime<Utc>,
}

impl SnapshotRow {
    pub fn from_entry(contest_id: ContestId, entry: &RankedEntry, captured_at: DateTime<Utc>) -> Self {
        Self {
            contest_id,
            user_id: entry.user_id,
            score: clamp_i64(entry.standing.points),
            rank: clamp_i64(entry.rank),
            time_taken_ms: clamp_i64(entry.standing.penalty_ms()),
            captured_at,
        }
    }
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Append-only destination for snapshot rows.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Returns the number of rows written.
    async fn append(&self, rows: &[SnapshotRow]) -> Result<u64>;
}

pub struct PgSnapshotSink {
    pool: PgPool,
}

impl PgSnapshotSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotSink for PgSnapshotSink {
    async fn append(&self, rows: &[SnapshotRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO leaderboard_snapshots \
                 (contest_id, user_id, score, rank, time_taken_ms, captured_at) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.contest_id)
                    .push_bind(row.user_id)
                    .push_bind(row.score)
                    .push_bind(row.rank)
                    .push_bind(row.time_taken_ms)
                    .push_bind(row.captured_at);
            });

            written += qb
                .build()
                .execute(&mut *tx)
                .await
                .context("Failed to insert leaderboard snapshot rows")?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }
}

/// Copies every active contest's live ranking into the snapshot sink.
pub struct SnapshotJob {
    store: Arc<dyn RankingStore>,
    sink: Arc<dyn SnapshotSink>,
    /// How long after its end a contest is still captured
    lookback: Duration,
    /// How long after its end a contest stays in the active index
    grace: Duration,
}

impl SnapshotJob {
    pub fn new(
        store: Arc<dyn RankingStore>,
        sink: Arc<dyn SnapshotSink>,
        lookback: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            sink,
            lookback,
            grace,
        }
    }

    /// Archive one snapshot of every active contest. Returns the number of
    /// rows written.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        match self.store.prune_ended(now - self.grace).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Pruned {} expired contests from the active index", n),
            Err(e) => tracing::warn!("Failed to prune ended contests: {}", e),
        }

        let contests = self
            .store
            .active_contests(now, self.lookback)
            .await
            .context("Failed to list active contests")?;

        let mut archived = 0;
        for contest in contests {
            match self.capture(contest, now).await {
                Ok(n) => archived += n,
                Err(e) => {
                    tracing::error!(contest_id = %contest, "Snapshot failed: {:#}", e);
                }
            }
        }

        tracing::info!("Snapshot complete: {} rows archived", archived);
        Ok(archived)
    }

    async fn capture(&self, contest: ContestId, now: DateTime<Utc>) -> Result<usize> {
        let ranking = self.store.full_ranking(contest).await?;
        if ranking.is_empty() {
            tracing::debug!(contest_id = %contest, "No ranked users, skipping snapshot");
            return Ok(0);
        }

        let rows: Vec<SnapshotRow> = ranking
            .iter()
            .map(|entry| SnapshotRow::from_entry(contest, entry, now))
            .collect();

        self.sink.append(&rows).await?;
        tracing::debug!(contest_id = %contest, rows = rows.len(), "Contest snapshot archived");
        Ok(rows.len())
    }
}
