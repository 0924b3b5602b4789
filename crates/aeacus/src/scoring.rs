//! Score and penalty rules for scored submissions.

use chrono::{DateTime, Duration, Utc};
use kleos::score;
use tartarus::EvaluationOutcome;

use crate::services::ContestWindow;

/// Full marks on `AC`, nothing otherwise.
pub fn award(outcome: &EvaluationOutcome, max_score: u32) -> u32 {
    if outcome.is_accepted() { max_score } else { 0 }
}

/// Penalty time in milliseconds.
///
/// Practice mode charges the execution time. Contest mode charges the time
/// elapsed between contest start and submission, clamped at zero.
pub fn penalty_ms(
    outcome: &EvaluationOutcome,
    submitted_at: DateTime<Utc>,
    contest: Option<&ContestWindow>,
) -> u64 {
    match contest {
        None => outcome.time_taken_ms,
        Some(window) => (submitted_at - window.start_time).num_milliseconds().max(0) as u64,
    }
}

/// Combined leaderboard score of one solve.
pub fn combined_score(points: u32, penalty_ms: u64) -> f64 {
    score::encode(u64::from(points), score::penalty_minutes(penalty_ms))
}

/// Expiry of a first-solve marker: contest end plus the grace window.
pub fn marker_expiry(window: &ContestWindow, grace_secs: u64) -> DateTime<Utc> {
    i64::try_from(grace_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|grace| window.end_time.checked_add_signed(grace))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
