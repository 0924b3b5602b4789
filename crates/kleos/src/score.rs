//! Combined score encoding.
//!
//! A standing is stored as one real number so that a single descending
//! sorted-set scan orders users by points, then by smaller penalty:
//!
//! ```text
//! combined = points + (MAX_PENALTY_UNITS - penalty_minutes) / (MAX_PENALTY_UNITS + 1)
//! ```
//!
//! The fractional term lies in `(0, 1)` for every penalty in
//! `[0, MAX_PENALTY_UNITS)`, so the integer part is always the points.

use serde::{Deserialize, Serialize};

/// Penalty resolution; penalties are clamped below this many minutes.
pub const MAX_PENALTY_UNITS: u64 = 1_000_000;

const MS_PER_MINUTE: u64 = 60_000;

/// Decoded standing of one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Standing {
    pub points: u64,
    pub penalty_minutes: u64,
}

impl Standing {
    pub fn new(points: u64, penalty_minutes: u64) -> Self {
        Self {
            points,
            penalty_minutes: clamp_penalty(penalty_minutes),
        }
    }

    pub fn encode(&self) -> f64 {
        encode(self.points, self.penalty_minutes)
    }

    pub fn penalty_ms(&self) -> u64 {
        self.penalty_minutes * MS_PER_MINUTE
    }
}

fn clamp_penalty(penalty_minutes: u64) -> u64 {
    penalty_minutes.min(MAX_PENALTY_UNITS - 1)
}

/// Whole minutes of a millisecond penalty.
pub fn penalty_minutes(penalty_ms: u64) -> u64 {
    clamp_penalty(penalty_ms / MS_PER_MINUTE)
}

pub fn encode(points: u64, penalty_minutes: u64) -> f64 {
    let penalty = clamp_penalty(penalty_minutes);
    points as f64 + (MAX_PENALTY_UNITS - penalty) as f64 / (MAX_PENALTY_UNITS + 1) as f64
}

pub fn decode(score: f64) -> Standing {
    if !score.is_finite() || score <= 0.0 {
        return Standing::new(0, MAX_PENALTY_UNITS - 1);
    }

    let points = score.floor();
    let units = ((score - points) * (MAX_PENALTY_UNITS + 1) as f64).round() as u64;

    Standing::new(points as u64, MAX_PENALTY_UNITS.saturating_sub(units))
}
