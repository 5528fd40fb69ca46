// Utility helpers

use crate::constants::{LEADERBOARD_DEFAULT_LIMIT, LEADERBOARD_MAX_LIMIT};

/// Bounds a requested leaderboard size to `1..=LEADERBOARD_MAX_LIMIT`.
pub fn clamp_leaderboard_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(LEADERBOARD_DEFAULT_LIMIT)
        .clamp(1, LEADERBOARD_MAX_LIMIT)
}
