//! Shared time budget helpers for deterministic orchestration.

use std::time::{Duration, Instant};

/// Return the remaining time budget until the provided deadline, or `None`
/// once the deadline has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}
