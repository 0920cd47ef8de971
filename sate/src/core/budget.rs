//! Shared time budget helpers for deterministic orchestration.
//!
//! Callers pass `now` explicitly so decisions are reproducible in tests.

use std::time::{Duration, Instant};

/// Time left until `limit` measured from `start`. `None` means unlimited.
pub fn remaining_budget(start: Instant, limit: Option<Duration>, now: Instant) -> Option<Duration> {
    let limit = limit?;
    let elapsed = now.saturating_duration_since(start);
    Some(limit.saturating_sub(elapsed))
}

/// True once `limit` has fully elapsed since `start`.
pub fn limit_reached(start: Instant, limit: Option<Duration>, now: Instant) -> bool {
    remaining_budget(start, limit, now).is_some_and(|left| left.is_zero())
}
