//! Drift-corrected countdown.
//!
//! Remaining time is always recomputed from the wall clock and the
//! server-stamped `started_at`; nothing is decremented, so a suspended tab
//! that wakes up after minutes shows the correct value on its first tick.

use crate::types::Timestamp;

/// Seconds left in a focus period.
///
/// `remaining = max(0, duration*60 - floor((now - started_at) / 1s))`.
/// A `now` earlier than `started_at` (a client clock running behind the
/// server) reports the full duration.
pub fn remaining_seconds(started_at: Timestamp, duration_minutes: u32, now: Timestamp) -> u32 {
    let total = i64::from(duration_minutes) * 60;
    let elapsed_ms = (now - started_at).num_milliseconds().max(0);
    let elapsed = elapsed_ms.div_euclid(1000);
    (total - elapsed).clamp(0, total) as u32
}

/// Whether the period is over at `now`.
pub fn is_expired(started_at: Timestamp, duration_minutes: u32, now: Timestamp) -> bool {
    remaining_seconds(started_at, duration_minutes, now) == 0
}
