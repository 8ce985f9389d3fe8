//! Retry delays for failed tasks.

use std::time::Duration;

/// Exponential backoff: `2^retry_count` minutes, capped at `cap_minutes`.
///
/// With the default cap of 4096 minutes the delay stops growing after the
/// twelfth retry (about 68 hours).
pub fn backoff(retry_count: u32, cap_minutes: u64) -> Duration {
    let minutes = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX).min(cap_minutes);
    Duration::from_secs(minutes.saturating_mul(60))
}
