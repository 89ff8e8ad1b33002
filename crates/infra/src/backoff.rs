//! Retry pacing shared by the background loops.

use std::time::Duration;

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `cap`.
///
/// `attempt` is 1-based; attempt 0 is treated as 1.
pub fn backoff(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let pow = 1u32 << attempt.saturating_sub(1).min(16);
    let ms = base.as_millis().saturating_mul(pow as u128);
    Duration::from_millis(ms.min(cap.as_millis()) as u64)
}
