//! Retry backoff and human-like pacing delays.

use std::time::Duration;

use rand::Rng;

/// Ceiling for any single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at [`MAX_BACKOFF`].
///
/// `attempt` is 1-based; attempt 0 is treated as 1.
pub fn exponential(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}

/// Pick a random delay in `range_ms` (inclusive). A `(0, 0)` range is no delay.
pub fn random_delay(range_ms: (u64, u64)) -> Duration {
    let (min, max) = range_ms;
    if max == 0 || min > max {
        return Duration::from_millis(min.min(max));
    }
    // ThreadRng is not Send; keep it out of any await.
    let ms = rand::thread_rng().gen_range(min..=max);
    Duration::from_millis(ms)
}
