use std::sync::Arc;
use std::time::Duration;

/// Pure mapping from attempt number to retry delay.
///
/// Attempt 0 always yields zero so the first try runs immediately; there is
/// no retry cap at the executor level, so a policy bounds total pressure by
/// saturating at its cap.
pub type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// `min(increment * attempt, cap)`.
pub fn linear(increment: Duration, cap: Duration) -> Backoff {
    Arc::new(move |attempt| increment.saturating_mul(attempt).min(cap))
}

/// `min(base * 2^attempt, cap)` from attempt 1 onward; zero at attempt 0.
pub fn exponential(base: Duration, cap: Duration) -> Backoff {
    Arc::new(move |attempt| {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(cap)
    })
}

/// Policy used when a machine is started without an explicit backoff.
pub fn default_backoff() -> Backoff {
    exponential(Duration::from_millis(10), Duration::from_secs(1))
}
