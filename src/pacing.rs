use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::sleep;
use tracing::trace;

pub const BACKOFF_BASE_MS: u64 = 60_000;
pub const BACKOFF_CAP_MS: u64 = 86_400_000;

/// Delay before a failed place may run again. `attempts` is the count
/// recorded before the current failure is added.
pub fn backoff(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    let millis = BACKOFF_BASE_MS
        .saturating_mul(1_u64 << exponent)
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(millis)
}

/// Randomized per-call delay. Every worker owns its jitter, there is no
/// shared token bucket.
#[derive(Clone)]
pub struct Pacer {
    min_ms: u64,
    max_ms: u64,
    rng: Arc<Mutex<StdRng>>,
}

impl Pacer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self::with_rng(min_ms, max_ms, StdRng::from_entropy())
    }

    pub fn with_rng(min_ms: u64, max_ms: u64, rng: StdRng) -> Self {
        Self {
            min_ms,
            max_ms: max_ms.max(min_ms),
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    /// No waiting at all; used by tests and dry runs.
    pub fn disabled() -> Self {
        Self::with_rng(0, 0, StdRng::seed_from_u64(0))
    }

    pub fn next_delay(&self) -> Duration {
        if self.max_ms == 0 {
            return Duration::ZERO;
        }
        let millis = self.rng.lock().gen_range(self.min_ms..=self.max_ms);
        Duration::from_millis(millis)
    }

    pub async fn pause(&self) {
        let delay = self.next_delay();
        if delay.is_zero() {
            return;
        }
        trace!(delay_ms = delay.as_millis() as u64, "pacing before next request");
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_one_minute() {
        assert_eq!(backoff(1), Duration::from_millis(60_000));
        assert_eq!(backoff(2), Duration::from_millis(120_000));
        assert_eq!(backoff(3), Duration::from_millis(240_000));
    }

    #[test]
    fn backoff_is_capped_at_one_day() {
        assert_eq!(backoff(10), Duration::from_millis(30_720_000));
        assert!(backoff(10) <= Duration::from_millis(BACKOFF_CAP_MS));
        assert_eq!(backoff(12), Duration::from_millis(BACKOFF_CAP_MS));
        assert_eq!(backoff(u32::MAX), Duration::from_millis(BACKOFF_CAP_MS));
    }

    #[test]
    fn first_failure_uses_base_unit() {
        assert_eq!(backoff(0), Duration::from_millis(BACKOFF_BASE_MS));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let pacer = Pacer::with_rng(100, 250, StdRng::seed_from_u64(7));
        for _ in 0..50 {
            let delay = pacer.next_delay().as_millis() as u64;
            assert!((100..=250).contains(&delay));
        }
        assert_eq!(Pacer::disabled().next_delay(), Duration::ZERO);
    }
}
