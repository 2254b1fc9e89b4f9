//! Exponential backoff with jitter for transient push failures.

use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff: `min(base * 2^(attempt-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// [`delay`](Self::delay) plus up to a quarter of it in random jitter.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let spread = delay.as_millis() as u64 / 4;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    #[test]
    fn doubles_from_base() {
        let b = backoff();
        assert_eq!(b.delay(1), Duration::from_secs(1));
        assert_eq!(b.delay(2), Duration::from_secs(2));
        assert_eq!(b.delay(3), Duration::from_secs(4));
        assert_eq!(b.delay(5), Duration::from_secs(16));
    }

    #[test]
    fn capped_at_max() {
        let b = backoff();
        assert_eq!(b.delay(7), Duration::from_secs(60));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn zero_attempt_uses_base() {
        assert_eq!(backoff().delay(0), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn jitter_stays_within_a_quarter(attempt in 1u32..40) {
            let b = backoff();
            let delay = b.delay(attempt);
            let jittered = b.jittered(attempt);
            prop_assert!(jittered >= delay);
            prop_assert!(jittered <= delay + delay / 4);
        }
    }
}
