//! Retry delay computation shared by gateway reconnects and REST retries.

use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with randomized jitter.
///
/// Delays grow as `base * 2^attempt`, clamp to `max`, then scale by a
/// random factor in `0.5..=1.0` so parallel clients do not retry in
/// lockstep.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1 << self.attempt.min(16));
        let capped = exp.min(self.max);
        self.attempt += 1;

        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        capped.mul_f64(factor)
    }

    /// Attempts made since the last [`reset`](Self::reset).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_delay_within_jitter_bounds() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(500));
        assert!(first <= Duration::from_secs(1));

        let second = backoff.next_delay();
        assert!(second >= Duration::from_secs(1));
        assert!(second <= Duration::from_secs(2));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(30));
        }

        assert_eq!(backoff.attempt(), 20);
    }

    #[test]
    fn test_reset_restarts_growth() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= Duration::from_secs(1));
    }
}
