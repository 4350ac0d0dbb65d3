//! Cross-shard Identify pacing.
//!
//! Every Identify consumes one unit of the bot's session start budget
//! (reported by `GET /gateway/bot`), and identifies sharing a
//! `shard_id % max_concurrency` bucket must be spaced apart. One pacer
//! is shared by all shards of a client.

use std::time::Duration;

use snafu::prelude::*;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// spacing the platform mandates between identifies in one bucket
const IDENTIFY_SPACING: Duration = Duration::from_secs(5);

/// window length used once the initial `reset_after` has elapsed
const SESSION_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Error when acquiring an identify slot
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum AcquireError {
    /// the session start budget ran out before its reset
    #[snafu(display("session start limit exceeded, resets in {reset_in:?}"))]
    SessionStartLimitExceeded {
        /// time until the budget refills
        reset_in: Duration,
    },
}

/// Session start budget reported by `GET /gateway/bot`.
#[derive(Debug, Clone)]
pub struct SessionStartLimit {
    /// identifies allowed per window
    pub total: u32,
    /// identifies left in the current window
    pub remaining: u32,
    /// time until the current window resets
    pub reset_after: Duration,
    /// number of identify concurrency buckets
    pub max_concurrency: u32,
}

impl Default for SessionStartLimit {
    fn default() -> Self {
        Self {
            total: 1000,
            remaining: 1000,
            reset_after: SESSION_WINDOW,
            max_concurrency: 1,
        }
    }
}

/// Global scheduler bounding how fast shards may send Identify.
#[derive(Debug)]
pub struct IdentifyPacer {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    total: u32,
    remaining: u32,
    reset_at: Instant,
    max_concurrency: u32,
    next_allowed: Vec<Instant>,
}

impl IdentifyPacer {
    /// Build a pacer from the budget the platform reported.
    pub fn new(limit: SessionStartLimit) -> Self {
        let max_concurrency = limit.max_concurrency.max(1);
        let now = Instant::now();

        Self {
            inner: Mutex::new(Inner {
                total: limit.total,
                remaining: limit.remaining,
                reset_at: now + limit.reset_after,
                max_concurrency,
                next_allowed: vec![now; max_concurrency as usize],
            }),
        }
    }

    /// Wait for this shard's identify slot.
    ///
    /// Grants within one `shard_id % max_concurrency` bucket are spaced
    /// five seconds apart. An exhausted budget fails instead of waiting
    /// out the reset window: starting more sessions than the budget
    /// allows invalidates the token, so the caller has to stop.
    pub async fn acquire(&self, shard_id: u32) -> Result<(), AcquireError> {
        loop {
            let wait_until = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();

                if inner.remaining == 0 {
                    if now >= inner.reset_at {
                        inner.remaining = inner.total;
                        inner.reset_at = now + SESSION_WINDOW;
                    } else {
                        return error::SessionStartLimitExceeded {
                            reset_in: inner.reset_at - now,
                        }
                        .fail();
                    }
                }

                let bucket = (shard_id % inner.max_concurrency) as usize;
                if now >= inner.next_allowed[bucket] {
                    inner.next_allowed[bucket] = now + IDENTIFY_SPACING;
                    inner.remaining -= 1;

                    log::debug!(
                        "Identify slot granted to shard {}, {} starts remaining",
                        shard_id,
                        inner.remaining
                    );

                    return Ok(());
                }

                inner.next_allowed[bucket]
            };

            log::trace!("Shard {} waiting for identify bucket", shard_id);
            tokio::time::sleep_until(wait_until).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn limit(remaining: u32, max_concurrency: u32) -> SessionStartLimit {
        SessionStartLimit {
            total: 1000,
            remaining,
            reset_after: Duration::from_secs(3600),
            max_concurrency,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_bucket_grants_are_spaced() {
        let pacer = IdentifyPacer::new(limit(10, 1));

        let started = Instant::now();
        pacer.acquire(0).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);

        pacer.acquire(1).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_buckets_are_independent() {
        let pacer = IdentifyPacer::new(limit(10, 2));

        let started = Instant::now();
        pacer.acquire(0).await.unwrap();
        pacer.acquire(1).await.unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_fails_closed() {
        let pacer = IdentifyPacer::new(limit(1, 1));

        pacer.acquire(0).await.unwrap();

        let err = pacer.acquire(0).await.unwrap_err();
        assert!(matches!(
            err,
            AcquireError::SessionStartLimitExceeded { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_refills_after_reset() {
        let pacer = IdentifyPacer::new(SessionStartLimit {
            total: 5,
            remaining: 0,
            reset_after: Duration::from_secs(10),
            max_concurrency: 1,
        });

        assert!(pacer.acquire(0).await.is_err());

        tokio::time::advance(Duration::from_secs(10)).await;

        pacer.acquire(0).await.unwrap();
    }
}
