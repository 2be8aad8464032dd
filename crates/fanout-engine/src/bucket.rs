//! Per-connection token buckets.

use tokio::time::Instant;

/// A lazy token bucket.
///
/// The bucket starts full and refills on access: whole elapsed seconds since
/// the last fill each return `refill_rate` tokens, capped at `capacity`.
/// There is no queueing; a denied caller sees a rate-limit error.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate: u32,
    tokens: u32,
    last_filled: Instant,
}

impl TokenBucket {
    /// Creates a full bucket with the given capacity and per-second refill
    /// rate.
    pub fn new(capacity: u32, refill_rate: u32) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_filled: Instant::now(),
        }
    }

    /// Takes one token if any are available after refilling.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed_secs = now.saturating_duration_since(self.last_filled).as_secs();
        let refill = elapsed_secs.saturating_mul(u64::from(self.refill_rate));
        self.tokens = u64::from(self.tokens)
            .saturating_add(refill)
            .min(u64::from(self.capacity)) as u32;
        self.last_filled = now;

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}
