//! Lazy-refill token bucket. No timers: every call advances the bucket to "now" based on
//! wall-clock elapsed time, the same no-background-task approach the teacher's `RateLimiter`
//! uses for its sliding window (`rate_limit.rs`), just with a refill curve instead of a
//! retained history of instants.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u64,
    refill_tokens: u64,
    refill_interval: Duration,
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_tokens: u64, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_tokens,
            refill_interval,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.refill_interval.is_zero() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        let periods = (elapsed.as_nanos() / self.refill_interval.as_nanos().max(1)) as u64;
        if periods == 0 {
            return;
        }
        self.tokens = self
            .tokens
            .saturating_add(periods.saturating_mul(self.refill_tokens))
            .min(self.capacity);
        self.last_refill += self.refill_interval * periods as u32;
    }

    /// Lazily refills based on elapsed wall-clock time, then deducts `n` tokens iff at least
    /// `n` are available. Returns whether the deduction happened.
    pub fn take(&mut self, n: u64) -> bool {
        self.refill(Instant::now());
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn take_at(&mut self, n: u64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_and_drains() {
        let mut bucket = TokenBucket::new(3, 1, Duration::from_secs(10));
        assert!(bucket.take(3));
        assert!(!bucket.take(1));
    }

    #[test]
    fn refill_after_k_intervals_then_drains_again() {
        // R3: no calls for k*interval, then take(cap) succeeds once, take(1) fails next.
        let mut bucket = TokenBucket::new(5, 5, Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(bucket.take_at(5, t0));
        assert!(!bucket.take_at(1, t0));

        let t1 = t0 + Duration::from_secs(3); // 3 intervals elapsed
        assert!(bucket.take_at(5, t1));
        assert!(!bucket.take_at(1, t1));
    }

    #[test]
    fn partial_interval_does_not_refill() {
        let mut bucket = TokenBucket::new(2, 2, Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(bucket.take_at(2, t0));
        let t1 = t0 + Duration::from_secs(5);
        assert!(!bucket.take_at(1, t1));
    }

    #[test]
    fn repeated_rapid_calls_are_idempotent_with_refill_math() {
        let mut bucket = TokenBucket::new(10, 10, Duration::from_secs(10));
        let t0 = Instant::now();
        for _ in 0..10 {
            assert!(bucket.take_at(1, t0));
        }
        assert!(!bucket.take_at(1, t0));
    }
}
