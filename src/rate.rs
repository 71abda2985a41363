//! Token-bucket egress rate control.
//!
//! The bucket refills at `rate_per_sec` bytes per second and holds at most
//! one second's worth of tokens. Data and SPM emissions draw from it; NCFs
//! bypass it entirely. Blocking callers sleep until enough tokens have
//! accumulated; non-blocking callers get an immediate verdict.

use std::time::{Duration, Instant};

/// Byte-granularity token bucket.
#[derive(Debug)]
pub struct RateLimiter {
    /// Replenish rate, bytes per second.
    rate_per_sec: u64,

    /// Tokens currently available, bytes.
    tokens: u64,

    /// Last refill time.
    filled_at: Instant,
}

impl RateLimiter {
    /// Create a limiter replenishing at `rate_per_sec` bytes per second.
    /// The bucket starts full.
    pub fn new(rate_per_sec: u64) -> Self {
        debug_assert!(rate_per_sec > 0);
        RateLimiter {
            rate_per_sec,
            tokens: rate_per_sec,
            filled_at: Instant::now(),
        }
    }

    /// Take `bytes` tokens, sleeping until available unless `nonblocking`.
    ///
    /// Returns whether the tokens were granted; `false` only in
    /// non-blocking mode.
    pub fn check(&mut self, bytes: usize, nonblocking: bool) -> bool {
        loop {
            match self.try_take_at(Instant::now(), bytes) {
                Ok(()) => return true,
                Err(wait) => {
                    if nonblocking {
                        return false;
                    }
                    std::thread::sleep(wait);
                }
            }
        }
    }

    /// Attempt to take `bytes` tokens at time `now`; on refusal returns how
    /// long until the bucket could satisfy the request.
    pub(crate) fn try_take_at(&mut self, now: Instant, bytes: usize) -> Result<(), Duration> {
        self.refill(now);
        let bytes = bytes as u64;
        if bytes <= self.tokens {
            self.tokens -= bytes;
            return Ok(());
        }
        let deficit = bytes - self.tokens;
        // a request larger than the bucket capacity never completes in one
        // grant; round the wait up to a full refill
        let wait_us = deficit
            .min(self.rate_per_sec)
            .saturating_mul(1_000_000)
            .div_ceil(self.rate_per_sec);
        Err(Duration::from_micros(wait_us.max(1)))
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.filled_at);
        let new_tokens = (elapsed.as_micros() as u64).saturating_mul(self.rate_per_sec) / 1_000_000;
        if new_tokens > 0 {
            self.tokens = (self.tokens + new_tokens).min(self.rate_per_sec);
            self.filled_at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_burst_granted() {
        let mut rate = RateLimiter::new(10_000);
        let now = Instant::now();
        assert!(rate.try_take_at(now, 10_000).is_ok());
        assert!(rate.try_take_at(now, 1).is_err());
    }

    #[test]
    fn test_nonblocking_reject() {
        let mut rate = RateLimiter::new(1);
        assert!(rate.check(1, true));
        assert!(!rate.check(1000, true));
    }

    #[test]
    fn test_refill_over_time() {
        let mut rate = RateLimiter::new(1_000_000); // 1 byte per microsecond
        let start = Instant::now();
        assert!(rate.try_take_at(start, 1_000_000).is_ok());
        assert!(rate.try_take_at(start, 100).is_err());
        // 200us later, 200 tokens have accumulated
        let later = start + Duration::from_micros(200);
        assert!(rate.try_take_at(later, 100).is_ok());
        assert!(rate.try_take_at(later, 150).is_err());
    }

    #[test]
    fn test_bucket_capped_at_one_second() {
        let mut rate = RateLimiter::new(500);
        let start = Instant::now();
        assert!(rate.try_take_at(start, 500).is_ok());
        let much_later = start + Duration::from_secs(60);
        assert!(rate.try_take_at(much_later, 500).is_ok());
        assert!(rate.try_take_at(much_later, 1).is_err());
    }

    #[test]
    fn test_wait_hint_reasonable() {
        let mut rate = RateLimiter::new(1_000);
        let start = Instant::now();
        assert!(rate.try_take_at(start, 1_000).is_ok());
        let wait = rate.try_take_at(start, 500).unwrap_err();
        assert_eq!(wait, Duration::from_micros(500_000));
    }
}
