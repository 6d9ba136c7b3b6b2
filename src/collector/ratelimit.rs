//! Token-bucket rate limiter for test cycles and reflector pacing.
//!
//! A floating-point bucket refilled on demand. `acquire` reserves a token
//! up front and sleeps off any debt, so waiters are admitted in the order
//! they arrive at the bucket.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

/// Token bucket dispensing `rate` tokens per second with a burst equal to
/// the rate (minimum one token).
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// `rate` must be positive; config validation enforces this before a
    /// limiter is ever built.
    pub fn new(rate: f64) -> Self {
        debug_assert!(rate > 0.0, "rate limiter requires a positive rate");
        let burst = rate.max(1.0);
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Take one token, returning how long the caller must wait before
    /// acting on it. The bucket may go negative: that is the reservation.
    fn reserve(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.refilled_at = now;
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(-state.tokens / self.rate))
        }
    }

    /// Wait until a token is available.
    pub async fn acquire(&self) {
        if let Some(delay) = self.reserve() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Blocking variant for callers on dedicated threads.
    pub fn acquire_blocking(&self) {
        if let Some(delay) = self.reserve() {
            std::thread::sleep(delay);
        }
    }
}
