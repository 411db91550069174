//! Token-bucket rate limiter.
//!
//! Callers wait for a token up to a bounded timeout; once the timeout is
//! spent the call fails with a rate-limit error instead of queueing without
//! bound.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Configuration for rate limiting one dependency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Sustained requests per second.
    pub requests_per_second: f64,
    /// Requests that can be made instantly from a full bucket.
    pub burst_size: u64,
    /// Longest a caller waits for a token before giving up.
    pub acquire_timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_size: 20,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket for one dependency.
pub struct TokenBucket {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.burst_size as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        Self::refill(&mut state, &self.config);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a token, waiting up to the configured timeout for one to refill.
    /// Returns `false` when the deadline passes without a token.
    pub async fn acquire(&self) -> bool {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                Self::refill(&mut state, &self.config);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return true;
                }
                let needed = 1.0 - state.tokens;
                Duration::from_secs_f64(needed / self.config.requests_per_second)
            };

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(wait.min(deadline - now).min(Duration::from_millis(50))).await;
        }
    }

    fn refill(state: &mut BucketState, config: &RateLimiterConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.tokens =
            (state.tokens + elapsed * config.requests_per_second).min(config.burst_size as f64);
    }
}
