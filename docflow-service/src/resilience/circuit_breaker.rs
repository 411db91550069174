//! Circuit breaker over a sliding window of call outcomes.
//!
//! The breaker opens once the failure rate over the last N recorded calls
//! reaches the configured threshold. While open, calls fail fast for a
//! cooldown period; after the cooldown a bounded number of trial calls is
//! admitted (half-open). A trial success closes the circuit, a trial failure
//! reopens it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of recent call outcomes tracked.
    pub window_size: usize,
    /// Failure rate over the window that opens the circuit.
    pub failure_rate_threshold: f64,
    /// How long an open circuit fails fast before going half-open.
    pub cooldown: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_rate_threshold: 0.5,
            cooldown: Duration::from_secs(30),
            half_open_trials: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Failures within the window needed to open the circuit.
    fn open_threshold(&self) -> usize {
        ((self.window_size as f64) * self.failure_rate_threshold).ceil() as usize
    }
}

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests are allowed.
    Closed,
    /// Requests fail fast.
    Open,
    /// A bounded number of trial requests is allowed.
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    /// Outcomes of the last `window_size` calls, `true` = failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trials_admitted: u32,
}

/// Sliding-window circuit breaker for one external dependency.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.window_size),
                opened_at: None,
                trials_admitted: 0,
            }),
        }
    }

    /// Whether a call may proceed right now.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.cooldown);
                if !cooled_down {
                    return false;
                }
                inner.state = CircuitState::HalfOpen;
                inner.trials_admitted = 1;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trials_admitted < self.config.half_open_trials {
                    inner.trials_admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                Self::push_outcome(&mut inner.window, self.config.window_size, false);
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.window.clear();
                inner.opened_at = None;
                inner.trials_admitted = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                Self::push_outcome(&mut inner.window, self.config.window_size, true);
                let failures = inner.window.iter().filter(|failed| **failed).count();
                if failures >= self.config.open_threshold() {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trials_admitted = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    fn push_outcome(window: &mut VecDeque<bool>, capacity: usize, failed: bool) {
        if window.len() == capacity {
            window.pop_front();
        }
        window.push_back(failed);
    }
}
