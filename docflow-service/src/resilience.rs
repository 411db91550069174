//! Resilience envelope around outbound calls.
//!
//! Three concerns compose per logical call: the rate limiter gates entry,
//! the circuit breaker decides whether an attempt may be made, and the retry
//! loop governs repeated attempts. State is scoped per external dependency
//! name in a concurrent map; two stages talking to the same dependency share
//! one breaker and one bucket, while unrelated dependencies never interfere.

mod circuit_breaker;
mod rate_limit;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limit::{RateLimiterConfig, TokenBucket};
pub use retry::{RetryConfig, backoff_delay};

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ResilienceConfig;
use crate::error::FailureClass;

/// Why a wrapped call failed.
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error("rate limit exceeded for dependency {dependency}")]
    RateLimited { dependency: String },

    #[error("circuit open for dependency {dependency}")]
    CircuitOpen { dependency: String },

    #[error(transparent)]
    Inner(E),
}

/// How a wrapped call produced its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovered<T> {
    /// The dependency answered.
    Primary(T),
    /// The fallback supplied the value after the envelope gave up.
    Fallback(T),
}

impl<T> Recovered<T> {
    pub fn into_inner(self) -> T {
        match self {
            Recovered::Primary(value) | Recovered::Fallback(value) => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Recovered::Fallback(_))
    }
}

struct DependencyControls {
    breaker: CircuitBreaker,
    limiter: TokenBucket,
}

/// Per-dependency resilience state plus the shared policy configuration.
pub struct ResiliencePolicies {
    controls: DashMap<String, Arc<DependencyControls>>,
    breaker_config: CircuitBreakerConfig,
    limiter_config: RateLimiterConfig,
    retry_config: RetryConfig,
}

impl ResiliencePolicies {
    pub fn new(config: &ResilienceConfig) -> Self {
        Self {
            controls: DashMap::new(),
            breaker_config: CircuitBreakerConfig {
                window_size: config.window_size,
                failure_rate_threshold: config.failure_rate_threshold,
                cooldown: config.cooldown(),
                half_open_trials: config.half_open_trials,
            },
            limiter_config: RateLimiterConfig {
                requests_per_second: config.requests_per_second,
                burst_size: config.burst_size,
                acquire_timeout: config.acquire_timeout(),
            },
            retry_config: RetryConfig {
                max_attempts: config.max_attempts,
                base_delay: config.base_delay(),
                max_delay: config.max_delay(),
            },
        }
    }

    fn controls(&self, dependency: &str) -> Arc<DependencyControls> {
        self.controls
            .entry(dependency.to_string())
            .or_insert_with(|| {
                Arc::new(DependencyControls {
                    breaker: CircuitBreaker::new(self.breaker_config),
                    limiter: TokenBucket::new(self.limiter_config),
                })
            })
            .clone()
    }

    /// Breaker state for a dependency, mainly for operational visibility.
    pub fn circuit_state(&self, dependency: &str) -> CircuitState {
        self.controls(dependency).breaker.state()
    }

    /// Run `op` under the full envelope. The closure receives the 0-indexed
    /// attempt number. Transient failures are retried with backoff up to the
    /// attempt cap; permanent failures surface immediately.
    pub async fn call<T, E, F, Fut>(&self, dependency: &str, mut op: F) -> Result<T, CallError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureClass + std::fmt::Display,
    {
        let controls = self.controls(dependency);

        if !controls.limiter.acquire().await {
            counter!("docflow_resilience_rate_limited_total", "dependency" => dependency.to_string())
                .increment(1);
            warn!(dependency = %dependency, "Rate limit wait timed out");
            return Err(CallError::RateLimited {
                dependency: dependency.to_string(),
            });
        }

        let mut last_error = None;
        for attempt in 0..self.retry_config.max_attempts {
            if !controls.breaker.try_acquire() {
                counter!("docflow_resilience_circuit_open_total", "dependency" => dependency.to_string())
                    .increment(1);
                return Err(CallError::CircuitOpen {
                    dependency: dependency.to_string(),
                });
            }

            match op(attempt).await {
                Ok(value) => {
                    controls.breaker.record_success();
                    return Ok(value);
                }
                Err(error) => {
                    controls.breaker.record_failure();
                    let transient = error.is_transient();
                    debug!(
                        dependency = %dependency,
                        attempt,
                        transient,
                        error = %error,
                        "Wrapped call attempt failed"
                    );
                    last_error = Some(error);
                    if !transient {
                        break;
                    }
                    if attempt + 1 < self.retry_config.max_attempts {
                        tokio::time::sleep(backoff_delay(&self.retry_config, attempt)).await;
                    }
                }
            }
        }

        Err(CallError::Inner(last_error.expect("at least one attempt ran")))
    }

    /// Like [`call`](Self::call), but consults `fallback` when the envelope
    /// gives up. A `Some` from the fallback is returned as
    /// [`Recovered::Fallback`]; `None` propagates the original error.
    pub async fn call_with_fallback<T, E, F, Fut, FB>(
        &self,
        dependency: &str,
        op: F,
        fallback: FB,
    ) -> Result<Recovered<T>, CallError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureClass + std::fmt::Display,
        FB: FnOnce(&CallError<E>) -> Option<T>,
    {
        match self.call(dependency, op).await {
            Ok(value) => Ok(Recovered::Primary(value)),
            Err(error) => match fallback(&error) {
                Some(value) => {
                    counter!("docflow_resilience_fallback_total", "dependency" => dependency.to_string())
                        .increment(1);
                    Ok(Recovered::Fallback(value))
                }
                None => Err(error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("permanent")]
        Permanent,
    }

    impl FailureClass for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn policies() -> ResiliencePolicies {
        ResiliencePolicies::new(&crate::config::default_resilience_for_tests())
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let policies = policies();
        let calls = AtomicU32::new(0);

        let result = policies
            .call("dep", |_attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError::Transient)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert!(matches!(result, Ok("done")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let policies = policies();
        let calls = AtomicU32::new(0);

        let result: Result<&str, _> = policies
            .call("dep", |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Permanent) }
            })
            .await;

        assert!(matches!(result, Err(CallError::Inner(TestError::Permanent))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_touching_the_dependency() {
        let policies = policies();

        // Five permanent failures open the 10-wide / 50% circuit.
        for _ in 0..5 {
            let _: Result<&str, _> = policies
                .call("flaky", |_| async { Err(TestError::Permanent) })
                .await;
        }
        assert_eq!(policies.circuit_state("flaky"), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result: Result<&str, _> = policies
            .call("flaky", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok("unreachable") }
            })
            .await;

        assert!(matches!(result, Err(CallError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallback_is_served_when_the_circuit_is_open() {
        let policies = policies();
        for _ in 0..5 {
            let _: Result<&str, _> = policies
                .call("flaky", |_| async { Err(TestError::Permanent) })
                .await;
        }

        let result = policies
            .call_with_fallback(
                "flaky",
                |_| async { Ok::<_, TestError>("unreachable") },
                |error| {
                    assert!(matches!(error, CallError::CircuitOpen { .. }));
                    Some("placeholder")
                },
            )
            .await
            .unwrap();

        assert!(result.is_fallback());
        assert_eq!(result.into_inner(), "placeholder");
    }

    #[tokio::test]
    async fn dependencies_are_isolated() {
        let policies = policies();
        for _ in 0..5 {
            let _: Result<&str, _> = policies
                .call("flaky", |_| async { Err(TestError::Permanent) })
                .await;
        }
        assert_eq!(policies.circuit_state("flaky"), CircuitState::Open);
        assert_eq!(policies.circuit_state("healthy"), CircuitState::Closed);

        let result = policies
            .call("healthy", |_| async { Ok::<_, TestError>(42) })
            .await;
        assert!(matches!(result, Ok(42)));
    }

    #[tokio::test]
    async fn rate_limit_timeout_surfaces_as_rate_limited() {
        let config = crate::config::ResilienceConfig {
            requests_per_second: 0.1,
            burst_size: 1,
            acquire_timeout_ms: 30,
            ..crate::config::default_resilience_for_tests()
        };
        let policies = ResiliencePolicies::new(&config);

        let first = policies
            .call("slow", |_| async { Ok::<_, TestError>(1) })
            .await;
        assert!(first.is_ok());

        let second = policies
            .call("slow", |_| async { Ok::<_, TestError>(2) })
            .await;
        assert!(matches!(second, Err(CallError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn half_open_trial_success_closes_the_circuit() {
        let config = crate::config::ResilienceConfig {
            cooldown_secs: 0,
            ..crate::config::default_resilience_for_tests()
        };
        let policies = ResiliencePolicies::new(&config);

        for _ in 0..5 {
            let _: Result<&str, _> = policies
                .call("flaky", |_| async { Err(TestError::Permanent) })
                .await;
        }
        assert_eq!(policies.circuit_state("flaky"), CircuitState::Open);

        // Cooldown of zero: the next call is the half-open trial.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let result = policies
            .call("flaky", |_| async { Ok::<_, TestError>("recovered") })
            .await;
        assert!(matches!(result, Ok("recovered")));
        assert_eq!(policies.circuit_state("flaky"), CircuitState::Closed);
    }
}
