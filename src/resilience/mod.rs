//! Resilience layer for outbound calls: rate limiting, circuit breaking,
//! timeouts and jittered retries, keyed by resource name.

pub mod circuit_breaker;
pub mod rate_limiter;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use circuit_breaker::{
    BreakerRegistry, BreakerState, BreakerStats, CircuitBreaker, CircuitBreakerConfig,
};
pub use rate_limiter::{DenyReason, RateDecision, RateLimitConfig, RateLimitStats, RateLimiter};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    /// Per-call timeout applied inside the breaker.
    #[serde(with = "crate::config::duration_ms")]
    pub call_timeout: Duration,
    /// Settings for one resource (a source or exchange name).
    pub overrides: HashMap<String, ResourceOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceOverride {
    pub breaker: Option<CircuitBreakerConfig>,
    pub rate_limit: Option<RateLimitConfig>,
}

/// Rate limiter + per-resource breakers + timeout, composed in that order.
#[derive(Debug)]
pub struct Guard {
    breakers: BreakerRegistry,
    limiter: RateLimiter,
    call_timeout: Duration,
}

impl Guard {
    pub fn new(cfg: &ResilienceConfig) -> Self {
        let call_timeout = if cfg.call_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.call_timeout
        };
        let mut breakers = BreakerRegistry::new(cfg.breaker.clone());
        let mut limiter = RateLimiter::new(cfg.rate_limit.clone());
        for (resource, o) in &cfg.overrides {
            if let Some(b) = &o.breaker {
                breakers = breakers.with_override(resource.clone(), b.clone());
            }
            if let Some(r) = &o.rate_limit {
                limiter = limiter.with_override(resource.clone(), r.clone());
            }
        }
        Self {
            breakers,
            limiter,
            call_timeout,
        }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run `op` against `resource`. Each attempt waits for rate-limit
    /// admission, goes through the resource's breaker under a timeout, and
    /// records its outcome with both layers. Retryable failures are retried
    /// with the breaker's backoff.
    pub async fn run<T, F, Fut>(&self, resource: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breakers.get(resource);
        let timeout = self.call_timeout;
        let mut attempt = 0u32;

        loop {
            self.limiter.wait_until_allowed(resource).await?;

            let fut = op();
            let result = breaker
                .execute(|| async move {
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(r) => r,
                        Err(_) => Err(CoreError::TransientNetwork(format!(
                            "{resource}: timed out after {}ms",
                            timeout.as_millis()
                        ))),
                    }
                })
                .await;

            match &result {
                Ok(_) => self.limiter.record_success(resource),
                // Rejected by the breaker: nothing went over the wire.
                Err(CoreError::BreakerOpen { .. }) => {}
                Err(_) => self.limiter.record_failure(resource),
            }

            match result {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() || attempt >= breaker.config().max_retries => {
                    return Err(e)
                }
                Err(e) => {
                    let delay = breaker.config().backoff(attempt);
                    warn!(
                        target: "resilience",
                        resource,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard(max_retries: u32) -> Guard {
        Guard::new(&ResilienceConfig {
            breaker: CircuitBreakerConfig {
                errors_before_open: 2,
                max_retries,
                jitter: 0.0,
                ..CircuitBreakerConfig::default()
            },
            rate_limit: RateLimitConfig {
                max_requests: 100,
                ..RateLimitConfig::default()
            },
            call_timeout: Duration::from_millis(50),
            overrides: HashMap::new(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn per_resource_overrides_apply_only_to_their_resource() {
        let strict = ResourceOverride {
            breaker: Some(CircuitBreakerConfig {
                errors_before_open: 1,
                max_retries: 0,
                jitter: 0.0,
                ..CircuitBreakerConfig::default()
            }),
            rate_limit: Some(RateLimitConfig {
                max_requests: 1,
                ..RateLimitConfig::default()
            }),
        };
        let g = Guard::new(&ResilienceConfig {
            overrides: HashMap::from([("bithumb".to_string(), strict)]),
            ..ResilienceConfig::default()
        });

        assert_eq!(g.limiter().config_for("bithumb").max_requests, 1);
        assert_eq!(
            g.limiter().config_for("upbit").max_requests,
            RateLimitConfig::default().max_requests
        );

        let err = g
            .run("bithumb", || async {
                Err::<(), _>(CoreError::TransientNetwork("reset".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TransientNetwork(_)));
        assert_eq!(g.breakers().get("bithumb").state(), BreakerState::Open);
        assert_eq!(g.breakers().get("upbit").state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_transient_failure() {
        let g = guard(0);
        let err = g
            .run("slow", || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(1)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TransientNetwork(_)));
        assert_eq!(g.breakers().get("slow").stats().consecutive_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_breaker_opens() {
        let g = guard(5);
        let calls = AtomicUsize::new(0);
        let err = g
            .run("flaky", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CoreError::TransientNetwork("502".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BreakerOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(g.breakers().get("flaky").state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn success_passes_through() {
        let g = guard(1);
        let v = g.run("ok", || async { Ok("markets") }).await.unwrap();
        assert_eq!(v, "markets");
        assert_eq!(g.limiter().snapshot()[0].count, 1);
    }
}
