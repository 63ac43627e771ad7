//! Per-resource fixed-window rate limiter with a failure backoff penalty.
//!
//! Checking admission is side-effect free. Every executed request is
//! counted against the window through `record_success` / `record_failure`,
//! and windows rotate lazily on the first record after `reset_at`.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub time_window: Duration,
    /// Penalty after the first consecutive failure.
    #[serde(with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Calls made by `execute_with_rate_limit` before giving up.
    pub max_attempts: u32,
    /// Total time `execute_with_rate_limit` may spend waiting for admission.
    #[serde(with = "crate::config::duration_ms")]
    pub max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            time_window: Duration::from_secs(1),
            base_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
            max_wait: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Penalty after `failures` consecutive failures (1-based).
    pub fn penalty(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.max(1.0).powi((failures - 1).min(32) as i32);
        let nanos = (self.base_delay.as_nanos() as f64 * factor).round();
        if nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    WindowExhausted,
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub delay: Option<Duration>,
    pub reason: Option<DenyReason>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            delay: None,
            reason: None,
        }
    }

    fn deny(delay: Duration, reason: DenyReason) -> Self {
        Self {
            allowed: false,
            delay: Some(delay),
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
    consecutive_failures: u32,
    penalty_until: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub resource: String,
    pub count: u32,
    pub max_requests: u32,
    pub consecutive_failures: u32,
    pub ms_until_reset: u64,
    pub ms_penalty_remaining: u64,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    default_config: RateLimitConfig,
    overrides: HashMap<String, RateLimitConfig>,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            ..Self::default()
        }
    }

    pub fn with_override(mut self, resource: impl Into<String>, config: RateLimitConfig) -> Self {
        self.overrides.insert(resource.into(), config);
        self
    }

    pub fn config_for(&self, resource: &str) -> &RateLimitConfig {
        self.overrides.get(resource).unwrap_or(&self.default_config)
    }

    /// Admission check. Does not consume a slot.
    pub fn can_make_request(&self, resource: &str) -> RateDecision {
        let cfg = self.config_for(resource);
        let now = Instant::now();
        let windows = self.windows.lock();
        let Some(w) = windows.get(resource) else {
            return RateDecision::allow();
        };

        if let Some(until) = w.penalty_until {
            if until > now {
                return RateDecision::deny(until - now, DenyReason::Backoff);
            }
        }
        let count = if now >= w.reset_at { 0 } else { w.count };
        if count >= cfg.max_requests {
            return RateDecision::deny(w.reset_at - now, DenyReason::WindowExhausted);
        }
        RateDecision::allow()
    }

    pub fn record_success(&self, resource: &str) {
        self.record(resource, true);
    }

    pub fn record_failure(&self, resource: &str) {
        self.record(resource, false);
    }

    fn record(&self, resource: &str, success: bool) {
        let cfg = self.config_for(resource);
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let w = windows.entry(resource.to_string()).or_insert(Window {
            count: 0,
            reset_at: now + cfg.time_window,
            consecutive_failures: 0,
            penalty_until: None,
        });
        if now >= w.reset_at {
            w.count = 0;
            w.reset_at = now + cfg.time_window;
        }
        w.count = w.count.saturating_add(1);

        if success {
            w.consecutive_failures = 0;
            w.penalty_until = None;
        } else {
            w.consecutive_failures = w.consecutive_failures.saturating_add(1);
            let penalty = cfg.penalty(w.consecutive_failures);
            w.penalty_until = Some(now + penalty);
            debug!(
                target: "resilience",
                resource,
                failures = w.consecutive_failures,
                penalty_ms = penalty.as_millis() as u64,
                "rate limiter penalty applied"
            );
        }
    }

    /// Sleep until `resource` is admitted, or fail with
    /// [`CoreError::RateLimited`] once `max_wait` would be exceeded.
    pub async fn wait_until_allowed(&self, resource: &str) -> Result<()> {
        let max_wait = self.config_for(resource).max_wait;
        let started = Instant::now();
        loop {
            let decision = self.can_make_request(resource);
            if decision.allowed {
                return Ok(());
            }
            let delay = decision.delay.unwrap_or(self.config_for(resource).base_delay);
            counter!("ratelimit_denied_total", "resource" => resource.to_string()).increment(1);
            if started.elapsed() + delay > max_wait {
                return Err(CoreError::RateLimited {
                    resource: resource.to_string(),
                    retry_after: delay,
                });
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Wait for admission, run `op`, record its outcome, and retry retryable
    /// failures up to `max_attempts` calls in total.
    pub async fn execute_with_rate_limit<T, F, Fut>(&self, resource: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config_for(resource).max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            self.wait_until_allowed(resource).await?;
            attempt += 1;
            match op().await {
                Ok(v) => {
                    self.record_success(resource);
                    return Ok(v);
                }
                Err(e) => {
                    self.record_failure(resource);
                    if !e.is_retryable() || attempt >= max_attempts {
                        return Err(e);
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<RateLimitStats> {
        let now = Instant::now();
        let windows = self.windows.lock();
        let mut out: Vec<_> = windows
            .iter()
            .map(|(resource, w)| {
                let rotated = now >= w.reset_at;
                RateLimitStats {
                    resource: resource.clone(),
                    count: if rotated { 0 } else { w.count },
                    max_requests: self.config_for(resource).max_requests,
                    consecutive_failures: w.consecutive_failures,
                    ms_until_reset: w.reset_at.saturating_duration_since(now).as_millis() as u64,
                    ms_penalty_remaining: w
                        .penalty_until
                        .map(|p| p.saturating_duration_since(now).as_millis() as u64)
                        .unwrap_or(0),
                }
            })
            .collect();
        out.sort_by(|a, b| a.resource.cmp(&b.resource));
        out
    }
}
