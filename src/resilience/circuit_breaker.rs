//! Circuit breaker for outbound calls, one instance per named resource.
//!
//! ## States
//!
//! - **Closed**: calls flow; consecutive errors are counted.
//! - **Open**: calls are rejected without running the operation.
//! - **HalfOpen**: one trial call is let through; success closes, failure re-opens.
//!
//! Open → HalfOpen happens lazily on the next call once `open_duration` has
//! passed since the last error, and also proactively from a timer armed when
//! the circuit opens.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

/// Configuration for one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive errors that trip a closed circuit.
    pub errors_before_open: u32,
    /// How long the circuit stays open after the last error.
    #[serde(with = "crate::config::duration_ms")]
    pub open_duration: Duration,
    /// Extra attempts made by `execute_with_retry` / `Guard::run`.
    pub max_retries: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub base_backoff: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub max_backoff: Duration,
    /// Fraction of each backoff that is randomized, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            errors_before_open: 5,
            open_duration: Duration::from_secs(30),
            max_retries: 2,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            jitter: 0.5,
        }
    }
}

impl CircuitBreakerConfig {
    /// Backoff before retry number `attempt` (0-based): exponential, capped,
    /// with the configured jitter fraction removed at random.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let capped = exp.min(self.max_backoff);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return capped;
        }
        let keep = 1.0 - jitter * rand::random::<f64>();
        capped.mul_f64(keep)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Point-in-time view for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub resource: String,
    pub state: BreakerState,
    pub consecutive_errors: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub open_count: u64,
    pub ms_since_last_error: Option<u64>,
    pub ms_since_last_success: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_errors: u32,
    last_error_at: Option<Instant>,
    last_success_at: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped on every trip so a stale half-open timer can tell it lost the race.
    open_epoch: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    opened: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    resource: Arc<str>,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<Inner>>,
    counters: Arc<Counters>,
}

enum Admission {
    Run { trial: bool },
    Reject,
}

impl CircuitBreaker {
    pub fn new(resource: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            resource: Arc::from(resource.into()),
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_errors: 0,
                last_error_at: None,
                last_success_at: None,
                trial_in_flight: false,
                open_epoch: 0,
            })),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Run `op` through the breaker. An open circuit returns
    /// [`CoreError::BreakerOpen`] without calling `op`.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_inner(op, None::<fn() -> T>).await
    }

    /// Like [`execute`](Self::execute), but an open circuit yields `fallback()`
    /// instead of an error. Errors from `op` itself are still returned.
    pub async fn execute_or<T, F, Fut, FB>(&self, op: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> T,
    {
        self.execute_inner(op, Some(fallback)).await
    }

    async fn execute_inner<T, F, Fut, FB>(&self, op: F, fallback: Option<FB>) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> T,
    {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let trial = match self.admit() {
            Admission::Run { trial } => trial,
            Admission::Reject => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                counter!("breaker_rejected_total", "resource" => self.resource.to_string())
                    .increment(1);
                return match fallback {
                    Some(fb) => Ok(fb()),
                    None => Err(CoreError::BreakerOpen {
                        resource: self.resource.to_string(),
                    }),
                };
            }
        };

        let result = op().await;
        match &result {
            Ok(_) => self.on_success(),
            // The upstream answered; a bad payload says nothing about its health.
            Err(CoreError::PermanentValidation(_)) => self.on_success(),
            Err(e) => self.on_error(e),
        }
        if trial {
            self.inner.lock().trial_in_flight = false;
        }
        result
    }

    /// Retry `op` with jittered exponential backoff. Stops on an open circuit
    /// or a non-retryable error.
    pub async fn execute_with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match self.execute(&mut op).await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() || attempt >= self.config.max_retries => return Err(e),
                Err(e) => {
                    let delay = self.config.backoff(attempt);
                    debug!(
                        target: "resilience",
                        resource = %self.resource,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        let since = |t: Option<Instant>| t.map(|t| t.elapsed().as_millis() as u64);
        BreakerStats {
            resource: self.resource.to_string(),
            state: inner.state,
            consecutive_errors: inner.consecutive_errors,
            total_requests: self.counters.total.load(Ordering::Relaxed),
            successful_requests: self.counters.successful.load(Ordering::Relaxed),
            failed_requests: self.counters.failed.load(Ordering::Relaxed),
            rejected_requests: self.counters.rejected.load(Ordering::Relaxed),
            open_count: self.counters.opened.load(Ordering::Relaxed),
            ms_since_last_error: since(inner.last_error_at),
            ms_since_last_success: since(inner.last_success_at),
        }
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Admission::Run { trial: false },
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Reject
                } else {
                    inner.trial_in_flight = true;
                    Admission::Run { trial: true }
                }
            }
            BreakerState::Open => {
                let cooled = inner
                    .last_error_at
                    .map_or(true, |t| t.elapsed() >= self.config.open_duration);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(target: "resilience", resource = %self.resource, "circuit half-open");
                    Admission::Run { trial: true }
                } else {
                    Admission::Reject
                }
            }
        }
    }

    fn on_success(&self) {
        self.counters.successful.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.consecutive_errors = 0;
        inner.last_success_at = Some(Instant::now());
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            info!(target: "resilience", resource = %self.resource, "circuit closed");
        }
    }

    fn on_error(&self, err: &CoreError) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        counter!("breaker_errors_total", "resource" => self.resource.to_string()).increment(1);

        let mut inner = self.inner.lock();
        inner.consecutive_errors = inner.consecutive_errors.saturating_add(1);
        inner.last_error_at = Some(Instant::now());

        let trip = match inner.state {
            BreakerState::Closed => inner.consecutive_errors >= self.config.errors_before_open,
            BreakerState::HalfOpen => true,
            BreakerState::Open => false,
        };
        if trip {
            inner.state = BreakerState::Open;
            inner.open_epoch += 1;
            let epoch = inner.open_epoch;
            drop(inner);

            self.counters.opened.fetch_add(1, Ordering::Relaxed);
            counter!("breaker_open_total", "resource" => self.resource.to_string()).increment(1);
            warn!(
                target: "resilience",
                resource = %self.resource,
                error = %err,
                open_ms = self.config.open_duration.as_millis() as u64,
                "circuit opened"
            );
            self.arm_half_open_timer(epoch);
        }
    }

    fn arm_half_open_timer(&self, epoch: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::downgrade(&self.inner);
        let wait = self.config.open_duration;
        let resource = self.resource.clone();
        handle.spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut g = inner.lock();
            if g.state == BreakerState::Open && g.open_epoch == epoch {
                g.state = BreakerState::HalfOpen;
                debug!(target: "resilience", resource = %resource, "half-open timer fired");
            }
        });
    }
}

/// One breaker per resource name, created on first use.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: std::collections::HashMap<String, CircuitBreakerConfig>,
    breakers: Mutex<std::collections::HashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            ..Self::default()
        }
    }

    pub fn with_override(
        mut self,
        resource: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.overrides.insert(resource.into(), config);
        self
    }

    pub fn get(&self, resource: &str) -> CircuitBreaker {
        let mut map = self.breakers.lock();
        map.entry(resource.to_string())
            .or_insert_with(|| {
                let cfg = self
                    .overrides
                    .get(resource)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                CircuitBreaker::new(resource, cfg)
            })
            .clone()
    }

    pub fn snapshot(&self) -> Vec<BreakerStats> {
        let map = self.breakers.lock();
        let mut out: Vec<_> = map.values().map(CircuitBreaker::stats).collect();
        out.sort_by(|a, b| a.resource.cmp(&b.resource));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            errors_before_open: 3,
            open_duration: Duration::from_secs(10),
            max_retries: 0,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            jitter: 0.0,
        }
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicUsize) -> Result<()> {
        b.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::TransientNetwork("503".into()))
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let b = CircuitBreaker::new("upbit", cfg());
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            assert!(fail(&b, &calls).await.is_err());
            assert_eq!(b.state(), BreakerState::Closed);
        }
        assert!(fail(&b, &calls).await.is_err());
        assert_eq!(b.state(), BreakerState::Open);

        let err = fail(&b, &calls).await.unwrap_err();
        assert!(matches!(err, CoreError::BreakerOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = b.stats();
        assert_eq!(stats.open_count, 1);
        assert_eq!(stats.rejected_requests, 1);
        assert_eq!(stats.failed_requests, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes() {
        let b = CircuitBreaker::new("upbit", cfg());
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let v = b.execute(|| async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.stats().consecutive_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let b = CircuitBreaker::new("upbit", cfg());
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&b, &calls).await;
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.stats().open_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_is_used_when_open() {
        let b = CircuitBreaker::new("bithumb", cfg());
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &calls).await;
        }
        let v = b
            .execute_or(|| async { Ok(vec!["live".to_string()]) }, Vec::new)
            .await
            .unwrap();
        assert!(v.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flips_to_half_open_without_a_call() {
        let b = CircuitBreaker::new("upbit", cfg());
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &calls).await;
        }
        tokio::time::sleep(Duration::from_secs(10) + Duration::from_millis(5)).await;
        for _ in 0..10 {
            if b.state() == BreakerState::HalfOpen {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_permanent_error() {
        let mut c = cfg();
        c.max_retries = 3;
        let b = CircuitBreaker::new("upbit", c);
        let calls = AtomicUsize::new(0);
        let err = b
            .execute_with_retry(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CoreError::PermanentValidation("bad json".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PermanentValidation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_is_capped() {
        let c = cfg();
        assert_eq!(c.backoff(0), Duration::from_millis(10));
        assert_eq!(c.backoff(2), Duration::from_millis(40));
        assert_eq!(c.backoff(10), Duration::from_millis(100));
    }
}
