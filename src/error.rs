//! Error taxonomy for the detection-to-dispatch core.
//!
//! Duplicates, lock contention and stale locks are deliberately absent here:
//! they are ordinary status values (`InsertOutcome::Duplicate`, a `false`
//! from `try_acquire_leadership`) and never surface as failures.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Timeouts, connection resets, 5xx. Retried with backoff; trips the breaker.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Malformed notice, no extractable ticker, bad config value. Never retried.
    #[error("validation error: {0}")]
    PermanentValidation(String),

    /// The resource's circuit is open and no fallback was supplied.
    #[error("circuit breaker open for {resource}")]
    BreakerOpen { resource: String },

    /// Attempts were exhausted while the rate limiter kept the resource throttled.
    #[error("rate limited on {resource}, retry after {retry_after:?}")]
    RateLimited {
        resource: String,
        retry_after: Duration,
    },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

impl CoreError {
    /// Whether a retry loop may try the same call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::TransientNetwork(_) | CoreError::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        let permanent = err.is_decode()
            || err.is_builder()
            || err
                .status()
                .is_some_and(|s| s.is_client_error() && s.as_u16() != 429);
        if permanent {
            CoreError::PermanentValidation(err.to_string())
        } else {
            CoreError::TransientNetwork(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(CoreError::TransientNetwork("timeout".into()).is_retryable());
        assert!(CoreError::RateLimited {
            resource: "upbit".into(),
            retry_after: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!CoreError::PermanentValidation("no ticker".into()).is_retryable());
        assert!(!CoreError::BreakerOpen {
            resource: "upbit".into()
        }
        .is_retryable());
    }
}
