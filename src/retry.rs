//! Retry and backoff shared by the feed (reconnects) and the executor (order calls).

use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Retryable;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,   // Attempts after the first
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,       // +/-25% random spread
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Stop-loss / take-profit placement: more attempts, shorter waits
    pub fn protective() -> Self {
        Self {
            max_retries: 8,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Market data reconnects: never give up
    pub fn feed() -> Self {
        Self {
            max_retries: u32::MAX,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Capped exponential backoff without jitter for the given attempt (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let exp = attempt.min(30) as i32;
        let delay = base * self.backoff_multiplier.max(1.0).powi(exp);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    /// Backoff with jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-0.25..=0.25);
        let millis = delay.as_millis() as f64 * (1.0 + spread);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

/// Run `operation` until it succeeds, fails terminally, or retries run out
///
/// The last error is returned unchanged so callers can still classify it.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= policy.max_retries => {
                warn!(error = %e, attempts = attempt + 1, "Retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = e.retry_after().unwrap_or_else(|| policy.delay_for(attempt));
                warn!(
                    error = %e,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
