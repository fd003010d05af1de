//! Retry policy for remote mailbox and storage calls.
//!
//! Classification is a pure function of the HTTP status and the error reason
//! token Gmail puts in its error body. Throttling and server-side failures are
//! retried with exponential backoff and jitter; everything else is returned to
//! the caller on the first failure.

use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Permanent,
}

/// `status` is `None` for transport failures (connect, reset, timeout), which
/// are always worth another attempt.
pub fn classify(status: Option<u16>, reason: Option<&str>) -> RetryDecision {
    match status {
        None => RetryDecision::Retry,
        Some(429) => RetryDecision::Retry,
        Some(500..=599) => RetryDecision::Retry,
        Some(403) if reason.is_some_and(is_throttle_reason) => RetryDecision::Retry,
        Some(_) => RetryDecision::Permanent,
    }
}

fn is_throttle_reason(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    reason.contains("ratelimit") || reason == "backenderror"
}

/// Errors that know how they should be retried.
pub trait Retryable {
    fn retry_decision(&self) -> RetryDecision;
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `call` until it succeeds, fails permanently, or attempts run out.
    /// The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_attempts
                        || err.retry_decision() == RetryDecision::Permanent
                    {
                        return Err(err);
                    }

                    let pause = jittered(delay);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = pause.as_millis() as u64,
                        error = %err,
                        "retrying remote call"
                    );
                    self.sleeper.sleep(pause).await;
                    delay = delay.saturating_mul(2).min(self.max_delay);
                    attempt += 1;
                }
            }
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
    delay.mul_f64(factor)
}
