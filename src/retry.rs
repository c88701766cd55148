//! Retry policies.
//!
//! Every bounded retry in the engine (conflict-retrying label patches, repair
//! verification) goes through [`retry`] with an explicit [`RetryPolicy`].

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::error::{Error, Result};

// ============================================================================
// Policy
// ============================================================================

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed {
        #[serde(with = "millis")]
        delay: Duration,
    },
    /// Delay grows by `multiplier` per attempt, capped at `max`.
    Exponential {
        #[serde(with = "millis")]
        initial: Duration,
        #[serde(with = "millis")]
        max: Duration,
        multiplier: f64,
    },
}

/// Retry policy: how often to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Fixed-delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
        }
    }

    /// Default policy for optimistic-concurrency conflicts.
    pub fn conflict() -> Self {
        Self::fixed(5, Duration::from_millis(10))
    }

    /// Calculate delay after a given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let base = initial.as_secs_f64() * multiplier.powi(attempt as i32 - 1);
                Duration::from_secs_f64(base.min(max.as_secs_f64()))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::conflict()
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Run `operation` until it succeeds, `should_retry` rejects the error, or the
/// policy's attempts are exhausted. The last error is returned.
pub async fn retry<F, Fut, T, P>(policy: &RetryPolicy, should_retry: P, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0;
    let max_attempts = policy.max_attempts.max(1);

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts || !should_retry(&e) => return Err(e),
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after failure"
                );
                sleep(delay).await;
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
