//! Jittered exponential backoff around sink writes.
//!
//! One [`RetryPolicy::run`] call wraps one terminal send: it retries
//! transient errors with capped exponential backoff (honoring any
//! `Retry-After` hint), stops immediately on permanent errors, and gives up
//! after `max_retries`. The circuit breaker is fed the terminal result only.

use crate::error::SinkError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries beyond the first attempt; total attempts = max_retries + 1.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Relative jitter in [0, 1]; the computed delay is scaled by
    /// `1 + uniform(-jitter, +jitter)`.
    pub jitter_factor: f64,
    /// Per-attempt budget covering connect and read.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.2,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Terminal outcome of a retried send.
#[derive(Debug)]
pub enum RetryError {
    /// A permanent error ended the send; no further attempts were made.
    Permanent { error: SinkError, attempts: u32 },
    /// `max_retries` transient failures in a row; treated as permanent by
    /// the caller.
    Exhausted { error: SinkError, attempts: u32 },
    /// Shutdown interrupted the send; the batch lease will re-surface it.
    Cancelled,
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
            RetryError::Cancelled => 0,
        }
    }

    /// Label value for `edgebot_batches_failed_total{kind}`.
    pub fn kind(&self) -> &'static str {
        match self {
            RetryError::Permanent { .. } => "permanent",
            RetryError::Exhausted { .. } => "exhausted",
            RetryError::Cancelled => "cancelled",
        }
    }

    pub fn message(&self) -> String {
        match self {
            RetryError::Permanent { error, .. } | RetryError::Exhausted { error, .. } => {
                error.to_string()
            }
            RetryError::Cancelled => "cancelled".to_string(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `k + 1`, computed from the index of the
    /// failed attempt `k` (0-based): `min(initial * 2^k, max) * jitter`.
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(1u32.checked_shl(failed_attempt).unwrap_or(u32::MAX));
        let capped = exp.min(self.max_backoff);
        if self.jitter_factor <= 0.0 {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        capped.mul_f64((1.0 + jitter).max(0.0))
    }

    /// Runs `op` until it succeeds, fails permanently, exhausts retries, or
    /// the token is cancelled. Returns the value plus the attempt count.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(T, u32), RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SinkError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = tokio::time::timeout(self.attempt_timeout, op(attempt)) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(SinkError::transient(format!(
                        "attempt timed out after {:?}",
                        self.attempt_timeout
                    ))),
                },
            };

            match result {
                Ok(value) => return Ok((value, attempt + 1)),
                Err(error) if error.is_permanent() => {
                    return Err(RetryError::Permanent {
                        error,
                        attempts: attempt + 1,
                    });
                }
                Err(error) => {
                    if attempt >= self.max_retries {
                        return Err(RetryError::Exhausted {
                            error,
                            attempts: attempt + 1,
                        });
                    }
                    // A Retry-After hint overrides the computed delay, still
                    // clamped to max_backoff.
                    let delay = match error.retry_after() {
                        Some(hint) => hint.min(self.max_backoff),
                        None => self.backoff_for(attempt),
                    };
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient send failure, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
