//! Exponential backoff with jitter.

use crate::config::RetrySettings;
use crate::{HephaestusError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry schedule for agent invocations.
///
/// Delay for attempt n is `min(max_delay, base_delay * 2^(n-1))`
/// stretched by a random jitter factor in `[1-jitter, 1+jitter]`.
/// Non-retryable errors and cancellation end the loop immediately;
/// a server-provided `retry_after` hint floors the computed delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: settings.base_delay,
            max_delay: settings.max_delay,
            jitter: settings.jitter,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt
    /// budget is spent. The final error carries the attempt count when
    /// retries were actually consumed.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(HephaestusError::cancelled("cancelled before attempt"));
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(HephaestusError::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt, e.retry_after());
                    warn!(
                        "Attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, self.max_attempts, e, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            debug!("Retry wait cancelled");
                            return Err(HephaestusError::cancelled("cancelled during retry wait"));
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Backoff delay for the given (1-based) attempt.
    pub fn delay_for(&self, attempt: u32, server_hint: Option<Duration>) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << (attempt - 1).min(16))
            .min(self.max_delay);
        let factor = if self.jitter > 0.0 {
            1.0 + self.jitter * rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            1.0
        };
        let jittered = exp.mul_f64(factor.max(0.0));
        match server_hint {
            Some(hint) => jittered.max(hint),
            None => jittered,
        }
    }
}
