//! Global rate limiting across the API key pool.
//!
//! A call is admitted only when three gates agree: the global
//! concurrency semaphore has a slot, the per-minute token bucket has a
//! token, and the key pool has a healthy key. `wait_for_permit` blocks
//! through all three gates and honors cancellation at each.

use crate::config::LimiterSettings;
use crate::{HephaestusError, Result};
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod key_pool;

pub use key_pool::{KeyHandle, KeyHealth, KeyPool, KeyState};

/// Fallback wait when no cooldown deadline is known.
const KEY_WAIT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSnapshot {
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub calls_per_minute: u32,
    pub keys: Vec<KeyHealth>,
}

/// An admitted call: holds the concurrency slot and the selected key.
/// Callers must report the outcome through one of the consuming
/// methods; dropping the permit without a report releases the key with
/// no outcome recorded (a cancelled call).
pub struct Permit {
    pub key: KeyHandle,
    pool: KeyPool,
    reported: bool,
    _slot: OwnedSemaphorePermit,
}

impl Permit {
    pub fn succeed(mut self) {
        self.pool.report_success(&self.key.id);
        self.reported = true;
    }

    pub fn fail_retryable(mut self) {
        self.pool.report_retryable_failure(&self.key.id);
        self.reported = true;
    }

    pub fn fail_hard(mut self) {
        self.pool.report_hard_failure(&self.key.id);
        self.reported = true;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.reported {
            self.pool.release(&self.key.id);
        }
    }
}

pub struct RateLimiter {
    bucket: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
    clock: DefaultClock,
    /// Hard ceiling on in-flight external calls. Fixed for the process
    /// lifetime; the adaptive worker pool scales beneath it.
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    calls_per_minute: u32,
    pool: KeyPool,
}

impl RateLimiter {
    pub fn new(settings: &LimiterSettings) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(settings.calls_per_minute).unwrap_or(NonZeroU32::MIN),
        );
        let keys = if settings.keys.is_empty() {
            // Credential-less operation (local invokers, tests): a
            // single anonymous key keeps the pool machinery uniform.
            info!("No API keys configured, using anonymous local key");
            vec![crate::config::KeySettings {
                id: "local".to_string(),
                provider: "local".to_string(),
                secret: String::new(),
            }]
        } else {
            settings.keys.clone()
        };

        Self {
            bucket: GovernorLimiter::direct(quota),
            clock: DefaultClock::default(),
            slots: Arc::new(Semaphore::new(settings.max_concurrent)),
            max_concurrent: settings.max_concurrent,
            calls_per_minute: settings.calls_per_minute,
            pool: KeyPool::new(
                &keys,
                settings.key_cooldown_base,
                settings.key_cooldown_max,
            ),
        }
    }

    /// Block until a call is admitted or `cancel` fires.
    pub async fn wait_for_permit(&self, cancel: &CancellationToken) -> Result<Permit> {
        // Gate 1: global concurrency slot.
        let slot = tokio::select! {
            permit = self.slots.clone().acquire_owned() => {
                permit.map_err(|_| HephaestusError::Internal(anyhow::anyhow!(
                    "rate limiter semaphore closed"
                )))?
            }
            _ = cancel.cancelled() => {
                return Err(HephaestusError::cancelled("cancelled waiting for call slot"));
            }
        };

        // Gate 2: per-minute token.
        self.wait_for_token(cancel).await?;

        // Gate 3: a healthy key.
        let key = loop {
            let (selected, _recovered) = self.pool.select();
            if let Some(key) = selected {
                break key;
            }
            let wait = self
                .pool
                .next_recovery()
                .map(|at| at.saturating_duration_since(std::time::Instant::now()))
                .unwrap_or(KEY_WAIT_INTERVAL)
                .max(Duration::from_millis(10));
            debug!("All keys cooling or disabled, waiting {:?}", wait);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    return Err(HephaestusError::cancelled("cancelled waiting for API key"));
                }
            }
        };

        Ok(Permit {
            key,
            pool: self.pool.clone(),
            reported: false,
            _slot: slot,
        })
    }

    /// Non-blocking token probe, used by tests and backpressure checks.
    pub fn try_token(&self) -> bool {
        self.bucket.check().is_ok()
    }

    pub fn key_pool(&self) -> &KeyPool {
        &self.pool
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        LimiterSnapshot {
            max_concurrent: self.max_concurrent,
            available_slots: self.slots.available_permits(),
            calls_per_minute: self.calls_per_minute,
            keys: self.pool.snapshot(),
        }
    }

    async fn wait_for_token(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            match self.bucket.check() {
                Ok(()) => return Ok(()),
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => {
                            return Err(HephaestusError::cancelled(
                                "cancelled waiting for rate-limit token",
                            ));
                        }
                    }
                }
            }
        }
    }
}
