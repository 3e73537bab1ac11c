//! Per-endpoint circuit breakers.
//!
//! An endpoint is a (provider, operation) pair. While a breaker is open
//! the wrapped call is rejected with a typed `BreakerOpen` error without
//! touching the underlying agent; after the probe timeout exactly one
//! probe call is admitted at a time.

use crate::config::BreakerSettings;
use crate::{HephaestusError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Failures older than this no longer count toward the threshold.
const FAILURE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker identity: one breaker per (provider, operation).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub provider: String,
    pub operation: String,
}

impl Endpoint {
    pub fn new(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.operation)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    pub last_state_change_secs: u64,
}

enum Admission {
    Normal,
    Probe,
    Rejected,
}

pub struct CircuitBreaker {
    endpoint: Endpoint,
    config: BreakerSettings,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    last_failure: RwLock<Option<Instant>>,
    last_state_change: RwLock<Instant>,
    probe_in_flight: AtomicBool,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(endpoint: Endpoint, config: BreakerSettings) -> Self {
        Self {
            endpoint,
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            last_failure: RwLock::new(None),
            last_state_change: RwLock::new(Instant::now()),
            probe_in_flight: AtomicBool::new(false),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    /// Run `f` under the breaker. Open circuits reject immediately with
    /// `BreakerOpen`; a half-open circuit admits one probe at a time.
    /// A cancelled call counts as neither success nor failure.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let admission = self.admit().await;
        let probing = match admission {
            Admission::Rejected => {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(HephaestusError::BreakerOpen {
                    endpoint: self.endpoint.to_string(),
                });
            }
            Admission::Probe => true,
            Admission::Normal => false,
        };

        let result = f().await;

        match &result {
            Ok(_) => self.record_success(probing).await,
            Err(e) if e.is_cancelled() => {
                if probing {
                    self.probe_in_flight.store(false, Ordering::SeqCst);
                }
            }
            Err(_) => self.record_failure(probing).await,
        }
        result
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    pub async fn metrics(&self) -> BreakerMetrics {
        let last_change = *self.last_state_change.read().await;
        BreakerMetrics {
            state: *self.state.read().await,
            failure_count: self.failure_count.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            last_state_change_secs: last_change.elapsed().as_secs(),
        }
    }

    async fn admit(&self) -> Admission {
        let current = *self.state.read().await;
        match current {
            CircuitState::Closed => Admission::Normal,
            CircuitState::Open => {
                let last_change = *self.last_state_change.read().await;
                if last_change.elapsed() >= self.config.timeout_to_probe {
                    self.transition(CircuitState::HalfOpen).await;
                    self.try_claim_probe()
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => self.try_claim_probe(),
        }
    }

    fn try_claim_probe(&self) -> Admission {
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Admission::Probe
        } else {
            Admission::Rejected
        }
    }

    async fn record_success(&self, probing: bool) {
        if probing {
            self.probe_in_flight.store(false, Ordering::SeqCst);
            info!("Breaker {} probe succeeded, closing", self.endpoint);
            self.failure_count.store(0, Ordering::Relaxed);
            self.transition(CircuitState::Closed).await;
            return;
        }
        // Success in the closed state clears the failure streak.
        self.failure_count.store(0, Ordering::Relaxed);
    }

    async fn record_failure(&self, probing: bool) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        if probing {
            self.probe_in_flight.store(false, Ordering::SeqCst);
            warn!("Breaker {} probe failed, reopening", self.endpoint);
            self.transition(CircuitState::Open).await;
            return;
        }

        let now = Instant::now();
        let mut last_failure = self.last_failure.write().await;
        let count = match *last_failure {
            Some(previous) if now.duration_since(previous) > FAILURE_WINDOW => {
                // Streak fell out of the window; start over.
                self.failure_count.store(1, Ordering::Relaxed);
                1
            }
            _ => self.failure_count.fetch_add(1, Ordering::Relaxed) + 1,
        };
        *last_failure = Some(now);
        drop(last_failure);

        debug!(
            "Breaker {} failure {}/{}",
            self.endpoint, count, self.config.failure_threshold
        );
        if count >= self.config.failure_threshold {
            let state = *self.state.read().await;
            if state == CircuitState::Closed {
                warn!(
                    "Breaker {} opened after {} failures (total requests {}, total failures {})",
                    self.endpoint,
                    count,
                    self.total_requests.load(Ordering::Relaxed),
                    self.total_failures.load(Ordering::Relaxed)
                );
                self.transition(CircuitState::Open).await;
            }
        }
    }

    async fn transition(&self, next: CircuitState) {
        let mut state = self.state.write().await;
        if *state == next {
            return;
        }
        debug!("Breaker {} {:?} -> {:?}", self.endpoint, *state, next);
        *state = next;
        *self.last_state_change.write().await = Instant::now();
    }
}

/// Lazily-populated registry of breakers keyed by endpoint.
pub struct BreakerRegistry {
    config: BreakerSettings,
    breakers: RwLock<HashMap<Endpoint, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerSettings) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn breaker_for(&self, endpoint: &Endpoint) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(endpoint) {
                return breaker.clone();
            }
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(endpoint.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(endpoint.clone(), self.config.clone()))
            })
            .clone()
    }

    pub async fn snapshot(&self) -> HashMap<String, BreakerMetrics> {
        let breakers = self.breakers.read().await;
        let mut out = HashMap::new();
        for (endpoint, breaker) in breakers.iter() {
            out.insert(endpoint.to_string(), breaker.metrics().await);
        }
        out
    }
}
