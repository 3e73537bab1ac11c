//! Adaptive concurrency control.
//!
//! A sampler task periodically folds execution outcomes and host
//! resource readings into a strategy choice; each strategy maps to a
//! worker bound, per-class semaphore limits, and a timeout multiplier.
//! Semaphore resizes never interrupt in-flight tasks: growth adds
//! permits immediately, shrinking retires permits by attrition as they
//! are released.

use crate::constants::{
    AGGRESSIVE_CPU_CEILING, AGGRESSIVE_MEM_CEILING, AGGRESSIVE_SUCCESS_FLOOR,
    CONSERVATIVE_CPU_CEILING, CONSERVATIVE_MEM_CEILING, CONSERVATIVE_SUCCESS_FLOOR,
};
use crate::event_bus::{EventBus, TaskEvent};
use crate::models::AgentClass;
use crate::monitor;
use crate::{HephaestusError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Smoothing factor for the success-rate and execution-time averages.
const EMA_ALPHA: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcurrencyStrategy {
    Conservative,
    Balanced,
    Aggressive,
}

impl ConcurrencyStrategy {
    /// Per-class semaphore limit under this strategy. The configured
    /// limit is the Balanced mapping; growth is clamped to the global
    /// admission ceiling, which no strategy may exceed.
    pub fn class_limit(&self, base: usize, ceiling: usize) -> usize {
        match self {
            ConcurrencyStrategy::Conservative => (base / 4).max(1),
            ConcurrencyStrategy::Balanced => base,
            ConcurrencyStrategy::Aggressive => (base * 2).min(ceiling.max(base)),
        }
    }

    /// Worker-pool bound under this strategy. The ceiling is the rate
    /// limiter's hard cap on in-flight calls: Aggressive runs right up
    /// against it, Balanced holds half of it in reserve.
    pub fn worker_limit(&self, ceiling: usize) -> usize {
        match self {
            ConcurrencyStrategy::Conservative => (ceiling / 4).max(2).min(ceiling),
            ConcurrencyStrategy::Balanced => (ceiling / 2).max(2).min(ceiling),
            ConcurrencyStrategy::Aggressive => ceiling,
        }
    }

    /// Multiplier applied to the default task timeout: patient when
    /// conservative, tight when aggressive.
    pub fn timeout_multiplier(&self) -> f64 {
        match self {
            ConcurrencyStrategy::Conservative => 1.5,
            ConcurrencyStrategy::Balanced => 1.0,
            ConcurrencyStrategy::Aggressive => 0.75,
        }
    }
}

/// Pick a strategy from the sampled signals.
pub fn choose_strategy(success_rate: f64, cpu_percent: f64, mem_percent: f64) -> ConcurrencyStrategy {
    if success_rate < CONSERVATIVE_SUCCESS_FLOOR
        || mem_percent > CONSERVATIVE_MEM_CEILING
        || cpu_percent > CONSERVATIVE_CPU_CEILING
    {
        ConcurrencyStrategy::Conservative
    } else if success_rate > AGGRESSIVE_SUCCESS_FLOOR
        && mem_percent < AGGRESSIVE_MEM_CEILING
        && cpu_percent < AGGRESSIVE_CPU_CEILING
    {
        ConcurrencyStrategy::Aggressive
    } else {
        ConcurrencyStrategy::Balanced
    }
}

/// Semaphore whose limit can change at runtime without revoking held
/// permits: growth calls `add_permits`, shrinking acquires-and-forgets
/// the difference so capacity drains as tasks finish.
pub struct ResizableSemaphore {
    sem: Arc<Semaphore>,
    limit: AtomicUsize,
}

impl ResizableSemaphore {
    pub fn new(limit: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(limit)),
            limit: AtomicUsize::new(limit),
        }
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            permit = self.sem.clone().acquire_owned() => {
                permit.map_err(|_| HephaestusError::Internal(anyhow::anyhow!("semaphore closed")))
            }
            _ = cancel.cancelled() => {
                Err(HephaestusError::cancelled("cancelled waiting for execution slot"))
            }
        }
    }

    pub fn resize(&self, new_limit: usize) {
        let old = self.limit.swap(new_limit, Ordering::SeqCst);
        if new_limit > old {
            self.sem.add_permits(new_limit - old);
        } else if old > new_limit {
            let sem = self.sem.clone();
            let delta = (old - new_limit) as u32;
            tokio::spawn(async move {
                if let Ok(retired) = sem.acquire_many_owned(delta).await {
                    retired.forget();
                }
            });
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

/// One resizable semaphore per agent class.
pub struct ClassSemaphores {
    semaphores: HashMap<AgentClass, ResizableSemaphore>,
    base_limits: HashMap<AgentClass, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassUtilization {
    pub limit: usize,
    pub available: usize,
}

impl ClassSemaphores {
    pub fn new(limits: &HashMap<AgentClass, usize>) -> Self {
        let mut semaphores = HashMap::new();
        let mut base_limits = HashMap::new();
        for class in AgentClass::ALL {
            let limit = limits.get(&class).copied().unwrap_or(1);
            semaphores.insert(class, ResizableSemaphore::new(limit));
            base_limits.insert(class, limit);
        }
        Self {
            semaphores,
            base_limits,
        }
    }

    pub async fn acquire(
        &self,
        class: AgentClass,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit> {
        self.semaphores
            .get(&class)
            .expect("every class has a semaphore")
            .acquire(cancel)
            .await
    }

    pub fn current_limit(&self, class: AgentClass) -> usize {
        self.semaphores
            .get(&class)
            .expect("every class has a semaphore")
            .limit()
    }

    pub fn apply_strategy(&self, strategy: ConcurrencyStrategy, ceiling: usize) {
        for (class, semaphore) in &self.semaphores {
            let base = self.base_limits[class];
            semaphore.resize(strategy.class_limit(base, ceiling));
        }
    }

    pub fn utilization(&self) -> HashMap<String, ClassUtilization> {
        self.semaphores
            .iter()
            .map(|(class, semaphore)| {
                (
                    class.to_string(),
                    ClassUtilization {
                        limit: semaphore.limit(),
                        available: semaphore.available(),
                    },
                )
            })
            .collect()
    }
}

/// Execution outcomes reported by the orchestrator, folded into moving
/// averages at each sample.
pub struct ExecutionMetrics {
    window_successes: AtomicU64,
    window_failures: AtomicU64,
    exec_time_ema_millis: AtomicU64,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self {
            window_successes: AtomicU64::new(0),
            window_failures: AtomicU64::new(0),
            exec_time_ema_millis: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, execution: Duration) {
        self.window_successes.fetch_add(1, Ordering::Relaxed);
        let millis = execution.as_millis() as u64;
        let prev = self.exec_time_ema_millis.load(Ordering::Relaxed);
        let next = if prev == 0 {
            millis
        } else {
            ((1.0 - EMA_ALPHA) * prev as f64 + EMA_ALPHA * millis as f64) as u64
        };
        self.exec_time_ema_millis.store(next, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.window_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Success rate over the window since the last call, or `None` when
    /// nothing ran.
    fn drain_window(&self) -> Option<f64> {
        let successes = self.window_successes.swap(0, Ordering::Relaxed);
        let failures = self.window_failures.swap(0, Ordering::Relaxed);
        let total = successes + failures;
        if total == 0 {
            None
        } else {
            Some(successes as f64 / total as f64)
        }
    }

    pub fn average_execution(&self) -> Duration {
        Duration::from_millis(self.exec_time_ema_millis.load(Ordering::Relaxed))
    }
}

impl Default for ExecutionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveSnapshot {
    pub strategy: ConcurrencyStrategy,
    pub turbo: bool,
    pub success_rate_ema: f64,
    pub average_execution_secs: f64,
    pub worker_limit: usize,
    pub workers_available: usize,
}

pub struct AdaptiveController {
    metrics: Arc<ExecutionMetrics>,
    class_semaphores: Arc<ClassSemaphores>,
    worker_slots: Arc<ResizableSemaphore>,
    /// The rate limiter's hard cap on in-flight calls; never resized.
    /// Every strategy mapping stays at or below it.
    max_concurrent: usize,
    strategy: Mutex<ConcurrencyStrategy>,
    success_ema: Mutex<f64>,
    turbo: AtomicBool,
    bus: EventBus,
}

impl AdaptiveController {
    pub fn new(
        metrics: Arc<ExecutionMetrics>,
        class_semaphores: Arc<ClassSemaphores>,
        worker_slots: Arc<ResizableSemaphore>,
        max_concurrent: usize,
        turbo: bool,
        bus: EventBus,
    ) -> Self {
        let controller = Self {
            metrics,
            class_semaphores,
            worker_slots,
            max_concurrent,
            strategy: Mutex::new(ConcurrencyStrategy::Balanced),
            success_ema: Mutex::new(1.0),
            turbo: AtomicBool::new(turbo),
            bus,
        };
        if turbo {
            controller.apply(ConcurrencyStrategy::Aggressive);
        }
        controller
    }

    /// Spawn the sampling loop; it stops when `shutdown` fires.
    pub fn start(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let resources = monitor::sample().await;
                        controller.sample_once(resources.cpu_percent, resources.mem_percent);
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Adaptive controller stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Fold one sample into the moving averages and apply the resulting
    /// strategy. Exposed for tests; the sampler loop calls it with live
    /// host readings.
    pub fn sample_once(&self, cpu_percent: f64, mem_percent: f64) -> ConcurrencyStrategy {
        let ema = {
            let mut ema = self.success_ema.lock().expect("ema lock poisoned");
            if let Some(rate) = self.metrics.drain_window() {
                *ema = (1.0 - EMA_ALPHA) * *ema + EMA_ALPHA * rate;
            }
            *ema
        };

        let chosen = if self.turbo.load(Ordering::SeqCst) {
            ConcurrencyStrategy::Aggressive
        } else {
            choose_strategy(ema, cpu_percent, mem_percent)
        };
        self.apply(chosen);
        chosen
    }

    /// Pin the Aggressive strategy until cleared.
    pub fn set_turbo(&self, enabled: bool) {
        self.turbo.store(enabled, Ordering::SeqCst);
        if enabled {
            info!("Turbo override engaged, pinning Aggressive strategy");
            self.apply(ConcurrencyStrategy::Aggressive);
        }
    }

    pub fn current_strategy(&self) -> ConcurrencyStrategy {
        *self.strategy.lock().expect("strategy lock poisoned")
    }

    pub fn timeout_multiplier(&self) -> f64 {
        self.current_strategy().timeout_multiplier()
    }

    pub fn snapshot(&self) -> AdaptiveSnapshot {
        AdaptiveSnapshot {
            strategy: self.current_strategy(),
            turbo: self.turbo.load(Ordering::SeqCst),
            success_rate_ema: *self.success_ema.lock().expect("ema lock poisoned"),
            average_execution_secs: self.metrics.average_execution().as_secs_f64(),
            worker_limit: self.worker_slots.limit(),
            workers_available: self.worker_slots.available(),
        }
    }

    fn apply(&self, next: ConcurrencyStrategy) {
        let mut current = self.strategy.lock().expect("strategy lock poisoned");
        if *current == next {
            return;
        }
        info!("Concurrency strategy {:?} -> {:?}", *current, next);
        // The worker pool always sits at or below the limiter's cap, so
        // growth here is real admission capacity, not a phantom signal.
        let growing = next.worker_limit(self.max_concurrent)
            > current.worker_limit(self.max_concurrent);
        *current = next;
        drop(current);

        self.class_semaphores.apply_strategy(next, self.max_concurrent);
        self.worker_slots.resize(next.worker_limit(self.max_concurrent));

        if growing {
            let bus = self.bus.clone();
            tokio::spawn(async move {
                bus.publish(TaskEvent::ResourceAvailable {
                    kind: "concurrency".to_string(),
                    at: chrono::Utc::now(),
                })
                .await;
            });
        }
    }
}
