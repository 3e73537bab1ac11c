//! Orchestrator test support: a recording invoker whose behavior is
//! driven by task input, plus harness constructors.

use crate::agents::{AgentInvoker, InvocationContext, InvokerRegistry};
use crate::config::Config;
use crate::event_bus::EventBus;
use crate::models::{AgentClass, Task};
use crate::orchestrator::Orchestrator;
use crate::state_store::StateStore;
use crate::{HephaestusError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

mod integration;

/// Invoker that records invocation order and concurrency, with behavior
/// chosen by the task input:
/// `{"behavior": "ok" | "permanent" | "transient" | "flaky", "sleep_ms": N}`.
/// "flaky" fails with a transient error until the third attempt.
pub(super) struct RecordingInvoker {
    starts: Mutex<Vec<(String, Instant, AgentClass)>>,
    attempts: Mutex<HashMap<String, u32>>,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    class_concurrent: Mutex<HashMap<AgentClass, usize>>,
    class_max: Mutex<HashMap<AgentClass, usize>>,
}

impl RecordingInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            starts: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            class_concurrent: Mutex::new(HashMap::new()),
            class_max: Mutex::new(HashMap::new()),
        })
    }

    pub fn start_order(&self) -> Vec<String> {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _, _)| id.clone())
            .collect()
    }

    pub fn start_count(&self, task_id: &str) -> usize {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == task_id)
            .count()
    }

    pub fn max_observed_concurrency(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn max_observed_for_class(&self, class: AgentClass) -> usize {
        self.class_max
            .lock()
            .unwrap()
            .get(&class)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, task_id: &str, class: AgentClass) {
        self.starts
            .lock()
            .unwrap()
            .push((task_id.to_string(), Instant::now(), class));

        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let mut per_class = self.class_concurrent.lock().unwrap();
        let count = per_class.entry(class).or_insert(0);
        *count += 1;
        let mut maxima = self.class_max.lock().unwrap();
        let max = maxima.entry(class).or_insert(0);
        *max = (*max).max(*count);
    }

    fn exit(&self, class: AgentClass) {
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        let mut per_class = self.class_concurrent.lock().unwrap();
        if let Some(count) = per_class.get_mut(&class) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl AgentInvoker for RecordingInvoker {
    async fn invoke(
        &self,
        ctx: InvocationContext,
        class: AgentClass,
        input: Value,
    ) -> Result<Value> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(ctx.task_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        self.enter(&ctx.task_id, class);
        let behavior = input
            .get("behavior")
            .and_then(|v| v.as_str())
            .unwrap_or("ok")
            .to_string();
        let sleep_ms = input.get("sleep_ms").and_then(|v| v.as_u64()).unwrap_or(20);

        let outcome = tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {
                match behavior.as_str() {
                    "permanent" => Err(HephaestusError::Permanent("injected failure".into())),
                    "transient" => Err(HephaestusError::Transient("injected 503".into())),
                    "flaky" if attempt < 3 => {
                        Err(HephaestusError::Transient("injected flake".into()))
                    }
                    _ => Ok(json!({"task": ctx.task_id, "attempt": attempt})),
                }
            }
            _ = ctx.cancel.cancelled() => {
                Err(HephaestusError::cancelled("agent observed cancellation"))
            }
        };
        self.exit(class);
        outcome
    }
}

pub(super) fn test_config() -> Config {
    let mut config = Config::default();
    config.limiter.max_concurrent = 8;
    config.limiter.calls_per_minute = 6000;
    config.limiter.key_cooldown_base = Duration::from_millis(10);
    config.limiter.key_cooldown_max = Duration::from_millis(50);
    config.retry.max_attempts = 3;
    config.retry.base_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter = 0.0;
    config
}

pub(super) fn harness(
    config: Config,
    invoker: Arc<RecordingInvoker>,
) -> (Orchestrator, EventBus, CancellationToken) {
    let bus = EventBus::new(256);
    let shutdown = CancellationToken::new();
    let registry = Arc::new(InvokerRegistry::with_default(invoker));
    let orchestrator = Orchestrator::new(
        &config,
        registry,
        bus.clone(),
        Arc::new(StateStore::new()),
        shutdown.clone(),
    );
    (orchestrator, bus, shutdown)
}

pub(super) fn chain_task(id: &str, class: AgentClass, deps: &[&str], input: Value) -> Task {
    let mut task = Task::new(class, input);
    task.id = id.to_string();
    task.dependencies = deps.iter().map(|d| d.to_string()).collect();
    task
}
