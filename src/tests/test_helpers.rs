//! Shared fixtures for the lifecycle tests: a full stack with a fake
//! planner and invoker, backed by a temp-dir queue snapshot.

use crate::agents::{AgentInvoker, InvocationContext, InvokerRegistry};
use crate::cache::IntelligentCache;
use crate::config::Config;
use crate::event_bus::EventBus;
use crate::models::{AgentClass, Objective, Task};
use crate::orchestrator::Orchestrator;
use crate::queue::ObjectiveQueue;
use crate::runner::{CycleRunner, Planner};
use crate::state_store::StateStore;
use crate::{HephaestusError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Invoker with input-driven behavior, mirroring what a cooperative
/// agent does: respects cancellation, sleeps, fails on demand.
pub struct TestInvoker;

#[async_trait]
impl AgentInvoker for TestInvoker {
    async fn invoke(
        &self,
        ctx: InvocationContext,
        _class: AgentClass,
        input: Value,
    ) -> Result<Value> {
        let behavior = input
            .get("behavior")
            .and_then(|v| v.as_str())
            .unwrap_or("ok");
        let sleep_ms = input.get("sleep_ms").and_then(|v| v.as_u64()).unwrap_or(10);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => match behavior {
                "permanent" => Err(HephaestusError::Permanent("injected failure".into())),
                _ => Ok(json!({"handled": ctx.task_id})),
            },
            _ = ctx.cancel.cancelled() => {
                Err(HephaestusError::cancelled("agent observed cancellation"))
            }
        }
    }
}

/// Two-step plan: gather, then draft depending on gather. The task
/// inputs inherit the objective payload so tests can steer behavior.
pub struct ChainPlanner;

#[async_trait]
impl Planner for ChainPlanner {
    async fn plan(&self, objective: &Objective) -> Result<Vec<Task>> {
        let gather = Task::new(AgentClass::Architect, objective.payload.clone())
            .with_priority(objective.priority);
        let draft = Task::new(AgentClass::Scribe, objective.payload.clone())
            .with_priority(objective.priority)
            .with_dependencies(vec![gather.id.clone()]);
        Ok(vec![gather, draft])
    }
}

/// Planner that always errors, for nack/dead-letter paths.
pub struct FailingPlanner;

#[async_trait]
impl Planner for FailingPlanner {
    async fn plan(&self, _objective: &Objective) -> Result<Vec<Task>> {
        Err(HephaestusError::Transient("planner offline".into()))
    }
}

pub struct Stack {
    pub runner: Arc<CycleRunner>,
    pub queue: Arc<ObjectiveQueue>,
    pub cache: Arc<IntelligentCache>,
    pub orchestrator: Orchestrator,
    pub bus: EventBus,
}

pub fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.queue.path = dir
        .path()
        .join("queue.snapshot")
        .to_string_lossy()
        .into_owned();
    config.limiter.calls_per_minute = 6000;
    config.limiter.key_cooldown_base = Duration::from_millis(10);
    config.limiter.key_cooldown_max = Duration::from_millis(50);
    config.retry.base_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter = 0.0;
    config.shutdown_grace = Duration::from_secs(5);
    config
}

pub fn build_stack(config: Config, planner: Arc<dyn Planner>) -> Stack {
    let shutdown = CancellationToken::new();
    let bus = EventBus::new(256);
    let queue = Arc::new(ObjectiveQueue::open(&config.queue).unwrap());
    let cache = Arc::new(IntelligentCache::new(&config.cache));
    let invoker = Arc::new(InvokerRegistry::with_default(Arc::new(TestInvoker)));
    let orchestrator = Orchestrator::new(
        &config,
        invoker,
        bus.clone(),
        Arc::new(StateStore::new()),
        shutdown.child_token(),
    );
    let runner = Arc::new(CycleRunner::new(
        config,
        queue.clone(),
        planner,
        orchestrator.clone(),
        cache.clone(),
        bus.clone(),
        shutdown.clone(),
    ));

    Stack {
        runner,
        queue,
        cache,
        orchestrator,
        bus,
    }
}

/// Poll `predicate` until it holds or the timeout passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
