//! Task orchestration.
//!
//! Accepts task batches, registers them in the dependency graph, and
//! executes ready tasks through the worker pool. Every state transition
//! is a CAS against the versioned state store; capacity (worker slot,
//! class semaphore) and admission (rate-limit permit) are secured
//! before a task becomes `Running`. Completion resolves dependents
//! through the graph; failure cascades cancellation to them.
//!
//! Lock order: task metadata before the dependency graph; the state
//! store's per-key locks are leaf locks and never held across either.

use crate::adaptive::{
    AdaptiveController, ClassSemaphores, ConcurrencyStrategy, ExecutionMetrics, ResizableSemaphore,
};
use crate::agents::{AgentInvoker, InvocationContext, InvokerRegistry};
use crate::breaker::{BreakerRegistry, Endpoint};
use crate::config::Config;
use crate::constants::{
    BACKPRESSURE_READY_THRESHOLD, CANCEL_GRACE_PERIOD, CLEANUP_INTERVAL, DEFAULT_TASK_TIMEOUT,
    RECORD_RETENTION,
};
use crate::event_bus::{EventBus, TaskEvent};
use crate::limiter::{Permit, RateLimiter};
use crate::models::{
    AgentClass, ClassStatus, Task, TaskOutcome, TaskRecord, TaskResult, TaskState,
};
use crate::retry::RetryPolicy;
use crate::state_store::StateStore;
use crate::{HephaestusError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod graph;
#[cfg(test)]
mod tests;

use graph::DependencyGraph;

fn task_key(id: &str) -> String {
    format!("task/{id}")
}

struct TaskMeta {
    task: Task,
    cancel: CancellationToken,
    batch_deadline: Option<chrono::DateTime<chrono::Utc>>,
    terminal_at: Option<Instant>,
}

struct Inner {
    state: Arc<StateStore>,
    bus: EventBus,
    graph: Mutex<DependencyGraph>,
    meta: Mutex<HashMap<String, TaskMeta>>,
    results: Mutex<HashMap<String, TaskResult>>,
    class_status: RwLock<HashMap<AgentClass, ClassStatus>>,
    class_semaphores: Arc<ClassSemaphores>,
    worker_slots: Arc<ResizableSemaphore>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    invoker: Arc<InvokerRegistry>,
    metrics: Arc<ExecutionMetrics>,
    adaptive: Arc<AdaptiveController>,
    completion: Notify,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build the orchestrator and its resilience subsystems from
    /// configuration. The caller owns the bus, state store, and invoker
    /// registry so tests can substitute fakes.
    pub fn new(
        config: &Config,
        invoker: Arc<InvokerRegistry>,
        bus: EventBus,
        state: Arc<StateStore>,
        shutdown: CancellationToken,
    ) -> Self {
        let max_concurrent = config.limiter.max_concurrent;
        let class_semaphores = Arc::new(ClassSemaphores::new(&config.class_limits));
        // The worker pool starts at the Balanced mapping and is resized
        // by the adaptive controller within the hard in-flight cap.
        let worker_slots = Arc::new(ResizableSemaphore::new(
            ConcurrencyStrategy::Balanced.worker_limit(max_concurrent),
        ));
        let metrics = Arc::new(ExecutionMetrics::new());
        let adaptive = Arc::new(AdaptiveController::new(
            metrics.clone(),
            class_semaphores.clone(),
            worker_slots.clone(),
            max_concurrent,
            config.adaptive.turbo,
            bus.clone(),
        ));

        let mut class_status = HashMap::new();
        for class in AgentClass::ALL {
            class_status.insert(class, ClassStatus::new(class));
        }
        info!(
            "Orchestrator initialized: {} agent classes, {} worker slots ({} in-flight cap)",
            AgentClass::ALL.len(),
            worker_slots.limit(),
            max_concurrent
        );

        Self {
            inner: Arc::new(Inner {
                state,
                bus,
                graph: Mutex::new(DependencyGraph::new()),
                meta: Mutex::new(HashMap::new()),
                results: Mutex::new(HashMap::new()),
                class_status: RwLock::new(class_status),
                class_semaphores,
                worker_slots,
                limiter: Arc::new(RateLimiter::new(&config.limiter)),
                breakers: Arc::new(BreakerRegistry::new(config.breaker.clone())),
                retry: RetryPolicy::new(&config.retry),
                invoker,
                metrics,
                adaptive,
                completion: Notify::new(),
                shutdown,
            }),
        }
    }

    /// Validate and register a batch; ready tasks start immediately.
    /// `batch_deadline` caps every task in the batch (the objective
    /// deadline, when driven by the cycle runner).
    pub async fn submit_batch(
        &self,
        tasks: Vec<Task>,
        batch_deadline: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<String>> {
        if tasks.is_empty() {
            return Err(HephaestusError::Validation("empty task batch".to_string()));
        }
        for task in &tasks {
            if !self.inner.invoker.supports(task.agent_class) {
                return Err(HephaestusError::Validation(format!(
                    "no invoker registered for agent class {}",
                    task.agent_class
                )));
            }
        }

        let ready = {
            let mut graph = self.inner.graph.lock().await;
            graph.register_batch(&tasks)?
        };

        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        {
            let mut meta = self.inner.meta.lock().await;
            for task in &tasks {
                meta.insert(
                    task.id.clone(),
                    TaskMeta {
                        task: task.clone(),
                        cancel: self.inner.shutdown.child_token(),
                        batch_deadline,
                        terminal_at: None,
                    },
                );
            }
        }
        for task in &tasks {
            let record = serde_json::to_value(TaskRecord::new(task.clone()))?;
            self.inner.state.set(&task_key(&task.id), record).await;
        }
        info!(
            "Batch of {} tasks registered ({} immediately ready)",
            tasks.len(),
            ready.len()
        );

        for id in &ready {
            self.inner.mark_ready_and_schedule(id).await;
        }
        Ok(ids)
    }

    /// Block until every task reaches a terminal state or the deadline
    /// passes; stragglers are cancelled and whatever is terminal by then
    /// is returned.
    pub async fn await_all(
        &self,
        ids: &[String],
        deadline: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Vec<TaskResult> {
        loop {
            let notified = self.inner.completion.notified();
            let (all_terminal, results) = self.inner.collect(ids).await;
            if all_terminal {
                return results;
            }

            let remaining = deadline.map(|d| {
                (d - chrono::Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO)
            });
            match remaining {
                Some(rem) if rem.is_zero() => {
                    warn!("await_all deadline reached, cancelling stragglers");
                    for id in ids {
                        if self.inner.task_state(id).await.map(|s| !s.is_terminal()) == Some(true) {
                            let _ = self.cancel(id).await;
                        }
                    }
                    let grace = CANCEL_GRACE_PERIOD + std::time::Duration::from_millis(250);
                    let _ = tokio::time::timeout(grace, self.inner.wait_terminal(ids)).await;
                    return self.inner.collect(ids).await.1;
                }
                Some(rem) => {
                    let _ = tokio::time::timeout(rem, notified).await;
                }
                None => notified.await,
            }
        }
    }

    /// Cancel a task: immediately when it has not started, cooperatively
    /// through its context when it is running. Dependents cascade.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let state = self
            .inner
            .task_state(id)
            .await
            .ok_or_else(|| HephaestusError::NotFound(format!("task {id}")))?;

        match state {
            TaskState::Pending | TaskState::Ready => {
                if self
                    .inner
                    .transition_from(
                        id,
                        &[TaskState::Pending, TaskState::Ready],
                        TaskState::Cancelled,
                        Some("cancelled by caller".to_string()),
                    )
                    .await?
                {
                    self.inner.fire_cancel_token(id).await;
                    self.inner
                        .store_cancelled_result(id, "cancelled by caller")
                        .await;
                    self.inner.cascade_from(id, id).await;
                    self.inner.graph.lock().await.remove(id);
                    self.inner.mark_terminal(id).await;
                    self.inner.completion.notify_waiters();
                }
            }
            TaskState::Running => {
                debug!("Requesting cooperative cancellation of running task {}", id);
                self.inner.fire_cancel_token(id).await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Cancel everything that is not yet terminal; used during shutdown.
    pub async fn cancel_all(&self) {
        let ids: Vec<String> = {
            let meta = self.inner.meta.lock().await;
            meta.iter()
                .filter(|(_, m)| m.terminal_at.is_none())
                .map(|(id, _)| id.clone())
                .collect()
        };
        info!("Cancelling {} in-flight tasks", ids.len());
        for id in ids {
            let _ = self.cancel(&id).await;
        }
    }

    /// Wait until every registered task is terminal.
    pub async fn quiesce(&self, timeout: std::time::Duration) -> Result<()> {
        let all: Vec<String> = {
            let meta = self.inner.meta.lock().await;
            meta.keys().cloned().collect()
        };
        tokio::time::timeout(timeout, self.inner.wait_terminal(&all))
            .await
            .map_err(|_| HephaestusError::ShutdownTimeout)
    }

    pub async fn task_state(&self, id: &str) -> Option<TaskState> {
        self.inner.task_state(id).await
    }

    pub async fn task_result(&self, id: &str) -> Option<TaskResult> {
        self.inner.results.lock().await.get(id).cloned()
    }

    /// Ready tasks waiting for capacity; the cycle runner pauses intake
    /// above the backpressure threshold.
    pub async fn ready_backlog(&self) -> usize {
        self.inner.graph.lock().await.ready_len()
    }

    pub async fn under_backpressure(&self) -> bool {
        self.ready_backlog().await > BACKPRESSURE_READY_THRESHOLD
    }

    pub async fn class_statuses(&self) -> HashMap<AgentClass, ClassStatus> {
        self.inner.class_status.read().await.clone()
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.inner.limiter.clone()
    }

    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        self.inner.breakers.clone()
    }

    pub fn adaptive(&self) -> Arc<AdaptiveController> {
        self.inner.adaptive.clone()
    }

    pub fn class_semaphores(&self) -> Arc<ClassSemaphores> {
        self.inner.class_semaphores.clone()
    }

    /// Spawn the retention cleanup loop (terminal records older than the
    /// retention window are trimmed).
    pub fn start_cleanup(&self, shutdown: CancellationToken) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => inner.cleanup().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}

impl Inner {
    async fn mark_ready_and_schedule(self: &Arc<Self>, id: &str) {
        match self
            .transition_from(id, &[TaskState::Pending], TaskState::Ready, None)
            .await
        {
            Ok(true) => self.schedule(id.to_string()),
            Ok(false) => debug!("Task {} no longer pending, not scheduling", id),
            Err(e) => error!("Failed to mark task {} ready: {}", id, e),
        }
    }

    fn schedule(self: &Arc<Self>, id: String) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.execute(&id).await;
        });
    }

    /// Full execution of one ready task: capacity, admission, the
    /// `Ready -> Running` CAS, the retried agent call, and finalization.
    async fn execute(self: &Arc<Self>, id: &str) {
        let (task, cancel, batch_deadline) = {
            let meta = self.meta.lock().await;
            match meta.get(id) {
                Some(m) => (m.task.clone(), m.cancel.clone(), m.batch_deadline),
                None => return,
            }
        };
        let class = task.agent_class;
        let deadline = self.effective_deadline(&task, batch_deadline);

        // Capacity before admission, admission before Running (fixed
        // acquisition order: worker slot, class semaphore, rate permit).
        let _worker = match self.worker_slots.acquire(&cancel).await {
            Ok(permit) => permit,
            Err(e) => return self.finish_before_start(id, &e).await,
        };
        let _class_permit = match self.class_semaphores.acquire(class, &cancel).await {
            Ok(permit) => permit,
            Err(e) => return self.finish_before_start(id, &e).await,
        };
        if chrono::Utc::now() >= deadline {
            let e = HephaestusError::DeadlineExceeded(format!("task {id} expired while queued"));
            return self.finish_before_start(id, &e).await;
        }
        let first_permit = match self.limiter.wait_for_permit(&cancel).await {
            Ok(permit) => permit,
            Err(e) => return self.finish_before_start(id, &e).await,
        };

        if !matches!(
            self.transition_from(id, &[TaskState::Ready], TaskState::Running, None)
                .await,
            Ok(true)
        ) {
            // Cancelled while waiting for capacity.
            drop(first_permit);
            return;
        }
        self.graph.lock().await.mark_started(id);

        let started_at = chrono::Utc::now();
        {
            let mut statuses = self.class_status.write().await;
            if let Some(status) = statuses.get_mut(&class) {
                status.start_task();
            }
        }
        self.bus
            .publish(TaskEvent::TaskStarted {
                task_id: id.to_string(),
                agent_class: class,
                at: started_at,
            })
            .await;

        let attempts = Arc::new(AtomicU32::new(0));
        let outcome = self
            .run_attempts(&task, &cancel, deadline, first_permit, attempts.clone())
            .await;
        let finished_at = chrono::Utc::now();
        let execution = (finished_at - started_at)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let attempts_made = attempts.load(Ordering::SeqCst).max(1);

        match outcome {
            Ok(value) => {
                self.metrics.record_success(execution);
                {
                    let mut statuses = self.class_status.write().await;
                    if let Some(status) = statuses.get_mut(&class) {
                        status.complete_task(execution.as_secs_f64());
                    }
                }
                let result = TaskResult {
                    task_id: id.to_string(),
                    agent_class: class,
                    outcome: TaskOutcome::Success { value },
                    started_at: Some(started_at),
                    finished_at,
                    attempts: attempts_made,
                };
                self.finalize_success(id, result).await;
                info!(
                    "Task {} succeeded in {:.2}s ({} attempts)",
                    id,
                    execution.as_secs_f64(),
                    attempts_made
                );
            }
            Err(e) if e.is_cancelled() => {
                {
                    let mut statuses = self.class_status.write().await;
                    if let Some(status) = statuses.get_mut(&class) {
                        status.abandon_task();
                    }
                }
                let result = TaskResult {
                    task_id: id.to_string(),
                    agent_class: class,
                    outcome: TaskOutcome::Failure {
                        error: e.to_string(),
                    },
                    started_at: Some(started_at),
                    finished_at,
                    attempts: attempts_made,
                };
                self.finalize_cancelled_after_start(id, class, result, &e).await;
                info!("Task {} cancelled: {}", id, e);
            }
            Err(e) => {
                self.metrics.record_failure();
                {
                    let mut statuses = self.class_status.write().await;
                    if let Some(status) = statuses.get_mut(&class) {
                        status.fail_task();
                    }
                }
                let result = TaskResult {
                    task_id: id.to_string(),
                    agent_class: class,
                    outcome: TaskOutcome::Failure {
                        error: e.to_string(),
                    },
                    started_at: Some(started_at),
                    finished_at,
                    attempts: attempts_made,
                };
                self.finalize_failure(id, class, result, &e).await;
                error!("Task {} failed after {} attempts: {}", id, attempts_made, e);
            }
        }
        self.completion.notify_waiters();
    }

    /// The retried agent call. Holds the concurrency slot of a fresh
    /// permit per attempt; the minute bucket and the key pool therefore
    /// see every attempt as a separate call.
    async fn run_attempts(
        &self,
        task: &Task,
        cancel: &CancellationToken,
        deadline: chrono::DateTime<chrono::Utc>,
        first_permit: Permit,
        attempts: Arc<AtomicU32>,
    ) -> Result<Value> {
        let first = Mutex::new(Some(first_permit));

        self.retry
            .execute(cancel, |attempt| {
                let first = &first;
                let attempts = attempts.clone();
                async move {
                    attempts.store(attempt, Ordering::SeqCst);

                    let permit = match first.lock().await.take() {
                        Some(permit) => permit,
                        None => self.limiter.wait_for_permit(cancel).await?,
                    };

                    let remaining = (deadline - chrono::Utc::now())
                        .to_std()
                        .unwrap_or(std::time::Duration::ZERO);
                    if remaining.is_zero() {
                        drop(permit);
                        return Err(HephaestusError::DeadlineExceeded(format!(
                            "task {}",
                            task.id
                        )));
                    }

                    let endpoint = Endpoint::new(
                        permit.key.provider.clone(),
                        task.agent_class.operation(),
                    );
                    let breaker = self.breakers.breaker_for(&endpoint).await;

                    let ctx = InvocationContext::new(
                        &task.id,
                        Some(deadline),
                        cancel.child_token(),
                        permit.key.clone(),
                    );
                    let invoker = self.invoker.clone();
                    let class = task.agent_class;
                    let input = task.input.clone();
                    let task_id = task.id.clone();
                    let call_cancel = cancel.clone();

                    let result = breaker
                        .call(|| async move {
                            let invocation = invoker.invoke(ctx, class, input);
                            tokio::select! {
                                outcome = tokio::time::timeout(remaining, invocation) => {
                                    match outcome {
                                        Ok(result) => result,
                                        Err(_) => Err(HephaestusError::DeadlineExceeded(
                                            format!("task {task_id}"),
                                        )),
                                    }
                                }
                                // Non-compliant agents get a grace period
                                // after cancellation, then are abandoned.
                                _ = async {
                                    call_cancel.cancelled().await;
                                    tokio::time::sleep(CANCEL_GRACE_PERIOD).await;
                                } => {
                                    Err(HephaestusError::cancelled(
                                        "agent abandoned after cancellation grace period",
                                    ))
                                }
                            }
                        })
                        .await;

                    match &result {
                        Ok(_) => permit.succeed(),
                        Err(HephaestusError::RateLimited { .. })
                        | Err(HephaestusError::Transient(_)) => permit.fail_retryable(),
                        Err(HephaestusError::Unauthorized(_)) => permit.fail_hard(),
                        // Breaker rejections never used the key;
                        // cancellations carry no outcome.
                        Err(_) => drop(permit),
                    }
                    result
                }
            })
            .await
    }

    /// Cancellation or deadline hit while waiting for capacity: the task
    /// is cancelled without ever starting (no events are emitted).
    async fn finish_before_start(self: &Arc<Self>, id: &str, error: &HephaestusError) {
        let cause = error.to_string();
        match self
            .transition_from(
                id,
                &[TaskState::Ready],
                TaskState::Cancelled,
                Some(cause.clone()),
            )
            .await
        {
            Ok(true) => {
                self.store_cancelled_result(id, &cause).await;
                self.cascade_from(id, id).await;
                self.mark_terminal(id).await;
                self.completion.notify_waiters();
            }
            _ => debug!("Task {} already finalized elsewhere", id),
        }
    }

    async fn finalize_success(self: &Arc<Self>, id: &str, result: TaskResult) {
        let class = result.agent_class;
        if !matches!(
            self.transition_from(id, &[TaskState::Running], TaskState::Succeeded, None)
                .await,
            Ok(true)
        ) {
            warn!("Task {} could not be finalized as succeeded", id);
            return;
        }
        self.results
            .lock()
            .await
            .insert(id.to_string(), result.clone());
        self.bus
            .publish(TaskEvent::TaskCompleted {
                task_id: id.to_string(),
                agent_class: class,
                result,
                at: chrono::Utc::now(),
            })
            .await;

        let (resolved, newly_ready) = {
            let mut graph = self.graph.lock().await;
            graph.on_success(id)
        };
        for (from, to) in resolved {
            self.bus
                .publish(TaskEvent::DependencyResolved {
                    from_id: from,
                    to_id: to,
                    at: chrono::Utc::now(),
                })
                .await;
        }
        for ready_id in newly_ready {
            self.mark_ready_and_schedule(&ready_id).await;
        }
        self.mark_terminal(id).await;
    }

    async fn finalize_failure(
        self: &Arc<Self>,
        id: &str,
        class: AgentClass,
        result: TaskResult,
        error: &HephaestusError,
    ) {
        if !matches!(
            self.transition_from(id, &[TaskState::Running], TaskState::Failed, None)
                .await,
            Ok(true)
        ) {
            return;
        }
        self.results
            .lock()
            .await
            .insert(id.to_string(), result);
        self.bus
            .publish(TaskEvent::TaskFailed {
                task_id: id.to_string(),
                agent_class: class,
                error: error.to_string(),
                at: chrono::Utc::now(),
            })
            .await;
        self.cascade_from(id, id).await;
        self.mark_terminal(id).await;
    }

    async fn finalize_cancelled_after_start(
        self: &Arc<Self>,
        id: &str,
        class: AgentClass,
        result: TaskResult,
        error: &HephaestusError,
    ) {
        if !matches!(
            self.transition_from(
                id,
                &[TaskState::Running],
                TaskState::Cancelled,
                Some(error.to_string()),
            )
            .await,
            Ok(true)
        ) {
            return;
        }
        self.results
            .lock()
            .await
            .insert(id.to_string(), result);
        // Started tasks always close their event pair.
        self.bus
            .publish(TaskEvent::TaskFailed {
                task_id: id.to_string(),
                agent_class: class,
                error: error.to_string(),
                at: chrono::Utc::now(),
            })
            .await;
        self.cascade_from(id, id).await;
        self.mark_terminal(id).await;
    }

    /// Cancel every transitive dependent of `origin`, recording the
    /// originating task as the cause.
    async fn cascade_from(self: &Arc<Self>, origin: &str, cause: &str) {
        let victims = {
            let mut graph = self.graph.lock().await;
            graph.on_failure(origin)
        };
        if victims.is_empty() {
            return;
        }
        info!(
            "Cascading cancellation from {} to {} dependents",
            origin,
            victims.len()
        );
        for victim in victims {
            self.fire_cancel_token(&victim).await;
            if matches!(
                self.transition_from(
                    &victim,
                    &[TaskState::Pending, TaskState::Ready],
                    TaskState::Cancelled,
                    Some(cause.to_string()),
                )
                .await,
                Ok(true)
            ) {
                self.store_cancelled_result(
                    &victim,
                    &format!("cancelled: dependency {cause} failed"),
                )
                .await;
                self.mark_terminal(&victim).await;
            }
        }
        self.completion.notify_waiters();
    }

    /// CAS-based state transition restricted to the given source states.
    /// Returns whether this call performed the transition.
    async fn transition_from(
        &self,
        id: &str,
        from: &[TaskState],
        to: TaskState,
        cause: Option<String>,
    ) -> Result<bool> {
        let key = task_key(id);
        loop {
            let Some((value, version)) = self.state.get_versioned(&key).await else {
                return Ok(false);
            };
            let mut record: TaskRecord = serde_json::from_value(value)?;
            if !from.contains(&record.state) || !record.state.can_transition_to(to) {
                return Ok(false);
            }
            record.state = to;
            record.updated_at = chrono::Utc::now();
            if cause.is_some() {
                record.cancel_cause = cause.clone();
            }
            let next = serde_json::to_value(&record)?;
            if self.state.cas(&key, version, next).await {
                debug!("Task {} -> {:?}", id, to);
                return Ok(true);
            }
            // Lost the race; re-read and re-check.
        }
    }

    fn effective_deadline(
        &self,
        task: &Task,
        batch_deadline: Option<chrono::DateTime<chrono::Utc>>,
    ) -> chrono::DateTime<chrono::Utc> {
        let budget = DEFAULT_TASK_TIMEOUT.mul_f64(self.adaptive.timeout_multiplier());
        let default_deadline = chrono::Utc::now()
            + chrono::Duration::from_std(budget).unwrap_or(chrono::Duration::seconds(300));
        [task.deadline, batch_deadline]
            .into_iter()
            .flatten()
            .chain(std::iter::once(default_deadline))
            .min()
            .expect("at least the default deadline")
    }

    async fn task_state(&self, id: &str) -> Option<TaskState> {
        let value = self.state.get(&task_key(id)).await?;
        serde_json::from_value::<TaskRecord>(value)
            .ok()
            .map(|r| r.state)
    }

    async fn collect(&self, ids: &[String]) -> (bool, Vec<TaskResult>) {
        let mut all_terminal = true;
        let mut results = Vec::new();
        for id in ids {
            match self.task_state(id).await {
                Some(state) if state.is_terminal() => {
                    match self.results.lock().await.get(id).cloned() {
                        Some(result) => results.push(result),
                        // Terminal but the result write has not landed
                        // yet; the finalizer notifies once it has.
                        None => all_terminal = false,
                    }
                }
                Some(_) => all_terminal = false,
                None => {}
            }
        }
        (all_terminal, results)
    }

    async fn wait_terminal(&self, ids: &[String]) {
        loop {
            let notified = self.completion.notified();
            let mut done = true;
            for id in ids {
                if let Some(state) = self.task_state(id).await {
                    if !state.is_terminal() {
                        done = false;
                        break;
                    }
                }
            }
            if done {
                return;
            }
            notified.await;
        }
    }

    async fn fire_cancel_token(&self, id: &str) {
        let meta = self.meta.lock().await;
        if let Some(m) = meta.get(id) {
            m.cancel.cancel();
        }
    }

    async fn store_cancelled_result(&self, id: &str, error: &str) {
        let class = {
            let meta = self.meta.lock().await;
            match meta.get(id) {
                Some(m) => m.task.agent_class,
                None => return,
            }
        };
        self.results.lock().await.insert(
            id.to_string(),
            TaskResult {
                task_id: id.to_string(),
                agent_class: class,
                outcome: TaskOutcome::Failure {
                    error: error.to_string(),
                },
                started_at: None,
                finished_at: chrono::Utc::now(),
                attempts: 0,
            },
        );
    }

    async fn mark_terminal(&self, id: &str) {
        let mut meta = self.meta.lock().await;
        if let Some(m) = meta.get_mut(id) {
            m.terminal_at = Some(Instant::now());
        }
    }

    /// Trim terminal records past the retention window.
    async fn cleanup(&self) {
        let cutoff = Instant::now() - RECORD_RETENTION;
        let expired: Vec<String> = {
            let meta = self.meta.lock().await;
            meta.iter()
                .filter(|(_, m)| m.terminal_at.map(|t| t < cutoff).unwrap_or(false))
                .map(|(id, _)| id.clone())
                .collect()
        };
        if expired.is_empty() {
            return;
        }

        {
            let mut meta = self.meta.lock().await;
            for id in &expired {
                meta.remove(id);
            }
        }
        {
            let mut results = self.results.lock().await;
            for id in &expired {
                results.remove(id);
            }
        }
        {
            let mut graph = self.graph.lock().await;
            for id in &expired {
                graph.forget(id);
            }
        }
        for id in &expired {
            self.state.remove(&task_key(id)).await;
        }
        info!("Cleaned up {} expired task records", expired.len());
    }
}
