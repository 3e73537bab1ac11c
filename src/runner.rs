//! Top-level cycle driver.
//!
//! Pulls objectives from the durable queue, asks the external planner
//! for a task DAG, runs it through the orchestrator, and commits the
//! produced artifact to the cache. The runner owns every subsystem and
//! wires them explicitly; tests instantiate it with fakes.

use crate::cache::IntelligentCache;
use crate::config::Config;
use crate::constants::{BACKPRESSURE_PAUSE, CACHE_SWEEP_INTERVAL};
use crate::event_bus::{EventBus, TaskEvent};
use crate::models::{Objective, Task, TaskOutcome};
use crate::orchestrator::Orchestrator;
use crate::queue::ObjectiveQueue;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// External planning collaborator: turns one objective into a task DAG.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, objective: &Objective) -> Result<Vec<Task>>;
}

pub struct CycleRunner {
    config: Config,
    queue: Arc<ObjectiveQueue>,
    planner: Arc<dyn Planner>,
    orchestrator: Orchestrator,
    cache: Arc<IntelligentCache>,
    bus: EventBus,
    shutdown: CancellationToken,
}

impl CycleRunner {
    pub fn new(
        config: Config,
        queue: Arc<ObjectiveQueue>,
        planner: Arc<dyn Planner>,
        orchestrator: Orchestrator,
        cache: Arc<IntelligentCache>,
        bus: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            queue,
            planner,
            orchestrator,
            cache,
            bus,
            shutdown,
        }
    }

    /// Spawn the maintenance loops: cache sweeper, adaptive sampler, and
    /// record cleanup. They all stop with the shutdown token.
    pub fn start_background(&self) {
        self.cache
            .start_sweeper(CACHE_SWEEP_INTERVAL, self.shutdown.child_token());
        self.orchestrator.adaptive().start(
            self.config.adaptive.sample_interval,
            self.shutdown.child_token(),
        );
        self.orchestrator.start_cleanup(self.shutdown.child_token());
    }

    /// Main loop: dequeue, plan, execute, commit. Pauses intake while
    /// the system reports backpressure.
    pub async fn run(&self) -> Result<()> {
        info!("Cycle runner started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if self.orchestrator.under_backpressure().await || self.bus.backpressure() {
                self.bus
                    .publish(TaskEvent::BackpressureDetected {
                        reason: "ready backlog outpacing worker throughput".to_string(),
                        at: chrono::Utc::now(),
                    })
                    .await;
                tokio::select! {
                    _ = tokio::time::sleep(BACKPRESSURE_PAUSE) => {}
                    _ = self.shutdown.cancelled() => break,
                }
                continue;
            }

            let objective = tokio::select! {
                objective = self.queue.dequeue(Duration::from_secs(1)) => objective,
                _ = self.shutdown.cancelled() => break,
            };
            if let Some(objective) = objective {
                self.process(objective).await;
            }
        }
        info!("Cycle runner stopped");
        Ok(())
    }

    async fn process(&self, objective: Objective) {
        let deadline = chrono::Utc::now()
            + chrono::Duration::from_std(self.config.objective_deadline)
                .unwrap_or(chrono::Duration::seconds(600));
        info!(
            "Processing objective {} (priority {}, attempt {})",
            objective.id, objective.priority, objective.attempts
        );

        let plan = match self.planner.plan(&objective).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Planner failed for objective {}: {}", objective.id, e);
                let _ = self
                    .queue
                    .nack(&objective.id, &format!("planner failed: {e}"))
                    .await;
                return;
            }
        };
        if plan.is_empty() {
            debug!("Objective {} produced an empty plan", objective.id);
            let _ = self.queue.ack(&objective.id).await;
            return;
        }

        let ids = match self.orchestrator.submit_batch(plan, Some(deadline)).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Plan for objective {} rejected: {}", objective.id, e);
                let _ = self
                    .queue
                    .nack(&objective.id, &format!("plan rejected: {e}"))
                    .await;
                return;
            }
        };

        let results = self.orchestrator.await_all(&ids, Some(deadline)).await;
        let succeeded =
            results.len() == ids.len() && results.iter().all(|r| r.outcome.is_success());

        if succeeded {
            let artifact = serde_json::Value::Object(
                results
                    .iter()
                    .map(|r| {
                        let value = match &r.outcome {
                            TaskOutcome::Success { value } => value.clone(),
                            TaskOutcome::Failure { .. } => serde_json::Value::Null,
                        };
                        (r.task_id.clone(), value)
                    })
                    .collect(),
            );
            self.cache
                .set(
                    &objective.fingerprint(),
                    artifact,
                    None,
                    vec![format!("objective:{}", objective.id)],
                )
                .await;
            if let Err(e) = self.queue.ack(&objective.id).await {
                warn!("Failed to ack objective {}: {}", objective.id, e);
            }
            info!("Objective {} completed", objective.id);
        } else {
            let reason = results
                .iter()
                .find_map(|r| match &r.outcome {
                    TaskOutcome::Failure { error } => Some(error.clone()),
                    TaskOutcome::Success { .. } => None,
                })
                .unwrap_or_else(|| "objective deadline exceeded".to_string());
            warn!("Objective {} failed: {}", objective.id, reason);
            if let Err(e) = self.queue.nack(&objective.id, &reason).await {
                warn!("Failed to nack objective {}: {}", objective.id, e);
            }
        }
    }

    /// Graceful shutdown: stop intake, cancel in-flight work, flush the
    /// queue snapshot. Bounded by the configured grace period; past it
    /// the remaining tasks are abandoned and the timeout is surfaced.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down cycle runner");
        self.shutdown.cancel();
        self.orchestrator.cancel_all().await;
        let quiesced = self.orchestrator.quiesce(self.config.shutdown_grace).await;
        self.queue.flush().await?;
        match &quiesced {
            Ok(()) => info!("Shutdown complete"),
            Err(_) => warn!("Shutdown grace period exceeded, abandoning remaining tasks"),
        }
        quiesced
    }
}
