//! Read-only health and metrics surface.
//!
//! A single snapshot endpoint exposes queue depth, per-class
//! utilization, cache statistics, breaker states, key-pool health, and
//! the adaptive strategy. No write endpoints exist.

use crate::adaptive::AdaptiveSnapshot;
use crate::breaker::BreakerMetrics;
use crate::cache::{CacheStats, IntelligentCache};
use crate::config::ApiSettings;
use crate::event_bus::EventBus;
use crate::ids::MonotonicClock;
use crate::limiter::LimiterSnapshot;
use crate::orchestrator::Orchestrator;
use crate::queue::ObjectiveQueue;
use crate::Result;
use axum::{extract::State, response::Json, routing::get, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

const SERVICE_NAME: &str = "hephaestus-core";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ROUTE_HEALTH: &str = "/health";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    pub depth: usize,
    pub in_flight: usize,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassHealth {
    pub limit: usize,
    pub available: usize,
    pub running: u32,
    pub completed: u64,
    pub failed: u64,
    pub average_execution_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub service: String,
    pub version: String,
    pub uptime_secs: f64,
    pub queue: QueueHealth,
    pub classes: HashMap<String, ClassHealth>,
    pub cache: CacheStats,
    pub breakers: HashMap<String, BreakerMetrics>,
    pub limiter: LimiterSnapshot,
    pub adaptive: AdaptiveSnapshot,
    pub backpressure: bool,
}

/// Aggregates component views into one read-only snapshot.
pub struct HealthSource {
    queue: Arc<ObjectiveQueue>,
    orchestrator: Orchestrator,
    cache: Arc<IntelligentCache>,
    bus: EventBus,
    clock: MonotonicClock,
}

impl HealthSource {
    pub fn new(
        queue: Arc<ObjectiveQueue>,
        orchestrator: Orchestrator,
        cache: Arc<IntelligentCache>,
        bus: EventBus,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            cache,
            bus,
            clock: MonotonicClock::new(),
        }
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let statuses = self.orchestrator.class_statuses().await;
        let utilization = self.orchestrator.class_semaphores().utilization();

        let mut classes = HashMap::new();
        for (class, status) in statuses {
            let name = class.to_string();
            let (limit, available) = utilization
                .get(&name)
                .map(|u| (u.limit, u.available))
                .unwrap_or((0, 0));
            classes.insert(
                name,
                ClassHealth {
                    limit,
                    available,
                    running: status.running,
                    completed: status.completed,
                    failed: status.failed,
                    average_execution_secs: status.average_execution_secs,
                },
            );
        }

        HealthSnapshot {
            service: SERVICE_NAME.to_string(),
            version: SERVICE_VERSION.to_string(),
            uptime_secs: self.clock.elapsed_secs(),
            queue: QueueHealth {
                depth: self.queue.depth().await,
                in_flight: self.queue.in_flight_count().await,
                dead_lettered: self.queue.dead_letter_count().await,
            },
            classes,
            cache: self.cache.stats().await,
            breakers: self.orchestrator.breakers().snapshot().await,
            limiter: self.orchestrator.limiter().snapshot(),
            adaptive: self.orchestrator.adaptive().snapshot(),
            backpressure: self.bus.backpressure()
                || self.orchestrator.under_backpressure().await,
        }
    }
}

#[derive(Clone)]
pub struct ApiServer {
    settings: ApiSettings,
    source: Arc<HealthSource>,
}

impl ApiServer {
    pub fn new(settings: ApiSettings, source: Arc<HealthSource>) -> Self {
        Self { settings, source }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(ROUTE_HEALTH, get(health_handler))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(self.source.clone())
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("Health endpoint listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn health_handler(State(source): State<Arc<HealthSource>>) -> Json<HealthSnapshot> {
    Json(source.snapshot().await)
}
