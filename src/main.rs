use clap::Parser;
use hephaestus_core::{
    agents::{AgentInvoker, InvocationContext, InvokerRegistry},
    api::{ApiServer, HealthSource},
    cache::IntelligentCache,
    config::Config,
    constants::EVENT_BUS_CAPACITY,
    event_bus::EventBus,
    models::{AgentClass, Objective, Task},
    orchestrator::Orchestrator,
    queue::ObjectiveQueue,
    runner::{CycleRunner, Planner},
    state_store::StateStore,
    HephaestusError, Result,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 2;
const EXIT_SNAPSHOT_CORRUPT: i32 = 3;
const EXIT_SHUTDOWN_TIMEOUT: i32 = 4;

#[derive(Parser, Debug)]
#[command(name = "hephaestus-core", about = "Concurrent job orchestrator")]
struct Cli {
    /// Override the queue snapshot path.
    #[arg(long)]
    queue_path: Option<String>,

    /// Pin the concurrency strategy to Aggressive.
    #[arg(long)]
    turbo: bool,
}

/// Development planner: one Scribe task carrying the objective payload.
/// Production deployments plug in a real planner.
struct PassthroughPlanner;

#[async_trait]
impl Planner for PassthroughPlanner {
    async fn plan(&self, objective: &Objective) -> Result<Vec<Task>> {
        Ok(vec![
            Task::new(AgentClass::Scribe, objective.payload.clone())
                .with_priority(objective.priority),
        ])
    }
}

/// Development invoker that reflects its input back.
struct EchoInvoker;

#[async_trait]
impl AgentInvoker for EchoInvoker {
    async fn invoke(
        &self,
        _ctx: InvocationContext,
        _class: AgentClass,
        input: Value,
    ) -> Result<Value> {
        Ok(input)
    }
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Hephaestus Core");
    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            return EXIT_CONFIG;
        }
    };
    if let Some(path) = cli.queue_path {
        config.queue.path = path;
    }
    if cli.turbo {
        config.adaptive.turbo = true;
    }

    let queue = match ObjectiveQueue::open(&config.queue) {
        Ok(queue) => Arc::new(queue),
        Err(e @ HephaestusError::SnapshotCorrupt(_)) => {
            error!("Queue snapshot unrecoverable: {}", e);
            return EXIT_SNAPSHOT_CORRUPT;
        }
        Err(e) => {
            error!("Failed to open queue: {}", e);
            return EXIT_CONFIG;
        }
    };

    let shutdown = CancellationToken::new();
    let bus = EventBus::new(EVENT_BUS_CAPACITY);
    let state = Arc::new(StateStore::new());
    let invoker = Arc::new(InvokerRegistry::with_default(Arc::new(EchoInvoker)));
    let orchestrator = Orchestrator::new(
        &config,
        invoker,
        bus.clone(),
        state,
        shutdown.child_token(),
    );
    let cache = Arc::new(IntelligentCache::new(&config.cache));

    let health = Arc::new(HealthSource::new(
        queue.clone(),
        orchestrator.clone(),
        cache.clone(),
        bus.clone(),
    ));
    let api = ApiServer::new(config.api.clone(), health);
    let api_shutdown = shutdown.child_token();
    tokio::spawn(async move {
        if let Err(e) = api.run(api_shutdown).await {
            error!("Health endpoint failed: {}", e);
        }
    });

    let runner = CycleRunner::new(
        config,
        queue,
        Arc::new(PassthroughPlanner),
        orchestrator,
        cache,
        bus,
        shutdown.clone(),
    );
    runner.start_background();

    tokio::select! {
        result = runner.run() => {
            if let Err(e) = result {
                error!("Cycle runner failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    match runner.shutdown().await {
        Ok(()) => EXIT_OK,
        Err(HephaestusError::ShutdownTimeout) => EXIT_SHUTDOWN_TIMEOUT,
        Err(e) => {
            error!("Shutdown error: {}", e);
            EXIT_OK
        }
    }
}
