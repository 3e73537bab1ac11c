//! # Hephaestus Core
//!
//! Hephaestus Core is the concurrent job orchestrator at the heart of an
//! autonomous multi-agent platform. It accepts prioritized objectives,
//! decomposes them (via an external planner) into dependent agent
//! tasks, and executes those tasks across a bounded worker pool under
//! per-class concurrency caps, rate limiting over a pool of API keys,
//! circuit breaking, and retries with backoff.
//!
//! ## Architecture
//!
//! - **Cycle Runner**: pulls objectives from the durable queue and
//!   drives each through planning, execution, and artifact caching
//! - **Orchestrator**: dependency-graph scheduler with CAS-versioned
//!   state transitions and event-driven dependent resolution
//! - **Resilience stack**: multi-key rate limiter, per-endpoint circuit
//!   breakers, retry policy, adaptive concurrency controller
//! - **Durable edges**: crash-safe priority queue and an invalidating
//!   result cache
//! - **Health surface**: read-only snapshot over HTTP
//!
//! Agent business logic stays outside the core: agents are invoked
//! through the narrow [`agents::AgentInvoker`] boundary and never hold
//! orchestrator handles.

/// Adaptive concurrency controller and resizable semaphores
pub mod adaptive;
/// Agent invocation boundary and handler registry
pub mod agents;
/// Read-only health/metrics HTTP surface
pub mod api;
/// Per-endpoint circuit breakers
pub mod breaker;
/// Result cache with TTL, LRU, and tag-cascade invalidation
pub mod cache;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and handling
pub mod error;
/// In-process typed event bus
pub mod event_bus;
/// Monotonic time, identifiers, and fingerprints
pub mod ids;
/// Rate limiting and the API key pool
pub mod limiter;
/// Core data models
pub mod models;
/// Host resource sampling
pub mod monitor;
/// Task orchestration and the dependency graph
pub mod orchestrator;
/// Durable priority queue for objectives
pub mod queue;
/// Retry policy with exponential backoff
pub mod retry;
/// Top-level cycle driver
pub mod runner;
/// Versioned shared state store
pub mod state_store;

#[cfg(test)]
mod tests;

pub use error::{HephaestusError, Result};
