use std::time::Duration;
use thiserror::Error;

/// Convenience type alias for Results with HephaestusError
pub type Result<T> = std::result::Result<T, HephaestusError>;

/// Main error type for Hephaestus Core
///
/// Every failure the orchestrator can surface is tagged with one of
/// these variants. Retry and cascade decisions are driven by the tag,
/// not by inspecting messages.
#[derive(Error, Debug)]
pub enum HephaestusError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Circuit breaker open for {endpoint}")]
    BreakerOpen { endpoint: String },

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        /// Server-provided backoff hint, when one was present.
        retry_after: Option<Duration>,
    },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Task execution error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<HephaestusError>,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Queue is full")]
    QueueFull,

    #[error("Queue snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("Shutdown grace period exceeded")]
    ShutdownTimeout,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl HephaestusError {
    /// Whether the retry policy may re-attempt an operation that failed
    /// with this error. `BreakerOpen` is retryable so a later attempt can
    /// ride the breaker's probe; cancellation and permanent failures are
    /// final.
    pub fn is_retryable(&self) -> bool {
        match self {
            HephaestusError::Transient(_)
            | HephaestusError::RateLimited { .. }
            | HephaestusError::BreakerOpen { .. } => true,
            HephaestusError::RetriesExhausted { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            HephaestusError::Cancelled { .. } | HephaestusError::DeadlineExceeded(_)
        )
    }

    /// Backoff hint attached by the upstream service, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HephaestusError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        HephaestusError::Cancelled {
            reason: reason.into(),
        }
    }
}
