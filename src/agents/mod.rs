//! The agent invocation boundary.
//!
//! The orchestrator never interprets agent inputs or outputs; it hands
//! both across this narrow interface together with a context carrying
//! the deadline, cancellation token, request id, and the rate limiter's
//! selected key. Agents see nothing else of the core.

use crate::limiter::KeyHandle;
use crate::models::AgentClass;
use crate::{ids, HephaestusError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to an agent.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub request_id: String,
    pub task_id: String,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub cancel: CancellationToken,
    pub api_key: KeyHandle,
}

impl InvocationContext {
    pub fn new(task_id: &str, deadline: Option<chrono::DateTime<chrono::Utc>>, cancel: CancellationToken, api_key: KeyHandle) -> Self {
        Self {
            request_id: ids::new_request_id(),
            task_id: task_id.to_string(),
            deadline,
            cancel,
            api_key,
        }
    }

    /// Time remaining until the deadline, if one is set.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline.map(|deadline| {
            (deadline - chrono::Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO)
        })
    }
}

/// Single method the core consumes to execute an agent task.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, ctx: InvocationContext, class: AgentClass, input: Value)
        -> Result<Value>;
}

/// Maps each agent class to its invocation handler. Dispatch is by tag
/// only; the registry holds no other knowledge about agents.
pub struct InvokerRegistry {
    handlers: HashMap<AgentClass, Arc<dyn AgentInvoker>>,
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(mut self, class: AgentClass, handler: Arc<dyn AgentInvoker>) -> Self {
        self.handlers.insert(class, handler);
        self
    }

    /// Register one handler for every agent class.
    pub fn with_default(handler: Arc<dyn AgentInvoker>) -> Self {
        let mut registry = Self::new();
        for class in AgentClass::ALL {
            registry.handlers.insert(class, handler.clone());
        }
        registry
    }

    pub fn supports(&self, class: AgentClass) -> bool {
        self.handlers.contains_key(&class)
    }
}

impl Default for InvokerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentInvoker for InvokerRegistry {
    async fn invoke(
        &self,
        ctx: InvocationContext,
        class: AgentClass,
        input: Value,
    ) -> Result<Value> {
        let handler = self.handlers.get(&class).ok_or_else(|| {
            HephaestusError::Validation(format!("no handler registered for agent class {class}"))
        })?;
        handler.invoke(ctx, class, input).await
    }
}
