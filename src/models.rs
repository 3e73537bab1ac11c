use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};

use crate::ids;

/// Classes of specialized agents the orchestrator dispatches to
///
/// The class is a closed tag: the orchestrator never inspects agent
/// behavior, it only routes by class and bounds concurrency with the
/// class's semaphore.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AgentClass {
    Architect,
    Maestro,
    Reviewer,
    BugHunter,
    Scribe,
}

impl AgentClass {
    pub const ALL: [AgentClass; 5] = [
        AgentClass::Architect,
        AgentClass::Maestro,
        AgentClass::Reviewer,
        AgentClass::BugHunter,
        AgentClass::Scribe,
    ];

    /// Endpoint operation name used for circuit breaker bookkeeping.
    pub fn operation(&self) -> &'static str {
        match self {
            AgentClass::Architect => "architect",
            AgentClass::Maestro => "maestro",
            AgentClass::Reviewer => "reviewer",
            AgentClass::BugHunter => "bug_hunter",
            AgentClass::Scribe => "scribe",
        }
    }
}

impl fmt::Display for AgentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation())
    }
}

impl FromStr for AgentClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "architect" => Ok(AgentClass::Architect),
            "maestro" => Ok(AgentClass::Maestro),
            "reviewer" => Ok(AgentClass::Reviewer),
            "bug_hunter" | "bughunter" => Ok(AgentClass::BugHunter),
            "scribe" => Ok(AgentClass::Scribe),
            _ => Err(format!("Unknown agent class: {s}")),
        }
    }
}

/// Lifecycle states of a task
///
/// Transitions are monotonic along
/// `Pending -> Ready -> Running -> {Succeeded | Failed | Cancelled}`;
/// nothing ever moves backward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Legal forward transitions. Cancellation is reachable from any
    /// non-terminal state; everything else advances one step.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match (self, next) {
            (TaskState::Pending, TaskState::Ready) => true,
            (TaskState::Ready, TaskState::Running) => true,
            (TaskState::Running, TaskState::Succeeded) => true,
            (TaskState::Running, TaskState::Failed) => true,
            (TaskState::Pending | TaskState::Ready | TaskState::Running, TaskState::Cancelled) => {
                true
            }
            _ => false,
        }
    }
}

/// A single agent invocation with inputs, dependencies, and a deadline
///
/// `input` is opaque to the orchestrator; it is transported to the agent
/// boundary untouched. Dependencies reference task ids within the same
/// submitted batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub agent_class: AgentClass,
    pub input: serde_json::Value,
    pub dependencies: Vec<String>,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub priority: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub context: HashMap<String, String>,
}

impl Task {
    pub fn new(agent_class: AgentClass, input: serde_json::Value) -> Self {
        Self {
            id: ids::new_task_id(),
            agent_class,
            input,
            dependencies: Vec::new(),
            deadline: None,
            priority: 0,
            created_at: chrono::Utc::now(),
            context: HashMap::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: chrono::DateTime<chrono::Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_context(mut self, key: String, value: String) -> Self {
        self.context.insert(key, value);
        self
    }
}

/// Versioned task record held in the state store
///
/// The `version` field is the state store's per-entry version at the
/// last write; transitions CAS against it so concurrent executors cannot
/// both move the same task forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub state: TaskState,
    /// Id of the failed dependency that cancelled this task, if any.
    pub cancel_cause: Option<String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl TaskRecord {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            state: TaskState::Pending,
            cancel_cause: None,
            updated_at: chrono::Utc::now(),
        }
    }
}

/// Outcome payload of a finished task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success { value: serde_json::Value },
    Failure { error: String },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }
}

/// Result of a terminal task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_class: AgentClass,
    pub outcome: TaskOutcome,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub attempts: u32,
}

/// A unit of user work in the durable priority queue
///
/// Objectives are planned into task DAGs by an external planner; the
/// queue only orders and persists them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub id: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl Objective {
    pub fn new(payload: serde_json::Value, priority: i64, max_attempts: u32) -> Self {
        Self {
            id: ids::new_task_id(),
            payload,
            priority,
            enqueued_at: chrono::Utc::now(),
            attempts: 0,
            max_attempts,
        }
    }

    /// Stable fingerprint of the objective payload, used as the cache key
    /// for the produced artifact.
    pub fn fingerprint(&self) -> String {
        ids::fingerprint(&[self.payload.to_string().as_bytes()])
    }
}

/// Per-class execution counters surfaced in the health snapshot and
/// sampled by the adaptive controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassStatus {
    pub agent_class: AgentClass,
    pub running: u32,
    pub completed: u64,
    pub failed: u64,
    pub average_execution_secs: f64,
}

impl ClassStatus {
    pub fn new(agent_class: AgentClass) -> Self {
        Self {
            agent_class,
            running: 0,
            completed: 0,
            failed: 0,
            average_execution_secs: 0.0,
        }
    }

    pub fn start_task(&mut self) {
        self.running += 1;
    }

    pub fn complete_task(&mut self, execution_secs: f64) {
        self.running = self.running.saturating_sub(1);
        self.completed += 1;
        self.average_execution_secs = (self.average_execution_secs
            * (self.completed - 1) as f64
            + execution_secs)
            / self.completed as f64;
    }

    pub fn fail_task(&mut self) {
        self.running = self.running.saturating_sub(1);
        self.failed += 1;
    }

    /// A cancelled run: releases the running slot without touching the
    /// completion counters.
    pub fn abandon_task(&mut self) {
        self.running = self.running.saturating_sub(1);
    }
}
