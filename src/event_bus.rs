//! In-process typed event bus.
//!
//! A single bounded queue feeds a dispatcher task, which fans events out
//! to per-handler bounded queues; each handler drains its own queue on a
//! dedicated task, so deliveries to one handler are serialized. Events
//! published from one task arrive at every handler in emission order.
//! Handlers that fall behind their queue bound have events shed rather
//! than stalling the dispatcher.

use crate::constants::{BUS_PUBLISH_DEADLINE, HANDLER_QUEUE_CAPACITY};
use crate::models::{AgentClass, TaskResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Events flowing through the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEvent {
    TaskStarted {
        task_id: String,
        agent_class: AgentClass,
        at: chrono::DateTime<chrono::Utc>,
    },
    TaskCompleted {
        task_id: String,
        agent_class: AgentClass,
        result: TaskResult,
        at: chrono::DateTime<chrono::Utc>,
    },
    TaskFailed {
        task_id: String,
        agent_class: AgentClass,
        error: String,
        at: chrono::DateTime<chrono::Utc>,
    },
    DependencyResolved {
        from_id: String,
        to_id: String,
        at: chrono::DateTime<chrono::Utc>,
    },
    BackpressureDetected {
        reason: String,
        at: chrono::DateTime<chrono::Utc>,
    },
    ResourceAvailable {
        kind: String,
        at: chrono::DateTime<chrono::Utc>,
    },
}

/// Tag used for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    DependencyResolved,
    BackpressureDetected,
    ResourceAvailable,
}

impl TaskEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TaskEvent::TaskStarted { .. } => EventKind::TaskStarted,
            TaskEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            TaskEvent::TaskFailed { .. } => EventKind::TaskFailed,
            TaskEvent::DependencyResolved { .. } => EventKind::DependencyResolved,
            TaskEvent::BackpressureDetected { .. } => EventKind::BackpressureDetected,
            TaskEvent::ResourceAvailable { .. } => EventKind::ResourceAvailable,
        }
    }
}

type HandlerFn = Box<dyn Fn(TaskEvent) + Send + Sync>;

struct HandlerSlot {
    name: String,
    tx: mpsc::Sender<TaskEvent>,
}

struct BusInner {
    handlers: RwLock<HashMap<EventKind, Vec<HandlerSlot>>>,
    published: AtomicU64,
    dropped: AtomicU64,
    shed: AtomicU64,
    backpressure: AtomicBool,
}

/// Cloneable handle to the bus; the dispatcher task lives as long as any
/// handle does.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<TaskEvent>,
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<TaskEvent>(capacity);
        let inner = Arc::new(BusInner {
            handlers: RwLock::new(HashMap::new()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            shed: AtomicU64::new(0),
            backpressure: AtomicBool::new(false),
        });

        let dispatcher_inner = inner.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatcher_inner.dispatch(event).await;
            }
            debug!("Event bus dispatcher stopped");
        });

        Self { tx, inner }
    }

    /// Publish an event. When the bus is full the publisher raises the
    /// backpressure flag and blocks up to the publish deadline; on
    /// timeout the event is dropped and counted.
    pub async fn publish(&self, event: TaskEvent) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        match self.tx.try_send(event) {
            Ok(()) => {
                self.inner.backpressure.store(false, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.inner.backpressure.store(true, Ordering::Relaxed);
                warn!("Event bus full, publisher blocking");

                match self.tx.send_timeout(event, BUS_PUBLISH_DEADLINE).await {
                    Ok(()) => {
                        // Space freed; record that pressure was seen.
                        let _ = self.tx.try_send(TaskEvent::BackpressureDetected {
                            reason: "event bus at capacity".to_string(),
                            at: chrono::Utc::now(),
                        });
                    }
                    Err(_) => {
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("Event dropped after publish deadline");
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event bus closed, event discarded");
            }
        }
    }

    /// Register `handler` for events of `kind`. The handler must not
    /// block; it runs on its own drainer task and is invoked serially.
    pub async fn subscribe<F>(&self, kind: EventKind, name: &str, handler: F)
    where
        F: Fn(TaskEvent) + Send + Sync + 'static,
    {
        self.subscribe_with_capacity(kind, name, HANDLER_QUEUE_CAPACITY, handler)
            .await;
    }

    /// Same as [`subscribe`](Self::subscribe) with an explicit queue
    /// bound; events beyond the bound are shed for this handler.
    pub async fn subscribe_with_capacity<F>(
        &self,
        kind: EventKind,
        name: &str,
        capacity: usize,
        handler: F,
    ) where
        F: Fn(TaskEvent) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<TaskEvent>(capacity);
        {
            let mut handlers = self.inner.handlers.write().await;
            handlers.entry(kind).or_default().push(HandlerSlot {
                name: name.to_string(),
                tx,
            });
        }

        let handler: HandlerFn = Box::new(handler);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
        });
    }

    pub fn backpressure(&self) -> bool {
        self.inner.backpressure.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn shed_count(&self) -> u64 {
        self.inner.shed.load(Ordering::Relaxed)
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

impl BusInner {
    async fn dispatch(&self, event: TaskEvent) {
        let kind = event.kind();
        let mut closed = Vec::new();
        {
            let handlers = self.handlers.read().await;
            let Some(slots) = handlers.get(&kind) else {
                return;
            };
            for (i, slot) in slots.iter().enumerate() {
                match slot.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.shed.fetch_add(1, Ordering::Relaxed);
                        warn!("Handler {} lagging, event shed", slot.name);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(i),
                }
            }
        }
        if !closed.is_empty() {
            let mut handlers = self.handlers.write().await;
            if let Some(slots) = handlers.get_mut(&kind) {
                for i in closed.into_iter().rev() {
                    if i < slots.len() {
                        debug!("Removing closed handler {}", slots[i].name);
                        slots.remove(i);
                    }
                }
            }
        }
    }
}
