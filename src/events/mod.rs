//! Lifecycle events and event handling.
//!
//! The engine emits an [`Event`] at each step of a convergence run so that
//! callers can observe progress without parsing logs.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::types::{RunId, TaskId};

/// Lifecycle events emitted during a convergence run.
#[derive(Debug, Clone)]
pub enum Event {
    /// A run has started.
    RunStarted {
        run_id: RunId,
        task_count: usize,
        timestamp: Instant,
    },

    /// A pass over the ready tasks has started.
    PassStarted {
        run_id: RunId,
        pass: u32,
        ready: usize,
        timestamp: Instant,
    },

    /// A task attempt has started.
    TaskStarted {
        run_id: RunId,
        task_id: TaskId,
        attempt: u32,
        timestamp: Instant,
    },

    /// A task succeeded and is now done.
    TaskCompleted {
        run_id: RunId,
        task_id: TaskId,
        duration: Duration,
        timestamp: Instant,
    },

    /// A task failed transiently and will be retried on a later pass.
    TaskDeferred {
        run_id: RunId,
        task_id: TaskId,
        attempt: u32,
        error: String,
        timestamp: Instant,
    },

    /// A task failed permanently; the run is aborting.
    TaskFailed {
        run_id: RunId,
        task_id: TaskId,
        error: String,
        timestamp: Instant,
    },

    /// A pass has finished.
    PassCompleted {
        run_id: RunId,
        pass: u32,
        completed: usize,
        remaining: usize,
        timestamp: Instant,
    },

    /// A run has finished, successfully or not.
    RunCompleted {
        run_id: RunId,
        success: bool,
        passes: u32,
        duration: Duration,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::RunStarted { timestamp, .. }
            | Event::PassStarted { timestamp, .. }
            | Event::TaskStarted { timestamp, .. }
            | Event::TaskCompleted { timestamp, .. }
            | Event::TaskDeferred { timestamp, .. }
            | Event::TaskFailed { timestamp, .. }
            | Event::PassCompleted { timestamp, .. }
            | Event::RunCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// The run this event belongs to.
    pub fn run_id(&self) -> RunId {
        match self {
            Event::RunStarted { run_id, .. }
            | Event::PassStarted { run_id, .. }
            | Event::TaskStarted { run_id, .. }
            | Event::TaskCompleted { run_id, .. }
            | Event::TaskDeferred { run_id, .. }
            | Event::TaskFailed { run_id, .. }
            | Event::PassCompleted { run_id, .. }
            | Event::RunCompleted { run_id, .. } => *run_id,
        }
    }

    pub fn run_started(run_id: RunId, task_count: usize) -> Self {
        Event::RunStarted {
            run_id,
            task_count,
            timestamp: Instant::now(),
        }
    }

    pub fn pass_started(run_id: RunId, pass: u32, ready: usize) -> Self {
        Event::PassStarted {
            run_id,
            pass,
            ready,
            timestamp: Instant::now(),
        }
    }

    pub fn task_started(run_id: RunId, task_id: TaskId, attempt: u32) -> Self {
        Event::TaskStarted {
            run_id,
            task_id,
            attempt,
            timestamp: Instant::now(),
        }
    }

    pub fn task_completed(run_id: RunId, task_id: TaskId, duration: Duration) -> Self {
        Event::TaskCompleted {
            run_id,
            task_id,
            duration,
            timestamp: Instant::now(),
        }
    }

    pub fn task_deferred(run_id: RunId, task_id: TaskId, attempt: u32, error: String) -> Self {
        Event::TaskDeferred {
            run_id,
            task_id,
            attempt,
            error,
            timestamp: Instant::now(),
        }
    }

    pub fn task_failed(run_id: RunId, task_id: TaskId, error: String) -> Self {
        Event::TaskFailed {
            run_id,
            task_id,
            error,
            timestamp: Instant::now(),
        }
    }

    pub fn pass_completed(run_id: RunId, pass: u32, completed: usize, remaining: usize) -> Self {
        Event::PassCompleted {
            run_id,
            pass,
            completed,
            remaining,
            timestamp: Instant::now(),
        }
    }

    pub fn run_completed(run_id: RunId, success: bool, passes: u32, duration: Duration) -> Self {
        Event::RunCompleted {
            run_id,
            success,
            passes,
            duration,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a one-line summary of each task and run outcome to the log.
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::TaskCompleted {
                task_id, duration, ..
            } => info!(task = %task_id, ?duration, "task done"),
            Event::TaskDeferred {
                task_id,
                attempt,
                error,
                ..
            } => info!(task = %task_id, attempt, %error, "task deferred"),
            Event::TaskFailed { task_id, error, .. } => {
                warn!(task = %task_id, %error, "task failed")
            }
            Event::RunCompleted {
                success,
                passes,
                duration,
                ..
            } => info!(success, passes, ?duration, "run finished"),
            _ => {}
        }
    }
}
