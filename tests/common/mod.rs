//! Common test utilities shared across integration tests.

use async_trait::async_trait;
use converge::{Event, EventHandler, ProgressBudget, RunOptions, Task, TaskMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Recording event handler for verifying events.
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    pub async fn pass_count(&self) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| matches!(e, Event::PassStarted { .. }))
            .count()
    }

    pub async fn deferred_count(&self) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| matches!(e, Event::TaskDeferred { .. }))
            .count()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// Run options with no pause between passes.
pub fn fast_options(max_passes_without_progress: u32) -> RunOptions {
    let budget = ProgressBudget::new(max_passes_without_progress)
        .unwrap()
        .with_pass_delay(Duration::ZERO);
    RunOptions::new(budget)
}

/// Build a task map, panicking on duplicate names.
pub fn task_map(tasks: Vec<Arc<dyn Task>>) -> TaskMap {
    TaskMap::from_tasks(tasks).unwrap()
}
