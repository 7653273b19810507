//! Testing utilities for users of the converge library.
//!
//! - [`StubTask`]: succeeds immediately, optionally recording into a [`RunLog`]
//! - [`FlakyTask`]: fails transiently N times, then succeeds
//! - [`FailingTask`]: always fails permanently
//! - [`SharedBuffer`]: a cloneable writer for capturing target output
//! - [`TestHarness`]: converges a collection against a script target

use async_trait::async_trait;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::core::budget::ProgressBudget;
use crate::core::context::TaskContext;
use crate::core::deps::TaskRef;
use crate::core::task::{Task, TaskError, TaskMap};
use crate::engine::{ConvergenceContext, RunError, RunOptions, RunReport};
use crate::target::{ScriptFormat, ScriptTarget};

/// A cloneable in-memory writer.
///
/// Targets take ownership of their output writer; keep a clone to read
/// what they wrote.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<StdMutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        self.bytes
            .lock()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self
            .bytes
            .lock()
            .map_err(|_| io::Error::other("buffer lock poisoned"))?;
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Records the order in which tasks ran.
#[derive(Clone, Default)]
pub struct RunLog {
    entries: Arc<StdMutex<Vec<String>>>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(name.to_string());
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// How many times `name` ran.
    pub fn count(&self, name: &str) -> usize {
        self.entries().iter().filter(|e| *e == name).count()
    }
}

/// A task that succeeds immediately.
///
/// # Example
///
/// ```
/// use converge::testing::{RunLog, StubTask};
///
/// let log = RunLog::new();
/// let task = StubTask::new("b").depends_on("a").logging_to(&log);
/// ```
pub struct StubTask {
    name: String,
    references: Vec<TaskRef>,
    log: Option<RunLog>,
}

impl StubTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            references: Vec::new(),
            log: None,
        }
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.references.push(TaskRef::to(name));
        self
    }

    pub fn weakly_depends_on(mut self, name: &str) -> Self {
        self.references.push(TaskRef::weak(name));
        self
    }

    pub fn logging_to(mut self, log: &RunLog) -> Self {
        self.log = Some(log.clone());
        self
    }
}

#[async_trait]
impl Task for StubTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn references(&self) -> Vec<TaskRef> {
        self.references.clone()
    }

    async fn run(&self, _ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        if let Some(log) = &self.log {
            log.record(&self.name);
        }
        Ok(())
    }
}

/// A task that fails transiently a configurable number of times before
/// succeeding.
///
/// The failure counter is behind a mutex so that concurrent passes see a
/// deterministic sequence.
pub struct FlakyTask {
    name: String,
    references: Vec<TaskRef>,
    state: Mutex<FlakyState>,
}

struct FlakyState {
    failures_remaining: u32,
    call_count: u32,
}

impl FlakyTask {
    /// Create a task that fails `failures` times then succeeds.
    pub fn new(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            references: Vec::new(),
            state: Mutex::new(FlakyState {
                failures_remaining: failures,
                call_count: 0,
            }),
        }
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.references.push(TaskRef::to(name));
        self
    }

    pub async fn call_count(&self) -> u32 {
        self.state.lock().await.call_count
    }

    pub async fn failures_remaining(&self) -> u32 {
        self.state.lock().await.failures_remaining
    }
}

#[async_trait]
impl Task for FlakyTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn references(&self) -> Vec<TaskRef> {
        self.references.clone()
    }

    async fn run(&self, _ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        let mut state = self.state.lock().await;
        state.call_count += 1;
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(TaskError::Transient("not ready yet".to_string()));
        }
        Ok(())
    }
}

/// A task that always fails permanently.
pub struct FailingTask {
    name: String,
    references: Vec<TaskRef>,
    message: String,
    calls: AtomicU32,
}

impl FailingTask {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            references: Vec::new(),
            message: message.into(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.references.push(TaskRef::to(name));
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for FailingTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn references(&self) -> Vec<TaskRef> {
        self.references.clone()
    }

    async fn run(&self, _ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TaskError::ExecutionFailed(self.message.clone()))
    }
}

/// Converges task collections against a shell-script target with no
/// pause between passes.
///
/// # Example
///
/// ```ignore
/// use converge::testing::{StubTask, TestHarness};
/// use converge::TaskMap;
/// use std::sync::Arc;
///
/// let tasks = TaskMap::from_tasks(vec![Arc::new(StubTask::new("a")) as _])?;
/// let result = TestHarness::new().run(&tasks).await;
/// assert!(result.outcome.is_ok());
/// ```
pub struct TestHarness {
    options: RunOptions,
    format: ScriptFormat,
}

/// Result from a [`TestHarness`] run.
pub struct HarnessResult {
    pub outcome: Result<RunReport, RunError>,
    /// What the target wrote on finish; empty if the run failed.
    pub output: String,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            options: RunOptions::new(ProgressBudget::default().with_pass_delay(Duration::ZERO)),
            format: ScriptFormat::Shell,
        }
    }

    /// Set the no-progress budget.
    pub fn with_budget(mut self, max_passes_without_progress: u32) -> Self {
        self.options.budget = ProgressBudget::new(max_passes_without_progress)
            .expect("budget must be positive")
            .with_pass_delay(Duration::ZERO);
        self
    }

    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.options = self.options.with_concurrency(max_concurrency);
        self
    }

    pub fn with_format(mut self, format: ScriptFormat) -> Self {
        self.format = format;
        self
    }

    /// Run and finish, capturing the rendered script.
    pub async fn run(&self, tasks: &TaskMap) -> HarnessResult {
        let output = SharedBuffer::new();
        let target = ScriptTarget::new(self.format, output.clone());
        let ctx = ConvergenceContext::new(Box::new(target), false, self.options.clone());
        let outcome = ctx.converge(tasks).await;
        HarnessResult {
            outcome,
            output: output.contents(),
        }
    }

    /// Run and assert the collection converged.
    pub async fn run_and_assert_success(&self, tasks: &TaskMap) -> HarnessResult {
        let result = self.run(tasks).await;
        if let Err(err) = &result.outcome {
            panic!("expected run to converge, but it failed: {err}");
        }
        result
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handles::Handles;
    use crate::core::types::TaskId;

    #[tokio::test]
    async fn test_flaky_task_counts_down() {
        let task = FlakyTask::new("flaky", 2);
        let target = ScriptTarget::new(ScriptFormat::Shell, Vec::new());
        let handles = Handles::new();
        let id = TaskId::new("flaky");
        let ctx = TaskContext::new(&id, &target, false, &handles, 1);

        assert!(task.run(&ctx).await.unwrap_err().is_transient());
        assert!(task.run(&ctx).await.is_err());
        assert!(task.run(&ctx).await.is_ok());
        assert_eq!(task.call_count().await, 3);
        assert_eq!(task.failures_remaining().await, 0);
    }

    #[tokio::test]
    async fn test_failing_task_is_permanent() {
        let task = FailingTask::new("bad", "boom");
        let target = ScriptTarget::new(ScriptFormat::Shell, Vec::new());
        let handles = Handles::new();
        let id = TaskId::new("bad");
        let ctx = TaskContext::new(&id, &target, false, &handles, 1);

        let err = task.run(&ctx).await.unwrap_err();

        assert!(!err.is_transient());
        assert_eq!(task.call_count(), 1);
    }

    #[tokio::test]
    async fn test_harness_reports_success_and_output() {
        let log = RunLog::new();
        let tasks = TaskMap::from_tasks(vec![
            Arc::new(StubTask::new("a").logging_to(&log)) as Arc<dyn Task>,
            Arc::new(StubTask::new("b").depends_on("a").logging_to(&log)),
        ])
        .unwrap();

        let result = TestHarness::new().run_and_assert_success(&tasks).await;

        assert_eq!(log.entries(), vec!["a", "b"]);
        assert_eq!(log.count("a"), 1);
        assert_eq!(result.output, "#!/bin/sh\nset -e\n");
    }

    #[tokio::test]
    async fn test_harness_budget() {
        let tasks =
            TaskMap::from_tasks(vec![Arc::new(FlakyTask::new("flaky", 2)) as Arc<dyn Task>])
                .unwrap();

        let result = TestHarness::new().with_budget(2).run(&tasks).await;

        assert!(matches!(result.outcome, Err(RunError::Stagnation { .. })));
        assert!(result.output.is_empty());
    }

    #[test]
    fn test_shared_buffer_clones_share_bytes() {
        let buffer = SharedBuffer::new();
        let mut writer = buffer.clone();

        writer.write_all(b"hello").unwrap();

        assert_eq!(buffer.contents(), "hello");
    }
}
