//! Convergence engine.
//!
//! A [`ConvergenceContext`] owns the target, the collaborator handles and
//! the existing-state policy for one run. [`ConvergenceContext::run_tasks`]
//! drives the run loop:
//!
//! 1. Resolve every task's dependencies into a [`DependencyGraph`]. Cycles
//!    and missing strong dependencies fail the run before anything runs.
//! 2. Pass over the collection. A pass attempts, in name order, every
//!    pending task whose dependencies were all done when the pass started.
//! 3. Success marks a task done. A transient error leaves it pending for
//!    the next pass. A permanent error aborts the run.
//! 4. A pass that completes nothing spends one unit of the no-progress
//!    budget; one that completes anything refills it. An empty budget
//!    fails the run as stagnant, naming what is stuck and why.

mod error;
mod report;

pub use error::{RunError, StallReason, StalledTask};
pub use report::{RunReport, TaskStatus};

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::budget::{BudgetState, ProgressBudget};
use crate::core::context::TaskContext;
use crate::core::graph::DependencyGraph;
use crate::core::handles::Handles;
use crate::core::task::{Task, TaskError, TaskMap};
use crate::core::types::{RunId, TaskId};
use crate::events::{Event, EventBus};
use crate::target::Target;

/// Knobs for a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub budget: ProgressBudget,
    /// Task attempts in flight at once within a pass. 1 runs passes sequentially.
    pub max_concurrency: usize,
}

impl RunOptions {
    pub fn new(budget: ProgressBudget) -> Self {
        Self {
            budget,
            max_concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new(ProgressBudget::default())
    }
}

/// Mutable bookkeeping for one run.
struct RunState {
    statuses: BTreeMap<TaskId, TaskStatus>,
    done: BTreeSet<TaskId>,
    completed: Vec<TaskId>,
    attempts: BTreeMap<TaskId, u32>,
    last_error: BTreeMap<TaskId, String>,
    passes: u32,
}

impl RunState {
    fn new(tasks: &TaskMap) -> Self {
        Self {
            statuses: tasks
                .ids()
                .map(|id| (id.clone(), TaskStatus::Pending))
                .collect(),
            done: BTreeSet::new(),
            completed: Vec::new(),
            attempts: BTreeMap::new(),
            last_error: BTreeMap::new(),
            passes: 0,
        }
    }

    fn pending(&self) -> Vec<TaskId> {
        self.statuses
            .iter()
            .filter(|(_, status)| **status != TaskStatus::Done)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn mark_done(&mut self, id: &TaskId) {
        if self.done.insert(id.clone()) {
            self.statuses.insert(id.clone(), TaskStatus::Done);
            self.last_error.remove(id);
            self.completed.push(id.clone());
        }
    }

    fn stalled(&self, graph: &DependencyGraph) -> Vec<StalledTask> {
        self.pending()
            .into_iter()
            .map(|id| {
                let waiting_on = graph.unmet(&id, &self.done);
                let reason = if waiting_on.is_empty() {
                    StallReason::Failing {
                        attempts: self.attempts.get(&id).copied().unwrap_or(0),
                        last_error: self.last_error.get(&id).cloned().unwrap_or_default(),
                    }
                } else {
                    StallReason::Blocked { waiting_on }
                };
                StalledTask { task: id, reason }
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct PassOutcome {
    completed: usize,
    deferred: usize,
}

/// Owns everything a run needs and drives the run loop.
pub struct ConvergenceContext {
    target: Box<dyn Target>,
    check_existing: bool,
    options: RunOptions,
    handles: Handles,
    events: Option<Arc<EventBus>>,
    shutdown: Option<watch::Receiver<bool>>,
    statuses: BTreeMap<TaskId, TaskStatus>,
    converged: bool,
}

impl ConvergenceContext {
    pub fn new(target: Box<dyn Target>, check_existing: bool, options: RunOptions) -> Self {
        Self {
            target,
            check_existing,
            options,
            handles: Handles::new(),
            events: None,
            shutdown: None,
            statuses: BTreeMap::new(),
            converged: false,
        }
    }

    /// Builder: collaborators handed through to tasks.
    pub fn with_handles(mut self, handles: Handles) -> Self {
        self.handles = handles;
        self
    }

    /// Builder: emit lifecycle events to `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Builder: abort between passes once `shutdown` reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn target(&self) -> &dyn Target {
        self.target.as_ref()
    }

    pub fn handles(&self) -> &Handles {
        &self.handles
    }

    pub fn check_existing(&self) -> bool {
        self.check_existing
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Status of a task as of the end of the last run.
    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.statuses.get(id).copied()
    }

    /// Converge every task in `tasks`.
    pub async fn run_tasks(&mut self, tasks: &TaskMap) -> Result<RunReport, RunError> {
        self.converged = false;
        let run_id = RunId::new();
        let started = Instant::now();
        let mut state = RunState::new(tasks);

        let span = info_span!(
            "convergence_run",
            run = %run_id,
            kind = %self.target.kind(),
            tasks = tasks.len(),
        );
        let result = self.drive(run_id, tasks, &mut state).instrument(span).await;

        let duration = started.elapsed();
        self.emit(Event::run_completed(
            run_id,
            result.is_ok(),
            state.passes,
            duration,
        ))
        .await;

        let outcome = match result {
            Ok(()) => {
                info!(run = %run_id, passes = state.passes, ?duration, "converged");
                Ok(RunReport {
                    run_id,
                    passes: state.passes,
                    completed: state.completed,
                    attempts: state.attempts,
                    duration,
                })
            }
            Err(err) => {
                warn!(run = %run_id, error = %err, "run failed");
                Err(err)
            }
        };
        self.statuses = state.statuses;
        self.converged = outcome.is_ok();
        outcome
    }

    /// Finalize the target. Only allowed after a successful run.
    pub async fn finish(&mut self, tasks: &TaskMap) -> Result<(), RunError> {
        if !self.converged {
            return Err(RunError::NotConverged);
        }
        self.target.finish(tasks).await?;
        debug!(kind = %self.target.kind(), "target finished");
        Ok(())
    }

    /// Run, then finish, then release the context.
    pub async fn converge(mut self, tasks: &TaskMap) -> Result<RunReport, RunError> {
        let report = self.run_tasks(tasks).await?;
        self.finish(tasks).await?;
        self.close();
        Ok(report)
    }

    /// Release the target and the collaborator handles.
    pub fn close(self) {
        debug!(handles = ?self.handles.describe(), "closing convergence context");
    }

    async fn drive(
        &self,
        run_id: RunId,
        tasks: &TaskMap,
        state: &mut RunState,
    ) -> Result<(), RunError> {
        let graph = DependencyGraph::build(tasks)?;
        info!(tasks = tasks.len(), depth = graph.depth(), "starting convergence run");
        self.emit(Event::run_started(run_id, tasks.len())).await;

        let mut budget = self.options.budget.tracker();
        while state.done.len() < tasks.len() {
            if self.shutdown_requested() {
                return Err(RunError::Cancelled {
                    pending: state.pending(),
                });
            }

            state.passes += 1;
            let pass = state.passes;
            let outcome = self
                .run_pass(run_id, pass, tasks, &graph, state)
                .instrument(info_span!("convergence_pass", pass))
                .await?;

            match budget.record_pass(outcome.completed > 0) {
                BudgetState::Reset => {}
                BudgetState::Spent { remaining } => {
                    debug!(remaining, deferred = outcome.deferred, "pass made no progress");
                    if outcome.deferred > 0 {
                        self.pause(self.options.budget.pass_delay()).await;
                    }
                }
                BudgetState::Exhausted => {
                    let stalled = state.stalled(&graph);
                    warn!(passes = pass, stalled = stalled.len(), "no-progress budget exhausted");
                    return Err(RunError::Stagnation {
                        passes: pass,
                        stalled,
                    });
                }
            }
        }
        Ok(())
    }

    async fn run_pass(
        &self,
        run_id: RunId,
        pass: u32,
        tasks: &TaskMap,
        graph: &DependencyGraph,
        state: &mut RunState,
    ) -> Result<PassOutcome, RunError> {
        // readiness only sees tasks done before this pass began
        let snapshot = state.done.clone();
        let ready: Vec<(TaskId, Arc<dyn Task>, u32)> = tasks
            .iter()
            .filter(|(id, _)| !snapshot.contains(*id) && graph.is_ready(id, &snapshot))
            .map(|(id, task)| {
                let attempt = state.attempts.get(id).copied().unwrap_or(0) + 1;
                (id.clone(), Arc::clone(task), attempt)
            })
            .collect();

        debug!(ready = ready.len(), "pass started");
        self.emit(Event::pass_started(run_id, pass, ready.len())).await;
        for (id, _, _) in &ready {
            state.statuses.insert(id.clone(), TaskStatus::Running);
        }

        let sequential = self.options.max_concurrency <= 1;
        let mut outcome = PassOutcome::default();
        let mut fatal = None;
        let mut attempts = stream::iter(ready)
            .map(|(id, task, attempt)| self.attempt(run_id, id, task, attempt))
            .buffered(self.options.max_concurrency.max(1));

        while let Some((id, attempt, result, elapsed)) = attempts.next().await {
            state.attempts.insert(id.clone(), attempt);
            match result {
                Ok(()) => {
                    state.mark_done(&id);
                    outcome.completed += 1;
                    self.emit(Event::task_completed(run_id, id, elapsed)).await;
                }
                Err(err) if err.is_transient() => {
                    debug!(task = %id, attempt, error = %err, "task deferred");
                    let message = err.to_string();
                    state.statuses.insert(id.clone(), TaskStatus::Pending);
                    state.last_error.insert(id.clone(), message.clone());
                    outcome.deferred += 1;
                    self.emit(Event::task_deferred(run_id, id, attempt, message))
                        .await;
                }
                Err(err) => {
                    warn!(task = %id, attempt, error = %err, "task failed permanently");
                    state.statuses.insert(id.clone(), TaskStatus::Failed);
                    self.emit(Event::task_failed(run_id, id.clone(), err.to_string()))
                        .await;
                    if fatal.is_none() {
                        fatal = Some(RunError::TaskFailed {
                            task: id,
                            source: err,
                        });
                    }
                    // concurrent attempts already in flight are allowed to finish
                    if sequential {
                        break;
                    }
                }
            }
        }
        drop(attempts);

        for status in state.statuses.values_mut() {
            if *status == TaskStatus::Running {
                *status = TaskStatus::Pending;
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        let remaining = tasks.len() - state.done.len();
        debug!(
            completed = outcome.completed,
            deferred = outcome.deferred,
            remaining,
            "pass finished"
        );
        self.emit(Event::pass_completed(
            run_id,
            pass,
            outcome.completed,
            remaining,
        ))
        .await;
        Ok(outcome)
    }

    async fn attempt(
        &self,
        run_id: RunId,
        id: TaskId,
        task: Arc<dyn Task>,
        attempt: u32,
    ) -> (TaskId, u32, Result<(), TaskError>, Duration) {
        let span = info_span!("task_attempt", task = %id, attempt);
        async move {
            self.emit(Event::task_started(run_id, id.clone(), attempt))
                .await;
            let started = Instant::now();
            let result = {
                let ctx = TaskContext::new(
                    &id,
                    self.target.as_ref(),
                    self.check_existing,
                    &self.handles,
                    attempt,
                );
                task.run(&ctx).await
            };
            (id, attempt, result, started.elapsed())
        }
        .instrument(span)
        .await
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn pause(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        debug!(?delay, "pausing before next pass");
        match self.shutdown.clone() {
            Some(mut rx) => {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown_signalled(&mut rx) => {}
                }
            }
            None => sleep(delay).await,
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.emit(event).await;
        }
    }
}

/// Resolves once shutdown is requested; never if the sender is gone.
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
