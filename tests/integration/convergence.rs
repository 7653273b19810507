//! End-to-end convergence runs.
//!
//! Tests that drive whole task collections through the public API and
//! check ordering, pass counts, retries and terminal errors.

use crate::common::{RecordingHandler, fast_options, task_map};
use converge::testing::{FailingTask, FlakyTask, RunLog, StubTask, TestHarness};
use converge::{
    ConvergenceContext, DirectTarget, Event, EventBus, RunError, StallReason, Task, TaskError,
    TaskId, TaskStatus,
};
use std::sync::Arc;

#[tokio::test]
async fn test_dependent_tasks_run_in_dependency_order() {
    let log = RunLog::new();
    let tasks = task_map(vec![
        Arc::new(StubTask::new("C").depends_on("B").logging_to(&log)),
        Arc::new(StubTask::new("B").depends_on("A").logging_to(&log)),
        Arc::new(StubTask::new("A").logging_to(&log)),
    ]);

    let result = TestHarness::new().run_and_assert_success(&tasks).await;

    let report = result.outcome.unwrap();
    assert_eq!(log.entries(), vec!["A", "B", "C"]);
    assert_eq!(report.passes, 3);
    assert_eq!(report.total_attempts(), 3);
}

#[tokio::test]
async fn test_independent_tasks_share_a_pass() {
    let log = RunLog::new();
    let tasks = task_map(vec![
        Arc::new(StubTask::new("A").logging_to(&log)),
        Arc::new(StubTask::new("B").logging_to(&log)),
        Arc::new(StubTask::new("C").depends_on("A").depends_on("B").logging_to(&log)),
    ]);

    let report = TestHarness::new()
        .run_and_assert_success(&tasks)
        .await
        .outcome
        .unwrap();

    assert_eq!(report.passes, 2);
    assert_eq!(log.entries(), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_cycle_is_rejected_before_anything_runs() {
    let log = RunLog::new();
    let tasks = task_map(vec![
        Arc::new(StubTask::new("X").depends_on("Y").logging_to(&log)),
        Arc::new(StubTask::new("Y").depends_on("X").logging_to(&log)),
        Arc::new(StubTask::new("free").logging_to(&log)),
    ]);

    let err = TestHarness::new().run(&tasks).await.outcome.unwrap_err();

    assert!(err.is_config());
    assert!(err.to_string().contains("cycle"));
    assert!(log.entries().is_empty());
}

#[tokio::test]
async fn test_permanent_failure_stops_the_run() {
    let log = RunLog::new();
    let z = Arc::new(FailingTask::new("Z", "disk full"));
    let tasks = task_map(vec![
        z.clone() as Arc<dyn Task>,
        Arc::new(StubTask::new("after-z").depends_on("Z").logging_to(&log)),
    ]);

    let result = TestHarness::new().run(&tasks).await;

    match result.outcome {
        Err(RunError::TaskFailed { task, source }) => {
            assert_eq!(task.as_str(), "Z");
            assert!(matches!(source, TaskError::ExecutionFailed(msg) if msg == "disk full"));
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }
    assert_eq!(z.call_count(), 1);
    assert!(log.entries().is_empty());
    assert!(result.output.is_empty());
}

#[tokio::test]
async fn test_flaky_task_converges_within_budget() {
    let k = Arc::new(FlakyTask::new("K", 3));
    let tasks = task_map(vec![k.clone() as Arc<dyn Task>]);

    let report = TestHarness::new()
        .with_budget(4)
        .run_and_assert_success(&tasks)
        .await
        .outcome
        .unwrap();

    assert_eq!(k.call_count().await, 4);
    assert_eq!(report.attempts_for(&TaskId::new("K")), 4);
    assert_eq!(report.retried(), vec![&TaskId::new("K")]);
}

#[tokio::test]
async fn test_flaky_task_exhausts_small_budget() {
    let tasks = task_map(vec![
        Arc::new(FlakyTask::new("K", 3)),
        Arc::new(StubTask::new("after-k").depends_on("K")),
    ]);

    let err = TestHarness::new()
        .with_budget(3)
        .run(&tasks)
        .await
        .outcome
        .unwrap_err();

    match err {
        RunError::Stagnation { passes, stalled } => {
            assert_eq!(passes, 3);
            assert_eq!(stalled.len(), 2);
            let k = stalled.iter().find(|s| s.task.as_str() == "K").unwrap();
            assert!(matches!(
                &k.reason,
                StallReason::Failing { attempts: 3, .. }
            ));
            let after = stalled.iter().find(|s| s.task.as_str() == "after-k").unwrap();
            assert_eq!(
                after.reason,
                StallReason::Blocked {
                    waiting_on: vec![TaskId::new("K")]
                }
            );
        }
        other => panic!("expected Stagnation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_events_follow_the_run() {
    let handler = RecordingHandler::new();
    let bus = EventBus::new();
    bus.register(handler.clone()).await;
    let tasks = task_map(vec![
        Arc::new(FlakyTask::new("K", 1)),
        Arc::new(StubTask::new("J").depends_on("K")),
    ]);

    let ctx = ConvergenceContext::new(Box::new(DirectTarget::new("/")), true, fast_options(5))
        .with_event_bus(Arc::new(bus));
    let report = ctx.converge(&tasks).await.unwrap();

    assert_eq!(report.passes, 3);
    assert_eq!(handler.pass_count().await, 3);
    assert_eq!(handler.deferred_count().await, 1);

    let events = handler.events().await;
    assert!(matches!(
        events.first(),
        Some(Event::RunStarted { task_count: 2, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(Event::RunCompleted {
            success: true,
            passes: 3,
            ..
        })
    ));
    assert!(events.iter().all(|e| e.run_id() == report.run_id));
}

#[tokio::test]
async fn test_statuses_reflect_a_failed_run() {
    let tasks = task_map(vec![
        Arc::new(StubTask::new("ok")),
        Arc::new(FailingTask::new("bad", "nope").depends_on("ok")),
        Arc::new(StubTask::new("never").depends_on("bad")),
    ]);
    let mut ctx =
        ConvergenceContext::new(Box::new(DirectTarget::new("/")), true, fast_options(3));

    assert!(ctx.run_tasks(&tasks).await.is_err());

    assert_eq!(ctx.status(&TaskId::new("ok")), Some(TaskStatus::Done));
    assert_eq!(ctx.status(&TaskId::new("bad")), Some(TaskStatus::Failed));
    assert_eq!(ctx.status(&TaskId::new("never")), Some(TaskStatus::Pending));
    assert!(matches!(
        ctx.finish(&tasks).await,
        Err(RunError::NotConverged)
    ));
}

#[tokio::test]
async fn test_rerun_after_success_is_allowed() {
    let log = RunLog::new();
    let tasks = task_map(vec![Arc::new(StubTask::new("A").logging_to(&log))]);
    let mut ctx =
        ConvergenceContext::new(Box::new(DirectTarget::new("/")), true, fast_options(3));

    ctx.run_tasks(&tasks).await.unwrap();
    ctx.run_tasks(&tasks).await.unwrap();
    ctx.finish(&tasks).await.unwrap();

    assert_eq!(log.count("A"), 2);
}

#[tokio::test]
async fn test_concurrent_run_respects_dependencies() {
    let log = RunLog::new();
    let mut tasks: Vec<Arc<dyn Task>> = (0..8)
        .map(|i| Arc::new(StubTask::new(format!("leaf-{i}")).logging_to(&log)) as Arc<dyn Task>)
        .collect();
    let mut root = StubTask::new("root").logging_to(&log);
    for i in 0..8 {
        root = root.depends_on(&format!("leaf-{i}"));
    }
    tasks.push(Arc::new(root));
    let tasks = task_map(tasks);

    let report = TestHarness::new()
        .with_concurrency(4)
        .run_and_assert_success(&tasks)
        .await
        .outcome
        .unwrap();

    assert_eq!(report.passes, 2);
    assert_eq!(log.entries().last().map(String::as_str), Some("root"));
    assert_eq!(log.entries().len(), 9);
}
