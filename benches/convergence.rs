//! Benchmarks for the convergence engine.
//!
//! Measures the overhead of:
//! - Dependency graph construction and validation
//! - Full runs over no-op tasks, sequential and concurrent

use async_trait::async_trait;
use converge::core::graph::DependencyGraph;
use converge::{
    ConvergenceContext, ProgressBudget, RunOptions, ScriptFormat, ScriptTarget, Task, TaskContext,
    TaskError, TaskMap, TaskRef,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::io::sink;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// A minimal no-op task for benchmarking engine overhead.
struct NoOpTask {
    name: String,
    deps: Vec<TaskRef>,
}

impl NoOpTask {
    fn create(name: &str, deps: &[&str]) -> Arc<dyn Task> {
        Arc::new(Self {
            name: name.to_string(),
            deps: deps.iter().map(|d| TaskRef::to(*d)).collect(),
        })
    }
}

#[async_trait]
impl Task for NoOpTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn references(&self) -> Vec<TaskRef> {
        self.deps.clone()
    }

    async fn run(&self, _ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        Ok(())
    }
}

/// A -> B -> C -> ... -> N
fn linear_tasks(size: usize) -> TaskMap {
    let tasks = (0..size).map(|i| {
        let name = format!("task_{}", i);
        if i == 0 {
            NoOpTask::create(&name, &[])
        } else {
            NoOpTask::create(&name, &[format!("task_{}", i - 1).as_str()])
        }
    });
    TaskMap::from_tasks(tasks).unwrap()
}

/// One root, many leaves.
fn wide_tasks(size: usize) -> TaskMap {
    let mut tasks = vec![NoOpTask::create("root", &[])];
    for i in 0..size {
        tasks.push(NoOpTask::create(&format!("leaf_{}", i), &["root"]));
    }
    TaskMap::from_tasks(tasks).unwrap()
}

/// start -> [middle_0 .. middle_n] -> end
fn diamond_tasks(width: usize) -> TaskMap {
    let mut tasks = vec![NoOpTask::create("start", &[])];
    let middle: Vec<String> = (0..width).map(|i| format!("middle_{}", i)).collect();
    for name in &middle {
        tasks.push(NoOpTask::create(name, &["start"]));
    }
    let refs: Vec<&str> = middle.iter().map(|s| s.as_str()).collect();
    tasks.push(NoOpTask::create("end", &refs));
    TaskMap::from_tasks(tasks).unwrap()
}

fn options(concurrency: usize) -> RunOptions {
    let budget = ProgressBudget::new(3)
        .unwrap()
        .with_pass_delay(Duration::ZERO);
    RunOptions::new(budget).with_concurrency(concurrency)
}

fn bench_graph_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_construction");

    for size in [100, 500].iter() {
        let linear = linear_tasks(*size);
        group.bench_with_input(BenchmarkId::new("linear", size), &linear, |b, tasks| {
            b.iter(|| DependencyGraph::build(tasks).unwrap());
        });

        let wide = wide_tasks(*size);
        group.bench_with_input(BenchmarkId::new("wide", size), &wide, |b, tasks| {
            b.iter(|| DependencyGraph::build(tasks).unwrap());
        });

        let diamond = diamond_tasks(*size);
        group.bench_with_input(BenchmarkId::new("diamond", size), &diamond, |b, tasks| {
            b.iter(|| DependencyGraph::build(tasks).unwrap());
        });
    }

    group.finish();
}

fn bench_convergence_run(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("convergence_run");

    for size in [100, 500].iter() {
        let wide = wide_tasks(*size);
        for concurrency in [1, 8] {
            let id = BenchmarkId::new(format!("wide_x{}", concurrency), size);
            group.bench_with_input(id, &wide, |b, tasks| {
                b.iter(|| {
                    rt.block_on(async {
                        let target = ScriptTarget::new(ScriptFormat::Shell, sink());
                        let mut ctx =
                            ConvergenceContext::new(Box::new(target), false, options(concurrency));
                        ctx.run_tasks(tasks).await.unwrap()
                    })
                });
            });
        }

        let diamond = diamond_tasks(*size);
        group.bench_with_input(BenchmarkId::new("diamond", size), &diamond, |b, tasks| {
            b.iter(|| {
                rt.block_on(async {
                    let target = ScriptTarget::new(ScriptFormat::Shell, sink());
                    let mut ctx = ConvergenceContext::new(Box::new(target), false, options(1));
                    ctx.run_tasks(tasks).await.unwrap()
                })
            });
        });
    }

    // Linear chains take one pass per task, so keep them short.
    let linear = linear_tasks(50);
    group.bench_with_input(BenchmarkId::new("linear", 50), &linear, |b, tasks| {
        b.iter(|| {
            rt.block_on(async {
                let target = ScriptTarget::new(ScriptFormat::Shell, sink());
                let mut ctx = ConvergenceContext::new(Box::new(target), false, options(1));
                ctx.run_tasks(tasks).await.unwrap()
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_graph_construction, bench_convergence_run);

criterion_main!(benches);
