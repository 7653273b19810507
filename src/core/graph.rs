//! Dependency graph of a task collection.
//!
//! Built once per run from every task's declared dependencies. Building
//! fails before any task runs if a strong dependency names a task that is
//! not in the collection, or if the dependencies contain a cycle.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;

use super::task::TaskMap;
use super::types::TaskId;

/// Configuration errors in a task collection's dependency structure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The dependencies contain a cycle through the listed tasks.
    #[error("dependency cycle: {}", format_cycle(.cycle))]
    CycleDetected { cycle: Vec<TaskId> },

    /// A dependency references a task that doesn't exist.
    #[error("missing dependency: task '{from}' depends on non-existent task '{to}'")]
    MissingDependency { from: TaskId, to: TaskId },
}

fn format_cycle(cycle: &[TaskId]) -> String {
    let mut parts: Vec<&str> = cycle.iter().map(TaskId::as_str).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.as_str());
    }
    parts.join(" -> ")
}

impl GraphError {
    /// Tasks named by this error.
    pub fn tasks(&self) -> Vec<TaskId> {
        match self {
            GraphError::CycleDetected { cycle } => cycle.clone(),
            GraphError::MissingDependency { from, to } => vec![from.clone(), to.clone()],
        }
    }
}

/// Resolved dependency edges for one task collection.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// task -> tasks it waits on.
    dependencies: BTreeMap<TaskId, BTreeSet<TaskId>>,

    /// task -> tasks waiting on it.
    dependents: BTreeMap<TaskId, BTreeSet<TaskId>>,

    /// Topological order, dependencies first, ties broken by name.
    order: Vec<TaskId>,
}

impl DependencyGraph {
    /// Resolve and validate the dependencies of every task in `tasks`.
    pub fn build(tasks: &TaskMap) -> Result<Self, GraphError> {
        let mut dependencies = BTreeMap::new();
        for (id, task) in tasks.iter() {
            let deps = task.dependencies(tasks);
            for dep in &deps {
                if !tasks.contains(dep) {
                    return Err(GraphError::MissingDependency {
                        from: id.clone(),
                        to: dep.clone(),
                    });
                }
            }
            dependencies.insert(id.clone(), deps);
        }
        Self::from_edges(dependencies)
    }

    /// Build from explicit edges (task -> dependencies).
    ///
    /// Every dependency must itself be a key of `dependencies`.
    pub fn from_edges(
        dependencies: BTreeMap<TaskId, BTreeSet<TaskId>>,
    ) -> Result<Self, GraphError> {
        let mut dependents: BTreeMap<TaskId, BTreeSet<TaskId>> = dependencies
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();

        for (from, deps) in &dependencies {
            for to in deps {
                match dependents.get_mut(to) {
                    Some(set) => {
                        set.insert(from.clone());
                    }
                    None => {
                        return Err(GraphError::MissingDependency {
                            from: from.clone(),
                            to: to.clone(),
                        });
                    }
                }
            }
        }

        let order = topological_sort(&dependencies, &dependents)?;

        Ok(Self {
            dependencies,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Tasks `id` waits on.
    pub fn dependencies(&self, id: &TaskId) -> impl Iterator<Item = &TaskId> {
        self.dependencies.get(id).into_iter().flatten()
    }

    /// Tasks waiting on `id`.
    pub fn dependents(&self, id: &TaskId) -> impl Iterator<Item = &TaskId> {
        self.dependents.get(id).into_iter().flatten()
    }

    /// Dependencies of `id` not contained in `done`.
    pub fn unmet(&self, id: &TaskId, done: &BTreeSet<TaskId>) -> Vec<TaskId> {
        self.dependencies(id)
            .filter(|dep| !done.contains(*dep))
            .cloned()
            .collect()
    }

    /// Whether every dependency of `id` is in `done`.
    pub fn is_ready(&self, id: &TaskId, done: &BTreeSet<TaskId>) -> bool {
        self.dependencies(id).all(|dep| done.contains(dep))
    }

    /// Tasks in dependency order (dependencies first).
    pub fn topological_order(&self) -> &[TaskId] {
        &self.order
    }

    /// Tasks grouped by depth: level 0 has no dependencies, level n
    /// depends on something at level n-1.
    pub fn levels(&self) -> Vec<Vec<TaskId>> {
        let mut depth: BTreeMap<&TaskId, usize> = BTreeMap::new();
        let mut levels: Vec<Vec<TaskId>> = Vec::new();

        for id in &self.order {
            let level = self
                .dependencies(id)
                .filter_map(|dep| depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(id.clone());
        }

        levels
    }

    /// Length of the longest dependency chain, counted in tasks.
    pub fn depth(&self) -> usize {
        self.levels().len()
    }
}

/// Kahn's algorithm; on failure the residual graph is searched for a cycle.
fn topological_sort(
    dependencies: &BTreeMap<TaskId, BTreeSet<TaskId>>,
    dependents: &BTreeMap<TaskId, BTreeSet<TaskId>>,
) -> Result<Vec<TaskId>, GraphError> {
    let mut in_degree: BTreeMap<&TaskId, usize> = dependencies
        .iter()
        .map(|(id, deps)| (id, deps.len()))
        .collect();

    let mut queue: VecDeque<&TaskId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut result = Vec::with_capacity(dependencies.len());

    while let Some(id) = queue.pop_front() {
        result.push(id.clone());

        for next in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if result.len() == dependencies.len() {
        return Ok(result);
    }

    let residual: BTreeSet<&TaskId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree > 0)
        .map(|(id, _)| *id)
        .collect();

    Err(GraphError::CycleDetected {
        cycle: find_cycle(dependencies, &residual),
    })
}

/// Walk dependencies inside the residual set until a task repeats.
///
/// Every residual task has at least one residual dependency, so the walk
/// cannot dead-end. The repeated suffix is the cycle.
fn find_cycle(
    dependencies: &BTreeMap<TaskId, BTreeSet<TaskId>>,
    residual: &BTreeSet<&TaskId>,
) -> Vec<TaskId> {
    let Some(start) = residual.iter().next() else {
        return Vec::new();
    };

    let mut path: Vec<&TaskId> = Vec::new();
    let mut current: &TaskId = start;

    loop {
        if let Some(pos) = path.iter().position(|id| *id == current) {
            return path[pos..].iter().map(|id| (*id).clone()).collect();
        }
        path.push(current);

        let next = dependencies
            .get(current)
            .into_iter()
            .flatten()
            .find(|dep| residual.contains(dep));

        match next {
            Some(dep) => current = dep,
            None => return path.iter().map(|id| (*id).clone()).collect(),
        }
    }
}
