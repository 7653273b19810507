//! Core identifier types for the convergence engine.
//!
//! These types provide type-safe identifiers for tasks and convergence runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique name of a task within one task collection.
///
/// Ordered so that every report the engine produces is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

/// Unique identifier for a single convergence run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl TaskId {
    /// Create a new TaskId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl RunId {
    /// Generate a new random RunId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a RunId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_creation() {
        let task_id = TaskId::new("LoadImage.0");
        assert_eq!(task_id.as_str(), "LoadImage.0");
    }

    #[test]
    fn test_task_id_display() {
        let task_id = TaskId::new("file/etc/hosts");
        assert_eq!(format!("{}", task_id), "file/etc/hosts");
    }

    #[test]
    fn test_task_ids_sort_by_name() {
        let mut ids = vec![TaskId::new("b"), TaskId::new("c"), TaskId::new("a")];
        ids.sort();

        let names: Vec<&str> = ids.iter().map(TaskId::as_str).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_run_id_is_unique() {
        let run1 = RunId::new();
        let run2 = RunId::new();

        assert_ne!(run1, run2);
    }

    #[test]
    fn test_run_id_from_uuid() {
        let uuid = Uuid::new_v4();
        let run_id = RunId::from_uuid(uuid);

        assert_eq!(run_id.as_uuid(), &uuid);
    }

    #[test]
    fn test_task_id_from_str() {
        let id1: TaskId = "my_task".into();
        let id2 = TaskId::new("my_task");
        assert_eq!(id1, id2);
    }
}
