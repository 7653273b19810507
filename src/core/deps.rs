//! Structural dependency references between tasks.
//!
//! A task that logically needs another task holds a [`TaskRef`] in one of
//! its fields. The engine never follows these references to own or mutate
//! the target task; they are lookups by name into the run's collection.
//!
//! Task authors collect their reference fields with [`References`] instead
//! of keeping a separate edge list in sync:
//!
//! ```
//! use converge::{References, TaskRef};
//!
//! struct SecurityGroupRule {
//!     group: TaskRef,
//!     source_group: Option<TaskRef>,
//!     subnets: Vec<TaskRef>,
//! }
//!
//! impl SecurityGroupRule {
//!     fn references(&self) -> Vec<TaskRef> {
//!         References::new()
//!             .field(&self.group)
//!             .field(&self.source_group)
//!             .field(&self.subnets)
//!             .build()
//!     }
//! }
//!
//! let rule = SecurityGroupRule {
//!     group: TaskRef::to("sg/nodes"),
//!     source_group: None,
//!     subnets: vec![TaskRef::to("subnet/a"), TaskRef::weak("subnet/b")],
//! };
//! assert_eq!(rule.references().len(), 3);
//! ```

use serde::{Deserialize, Serialize};

use super::types::TaskId;

/// How strongly a task depends on the referenced task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    /// The referenced task must exist in the run and be Done first.
    #[default]
    Strong,
    /// Wait for the referenced task only if it is part of this run.
    Weak,
}

/// A non-owning reference from one task to another, by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    id: TaskId,
    #[serde(default)]
    kind: RefKind,
}

impl TaskRef {
    /// A strong reference: the named task must be part of the run.
    pub fn to(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            kind: RefKind::Strong,
        }
    }

    /// A weak reference: ignored when the named task is absent.
    pub fn weak(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            kind: RefKind::Weak,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }

    pub fn is_strong(&self) -> bool {
        self.kind == RefKind::Strong
    }
}

/// Anything a task field can hold that points at other tasks.
pub trait IntoReferences {
    /// Append the references held by this value.
    fn collect_into(&self, out: &mut Vec<TaskRef>);
}

impl IntoReferences for TaskRef {
    fn collect_into(&self, out: &mut Vec<TaskRef>) {
        out.push(self.clone());
    }
}

impl<T: IntoReferences> IntoReferences for Option<T> {
    fn collect_into(&self, out: &mut Vec<TaskRef>) {
        if let Some(inner) = self {
            inner.collect_into(out);
        }
    }
}

impl<T: IntoReferences> IntoReferences for Vec<T> {
    fn collect_into(&self, out: &mut Vec<TaskRef>) {
        self.as_slice().collect_into(out);
    }
}

impl<T: IntoReferences> IntoReferences for [T] {
    fn collect_into(&self, out: &mut Vec<TaskRef>) {
        for item in self {
            item.collect_into(out);
        }
    }
}

/// Builder that walks a task's reference-holding fields.
///
/// Duplicate references collapse to one; if the same task is referenced
/// both strongly and weakly the strong reference wins.
#[derive(Debug, Default, Clone)]
pub struct References {
    refs: Vec<TaskRef>,
}

impl References {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every reference held by a field.
    pub fn field<F: IntoReferences + ?Sized>(mut self, field: &F) -> Self {
        field.collect_into(&mut self.refs);
        self
    }

    /// Add a strong reference by name.
    pub fn named(mut self, id: impl Into<TaskId>) -> Self {
        self.refs.push(TaskRef::to(id));
        self
    }

    /// Add a weak reference by name.
    pub fn named_weak(mut self, id: impl Into<TaskId>) -> Self {
        self.refs.push(TaskRef::weak(id));
        self
    }

    pub fn build(self) -> Vec<TaskRef> {
        let mut out: Vec<TaskRef> = Vec::with_capacity(self.refs.len());
        for r in self.refs {
            match out.iter_mut().find(|existing| existing.id == r.id) {
                Some(existing) => {
                    if r.is_strong() {
                        existing.kind = RefKind::Strong;
                    }
                }
                None => out.push(r),
            }
        }
        out
    }
}
