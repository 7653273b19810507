//! Core types: identifiers, the task contract, dependency structure and
//! the context a task runs in.

pub mod budget;
pub mod context;
pub mod deps;
pub mod environment;
pub mod graph;
pub mod handles;
pub mod task;
pub mod types;
