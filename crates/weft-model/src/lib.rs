//! Weft Model
//!
//! The static, declarative side of a workflow. A [`WorkflowModel`] describes
//! one node: its execution type, its ordered children, an optional instance
//! class for leaves, quorum settings and static metadata. Models reference
//! each other by id and are loaded together into a [`ModelSet`].
//!
//! Resolving a root id against a model set yields a [`WorkflowGraph`]: the
//! same nodes expanded into a tree, with pre- and post-condition sub-graphs
//! attached and marked as conditions. Resolution rejects unknown references
//! and cycles, so every graph handed to the processor builder is finite.

mod error;
mod graph;
mod model;

pub use error::ModelError;
pub use graph::WorkflowGraph;
pub use model::{ModelSet, WorkflowModel};
