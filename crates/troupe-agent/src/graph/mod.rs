//! Dependency graph scheduling.
//!
//! Units of work are wrapped in [`GraphNode`]s and connected by "must run
//! before" edges. [`DependencyGraph`] orders them topologically, refuses to
//! run cyclic graphs, and executes them one at a time, gating each node on its
//! predecessors and stopping at the first failure.

pub mod dag;
pub mod node;

pub use dag::{DependencyGraph, GraphSummary};
pub use node::{GraphNode, NodeId, NodeStatus};
