//! Workflow graphs: nodes, their registry and the execution runtime.
//!
//! A workflow is a tree of [`Node`]s held by a [`NodeRegistry`]. Calling
//! `start` on the root opens an [`ExecutionScope`] whose worker pool runs
//! the concurrent parts of the graph, and threads a [`Context`] through it.

pub mod config;
pub mod context;
pub mod node;
pub mod nodes;
pub mod registry;
pub mod scope;

pub use config::{branch_key, Branches, NodeConfig, NodeFn, NodeKind, NodeRef, Operand};
pub use context::Context;
pub use node::{iter_items, Child, Node, NodeBase, StopFlags};
pub use registry::{ClassFactory, NodeRegistry};
pub use scope::{join, ExecutionScope, ScopeGuard, WorkerPool};
