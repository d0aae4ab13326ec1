//! Graph execution: a workflow is a set of [`Node`](trellis_core::Node)s
//! joined by [`Edge`]s.
//!
//! [`GraphRunner`] walks the graph from the entry node, running each node
//! through the [`NodeExecutor`] (retries, backoff, cancellation) and
//! following the first matching edge. A parallel edge fans out to several
//! branches on independent copies of the state and folds them back
//! together with [`merge_branches`] before continuing at the join node.

pub mod definition;
pub mod edge;
pub mod executor;
pub mod merge;
pub mod node;
pub mod resolver;
pub mod runner;

pub use definition::{validate, GraphDefinition};
pub use edge::{evaluate_condition, Edge, Predicate};
pub use executor::{NodeExecutor, NodeFailure, NodeOutcome};
pub use merge::merge_branches;
pub use node::FnNode;
pub use resolver::resolve_next;
pub use runner::{GraphRunner, RunOptions, RunOutcome, RunStatus};
