pub mod abort;
pub mod checkpoint;
pub mod graph;
pub mod retry;

pub use abort::{AbortController, AbortState, ResumeTarget};
pub use checkpoint::CheckpointManager;
pub use graph::{
    Edge, FnNode, GraphDefinition, GraphRunner, NodeExecutor, Predicate, RunOptions, RunOutcome,
    RunStatus,
};
pub use retry::{calculate_backoff, RetryDecision};
