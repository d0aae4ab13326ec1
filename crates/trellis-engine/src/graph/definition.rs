use std::collections::HashSet;
use std::sync::Arc;

use trellis_core::config::{ConditionErrorStrategy, MergePolicy};
use trellis_core::error::{Result, TrellisError};
use trellis_core::hooks::{HookSet, RunnerHooks};
use trellis_core::traits::Node;

use super::edge::Edge;

/// Static description of a workflow graph.
///
/// Built once and reused across runs. Optional settings fall back to the
/// runner's [`EngineConfig`](trellis_core::EngineConfig).
pub struct GraphDefinition {
    pub nodes: Vec<Arc<dyn Node>>,
    pub edges: Vec<Edge>,
    pub entry_node: String,
    pub max_steps: Option<usize>,
    pub checkpoint_interval: Option<usize>,
    pub parallel_merge: Option<MergePolicy>,
    pub condition_error_strategy: Option<ConditionErrorStrategy>,
    /// Graph-level hooks, run before any call-level hooks.
    pub hooks: HookSet,
}

impl GraphDefinition {
    pub fn new(entry_node: impl Into<String>) -> Self {
        Self {
            nodes: vec![],
            edges: vec![],
            entry_node: entry_node.into(),
            max_steps: None,
            checkpoint_interval: None,
            parallel_merge: None,
            condition_error_strategy: None,
            hooks: HookSet::new(),
        }
    }

    /// Add a node.
    pub fn node(mut self, node: impl Node) -> Self {
        self.nodes.push(Arc::new(node));
        self
    }

    /// Add an already shared node.
    pub fn shared_node(mut self, node: Arc<dyn Node>) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an edge. Declaration order matters for conditional edges.
    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = Some(interval);
        self
    }

    pub fn with_merge(mut self, merge: MergePolicy) -> Self {
        self.parallel_merge = Some(merge);
        self
    }

    pub fn with_condition_errors(mut self, strategy: ConditionErrorStrategy) -> Self {
        self.condition_error_strategy = Some(strategy);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RunnerHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }
}

impl std::fmt::Debug for GraphDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphDefinition")
            .field("nodes", &self.nodes.iter().map(|n| n.id()).collect::<Vec<_>>())
            .field("edges", &self.edges)
            .field("entry_node", &self.entry_node)
            .field("max_steps", &self.max_steps)
            .field("checkpoint_interval", &self.checkpoint_interval)
            .field("parallel_merge", &self.parallel_merge)
            .field("condition_error_strategy", &self.condition_error_strategy)
            .finish()
    }
}

/// Structural checks run once, before any state transition.
pub fn validate(graph: &GraphDefinition) -> Result<()> {
    let mut ids = HashSet::new();
    for node in &graph.nodes {
        if !ids.insert(node.id()) {
            return Err(invalid(format!("duplicate node id '{}'", node.id())));
        }
    }

    if !ids.contains(graph.entry_node.as_str()) {
        return Err(invalid(format!("entry node '{}' does not exist", graph.entry_node)));
    }

    for (i, edge) in graph.edges.iter().enumerate() {
        if !ids.contains(edge.source()) {
            return Err(invalid(format!(
                "edge #{} starts at unknown node '{}'",
                i,
                edge.source()
            )));
        }
        for target in edge.targets() {
            if !ids.contains(target) {
                return Err(invalid(format!(
                    "edge #{} from '{}' points at unknown node '{}'",
                    i,
                    edge.source(),
                    target
                )));
            }
        }
        match edge {
            Edge::Conditional { predicate: None, from, to } => {
                return Err(invalid(format!(
                    "conditional edge #{} '{}' -> '{}' has no predicate",
                    i, from, to
                )));
            }
            Edge::Parallel { from, to, .. } if to.is_empty() => {
                return Err(invalid(format!(
                    "parallel edge #{} from '{}' has no branches",
                    i, from
                )));
            }
            _ => {}
        }
    }

    if graph.max_steps == Some(0) {
        return Err(invalid("max_steps must be at least 1"));
    }
    if graph.checkpoint_interval == Some(0) {
        return Err(invalid("checkpoint_interval must be at least 1"));
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> TrellisError {
    TrellisError::InvalidGraph(message.into())
}
