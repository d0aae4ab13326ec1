use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::event::{EmitOptions, Event, EventStatus, EventStream, EventType};
use crate::hooks::HookSet;
use crate::signal::AbortSignal;
use crate::types::{Checkpoint, State, StateId};

/// A named unit of work behind a single entry point.
pub trait Node: Send + Sync + 'static {
    /// Unique id within a graph.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str {
        self.id()
    }

    /// Execute against a private copy of the current state.
    fn execute(&self, state: State, ctx: NodeContext) -> BoxFuture<'_, Result<NodeResult>>;
}

/// A telemetry event returned by a node; re-emitted into the shared log
/// once the node completes.
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub kind: EventType,
    pub status: EventStatus,
    pub summary: String,
    pub payload: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

impl NodeEvent {
    pub fn new(kind: impl Into<EventType>, status: EventStatus, summary: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            status,
            summary: summary.into(),
            payload: None,
            metadata: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Output of a node execution.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub state: State,
    pub events: Vec<NodeEvent>,
    /// Overrides the edge-derived transition when set.
    pub next_node: Option<String>,
}

impl NodeResult {
    pub fn new(state: State) -> Self {
        Self {
            state,
            events: vec![],
            next_node: None,
        }
    }

    pub fn with_event(mut self, event: NodeEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn goto(mut self, node: impl Into<String>) -> Self {
        self.next_node = Some(node.into());
        self
    }
}

/// Context passed to nodes during execution.
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: String,
    /// 1-based attempt number within the current retry cycle.
    pub attempt: u32,
    events: Arc<EventStream>,
    hooks: HookSet,
    signal: AbortSignal,
}

impl NodeContext {
    pub fn new(
        node_id: impl Into<String>,
        attempt: u32,
        events: Arc<EventStream>,
        hooks: HookSet,
        signal: AbortSignal,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            attempt,
            events,
            hooks,
            signal,
        }
    }

    /// Emit a node-local event straight into the shared log.
    pub fn emit_event(
        &self,
        kind: impl Into<EventType>,
        status: EventStatus,
        summary: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Event {
        let mut options = EmitOptions::node(self.node_id.clone());
        options.payload = payload;
        self.events.emit(kind, status, summary, options)
    }

    /// Report a tool invocation to hooks and the event log.
    pub fn tool_call(&self, tool: &str, input: &serde_json::Value) {
        self.hooks.tool_call(&self.node_id, tool, input);
        self.emit_event(
            EventType::ToolCall,
            EventStatus::Started,
            format!("Calling {}", tool),
            Some(input.clone()),
        );
    }

    /// Report a tool result to hooks and the event log.
    pub fn tool_result(&self, tool: &str, summary: &str, is_error: bool) {
        self.hooks.tool_result(&self.node_id, tool, summary, is_error);
        let status = if is_error {
            EventStatus::Failure
        } else {
            EventStatus::Success
        };
        self.emit_event(EventType::ToolResult, status, format!("{}: {}", tool, summary), None);
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.signal
    }

    pub fn throw_if_aborted(&self) -> Result<()> {
        self.signal.throw_if_aborted()
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("attempt", &self.attempt)
            .field("hooks", &self.hooks)
            .field("aborted", &self.signal.is_aborted())
            .finish()
    }
}

/// Checkpoint storage backend.
pub trait PersistenceAdapter: Send + Sync + 'static {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>>;

    fn load_checkpoint(&self, id: &str) -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    /// All checkpoints for a state, oldest first.
    fn list_checkpoints(&self, state_id: &StateId) -> BoxFuture<'_, Result<Vec<Checkpoint>>>;

    fn delete_checkpoint(&self, id: &str) -> BoxFuture<'_, Result<()>>;
}
