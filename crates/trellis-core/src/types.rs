use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique state identifier, stable across all steps of a run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct StateId(pub String);

impl StateId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for StateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, text)
    }

    fn with_role(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Short summary of a tool invocation kept in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultSummary {
    pub tool: String,
    pub summary: String,
    pub is_error: bool,
}

/// Append-only conversation history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tool_results: Vec<ToolResultSummary>,
}

/// Lifecycle of the task being worked on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Current task progress. Replaced as a whole, never merged field by field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskState {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub current_step: usize,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryState {
    /// Working memory for the current run.
    #[serde(default)]
    pub short_term: BTreeMap<String, serde_json::Value>,
    /// Keys into the long-term store; append-only.
    #[serde(default)]
    pub long_term_refs: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeTiming {
    pub calls: u64,
    pub total_ms: u64,
}

/// Counters accumulated over a run. Never decrease until the run ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Telemetry {
    #[serde(default)]
    pub tool_call_count: u64,
    #[serde(default)]
    pub total_duration_ms: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub retry_count: u64,
    #[serde(default)]
    pub token_count: u64,
    #[serde(default)]
    pub node_timings: BTreeMap<String, NodeTiming>,
}

impl Telemetry {
    /// Record a successful node execution.
    pub fn record_node(&mut self, node_id: &str, elapsed_ms: u64) {
        let timing = self.node_timings.entry(node_id.to_string()).or_default();
        timing.calls += 1;
        timing.total_ms += elapsed_ms;
        self.total_duration_ms += elapsed_ms;
    }

    /// Raise every counter that fell below `floor`.
    ///
    /// Returns true if anything had to be corrected.
    pub fn clamp_to(&mut self, floor: &Telemetry) -> bool {
        let mut corrected = false;
        for (value, min) in [
            (&mut self.tool_call_count, floor.tool_call_count),
            (&mut self.total_duration_ms, floor.total_duration_ms),
            (&mut self.error_count, floor.error_count),
            (&mut self.retry_count, floor.retry_count),
            (&mut self.token_count, floor.token_count),
        ] {
            if *value < min {
                *value = min;
                corrected = true;
            }
        }
        for (node_id, min) in &floor.node_timings {
            let timing = self.node_timings.entry(node_id.clone()).or_default();
            if timing.calls < min.calls || timing.total_ms < min.total_ms {
                timing.calls = timing.calls.max(min.calls);
                timing.total_ms = timing.total_ms.max(min.total_ms);
                corrected = true;
            }
        }
        corrected
    }
}

/// Budget ceilings enforced by the runner between steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Policy {
    pub max_tool_calls: u64,
    pub max_duration_ms: u64,
    pub max_retries: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_tool_calls: 100,
            max_duration_ms: 600_000,
            max_retries: 10,
        }
    }
}

/// Which budget ceiling was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetResource {
    ToolCalls,
    Duration,
    Retries,
    Steps,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetBreach {
    pub resource: BudgetResource,
    pub used: u64,
    pub limit: u64,
}

impl Policy {
    /// First ceiling reached by `telemetry`, checked in a fixed order.
    ///
    /// A ceiling only trips once something was consumed, so a zero
    /// `max_retries` forbids retrying without blocking the first step.
    pub fn check(&self, telemetry: &Telemetry) -> Option<BudgetBreach> {
        let checks = [
            (BudgetResource::ToolCalls, telemetry.tool_call_count, self.max_tool_calls),
            (BudgetResource::Duration, telemetry.total_duration_ms, self.max_duration_ms),
            (BudgetResource::Retries, telemetry.retry_count, self.max_retries),
        ];
        checks
            .into_iter()
            .find(|(_, used, limit)| *used > 0 && used >= limit)
            .map(|(resource, used, limit)| BudgetBreach {
                resource,
                used,
                limit,
            })
    }
}

/// The shared state threaded through a run.
///
/// Each step consumes one `State` and produces the next. Parallel branches
/// receive independent clones, so nothing in here is ever aliased.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct State {
    pub id: StateId,
    #[serde(default)]
    pub conversation: Conversation,
    #[serde(default)]
    pub task: TaskState,
    #[serde(default)]
    pub memory: MemoryState,
    #[serde(default)]
    pub artifacts: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub telemetry: Telemetry,
    #[serde(default)]
    pub policy: Policy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl State {
    pub fn new(policy: Policy) -> Self {
        let now = Utc::now();
        Self {
            id: StateId::new(),
            conversation: Conversation::default(),
            task: TaskState::default(),
            memory: MemoryState::default(),
            artifacts: BTreeMap::new(),
            telemetry: Telemetry::default(),
            policy,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message and bump `updated_at`.
    pub fn push_message(&mut self, message: Message) {
        self.conversation.messages.push(message);
        self.touch();
    }

    /// Count a tool call and keep its summary in the conversation.
    pub fn record_tool_call(&mut self, tool: impl Into<String>, summary: impl Into<String>, is_error: bool) {
        self.telemetry.tool_call_count += 1;
        self.conversation.tool_results.push(ToolResultSummary {
            tool: tool.into(),
            summary: summary.into(),
            is_error,
        });
        self.touch();
    }

    pub fn add_tokens(&mut self, tokens: u64) {
        self.telemetry.token_count += tokens;
        self.touch();
    }

    pub fn set_artifact(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.artifacts.insert(key.into(), value);
        self.touch();
    }

    pub fn remember(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.memory.short_term.insert(key.into(), value);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Look up a value by key in short-term memory, then artifacts.
    pub fn lookup(&self, key: &str) -> Option<&serde_json::Value> {
        self.memory
            .short_term
            .get(key)
            .or_else(|| self.artifacts.get(key))
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new(Policy::default())
    }
}

/// What the runner does after a node completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    Next { node: String },
    Parallel { branches: Vec<String>, join: String },
    End,
}

impl Transition {
    pub fn next(node: impl Into<String>) -> Self {
        Self::Next { node: node.into() }
    }
}

/// Point-in-time snapshot sufficient to resume a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    pub state_id: StateId,
    pub state: State,
    /// Event log cursor at save time.
    pub event_index: u64,
    pub timestamp: DateTime<Utc>,
    /// Step count at save time.
    pub step: usize,
    /// Node whose completion produced `state`.
    pub node_id: String,
    /// Transition already resolved from `node_id`; `None` means the run
    /// was over.
    #[serde(default)]
    pub pending: Option<Transition>,
}
