//! Shared mocks and fixtures for Trellis tests.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use trellis_core::error::{Result, TrellisError};
use trellis_core::hooks::RunnerHooks;
use trellis_core::traits::{Node, NodeContext, NodeResult, PersistenceAdapter};
use trellis_core::types::{BudgetBreach, Checkpoint, Message, Policy, State, StateId};

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh state with the given ceilings.
pub fn state_with_policy(max_tool_calls: u64, max_duration_ms: u64, max_retries: u64) -> State {
    State::new(Policy {
        max_tool_calls,
        max_duration_ms,
        max_retries,
    })
}

/// Message contents in order.
pub fn message_texts(state: &State) -> Vec<String> {
    state
        .conversation
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect()
}

/// Write `content` to a temporary TOML file.
pub fn config_file(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write toml");
    tmp
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Checkpoint store kept in memory; remembers the step of every save.
#[derive(Default)]
pub struct InMemoryPersistence {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    saved_steps: Mutex<Vec<usize>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step counts passed to every `save_checkpoint` call, in order.
    pub fn saved_steps(&self) -> Vec<usize> {
        self.saved_steps.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceAdapter for InMemoryPersistence {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let checkpoint = checkpoint.clone();
        Box::pin(async move {
            self.saved_steps.lock().unwrap().push(checkpoint.step);
            self.checkpoints
                .lock()
                .unwrap()
                .insert(checkpoint.id.clone(), checkpoint);
            Ok(())
        })
    }

    fn load_checkpoint(&self, id: &str) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let found = self.checkpoints.lock().unwrap().get(id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn list_checkpoints(&self, state_id: &StateId) -> BoxFuture<'_, Result<Vec<Checkpoint>>> {
        let mut found: Vec<Checkpoint> = self
            .checkpoints
            .lock()
            .unwrap()
            .values()
            .filter(|c| &c.state_id == state_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| (c.timestamp, c.step));
        Box::pin(async move { Ok(found) })
    }

    fn delete_checkpoint(&self, id: &str) -> BoxFuture<'_, Result<()>> {
        self.checkpoints.lock().unwrap().remove(id);
        Box::pin(async move { Ok(()) })
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Fails its first `failures` attempts with `make_error`, then appends
/// `"<id> ok"` to the conversation.
pub struct FlakyNode {
    id: String,
    failures: usize,
    make_error: Box<dyn Fn() -> TrellisError + Send + Sync>,
    attempts: AtomicUsize,
}

impl FlakyNode {
    pub fn new(
        id: impl Into<String>,
        failures: usize,
        make_error: impl Fn() -> TrellisError + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            failures,
            make_error: Box::new(make_error),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Attempts made so far, across runs.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Node for FlakyNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute(&self, mut state: State, _ctx: NodeContext) -> BoxFuture<'_, Result<NodeResult>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move {
            if attempt <= self.failures {
                return Err((self.make_error)());
            }
            state.push_message(Message::assistant(format!("{} ok", self.id)));
            Ok(NodeResult::new(state))
        })
    }
}

/// Appends a fixed message and makes `tool_calls` tool calls per run.
pub struct EchoNode {
    id: String,
    text: String,
    tool_calls: usize,
}

impl EchoNode {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            tool_calls: 0,
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: usize) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

impl Node for EchoNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute(&self, mut state: State, ctx: NodeContext) -> BoxFuture<'_, Result<NodeResult>> {
        Box::pin(async move {
            ctx.throw_if_aborted()?;
            for i in 0..self.tool_calls {
                let input = serde_json::json!({ "call": i });
                ctx.tool_call("echo", &input);
                state.record_tool_call("echo", format!("{} #{}", self.id, i), false);
                ctx.tool_result("echo", "ok", false);
            }
            state.push_message(Message::assistant(self.text.clone()));
            Ok(NodeResult::new(state))
        })
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Records every hook invocation as `"<hook>:<detail>"`.
#[derive(Default)]
pub struct RecordingHooks {
    calls: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }
}

impl RunnerHooks for RecordingHooks {
    fn on_node_start(&self, node_id: &str, _state: &State) -> Result<()> {
        self.record(format!("node_start:{}", node_id));
        Ok(())
    }

    fn on_node_end(&self, node_id: &str, _state: &State, _elapsed_ms: u64) -> Result<()> {
        self.record(format!("node_end:{}", node_id));
        Ok(())
    }

    fn on_tool_call(&self, node_id: &str, tool: &str, _input: &serde_json::Value) -> Result<()> {
        self.record(format!("tool_call:{}:{}", node_id, tool));
        Ok(())
    }

    fn on_tool_result(&self, node_id: &str, tool: &str, _summary: &str, is_error: bool) -> Result<()> {
        self.record(format!("tool_result:{}:{}:{}", node_id, tool, is_error));
        Ok(())
    }

    fn on_error(&self, node_id: Option<&str>, _error: &TrellisError) -> Result<()> {
        self.record(format!("error:{}", node_id.unwrap_or("-")));
        Ok(())
    }

    fn on_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.record(format!("checkpoint:{}", checkpoint.step));
        Ok(())
    }

    fn on_budget_warning(&self, breach: &BudgetBreach) -> Result<()> {
        self.record(format!("budget:{}/{}", breach.used, breach.limit));
        Ok(())
    }
}

/// Fails every hook call.
pub struct FailingHooks;

impl RunnerHooks for FailingHooks {
    fn on_node_start(&self, node_id: &str, _state: &State) -> Result<()> {
        Err(TrellisError::Other(format!("hook refused {}", node_id)))
    }

    fn on_node_end(&self, node_id: &str, _state: &State, _elapsed_ms: u64) -> Result<()> {
        Err(TrellisError::Other(format!("hook refused {}", node_id)))
    }

    fn on_checkpoint(&self, _checkpoint: &Checkpoint) -> Result<()> {
        Err(TrellisError::Other("hook refused checkpoint".into()))
    }
}
