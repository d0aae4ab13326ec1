use std::sync::Arc;

use tracing::warn;

use crate::config::HooksConfig;
use crate::error::{Result, TrellisError};
use crate::types::{BudgetBreach, Checkpoint, State};

/// Observer callbacks around the step loop. All methods default to no-ops.
///
/// Hooks are best-effort: a returned error is logged by [`HookSet`] and
/// never stops the run.
pub trait RunnerHooks: Send + Sync + 'static {
    fn on_node_start(&self, _node_id: &str, _state: &State) -> Result<()> {
        Ok(())
    }

    fn on_node_end(&self, _node_id: &str, _state: &State, _elapsed_ms: u64) -> Result<()> {
        Ok(())
    }

    fn on_tool_call(&self, _node_id: &str, _tool: &str, _input: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn on_tool_result(
        &self,
        _node_id: &str,
        _tool: &str,
        _summary: &str,
        _is_error: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn on_error(&self, _node_id: Option<&str>, _error: &TrellisError) -> Result<()> {
        Ok(())
    }

    fn on_checkpoint(&self, _checkpoint: &Checkpoint) -> Result<()> {
        Ok(())
    }

    fn on_budget_warning(&self, _breach: &BudgetBreach) -> Result<()> {
        Ok(())
    }
}

/// Ordered composition of hook sets (e.g. graph-level then call-level).
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<Arc<dyn RunnerHooks>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hooks: Arc<dyn RunnerHooks>) {
        self.hooks.push(hooks);
    }

    /// A new set running `self` first, then `extra`.
    pub fn with(&self, extra: Option<Arc<dyn RunnerHooks>>) -> Self {
        let mut hooks = self.hooks.clone();
        hooks.extend(extra);
        Self { hooks }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn each(&self, hook: &str, f: impl Fn(&dyn RunnerHooks) -> Result<()>) {
        for h in &self.hooks {
            if let Err(e) = f(h.as_ref()) {
                warn!(hook, error = %e, "Runner hook failed");
            }
        }
    }

    pub fn node_start(&self, node_id: &str, state: &State) {
        self.each("on_node_start", |h| h.on_node_start(node_id, state));
    }

    pub fn node_end(&self, node_id: &str, state: &State, elapsed_ms: u64) {
        self.each("on_node_end", |h| h.on_node_end(node_id, state, elapsed_ms));
    }

    pub fn tool_call(&self, node_id: &str, tool: &str, input: &serde_json::Value) {
        self.each("on_tool_call", |h| h.on_tool_call(node_id, tool, input));
    }

    pub fn tool_result(&self, node_id: &str, tool: &str, summary: &str, is_error: bool) {
        self.each("on_tool_result", |h| {
            h.on_tool_result(node_id, tool, summary, is_error)
        });
    }

    pub fn error(&self, node_id: Option<&str>, error: &TrellisError) {
        self.each("on_error", |h| h.on_error(node_id, error));
    }

    pub fn checkpoint(&self, checkpoint: &Checkpoint) {
        self.each("on_checkpoint", |h| h.on_checkpoint(checkpoint));
    }

    pub fn budget_warning(&self, breach: &BudgetBreach) {
        self.each("on_budget_warning", |h| h.on_budget_warning(breach));
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet").field("len", &self.hooks.len()).finish()
    }
}

/// Hooks that run configured shell commands with environment variables.
/// Fire-and-forget: commands are spawned on the current runtime and their
/// failures are logged, not propagated.
pub struct CommandHooks {
    config: HooksConfig,
}

impl CommandHooks {
    pub fn new(config: HooksConfig) -> Self {
        Self { config }
    }

    fn spawn(&self, commands: &[String], env_vars: Vec<(&'static str, String)>) {
        if commands.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, skipping command hooks");
            return;
        };
        let commands = commands.to_vec();
        handle.spawn(async move {
            let env: Vec<(&str, &str)> = env_vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
            run_hooks(&commands, &env).await;
        });
    }
}

impl RunnerHooks for CommandHooks {
    fn on_node_start(&self, node_id: &str, state: &State) -> Result<()> {
        self.spawn(
            &self.config.on_node_start,
            vec![
                ("TRELLIS_NODE_ID", node_id.to_string()),
                ("TRELLIS_STATE_ID", state.id.to_string()),
            ],
        );
        Ok(())
    }

    fn on_node_end(&self, node_id: &str, state: &State, elapsed_ms: u64) -> Result<()> {
        self.spawn(
            &self.config.on_node_end,
            vec![
                ("TRELLIS_NODE_ID", node_id.to_string()),
                ("TRELLIS_STATE_ID", state.id.to_string()),
                ("TRELLIS_ELAPSED_MS", elapsed_ms.to_string()),
            ],
        );
        Ok(())
    }

    fn on_error(&self, node_id: Option<&str>, error: &TrellisError) -> Result<()> {
        self.spawn(
            &self.config.on_error,
            vec![
                ("TRELLIS_NODE_ID", node_id.unwrap_or_default().to_string()),
                ("TRELLIS_ERROR", error.to_string()),
                ("TRELLIS_ERROR_KIND", error.kind().to_string()),
            ],
        );
        Ok(())
    }

    fn on_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.spawn(
            &self.config.on_checkpoint,
            vec![
                ("TRELLIS_CHECKPOINT_ID", checkpoint.id.clone()),
                ("TRELLIS_STATE_ID", checkpoint.state_id.to_string()),
                ("TRELLIS_STEP", checkpoint.step.to_string()),
            ],
        );
        Ok(())
    }

    fn on_budget_warning(&self, breach: &BudgetBreach) -> Result<()> {
        self.spawn(
            &self.config.on_budget_warning,
            vec![
                ("TRELLIS_BUDGET_USED", breach.used.to_string()),
                ("TRELLIS_BUDGET_LIMIT", breach.limit.to_string()),
            ],
        );
        Ok(())
    }
}

/// Execute hook commands with environment variables.
pub async fn run_hooks(commands: &[String], env_vars: &[(&str, &str)]) {
    for cmd in commands {
        let mut command = tokio::process::Command::new("sh");
        command.args(["-c", cmd]);
        for (key, val) in env_vars {
            command.env(key, val);
        }
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::null());
        match command.status().await {
            Ok(s) if !s.success() => warn!(hook = %cmd, code = s.code(), "Hook exited non-zero"),
            Err(e) => warn!(hook = %cmd, error = %e, "Hook failed to execute"),
            _ => {}
        }
    }
}
