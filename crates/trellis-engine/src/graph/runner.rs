use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use trellis_core::config::{ConditionErrorStrategy, EngineConfig, MergePolicy};
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EmitOptions, EventStatus, EventStream, EventType};
use trellis_core::hooks::{CommandHooks, HookSet, RunnerHooks};
use trellis_core::traits::{Node, PersistenceAdapter};
use trellis_core::types::{BudgetBreach, BudgetResource, State, Transition};

use super::definition::{validate, GraphDefinition};
use super::edge::Edge;
use super::executor::NodeExecutor;
use super::merge::merge_branches;
use super::resolver::resolve_next;
use crate::abort::{AbortController, ResumeTarget};
use crate::checkpoint::CheckpointManager;

/// Per-call options for [`GraphRunner::execute`].
#[derive(Default, Clone)]
pub struct RunOptions {
    /// Call-level hooks, run after the graph-level ones.
    pub hooks: Option<Arc<dyn RunnerHooks>>,
}

impl RunOptions {
    pub fn with_hooks(hooks: Arc<dyn RunnerHooks>) -> Self {
        Self { hooks: Some(hooks) }
    }
}

/// How a run that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No edge matched after the last node.
    Completed,
    /// A policy ceiling was reached.
    BudgetExceeded,
    /// `max_steps` was reached.
    StepLimitReached,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: State,
    pub steps: usize,
    pub status: RunStatus,
    /// Node ids in execution order; parallel branches in declared order.
    pub visited: Vec<String>,
}

/// Mutable position of a run, kept outside the loop so a failure can still
/// report the last known state.
struct Progress {
    state: State,
    step: usize,
    node_id: Option<String>,
    visited: Vec<String>,
}

/// Walks a validated graph, one step at a time.
pub struct GraphRunner {
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: Vec<Edge>,
    entry_node: String,
    max_steps: usize,
    checkpoint_interval: usize,
    merge: MergePolicy,
    condition_errors: ConditionErrorStrategy,
    hooks: HookSet,
    events: Arc<EventStream>,
    abort: Arc<AbortController>,
    executor: NodeExecutor,
    checkpoints: CheckpointManager,
    last_state: Mutex<Option<State>>,
}

impl GraphRunner {
    /// Validate `graph` and build a runner with default settings.
    pub fn new(graph: GraphDefinition) -> Result<Self> {
        Self::with_config(graph, &EngineConfig::default())
    }

    /// Validate `graph`; settings it leaves unset come from `config`.
    pub fn with_config(graph: GraphDefinition, config: &EngineConfig) -> Result<Self> {
        validate(&graph)?;

        let GraphDefinition {
            nodes,
            edges,
            entry_node,
            max_steps,
            checkpoint_interval,
            parallel_merge,
            condition_error_strategy,
            mut hooks,
        } = graph;

        if let Some(commands) = config.hooks.as_ref().filter(|h| !h.is_empty()) {
            hooks.push(Arc::new(CommandHooks::new(commands.clone())));
        }

        let events = Arc::new(EventStream::new(config.events.capacity));
        let abort = Arc::new(AbortController::new());
        let executor = NodeExecutor::new(config.retry.clone(), Arc::clone(&events), Arc::clone(&abort));
        let checkpoints = CheckpointManager::new(None, Arc::clone(&events));
        let nodes = nodes
            .into_iter()
            .map(|n| (n.id().to_string(), n))
            .collect::<HashMap<_, _>>();

        let max_steps = max_steps.unwrap_or(config.runner.max_steps);
        let checkpoint_interval = checkpoint_interval.unwrap_or(config.runner.checkpoint_interval);
        if max_steps == 0 {
            return Err(TrellisError::InvalidGraph(
                "max_steps must be at least 1".to_string(),
            ));
        }
        if checkpoint_interval == 0 {
            return Err(TrellisError::InvalidGraph(
                "checkpoint_interval must be at least 1".to_string(),
            ));
        }

        info!(
            nodes = nodes.len(),
            edges = edges.len(),
            entry = %entry_node,
            "Graph runner ready"
        );

        Ok(Self {
            nodes,
            edges,
            entry_node,
            max_steps,
            checkpoint_interval,
            merge: parallel_merge.unwrap_or(config.merge),
            condition_errors: condition_error_strategy.unwrap_or(config.runner.condition_errors),
            hooks,
            events,
            abort,
            executor,
            checkpoints,
            last_state: Mutex::new(None),
        })
    }

    /// Attach a persistence collaborator, enabling checkpoints.
    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceAdapter>) -> Self {
        self.checkpoints = CheckpointManager::new(Some(persistence), Arc::clone(&self.events));
        self
    }

    pub fn events(&self) -> &Arc<EventStream> {
        &self.events
    }

    pub fn abort_controller(&self) -> &Arc<AbortController> {
        &self.abort
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// State at the end of the most recent run, including failed ones.
    pub fn last_state(&self) -> Option<State> {
        self.last_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run from the entry node.
    pub async fn execute(&self, state: State, options: RunOptions) -> Result<RunOutcome> {
        let cursor = Transition::next(self.entry_node.clone());
        self.run(state, cursor, 0, options).await
    }

    /// Restart from a checkpoint. The in-memory index is consulted first,
    /// then the persistence collaborator.
    pub async fn resume(&self, target: ResumeTarget, options: RunOptions) -> Result<RunOutcome> {
        let checkpoint = match self.abort.checkpoint(&target) {
            Some(checkpoint) => checkpoint,
            None => match &target {
                ResumeTarget::Id(id) => self.checkpoints.load(id).await?,
                ResumeTarget::LatestOf(state_id) => {
                    self.checkpoints.latest(state_id).await?.ok_or_else(|| {
                        TrellisError::CheckpointNotFound(format!("latest for state {}", state_id.0))
                    })?
                }
                ResumeTarget::Latest => {
                    return Err(TrellisError::CheckpointNotFound("latest".to_string()))
                }
            },
        };

        let (cursor, step) = match checkpoint.pending.clone() {
            Some(Transition::Next { node }) => (Transition::Next { node }, checkpoint.step + 1),
            Some(pending) => (pending, checkpoint.step),
            None => {
                let next = resolve_next(
                    &self.edges,
                    &checkpoint.node_id,
                    None,
                    &checkpoint.state,
                    self.condition_errors,
                )?;
                let step = match next {
                    Transition::Next { .. } => checkpoint.step + 1,
                    _ => checkpoint.step,
                };
                (next, step)
            }
        };

        info!(
            checkpoint_id = %checkpoint.id,
            node_id = %checkpoint.node_id,
            step,
            "Resuming from checkpoint"
        );
        self.run(checkpoint.state, cursor, step, options).await
    }

    async fn run(
        &self,
        state: State,
        cursor: Transition,
        step: usize,
        options: RunOptions,
    ) -> Result<RunOutcome> {
        let hooks = self.hooks.with(options.hooks);
        let started = Instant::now();
        let mut progress = Progress {
            state,
            step,
            node_id: None,
            visited: Vec::new(),
        };

        let result = self.drive(&mut progress, cursor, &hooks).await;
        self.store_last_state(progress.state.clone());

        match result {
            Ok(status) => {
                self.emit_health(&progress, status, started.elapsed().as_millis() as u64);
                info!(
                    steps = progress.step,
                    status = ?status,
                    visited = progress.visited.len(),
                    "Graph run finished"
                );
                Ok(RunOutcome {
                    state: progress.state,
                    steps: progress.step,
                    status,
                    visited: progress.visited,
                })
            }
            Err(e) => Err(self.report_failure(e, progress.node_id.as_deref(), &hooks)),
        }
    }

    async fn drive(&self, progress: &mut Progress, mut cursor: Transition, hooks: &HookSet) -> Result<RunStatus> {
        self.abort.throw_if_aborted()?;

        loop {
            if let Some(breach) = progress.state.policy.check(&progress.state.telemetry) {
                self.emit_budget(progress, &breach, EventStatus::Failure);
                hooks.budget_warning(&breach);
                return Ok(RunStatus::BudgetExceeded);
            }

            if progress.step >= self.max_steps {
                let breach = BudgetBreach {
                    resource: BudgetResource::Steps,
                    used: progress.step as u64,
                    limit: self.max_steps as u64,
                };
                self.emit_budget(progress, &breach, EventStatus::Warning);
                return Ok(RunStatus::StepLimitReached);
            }

            self.abort.throw_if_aborted()?;

            cursor = match cursor {
                Transition::End => return Ok(RunStatus::Completed),
                Transition::Next { node } => {
                    let next = self.run_node(progress, &node, hooks).await?;
                    match next {
                        Transition::End => return Ok(RunStatus::Completed),
                        Transition::Next { .. } => {
                            progress.step += 1;
                            next
                        }
                        Transition::Parallel { .. } => next,
                    }
                }
                Transition::Parallel { branches, join } => {
                    self.run_parallel(progress, &branches, hooks).await?;
                    progress.step += branches.len();
                    Transition::Next { node: join }
                }
            };
        }
    }

    /// Execute one node, resolve where to go next and checkpoint.
    async fn run_node(&self, progress: &mut Progress, node_id: &str, hooks: &HookSet) -> Result<Transition> {
        progress.node_id = Some(node_id.to_string());
        let node = self.lookup(node_id)?;
        progress.visited.push(node_id.to_string());

        let state = progress.state.clone();
        let outcome = match self.executor.execute(node.as_ref(), state, hooks).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                progress.state = failure.state;
                return Err(failure.error);
            }
        };
        progress.state = outcome.state;

        let next = resolve_next(
            &self.edges,
            node_id,
            outcome.next_node.as_deref(),
            &progress.state,
            self.condition_errors,
        )?;
        debug!(node_id = %node_id, step = progress.step, next = ?next, "Resolved transition");

        if progress.step % self.checkpoint_interval == 0 {
            let saved = self
                .abort
                .wrap_with_abort(self.checkpoints.save(
                    &progress.state,
                    progress.step,
                    node_id,
                    Some(next.clone()),
                    hooks,
                ))
                .await?;
            if let Some(checkpoint) = saved {
                self.abort.register_checkpoint(checkpoint);
            }
        }

        Ok(next)
    }

    /// Fan out to `branches` on clones of the current state and merge.
    async fn run_parallel(&self, progress: &mut Progress, branches: &[String], hooks: &HookSet) -> Result<()> {
        let nodes = branches
            .iter()
            .map(|id| self.lookup(id))
            .collect::<Result<Vec<_>>>()?;
        progress.visited.extend(branches.iter().cloned());

        info!(branches = ?branches, step = progress.step, "Fanning out");
        let base = progress.state.clone();

        let results = try_join_all(nodes.iter().map(|node| {
            let branch_state = base.clone();
            async move {
                let id = node.id().to_string();
                match self.executor.execute(node.as_ref(), branch_state, hooks).await {
                    Ok(outcome) => {
                        if let Some(ignored) = outcome.next_node {
                            debug!(node_id = %id, next = %ignored, "Branch override ignored");
                        }
                        Ok((id, outcome.state))
                    }
                    Err(failure) => Err((id, failure)),
                }
            }
        }))
        .await;

        match results {
            Ok(states) => {
                progress.state = merge_branches(&base, states, &self.merge);
                Ok(())
            }
            Err((id, failure)) => {
                warn!(node_id = %id, error = %failure.error, "Parallel branch failed, failing step");
                progress.state = merge_branches(&base, vec![(id.clone(), failure.state)], &self.merge);
                progress.node_id = Some(id);
                Err(failure.error)
            }
        }
    }

    fn lookup(&self, node_id: &str) -> Result<Arc<dyn Node>> {
        self.nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| TrellisError::UnknownNode(node_id.to_string()))
    }

    fn store_last_state(&self, state: State) {
        *self.last_state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
    }

    fn emit_budget(&self, progress: &Progress, breach: &BudgetBreach, status: EventStatus) {
        warn!(
            resource = ?breach.resource,
            used = breach.used,
            limit = breach.limit,
            step = progress.step,
            "Budget exceeded, terminating graph"
        );
        let mut options = EmitOptions::default().with_metadata(serde_json::json!(breach));
        options.node_id = progress.node_id.clone();
        self.events.emit(
            EventType::BudgetExceeded,
            status,
            format!(
                "Budget exceeded: {:?} used {} of {}",
                breach.resource, breach.used, breach.limit
            ),
            options,
        );
    }

    fn emit_health(&self, progress: &Progress, status: RunStatus, wall_ms: u64) {
        let telemetry = &progress.state.telemetry;
        self.events.emit(
            EventType::HealthMetrics,
            EventStatus::Info,
            format!("Run finished after {} steps", progress.step),
            EmitOptions::default().with_metadata(serde_json::json!({
                "status": status,
                "steps": progress.step,
                "wall_ms": wall_ms,
                "total_duration_ms": telemetry.total_duration_ms,
                "token_count": telemetry.token_count,
                "tool_call_count": telemetry.tool_call_count,
                "error_count": telemetry.error_count,
                "retry_count": telemetry.retry_count,
            })),
        );
    }

    /// Log, emit and route a fatal error; returns it unchanged.
    fn report_failure(&self, err: TrellisError, node_id: Option<&str>, hooks: &HookSet) -> TrellisError {
        let mut options = EmitOptions::default();
        options.node_id = node_id.map(str::to_string);

        if err.is_abort() {
            info!(node_id = ?node_id, error = %err, "Graph run aborted");
            self.events.emit(
                EventType::Aborted,
                EventStatus::Warning,
                err.to_string(),
                options.with_payload(err.to_payload()),
            );
            return err;
        }

        error!(node_id = ?node_id, error = %err, "Graph run failed");
        let mut payload = err.to_payload();
        payload["source_kind"] = payload["kind"].take();
        payload["kind"] = serde_json::json!(trellis_core::ErrorKind::Execution);
        self.events.emit(
            EventType::Error,
            EventStatus::Failure,
            format!("Run failed: {}", err),
            options.with_payload(payload),
        );
        hooks.error(node_id, &err);
        err
    }
}

impl std::fmt::Debug for GraphRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphRunner")
            .field("entry_node", &self.entry_node)
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .field("max_steps", &self.max_steps)
            .field("checkpoint_interval", &self.checkpoint_interval)
            .field("merge", &self.merge)
            .field("checkpoints", &self.checkpoints.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::config::RunnerConfig;
    use trellis_core::traits::{NodeContext, NodeResult};
    use trellis_core::types::Message;
    use trellis_test_utils::{InMemoryPersistence, RecordingHooks};

    use crate::graph::node::FnNode;

    fn say(id: &'static str) -> FnNode<impl Fn(State, NodeContext) -> futures::future::Ready<Result<NodeResult>> + Send + Sync + 'static> {
        FnNode::new(id, move |mut state: State, _ctx: NodeContext| {
            state.push_message(Message::assistant(id));
            futures::future::ready(Ok(NodeResult::new(state)))
        })
    }

    #[tokio::test]
    async fn test_override_jumps_past_edges() {
        let graph = GraphDefinition::new("a")
            .node(FnNode::new("a", |state: State, _ctx: NodeContext| async move {
                Ok(NodeResult::new(state).goto("c"))
            }))
            .node(say("b"))
            .node(say("c"))
            .edge(Edge::sequential("a", "b"));

        let runner = GraphRunner::new(graph).unwrap();
        let outcome = runner.execute(State::default(), RunOptions::default()).await.unwrap();
        assert_eq!(outcome.visited, vec!["a", "c"]);
        assert_eq!(outcome.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_override_is_fatal() {
        let graph = GraphDefinition::new("a").node(FnNode::new(
            "a",
            |state: State, _ctx: NodeContext| async move { Ok(NodeResult::new(state).goto("ghost")) },
        ));
        let hooks = Arc::new(RecordingHooks::new());
        let runner = GraphRunner::new(graph).unwrap();

        let err = runner
            .execute(State::default(), RunOptions::with_hooks(hooks.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, TrellisError::UnknownNode(ref id) if id == "ghost"));

        let errors = runner.events().events_of(&EventType::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status, EventStatus::Failure);
        let payload = runner.events().payload(errors[0].payload_ref.as_deref().unwrap()).unwrap();
        assert_eq!(payload["kind"], "execution");
        assert!(hooks.calls().contains(&"error:ghost".to_string()));
        assert!(runner.events().events_of(&EventType::HealthMetrics).is_empty());
    }

    #[tokio::test]
    async fn test_step_limit_emits_warning() {
        let graph = GraphDefinition::new("a")
            .node(say("a"))
            .node(say("b"))
            .edge(Edge::sequential("a", "b"))
            .edge(Edge::sequential("b", "a"))
            .with_max_steps(3);

        let runner = GraphRunner::new(graph).unwrap();
        let outcome = runner.execute(State::default(), RunOptions::default()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::StepLimitReached);
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.visited, vec!["a", "b", "a"]);

        let budget = runner.events().events_of(&EventType::BudgetExceeded);
        assert_eq!(budget.len(), 1);
        assert_eq!(budget[0].status, EventStatus::Warning);
        assert_eq!(runner.events().events_of(&EventType::HealthMetrics).len(), 1);
    }

    #[tokio::test]
    async fn test_condition_error_fails_run() {
        let graph = GraphDefinition::new("a")
            .node(say("a"))
            .node(say("b"))
            .edge(Edge::guarded(
                "a",
                "b",
                crate::graph::edge::Predicate::fallible("broken", |_| {
                    Err(TrellisError::Validation("no field".into()))
                }),
            ));
        let runner = GraphRunner::new(graph).unwrap();
        let err = runner.execute(State::default(), RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, TrellisError::Condition { .. }));
        // a's effects survive in the last state.
        assert_eq!(runner.last_state().unwrap().conversation.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_refuses_to_start_while_aborted() {
        let graph = GraphDefinition::new("a").node(say("a"));
        let runner = GraphRunner::new(graph).unwrap();
        runner.abort_controller().abort("stop");

        let err = runner.execute(State::default(), RunOptions::default()).await.unwrap_err();
        assert!(err.is_abort());
        assert_eq!(runner.events().events_of(&EventType::Aborted).len(), 1);
        assert!(runner.events().events_of(&EventType::NodeStart).is_empty());

        runner.abort_controller().reset();
        let outcome = runner.execute(State::default(), RunOptions::default()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_latest_continues_pending_transition() {
        let store = Arc::new(InMemoryPersistence::new());
        let graph = GraphDefinition::new("a")
            .node(say("a"))
            .node(say("b"))
            .node(say("c"))
            .edge(Edge::sequential("a", "b"))
            .edge(Edge::sequential("b", "c"))
            .with_max_steps(2);

        let runner = GraphRunner::new(graph).unwrap().with_persistence(store.clone());
        let first = runner.execute(State::default(), RunOptions::default()).await.unwrap();
        assert_eq!(first.status, RunStatus::StepLimitReached);
        assert_eq!(first.visited, vec!["a", "b"]);

        // The latest checkpoint was taken after b, pointing at c.
        let latest = runner.abort_controller().checkpoint(&ResumeTarget::Latest).unwrap();
        assert_eq!(latest.node_id, "b");
        assert_eq!(latest.pending, Some(Transition::next("c")));
        assert_eq!(latest.step, 1);

        let runner = {
            let graph = GraphDefinition::new("a")
                .node(say("a"))
                .node(say("b"))
                .node(say("c"))
                .edge(Edge::sequential("a", "b"))
                .edge(Edge::sequential("b", "c"));
            GraphRunner::new(graph).unwrap().with_persistence(store.clone())
        };
        let resumed = runner
            .resume(ResumeTarget::Id(latest.id.clone()), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(resumed.visited, vec!["c"]);
        assert_eq!(resumed.steps, 2);
        let said: Vec<&str> = resumed
            .state
            .conversation
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(said, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint_fails() {
        let graph = GraphDefinition::new("a").node(say("a"));
        let runner = GraphRunner::new(graph).unwrap();
        assert!(matches!(
            runner.resume(ResumeTarget::Latest, RunOptions::default()).await.unwrap_err(),
            TrellisError::CheckpointNotFound(_)
        ));
        assert!(matches!(
            runner
                .resume(ResumeTarget::Id("missing".into()), RunOptions::default())
                .await
                .unwrap_err(),
            TrellisError::CheckpointNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_config_fills_unset_settings() {
        let config = EngineConfig::from_toml(
            r#"
[runner]
max_steps = 1
"#,
        )
        .unwrap();
        let graph = GraphDefinition::new("a")
            .node(say("a"))
            .node(say("b"))
            .edge(Edge::sequential("a", "b"));
        let runner = GraphRunner::with_config(graph, &config).unwrap();
        let outcome = runner.execute(State::default(), RunOptions::default()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::StepLimitReached);
        assert_eq!(outcome.visited, vec!["a"]);
    }

    #[test]
    fn test_zero_settings_from_config_rejected() {
        let zero_interval = EngineConfig {
            runner: RunnerConfig {
                checkpoint_interval: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = GraphRunner::with_config(GraphDefinition::new("a").node(say("a")), &zero_interval)
            .unwrap_err();
        assert!(matches!(err, TrellisError::InvalidGraph(ref msg) if msg.contains("checkpoint_interval")));

        let zero_steps = EngineConfig {
            runner: RunnerConfig {
                max_steps: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = GraphRunner::with_config(GraphDefinition::new("a").node(say("a")), &zero_steps)
            .unwrap_err();
        assert!(matches!(err, TrellisError::InvalidGraph(ref msg) if msg.contains("max_steps")));

        // A graph-level setting still overrides the config.
        let graph = GraphDefinition::new("a").node(say("a")).with_checkpoint_interval(2);
        assert!(GraphRunner::with_config(graph, &zero_interval).is_ok());
    }
}
