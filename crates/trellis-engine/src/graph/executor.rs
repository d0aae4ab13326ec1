use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use trellis_core::config::RetryConfig;
use trellis_core::error::TrellisError;
use trellis_core::event::{EmitOptions, EventStatus, EventStream, EventType};
use trellis_core::hooks::HookSet;
use trellis_core::traits::{Node, NodeContext};
use trellis_core::types::State;

use crate::abort::AbortController;
use crate::retry::{self, RetryDecision};

/// A node run that ended in success, possibly after retries.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub state: State,
    pub next_node: Option<String>,
    /// Total attempts made, including the successful one.
    pub attempts: u32,
    pub elapsed_ms: u64,
}

/// A node run that exhausted its retries or hit a non-retryable error.
///
/// `state` is the input state with the retry and error counters applied.
#[derive(Debug)]
pub struct NodeFailure {
    pub error: TrellisError,
    pub state: State,
}

/// Runs a single node with retry, backoff and cancellation.
pub struct NodeExecutor {
    retry: RetryConfig,
    events: Arc<EventStream>,
    abort: Arc<AbortController>,
}

impl NodeExecutor {
    pub fn new(retry: RetryConfig, events: Arc<EventStream>, abort: Arc<AbortController>) -> Self {
        Self { retry, events, abort }
    }

    pub async fn execute(
        &self,
        node: &dyn Node,
        mut state: State,
        hooks: &HookSet,
    ) -> std::result::Result<NodeOutcome, NodeFailure> {
        let node_id = node.id().to_string();
        let started = Instant::now();
        let mut node_retries: u64 = 0;
        let mut attempt: u32 = 0;

        info!(node_id = %node_id, node_name = %node.name(), "Executing graph node");
        hooks.node_start(&node_id, &state);
        self.events.emit(
            EventType::NodeStart,
            EventStatus::Started,
            format!("Node {} started", node_id),
            EmitOptions::node(&node_id),
        );

        loop {
            attempt += 1;
            let attempt_start = Instant::now();
            let ctx = NodeContext::new(
                node_id.clone(),
                attempt,
                Arc::clone(&self.events),
                hooks.clone(),
                self.abort.signal(),
            );

            let result = self
                .abort
                .wrap_with_abort(node.execute(state.clone(), ctx))
                .await;
            let attempt_ms = attempt_start.elapsed().as_millis() as u64;

            let err = match result {
                Ok(result) => {
                    let mut next = result.state;
                    if next.telemetry.clamp_to(&state.telemetry) {
                        warn!(node_id = %node_id, "Node lowered telemetry counters, restored");
                    }
                    next.telemetry.record_node(&node_id, attempt_ms);
                    next.touch();

                    for event in result.events {
                        let mut options = EmitOptions::node(&node_id);
                        options.payload = event.payload;
                        options.metadata = event.metadata;
                        self.events.emit(event.kind, event.status, event.summary, options);
                    }

                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    hooks.node_end(&node_id, &next, elapsed_ms);
                    self.events.emit(
                        EventType::NodeEnd,
                        EventStatus::Success,
                        format!("Node {} completed", node_id),
                        EmitOptions::node(&node_id).with_metadata(serde_json::json!({
                            "attempts": attempt,
                            "elapsed_ms": elapsed_ms,
                        })),
                    );
                    debug!(node_id = %node_id, attempts = attempt, elapsed_ms, "Node execution complete");

                    return Ok(NodeOutcome {
                        state: next,
                        next_node: result.next_node,
                        attempts: attempt,
                        elapsed_ms,
                    });
                }
                Err(e) => e,
            };

            state.telemetry.total_duration_ms += attempt_ms;

            if err.is_abort() {
                info!(node_id = %node_id, attempt, "Node interrupted by abort");
                return Err(NodeFailure { error: err, state });
            }

            let kind = err.kind();
            let decision = retry::decide(
                kind,
                node_retries,
                state.telemetry.retry_count,
                state.policy.max_retries,
                &self.retry,
            );

            match decision {
                RetryDecision::Retry { delay } => {
                    node_retries += 1;
                    state.telemetry.retry_count += 1;
                    warn!(
                        node_id = %node_id,
                        attempt,
                        kind = %kind,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Node attempt failed, retrying"
                    );
                    self.events.emit(
                        EventType::Retry,
                        EventStatus::Warning,
                        format!("Retrying {} after attempt {}", node_id, attempt),
                        EmitOptions::node(&node_id)
                            .with_payload(err.to_payload())
                            .with_metadata(serde_json::json!({
                                "attempt": attempt,
                                "delay_ms": delay.as_millis() as u64,
                            })),
                    );

                    let signal = self.abort.signal();
                    tokio::select! {
                        biased;
                        _ = signal.cancelled() => {
                            info!(node_id = %node_id, "Backoff interrupted by abort");
                            return Err(NodeFailure { error: signal.to_error(), state });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => {
                    state.telemetry.error_count += 1;
                    state.touch();
                    error!(node_id = %node_id, attempts = attempt, kind = %kind, error = %err, "Graph node failed");
                    self.events.emit(
                        EventType::NodeEnd,
                        EventStatus::Failure,
                        format!("Node {} failed: {}", node_id, err),
                        EmitOptions::node(&node_id).with_payload(err.to_payload()),
                    );
                    return Err(NodeFailure { error: err, state });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::error::Result;
    use trellis_core::hooks::RunnerHooks;
    use trellis_core::traits::{NodeEvent, NodeResult};
    use trellis_core::types::Policy;
    use trellis_test_utils::{FlakyNode, RecordingHooks};

    use crate::graph::node::FnNode;

    fn executor(events: &Arc<EventStream>) -> NodeExecutor {
        let retry = RetryConfig {
            base_ms: 1,
            multiplier: 1.0,
            max_backoff_ms: 10,
            jitter: false,
        };
        NodeExecutor::new(retry, Arc::clone(events), Arc::new(AbortController::new()))
    }

    fn state_with_retries(max_retries: u64) -> State {
        State::new(Policy {
            max_retries,
            ..Policy::default()
        })
    }

    #[tokio::test]
    async fn test_success_records_timing_and_events() {
        let events = Arc::new(EventStream::default());
        let node = FnNode::new("a", |mut state: State, ctx: NodeContext| async move {
            ctx.emit_event("custom", EventStatus::Info, "inline", None);
            state.remember("done", serde_json::json!(true));
            Ok(NodeResult::new(state)
                .with_event(NodeEvent::new("note", EventStatus::Info, "queued"))
                .goto("b"))
        });
        let recorder = Arc::new(RecordingHooks::new());
        let hooks = HookSet::new().with(Some(recorder.clone() as Arc<dyn RunnerHooks>));

        let outcome = executor(&events)
            .execute(&node, State::default(), &hooks)
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.next_node.as_deref(), Some("b"));
        assert_eq!(outcome.state.telemetry.node_timings["a"].calls, 1);
        assert_eq!(outcome.state.lookup("done"), Some(&serde_json::json!(true)));

        let kinds: Vec<String> = events.events().iter().map(|e| e.kind.to_string()).collect();
        assert_eq!(kinds, vec!["node_start", "custom", "note", "node_end"]);
        assert!(events.events().iter().all(|e| e.node_id.as_deref() == Some("a")));
        assert_eq!(recorder.calls(), vec!["node_start:a", "node_end:a"]);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let events = Arc::new(EventStream::default());
        let node = FlakyNode::new("v", usize::MAX, || TrellisError::Validation("bad".into()));

        let failure = executor(&events)
            .execute(&node, state_with_retries(5), &HookSet::new())
            .await
            .unwrap_err();

        assert_eq!(node.attempts(), 1);
        assert!(matches!(failure.error, TrellisError::Validation(_)));
        assert_eq!(failure.state.telemetry.retry_count, 0);
        assert_eq!(failure.state.telemetry.error_count, 1);

        let end = events.events_of(&EventType::NodeEnd);
        assert_eq!(end.len(), 1);
        assert_eq!(end[0].status, EventStatus::Failure);
        let payload = events.payload(end[0].payload_ref.as_deref().unwrap()).unwrap();
        assert_eq!(payload["kind"], "validation");
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let events = Arc::new(EventStream::default());
        let node = FlakyNode::new("n", 2, || TrellisError::Network("reset".into()));

        let outcome = executor(&events)
            .execute(&node, state_with_retries(3), &HookSet::new())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.state.telemetry.retry_count, 2);
        assert_eq!(outcome.state.telemetry.error_count, 0);
        assert_eq!(events.events_of(&EventType::Retry).len(), 2);
        assert_eq!(events.events_of(&EventType::NodeStart).len(), 1);
    }

    #[tokio::test]
    async fn test_run_wide_retry_budget_limits_retries() {
        let events = Arc::new(EventStream::default());
        let node = FlakyNode::new("n", usize::MAX, || TrellisError::Network("down".into()));
        let mut state = state_with_retries(3);
        state.telemetry.retry_count = 2;

        let failure = executor(&events)
            .execute(&node, state, &HookSet::new())
            .await
            .unwrap_err();

        // One retry left in the run, so two attempts.
        assert_eq!(node.attempts(), 2);
        assert_eq!(failure.state.telemetry.retry_count, 3);
    }

    #[tokio::test]
    async fn test_lowered_telemetry_is_restored() {
        let events = Arc::new(EventStream::default());
        let node = FnNode::new("r", |mut state: State, _ctx: NodeContext| async move {
            state.telemetry.tool_call_count = 0;
            Ok::<_, TrellisError>(NodeResult::new(state))
        });
        let mut input = State::default();
        input.telemetry.tool_call_count = 7;

        let outcome = executor(&events)
            .execute(&node, input, &HookSet::new())
            .await
            .unwrap();
        assert_eq!(outcome.state.telemetry.tool_call_count, 7);
    }

    #[tokio::test]
    async fn test_abort_during_backoff() {
        let events = Arc::new(EventStream::default());
        let abort = Arc::new(AbortController::new());
        let retry = RetryConfig {
            base_ms: 10_000,
            multiplier: 1.0,
            max_backoff_ms: 10_000,
            jitter: false,
        };
        let executor = NodeExecutor::new(retry, Arc::clone(&events), Arc::clone(&abort));
        let node = FlakyNode::new("slow", usize::MAX, || TrellisError::Timeout {
            operation: "fetch".into(),
            timeout_ms: 5,
        });

        let a = Arc::clone(&abort);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            a.abort("user");
        });

        let started = Instant::now();
        let failure = executor
            .execute(&node, state_with_retries(5), &HookSet::new())
            .await
            .unwrap_err();

        assert!(failure.error.is_abort());
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(failure.state.telemetry.error_count, 0);
    }

    #[tokio::test]
    async fn test_abort_is_not_retried() -> Result<()> {
        let events = Arc::new(EventStream::default());
        let node = FlakyNode::new("x", usize::MAX, || TrellisError::Aborted {
            reason: "inner".into(),
        });
        let failure = executor(&events)
            .execute(&node, state_with_retries(5), &HookSet::new())
            .await
            .unwrap_err();
        assert_eq!(node.attempts(), 1);
        assert!(failure.error.is_abort());
        assert!(events.events_of(&EventType::Retry).is_empty());
        Ok(())
    }
}
