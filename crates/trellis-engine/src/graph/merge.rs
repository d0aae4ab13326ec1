//! Fork/join reconciliation of parallel branch states.
//!
//! Each field group has its own merge rule:
//! - append-only collections keep the base and concatenate every branch's
//!   suffix beyond the base length, in merge order;
//! - key-value maps are a shallow union where the later branch wins;
//! - `task` is replaced wholesale by the last branch, so a concurrent
//!   change to `task` in an earlier branch is discarded;
//! - telemetry adds each branch's delta against the base, so budget spent
//!   before the fork is counted once.

use std::collections::BTreeMap;

use trellis_core::config::{ConflictPolicy, MergeOrder, MergePolicy};
use trellis_core::types::{NodeTiming, State, Telemetry};

/// Merge branch results into one state.
///
/// `branches` must be in declared order; `policy.order` decides whether
/// that order or node-id order is used. Completion order never matters.
pub fn merge_branches(base: &State, mut branches: Vec<(String, State)>, policy: &MergePolicy) -> State {
    match policy.order {
        MergeOrder::Defined => {}
        MergeOrder::SortedById => branches.sort_by(|a, b| a.0.cmp(&b.0)),
    }
    match policy.conflict {
        ConflictPolicy::LastWriteWins => {}
    }

    let mut merged = base.clone();
    for (_, branch) in &branches {
        append_suffix(
            &mut merged.conversation.messages,
            &branch.conversation.messages,
            base.conversation.messages.len(),
        );
        append_suffix(
            &mut merged.conversation.tool_results,
            &branch.conversation.tool_results,
            base.conversation.tool_results.len(),
        );
        append_suffix(
            &mut merged.memory.long_term_refs,
            &branch.memory.long_term_refs,
            base.memory.long_term_refs.len(),
        );

        union_last_wins(&mut merged.memory.short_term, &branch.memory.short_term);
        union_last_wins(&mut merged.artifacts, &branch.artifacts);

        merged.task = branch.task.clone();

        add_delta(&mut merged.telemetry, &branch.telemetry, &base.telemetry);

        if branch.updated_at > merged.updated_at {
            merged.updated_at = branch.updated_at;
        }
    }
    merged
}

fn append_suffix<T: Clone>(target: &mut Vec<T>, branch: &[T], base_len: usize) {
    if branch.len() > base_len {
        target.extend_from_slice(&branch[base_len..]);
    }
}

fn union_last_wins(target: &mut BTreeMap<String, serde_json::Value>, branch: &BTreeMap<String, serde_json::Value>) {
    for (key, value) in branch {
        target.insert(key.clone(), value.clone());
    }
}

fn add_delta(target: &mut Telemetry, branch: &Telemetry, base: &Telemetry) {
    target.tool_call_count += branch.tool_call_count.saturating_sub(base.tool_call_count);
    target.total_duration_ms += branch.total_duration_ms.saturating_sub(base.total_duration_ms);
    target.error_count += branch.error_count.saturating_sub(base.error_count);
    target.retry_count += branch.retry_count.saturating_sub(base.retry_count);
    target.token_count += branch.token_count.saturating_sub(base.token_count);

    for (node_id, timing) in &branch.node_timings {
        let before = base.node_timings.get(node_id).copied().unwrap_or_default();
        let entry = target.node_timings.entry(node_id.clone()).or_insert(NodeTiming::default());
        entry.calls += timing.calls.saturating_sub(before.calls);
        entry.total_ms += timing.total_ms.saturating_sub(before.total_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use trellis_core::types::{Message, TaskStatus};

    fn base() -> State {
        let mut state = State::default();
        state.push_message(Message::user("start"));
        state.memory.long_term_refs.push("ltm-0".into());
        state.remember("shared", serde_json::json!("base"));
        state.telemetry.tool_call_count = 3;
        state.telemetry.record_node("x", 100);
        state
    }

    fn branch(base: &State, id: &str) -> State {
        let mut s = base.clone();
        s.push_message(Message::assistant(format!("from {}", id)));
        s.memory.long_term_refs.push(format!("ltm-{}", id));
        s.remember("shared", serde_json::json!(id));
        s.remember(&format!("only_{}", id), serde_json::json!(true));
        s.record_tool_call("search", format!("{} result", id), false);
        s.telemetry.record_node(id, 10);
        s.task.description = format!("task from {}", id);
        s
    }

    fn contents(state: &State) -> Vec<&str> {
        state.conversation.messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn test_defined_order_appends_suffixes() {
        let base = base();
        let y = branch(&base, "y");
        let z = branch(&base, "z");

        // Completion order is irrelevant: z is listed second because it was declared second.
        let merged = merge_branches(
            &base,
            vec![("y".into(), y), ("z".into(), z)],
            &MergePolicy::default(),
        );

        assert_eq!(contents(&merged), vec!["start", "from y", "from z"]);
        assert_eq!(merged.memory.long_term_refs, vec!["ltm-0", "ltm-y", "ltm-z"]);
        assert_eq!(merged.conversation.tool_results.len(), 2);
    }

    #[test]
    fn test_sorted_order_ignores_declaration() {
        let base = base();
        let merged = merge_branches(
            &base,
            vec![("zeta".into(), branch(&base, "zeta")), ("alpha".into(), branch(&base, "alpha"))],
            &MergePolicy {
                order: MergeOrder::SortedById,
                ..Default::default()
            },
        );
        assert_eq!(contents(&merged), vec!["start", "from alpha", "from zeta"]);
    }

    #[test]
    fn test_key_value_union_last_wins() {
        let base = base();
        let merged = merge_branches(
            &base,
            vec![("y".into(), branch(&base, "y")), ("z".into(), branch(&base, "z"))],
            &MergePolicy::default(),
        );
        assert_eq!(merged.memory.short_term["shared"], serde_json::json!("z"));
        assert_eq!(merged.memory.short_term["only_y"], serde_json::json!(true));
        assert_eq!(merged.memory.short_term["only_z"], serde_json::json!(true));
    }

    #[test]
    fn test_task_last_branch_wins_and_discards_earlier() {
        let base = base();
        let mut y = branch(&base, "y");
        y.task.status = TaskStatus::Completed;
        let z = branch(&base, "z");

        let merged = merge_branches(
            &base,
            vec![("y".into(), y), ("z".into(), z)],
            &MergePolicy::default(),
        );

        // y's completion is lost: whole-object replace, not a field merge.
        assert_eq!(merged.task.description, "task from z");
        assert_eq!(merged.task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_telemetry_sums_deltas() {
        let base = base();
        let merged = merge_branches(
            &base,
            vec![("y".into(), branch(&base, "y")), ("z".into(), branch(&base, "z"))],
            &MergePolicy::default(),
        );

        // 3 before the fork + 1 per branch, not 3 + 4 + 4.
        assert_eq!(merged.telemetry.tool_call_count, 5);
        assert_eq!(merged.telemetry.total_duration_ms, 120);
        assert_eq!(merged.telemetry.node_timings["x"], NodeTiming { calls: 1, total_ms: 100 });
        assert_eq!(merged.telemetry.node_timings["y"], NodeTiming { calls: 1, total_ms: 10 });
        assert_eq!(merged.telemetry.node_timings["z"].calls, 1);
    }

    #[test]
    fn test_updated_at_is_max() {
        let base = base();
        let mut y = branch(&base, "y");
        let mut z = branch(&base, "z");
        y.updated_at = base.updated_at + Duration::seconds(30);
        z.updated_at = base.updated_at + Duration::seconds(10);

        let merged = merge_branches(
            &base,
            vec![("y".into(), y.clone()), ("z".into(), z)],
            &MergePolicy::default(),
        );
        assert_eq!(merged.updated_at, y.updated_at);
        assert_eq!(merged.id, base.id);
    }

    #[test]
    fn test_branch_that_truncated_contributes_nothing() {
        let base = base();
        let mut y = base.clone();
        y.conversation.messages.clear();
        let merged = merge_branches(&base, vec![("y".into(), y)], &MergePolicy::default());
        assert_eq!(contents(&merged), vec!["start"]);
    }
}
