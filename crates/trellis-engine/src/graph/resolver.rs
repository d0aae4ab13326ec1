use tracing::{debug, warn};

use trellis_core::config::ConditionErrorStrategy;
use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{State, Transition};

use super::edge::Edge;

/// Decide where to go after `current` finished.
///
/// Priority: an explicit `next_node` override from the node, then any
/// parallel edge leaving `current`, then the first sequential or
/// conditional edge (in declaration order) that matches the state. No
/// match means the run is over.
pub fn resolve_next(
    edges: &[Edge],
    current: &str,
    next_override: Option<&str>,
    state: &State,
    on_condition_error: ConditionErrorStrategy,
) -> Result<Transition> {
    if let Some(next) = next_override {
        debug!(from = %current, to = %next, "Node overrode the edge graph");
        return Ok(Transition::next(next));
    }

    let outgoing: Vec<&Edge> = edges.iter().filter(|e| e.source() == current).collect();

    if let Some(Edge::Parallel { to, join, .. }) = outgoing
        .iter()
        .find(|e| matches!(e, Edge::Parallel { .. }))
        .copied()
    {
        return Ok(Transition::Parallel {
            branches: to.clone(),
            join: join.clone(),
        });
    }

    for edge in outgoing {
        match edge {
            Edge::Sequential { to, .. } => return Ok(Transition::next(to.clone())),
            Edge::Conditional { from, to, predicate } => {
                let Some(predicate) = predicate else {
                    // Rejected by validation; treat as not taken if it slips through.
                    continue;
                };
                match predicate.evaluate(state) {
                    Ok(true) => return Ok(Transition::next(to.clone())),
                    Ok(false) => {}
                    Err(e) => match on_condition_error {
                        ConditionErrorStrategy::Fail => {
                            return Err(TrellisError::Condition {
                                from: from.clone(),
                                to: to.clone(),
                                message: e.to_string(),
                            })
                        }
                        ConditionErrorStrategy::Skip => {
                            warn!(
                                from = %from,
                                to = %to,
                                predicate = %predicate.label(),
                                error = %e,
                                "Edge condition failed, skipping edge"
                            );
                        }
                    },
                }
            }
            Edge::Parallel { .. } => {}
        }
    }

    debug!(node_id = %current, "No edge matched, graph complete");
    Ok(Transition::End)
}
