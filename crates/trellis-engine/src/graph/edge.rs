use std::sync::Arc;

use trellis_core::error::Result;
use trellis_core::types::State;

type PredicateFn = dyn Fn(&State) -> Result<bool> + Send + Sync;

/// Guard on a conditional edge, evaluated against the current state.
#[derive(Clone)]
pub struct Predicate {
    label: String,
    check: Arc<PredicateFn>,
}

impl Predicate {
    /// Wrap an infallible closure.
    pub fn new(label: impl Into<String>, f: impl Fn(&State) -> bool + Send + Sync + 'static) -> Self {
        Self {
            label: label.into(),
            check: Arc::new(move |state: &State| -> Result<bool> { Ok(f(state)) }),
        }
    }

    /// Wrap a closure that may fail.
    pub fn fallible(
        label: impl Into<String>,
        f: impl Fn(&State) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            check: Arc::new(f),
        }
    }

    /// A declarative expression evaluated by [`evaluate_condition`].
    pub fn expr(expr: impl Into<String>) -> Self {
        let expr = expr.into();
        let label = expr.clone();
        Self {
            label,
            check: Arc::new(move |state: &State| -> Result<bool> {
                Ok(evaluate_condition(&expr, state))
            }),
        }
    }

    pub fn evaluate(&self, state: &State) -> Result<bool> {
        (self.check)(state)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Predicate").field(&self.label).finish()
    }
}

/// An edge connecting nodes in the execution graph.
#[derive(Debug, Clone)]
pub enum Edge {
    /// Always traverse.
    Sequential { from: String, to: String },
    /// Traverse if the predicate holds. A missing predicate is rejected at
    /// validation time.
    Conditional {
        from: String,
        to: String,
        predicate: Option<Predicate>,
    },
    /// Fan out to every branch concurrently, then continue at `join`.
    Parallel {
        from: String,
        to: Vec<String>,
        join: String,
    },
}

impl Edge {
    /// Create an unconditional edge.
    pub fn sequential(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::Sequential {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a conditional edge guarded by a closure.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        predicate: impl Fn(&State) -> bool + Send + Sync + 'static,
    ) -> Self {
        let from = from.into();
        let to = to.into();
        let label = format!("{} -> {}", from, to);
        Self::Conditional {
            from,
            to,
            predicate: Some(Predicate::new(label, predicate)),
        }
    }

    /// Create a conditional edge from a prebuilt predicate.
    pub fn guarded(from: impl Into<String>, to: impl Into<String>, predicate: Predicate) -> Self {
        Self::Conditional {
            from: from.into(),
            to: to.into(),
            predicate: Some(predicate),
        }
    }

    /// Create a conditional edge from an expression such as `status == "ok"`.
    pub fn when(from: impl Into<String>, to: impl Into<String>, expr: impl Into<String>) -> Self {
        Self::guarded(from, to, Predicate::expr(expr))
    }

    /// Create a fan-out edge.
    pub fn parallel<I, S>(from: impl Into<String>, to: I, join: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Parallel {
            from: from.into(),
            to: to.into_iter().map(Into::into).collect(),
            join: join.into(),
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Self::Sequential { from, .. }
            | Self::Conditional { from, .. }
            | Self::Parallel { from, .. } => from,
        }
    }

    /// Every node id this edge points at, including a parallel join.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::Sequential { to, .. } | Self::Conditional { to, .. } => vec![to.as_str()],
            Self::Parallel { to, join, .. } => {
                let mut targets: Vec<&str> = to.iter().map(String::as_str).collect();
                targets.push(join.as_str());
                targets
            }
        }
    }
}

/// Evaluate a simple conditional expression against state memory and artifacts.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
///
/// Non-string values are compared through their JSON rendering. Returns
/// `false` for unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, state: &State) -> bool {
    let expr = expr.trim();
    let lookup = |key: &str| -> Option<String> {
        state.lookup(key).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    };

    let Some((key, op, value)) = parse_operator(expr) else {
        return false;
    };
    let Some(actual) = lookup(key) else {
        return false;
    };
    match op {
        Operator::Contains => actual.contains(value),
        Operator::NotEquals => actual != value,
        Operator::Equals => actual == value,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equals,
    NotEquals,
    Contains,
}

/// Split `key OP "value"` at the leftmost operator, so operator text inside
/// the quoted value is never mistaken for the operator itself.
fn parse_operator(expr: &str) -> Option<(&str, Operator, &str)> {
    let (at, token, op) = [
        ("==", Operator::Equals),
        ("!=", Operator::NotEquals),
        (" contains ", Operator::Contains),
    ]
    .into_iter()
    .filter_map(|(token, op)| expr.find(token).map(|at| (at, token, op)))
    .min_by_key(|(at, _, _)| *at)?;

    let key = expr[..at].trim();
    if key.is_empty() {
        return None;
    }
    Some((key, op, expr[at + token.len()..].trim().trim_matches('"')))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(key: &str, value: serde_json::Value) -> State {
        let mut state = State::default();
        state.remember(key, value);
        state
    }

    #[test]
    fn test_edge_builders() {
        let e = Edge::sequential("a", "b");
        assert_eq!(e.source(), "a");
        assert_eq!(e.targets(), vec!["b"]);

        let e = Edge::parallel("x", ["y", "z"], "w");
        assert_eq!(e.targets(), vec!["y", "z", "w"]);

        let e = Edge::conditional("a", "c", |_| true);
        match e {
            Edge::Conditional { predicate: Some(p), .. } => assert_eq!(p.label(), "a -> c"),
            other => panic!("unexpected edge {:?}", other),
        }
    }

    #[test]
    fn test_condition_equals() {
        let state = state_with("status", serde_json::json!("success"));
        assert!(evaluate_condition(r#"status == "success""#, &state));
        assert!(!evaluate_condition(r#"status == "failure""#, &state));
    }

    #[test]
    fn test_condition_not_equals() {
        let state = state_with("status", serde_json::json!("success"));
        assert!(evaluate_condition(r#"status != "failure""#, &state));
        assert!(!evaluate_condition(r#"status != "success""#, &state));
    }

    #[test]
    fn test_condition_contains() {
        let mut state = State::default();
        state.set_artifact("output", serde_json::json!("The file was created successfully."));
        assert!(evaluate_condition(r#"output contains "created""#, &state));
        assert!(!evaluate_condition(r#"output contains "deleted""#, &state));
    }

    #[test]
    fn test_operator_text_inside_value() {
        let state = state_with("status", serde_json::json!("not contains x"));
        assert!(evaluate_condition(r#"status == "not contains x""#, &state));
        assert!(!evaluate_condition(r#"status != "not contains x""#, &state));

        let state = state_with("note", serde_json::json!("a == b holds"));
        assert!(evaluate_condition(r#"note contains "a == b""#, &state));
        assert!(!evaluate_condition(r#"note contains "a != b""#, &state));
    }

    #[test]
    fn test_condition_non_string_value() {
        let state = state_with("score", serde_json::json!(9));
        assert!(evaluate_condition("score == 9", &state));
    }

    #[test]
    fn test_condition_missing_key_and_invalid() {
        let state = State::default();
        assert!(!evaluate_condition(r#"missing == "value""#, &state));
        assert!(!evaluate_condition("this is not valid", &state));
        assert!(!evaluate_condition(r#" == "x""#, &state));
    }

    #[test]
    fn test_fallible_predicate() {
        let p = Predicate::fallible("needs plan", |s| {
            s.lookup("plan")
                .map(|_| true)
                .ok_or_else(|| trellis_core::TrellisError::Validation("no plan".into()))
        });
        assert!(p.evaluate(&State::default()).is_err());
        assert!(p.evaluate(&state_with("plan", serde_json::json!([]))).unwrap());
    }
}
