use std::future::Future;

use futures::future::BoxFuture;

use trellis_core::error::Result;
use trellis_core::traits::{Node, NodeContext, NodeResult};
use trellis_core::types::State;

/// A node backed by an async closure.
///
/// Handy for glue steps and tests; real workloads usually implement
/// [`Node`] directly.
pub struct FnNode<F> {
    id: String,
    name: String,
    f: F,
}

impl<F, Fut> FnNode<F>
where
    F: Fn(State, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<NodeResult>> + Send + 'static,
{
    pub fn new(id: impl Into<String>, f: F) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            f,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<F, Fut> Node for FnNode<F>
where
    F: Fn(State, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<NodeResult>> + Send + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, state: State, ctx: NodeContext) -> BoxFuture<'_, Result<NodeResult>> {
        Box::pin((self.f)(state, ctx))
    }
}
