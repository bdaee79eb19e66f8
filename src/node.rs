//! Task node trait.
//!
//! A node is a named unit of work that reads a state snapshot and returns
//! a partial update. The trait is object-safe so graphs can hold
//! heterogeneous nodes as `Arc<dyn TaskNode>`.

use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use crate::state::{PipelineState, StateMap};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed, pinned, Send future. The return type of [`TaskNode::execute`].
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe trait for graph nodes.
///
/// Implementations must not hold on to the snapshot beyond the returned
/// future; the executor owns the live state and merges the update itself.
/// Recoverable failures should be returned as data in the update (see
/// [`error_entry`](crate::state::error_entry)); an `Err` is also captured
/// by the executor as an error entry under the node's name, except
/// [`Cancelled`](crate::PipelineError::Cancelled) which aborts the run.
pub trait TaskNode: Send + Sync {
    /// Stable identifier for the node type (e.g. `"llm-call"`).
    fn kind(&self) -> &'static str;

    /// Instance name. Unique within a graph.
    fn name(&self) -> &str;

    /// Execute against an immutable snapshot.
    fn execute<'a>(&'a self, ctx: &'a ExecCtx, state: Arc<PipelineState>) -> BoxFut<'a, Result<StateMap>>;
}

/// The outcome of one node invocation as streamed to observers.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Node name.
    pub node: String,
    /// Update about to be merged.
    pub update: StateMap,
    /// Error message when the node failed and `update` is its error entry.
    pub error: Option<String>,
}

impl TaskResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn update_value(&self) -> Value {
        Value::Object(self.update.clone())
    }
}

type NodeFn = dyn Fn(&PipelineState) -> Result<StateMap> + Send + Sync;

/// A synchronous node backed by a closure over the snapshot.
///
/// Suited to routing checks and pure state derivations that need no
/// service call.
///
/// # Example
///
/// ```
/// use llm_docflow::node::FnNode;
/// use serde_json::json;
///
/// let node = FnNode::new("Count Files", |state| {
///     let n = state.documents().len();
///     Ok(json!({"file_count": n}).as_object().cloned().unwrap_or_default())
/// });
/// ```
pub struct FnNode {
    name: String,
    f: Box<NodeFn>,
}

impl FnNode {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&PipelineState) -> Result<StateMap> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl TaskNode for FnNode {
    fn kind(&self) -> &'static str {
        "fn"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(&'a self, ctx: &'a ExecCtx, state: Arc<PipelineState>) -> BoxFut<'a, Result<StateMap>> {
        Box::pin(async move {
            ctx.check_cancelled()?;
            (self.f)(&state)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_node_reads_snapshot() {
        let node = FnNode::new("echo", |state| {
            let mut out = StateMap::new();
            out.insert("seen".into(), state.get("input").cloned().unwrap_or(Value::Null));
            Ok(out)
        });
        let ctx = ExecCtx::builder("http://unused").build();
        let state = Arc::new(PipelineState::from_values(
            json!({"input": 7}).as_object().cloned().unwrap(),
        ));

        let update = node.execute(&ctx, state).await.unwrap();
        assert_eq!(update["seen"], 7);
        assert_eq!(node.kind(), "fn");
    }

    #[tokio::test]
    async fn test_fn_node_honours_cancellation() {
        let node = FnNode::new("noop", |_| Ok(StateMap::new()));
        let ctx = ExecCtx::builder("http://unused").build();
        ctx.cancellation.cancel();
        let result = node.execute(&ctx, Arc::new(PipelineState::default())).await;
        assert!(matches!(result, Err(crate::PipelineError::Cancelled)));
    }
}
