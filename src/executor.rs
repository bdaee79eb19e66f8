//! Async graph executor.
//!
//! [`Executor`] runs a [`PipelineGraph`] over a [`PipelineState`]. Ready nodes
//! run concurrently on immutable snapshots; each completion is streamed to an
//! observer and then deep-merged into the state, which the executor alone
//! owns. A node becomes ready once it has been activated (it is the entry,
//! an unconditional predecessor completed, or a router selected it), every
//! unconditional predecessor has completed, and, if any conditional edge
//! targets it, a router selected it. Nodes that never become ready are
//! reported as skipped.
//!
//! Node failures are merged as error entries under the node's name and do
//! not stop the run. They are listed in [`RunOutcome::failed`], and a failed
//! node's conditional edge is not evaluated.
//! Cancellation, graph errors and unmatched router labels abort the run.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::events::{emit, Event};
use crate::exec_ctx::ExecCtx;
use crate::graph::{PipelineGraph, Target};
use crate::node::{BoxFut, TaskResult};
use crate::state::{error_entry, PipelineState, StateMap};

/// Final result of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The merged state.
    pub state: PipelineState,
    /// Node names in completion order.
    pub completed: Vec<String>,
    /// Nodes that never ran, in graph order.
    pub skipped: Vec<String>,
    /// Nodes that returned an error, in completion order.
    pub failed: Vec<String>,
    /// Every dotted key changed during the run, first change first.
    pub changed_keys: Vec<String>,
}

impl RunOutcome {
    /// Whether any node in the run failed.
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Runs a graph. Holds no per-run state, so one executor can run many times.
///
/// # Example
///
/// ```
/// use llm_docflow::{Executor, ExecCtx, GraphBuilder, PipelineState};
/// use llm_docflow::node::FnNode;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let graph = GraphBuilder::new()
///     .add_node(Arc::new(FnNode::new("hello", |_| {
///         Ok(json!({"hello": "world"}).as_object().cloned().unwrap_or_default())
///     })))
///     .set_entry("hello")
///     .build()
///     .unwrap();
/// let ctx = ExecCtx::builder("http://unused").build();
/// let outcome = Executor::new(graph).run(&ctx, PipelineState::default()).await.unwrap();
/// assert_eq!(outcome.state.get_str("hello"), Some("world"));
/// # });
/// ```
pub struct Executor {
    graph: Arc<PipelineGraph>,
}

impl Executor {
    pub fn new(graph: PipelineGraph) -> Self {
        Self {
            graph: Arc::new(graph),
        }
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// Run to completion.
    pub async fn run(&self, ctx: &ExecCtx, state: PipelineState) -> Result<RunOutcome> {
        self.run_with_observer(ctx, state, |_| {}).await
    }

    /// Run to completion, handing each node's result to `observer` as soon
    /// as the node finishes and before it is merged.
    pub async fn run_with_observer<F>(
        &self,
        ctx: &ExecCtx,
        mut state: PipelineState,
        mut observer: F,
    ) -> Result<RunOutcome>
    where
        F: FnMut(&TaskResult) + Send,
    {
        let graph = &self.graph;
        let mut activated: Vec<String> = vec![graph.entry().to_string()];
        let mut selected: HashSet<String> = HashSet::new();
        let mut started: HashSet<String> = HashSet::new();
        let mut done: HashSet<String> = HashSet::new();
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut changed_keys = Vec::new();
        let mut seen_keys = HashSet::new();

        let mut running: FuturesUnordered<BoxFut<'_, (String, Result<StateMap>)>> = FuturesUnordered::new();

        loop {
            ctx.check_cancelled()?;

            let ready: Vec<String> = activated
                .iter()
                .filter(|name| !started.contains(*name))
                .filter(|name| graph.predecessors(name).iter().all(|p| done.contains(p)))
                .filter(|name| !graph.has_conditional_incoming(name) || selected.contains(*name))
                .cloned()
                .collect();

            if !ready.is_empty() {
                let snapshot = Arc::new(state.clone());
                for name in ready {
                    let Some(node) = graph.node(&name).cloned() else {
                        return Err(PipelineError::Graph(format!("node '{name}' vanished")));
                    };
                    info!(node = %name, kind = node.kind(), "node started");
                    emit(
                        &ctx.event_handler,
                        Event::NodeStart {
                            name: name.clone(),
                            kind: node.kind(),
                        },
                    );
                    started.insert(name.clone());
                    let snapshot = snapshot.clone();
                    running.push(Box::pin(async move {
                        let result = node.execute(ctx, snapshot).await;
                        (name, result)
                    }));
                }
            }

            if running.is_empty() {
                break;
            }

            let (name, result) = tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(PipelineError::Cancelled),
                next = running.next() => match next {
                    Some(finished) => finished,
                    None => break,
                },
            };

            let task = match result {
                Ok(update) => TaskResult {
                    node: name.clone(),
                    update,
                    error: None,
                },
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    warn!(node = %name, error = %e, "node failed");
                    let mut update = StateMap::new();
                    update.insert(name.clone(), error_entry(&e));
                    TaskResult {
                        node: name.clone(),
                        update,
                        error: Some(e.to_string()),
                    }
                }
            };

            observer(&task);
            emit(
                &ctx.event_handler,
                Event::NodeOutput {
                    name: name.clone(),
                    update: task.update_value(),
                },
            );

            let ok = task.is_ok();
            let changed = state.merge(task.update);
            debug!(node = %name, changed = changed.len(), "merged node output");
            for key in changed {
                if seen_keys.insert(key.clone()) {
                    changed_keys.push(key);
                }
            }
            done.insert(name.clone());
            completed.push(name.clone());
            if !ok {
                failed.push(name.clone());
            }
            emit(&ctx.event_handler, Event::NodeEnd { name: name.clone(), ok });

            for next in graph.successors(&name) {
                if !activated.contains(next) {
                    activated.push(next.clone());
                }
            }

            if let Some(edge) = graph.conditional(&name) {
                if !ok {
                    debug!(node = %name, "node failed, conditional edge not evaluated");
                    continue;
                }
                let label = edge.router().route(&state);
                match edge.resolve(&name, &label)? {
                    Target::Node(next) => {
                        info!(node = %name, %label, next = %next, "routed");
                        selected.insert(next.clone());
                        if !activated.contains(next) {
                            activated.push(next.clone());
                        }
                    }
                    Target::End => info!(node = %name, %label, "routed to end"),
                }
            }
        }

        let skipped: Vec<String> = graph
            .node_names()
            .into_iter()
            .filter(|n| !done.contains(*n))
            .map(str::to_string)
            .collect();
        if !skipped.is_empty() {
            debug!(?skipped, "nodes not run");
        }

        Ok(RunOutcome {
            state,
            completed,
            skipped,
            failed,
            changed_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockReply};
    use crate::events::FnEventHandler;
    use crate::graph::{GraphBuilder, Router, END};
    use crate::llm_call::LlmCall;
    use crate::node::{FnNode, TaskNode};
    use crate::retry::BackoffConfig;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    fn obj(v: Value) -> StateMap {
        v.as_object().cloned().unwrap()
    }

    fn writes(name: &str, update: Value) -> Arc<dyn TaskNode> {
        let update = obj(update);
        Arc::new(FnNode::new(name, move |_| Ok(update.clone())))
    }

    /// Sleeps, then records the peak number of concurrently running nodes.
    struct Slow {
        name: String,
        delay: Duration,
        live: Arc<Mutex<(usize, usize)>>,
    }

    impl TaskNode for Slow {
        fn kind(&self) -> &'static str {
            "slow"
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn execute<'a>(&'a self, _ctx: &'a ExecCtx, _state: Arc<PipelineState>) -> BoxFut<'a, Result<StateMap>> {
            Box::pin(async move {
                {
                    let mut g = self.live.lock().unwrap();
                    g.0 += 1;
                    g.1 = g.1.max(g.0);
                }
                tokio::time::sleep(self.delay).await;
                self.live.lock().unwrap().0 -= 1;
                let mut update = StateMap::new();
                update.insert(self.name.clone(), json!({"done": true}));
                Ok(update)
            })
        }
    }

    fn ctx() -> ExecCtx {
        ExecCtx::builder("http://unused").build()
    }

    fn po_graph() -> PipelineGraph {
        GraphBuilder::new()
            .add_node(writes("parse", json!({"parsed_data": {"po.pdf": {"result": {"doc_type": "PO"}}}})))
            .add_node(Arc::new(FnNode::new("check", |s| {
                let is_po = s
                    .get("parsed_data")
                    .and_then(Value::as_object)
                    .is_some_and(|docs| docs.values().any(|d| d["result"]["doc_type"] == "PO"));
                Ok(obj(json!({"po_check": if is_po { "Yes" } else { "No" }})))
            })))
            .add_node(writes("validate", json!({"validation_result": "ok"})))
            .set_entry("parse")
            .add_edge("parse", "check")
            .add_conditional_edges(
                "check",
                Router::from_key("po_check", ["Yes", "No"]),
                [("Yes", "validate"), ("No", END)],
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_routes_to_validate() {
        let outcome = Executor::new(po_graph()).run(&ctx(), PipelineState::default()).await.unwrap();
        assert_eq!(outcome.completed, vec!["parse", "check", "validate"]);
        assert_eq!(outcome.state.get_str("validation_result"), Some("ok"));
        assert!(outcome.skipped.is_empty());
        assert!(!outcome.has_failures());
    }

    #[tokio::test]
    async fn test_routes_to_end() {
        let graph = GraphBuilder::new()
            .add_node(writes("check", json!({"po_check": "No"})))
            .add_node(writes("validate", json!({"validation_result": "ok"})))
            .set_entry("check")
            .add_conditional_edges(
                "check",
                Router::from_key("po_check", ["Yes", "No"]),
                [("Yes", "validate"), ("No", END)],
            )
            .build()
            .unwrap();
        let outcome = Executor::new(graph).run(&ctx(), PipelineState::default()).await.unwrap();
        assert_eq!(outcome.completed, vec!["check"]);
        assert_eq!(outcome.skipped, vec!["validate"]);
        assert!(outcome.state.get("validation_result").is_none());
    }

    #[tokio::test]
    async fn test_unmatched_label_aborts() {
        let graph = GraphBuilder::new()
            .add_node(writes("check", json!({"po_check": "Maybe"})))
            .add_node(writes("validate", json!({})))
            .set_entry("check")
            .add_conditional_edges(
                "check",
                Router::from_key("po_check", ["Yes"]),
                [("Yes", "validate")],
            )
            .build()
            .unwrap();
        let err = Executor::new(graph).run(&ctx(), PipelineState::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Router { label, .. } if label == "Maybe"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_siblings_run_concurrently_and_join_waits() {
        let live = Arc::new(Mutex::new((0, 0)));
        let slow = |name: &str, ms: u64| -> Arc<dyn TaskNode> {
            Arc::new(Slow {
                name: name.into(),
                delay: Duration::from_millis(ms),
                live: live.clone(),
            })
        };
        let graph = GraphBuilder::new()
            .add_node(writes("parse", json!({"parsed_data": {}})))
            .add_node(slow("checklist", 300))
            .add_node(slow("union", 100))
            .add_node(slow("phi", 200))
            .add_node(writes("report", json!({"report": "ready"})))
            .set_entry("parse")
            .add_edge("parse", "checklist")
            .add_edge("parse", "union")
            .add_edge("parse", "phi")
            .add_edge("checklist", "report")
            .add_edge("union", "report")
            .add_edge("phi", "report")
            .build()
            .unwrap();

        let started = tokio::time::Instant::now();
        let outcome = Executor::new(graph).run(&ctx(), PipelineState::default()).await.unwrap();

        assert_eq!(live.lock().unwrap().1, 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));
        assert_eq!(outcome.completed, vec!["parse", "union", "phi", "checklist", "report"]);
        for key in ["checklist", "union", "phi"] {
            assert_eq!(outcome.state.get(key), Some(&json!({"done": true})));
        }
    }

    #[tokio::test]
    async fn test_node_error_is_data() {
        let graph = GraphBuilder::new()
            .add_node(writes("parse", json!({"parsed_data": {}})))
            .add_node(Arc::new(FnNode::new("checklist", |_| {
                Err(PipelineError::Protocol("no text".into()))
            })))
            .add_node(writes("phi", json!({"phi": "No"})))
            .set_entry("parse")
            .add_edge("parse", "checklist")
            .add_edge("parse", "phi")
            .build()
            .unwrap();

        let outcome = Executor::new(graph).run(&ctx(), PipelineState::default()).await.unwrap();
        let entry = outcome.state.get("checklist").unwrap();
        assert_eq!(entry["error_kind"], "protocol");
        assert!(entry["result"].is_null());
        assert_eq!(outcome.state.get_str("phi"), Some("No"));
        assert_eq!(outcome.failed, vec!["checklist"]);
        assert!(outcome.has_failures());
    }

    #[tokio::test]
    async fn test_failed_router_source_is_not_routed() {
        let backend = Arc::new(MockBackend::scripted(vec![MockReply::Fail("service down".into())]));
        let ctx = ExecCtx::builder("http://mock")
            .backend(backend)
            .backoff(BackoffConfig::none())
            .build();
        let graph = GraphBuilder::new()
            .add_node(writes("parse", json!({"parsed_data": {"po.pdf": {"result": {}}}})))
            .add_node(Arc::new(
                LlmCall::new("check", "Is there a PO in {parsed_data}?")
                    .with_inputs(["parsed_data"])
                    .with_output_key("po_check"),
            ))
            .add_node(writes("validate", json!({"validation_result": "ok"})))
            .set_entry("parse")
            .add_edge("parse", "check")
            .add_conditional_edges(
                "check",
                Router::from_key("po_check", ["Yes", "No"]),
                [("Yes", "validate"), ("No", END)],
            )
            .build()
            .unwrap();

        let oks = Arc::new(Mutex::new(Vec::new()));
        let recorder = oks.clone();
        let outcome = Executor::new(graph)
            .run_with_observer(&ctx, PipelineState::default(), move |task| {
                recorder.lock().unwrap().push((task.node.clone(), task.is_ok()));
            })
            .await
            .unwrap();

        assert_eq!(outcome.completed, vec!["parse", "check"]);
        assert_eq!(outcome.skipped, vec!["validate"]);
        assert_eq!(outcome.failed, vec!["check"]);
        assert!(outcome.has_failures());
        assert_eq!(outcome.state.get("check").unwrap()["error_kind"], "http");
        assert!(outcome.state.get("po_check").is_none());
        assert_eq!(
            *oks.lock().unwrap(),
            vec![("parse".to_string(), true), ("check".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_failure_counted_when_node_writes_elsewhere() {
        let backend = Arc::new(MockBackend::fixed("no structure here"));
        let ctx = ExecCtx::builder("http://mock")
            .backend(backend)
            .backoff(BackoffConfig::none())
            .build();
        let graph = GraphBuilder::new()
            .add_node(Arc::new(
                LlmCall::new("Validate PO data", "validate")
                    .with_output_key("validation_result")
                    .expecting_json(),
            ))
            .set_entry("Validate PO data")
            .build()
            .unwrap();

        let outcome = Executor::new(graph).run(&ctx, PipelineState::default()).await.unwrap();
        assert!(outcome.has_failures());
        assert_eq!(outcome.failed, vec!["Validate PO data"]);
        assert_eq!(outcome.state.get("Validate PO data").unwrap()["error_kind"], "parse");
    }

    #[tokio::test]
    async fn test_observer_sees_update_before_merge() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let ctx = ExecCtx::builder("http://unused")
            .event_handler(Arc::new(FnEventHandler(move |e: Event| {
                if let Event::NodeOutput { name, .. } = e {
                    sink.lock().unwrap().push(name);
                }
            })))
            .build();

        let recorder = seen.clone();
        let outcome = Executor::new(po_graph())
            .run_with_observer(&ctx, PipelineState::default(), move |task| {
                recorder.lock().unwrap().push((task.node.clone(), task.update.keys().cloned().collect::<Vec<_>>()));
            })
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[0], ("parse".to_string(), vec!["parsed_data".to_string()]));
        assert_eq!(seen[1], ("check".to_string(), vec!["po_check".to_string()]));
        assert_eq!(*events.lock().unwrap(), vec!["parse", "check", "validate"]);
        assert!(outcome.changed_keys.contains(&"parsed_data".to_string()));
        assert!(outcome.changed_keys.contains(&"po_check".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_run() {
        let live = Arc::new(Mutex::new((0, 0)));
        let graph = GraphBuilder::new()
            .add_node(Arc::new(Slow {
                name: "slow".into(),
                delay: Duration::from_secs(60),
                live,
            }) as Arc<dyn TaskNode>)
            .set_entry("slow")
            .build()
            .unwrap();
        let ctx = ctx();
        let token = ctx.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let err = Executor::new(graph).run(&ctx, PipelineState::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disjoint_writers_same_result_any_order() {
        let live = Arc::new(Mutex::new((0, 0)));
        let graph = |a_ms: u64, b_ms: u64| {
            let slow = |name: &str, ms: u64| -> Arc<dyn TaskNode> {
                Arc::new(Slow {
                    name: name.into(),
                    delay: Duration::from_millis(ms),
                    live: live.clone(),
                })
            };
            GraphBuilder::new()
                .add_node(writes("root", json!({})))
                .add_node(slow("a", a_ms))
                .add_node(slow("b", b_ms))
                .set_entry("root")
                .add_edge("root", "a")
                .add_edge("root", "b")
                .build()
                .unwrap()
        };
        let first = Executor::new(graph(10, 20)).run(&ctx(), PipelineState::default()).await.unwrap();
        let second = Executor::new(graph(20, 10)).run(&ctx(), PipelineState::default()).await.unwrap();

        assert_eq!(first.completed, vec!["root", "a", "b"]);
        assert_eq!(second.completed, vec!["root", "b", "a"]);
        assert_eq!(first.state.to_value(), second.state.to_value());
        assert_eq!(first.state.to_value(), json!({"a": {"done": true}, "b": {"done": true}}));
    }
}
