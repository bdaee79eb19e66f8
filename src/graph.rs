//! Pipeline graph definition and build-time validation.
//!
//! A graph is a set of named [`TaskNode`]s, an entry node, unconditional
//! edges, and at most one conditional edge per source node. A conditional
//! edge pairs a [`Router`] (a pure `state -> label` function that declares
//! every label it can return) with a label-to-target map. The builder
//! rejects graphs where a declared label has no target and no default
//! branch was given, so an unmatched label cannot surface at runtime for a
//! router that keeps to its declaration.
//!
//! # Example
//!
//! ```
//! use llm_docflow::graph::{GraphBuilder, Router, END};
//! use llm_docflow::node::FnNode;
//! use llm_docflow::state::StateMap;
//! use std::sync::Arc;
//!
//! let graph = GraphBuilder::new()
//!     .add_node(Arc::new(FnNode::new("Check PO Exists", |_| Ok(StateMap::new()))))
//!     .add_node(Arc::new(FnNode::new("Validate PO data", |_| Ok(StateMap::new()))))
//!     .set_entry("Check PO Exists")
//!     .add_conditional_edges(
//!         "Check PO Exists",
//!         Router::from_key("po_check", ["Yes", "No"]),
//!         [("Yes", "Validate PO data"), ("No", END)],
//!     )
//!     .build()
//!     .unwrap();
//! assert_eq!(graph.entry(), "Check PO Exists");
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::node::TaskNode;
use crate::state::PipelineState;

/// Name of the terminal marker. Routing to it ends that branch of the run.
pub const END: &str = "__end__";

/// Destination of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Node(String),
    End,
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        if name == END {
            Target::End
        } else {
            Target::Node(name.to_string())
        }
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::from(name.as_str())
    }
}

type RouteFn = dyn Fn(&PipelineState) -> String + Send + Sync;

/// A pure function from state to a branch label, with its declared labels.
#[derive(Clone)]
pub struct Router {
    labels: Vec<String>,
    route: Arc<RouteFn>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("labels", &self.labels).finish()
    }
}

impl Router {
    /// `labels` is every value `route` may return.
    pub fn new<I, S, F>(labels: I, route: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&PipelineState) -> String + Send + Sync + 'static,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            route: Arc::new(route),
        }
    }

    /// Route on a top-level string value. A missing or non-string value
    /// yields the empty label, which only a default branch can catch.
    pub fn from_key<I, S>(key: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.into();
        Self::new(labels, move |state| {
            state.get_str(&key).unwrap_or_default().to_string()
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn route(&self, state: &PipelineState) -> String {
        (self.route)(state)
    }
}

/// A router plus its label-to-target map.
#[derive(Debug, Clone)]
pub struct ConditionalEdge {
    router: Router,
    branches: BTreeMap<String, Target>,
    default: Option<Target>,
}

impl ConditionalEdge {
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Every node this edge can select.
    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.branches.values().chain(self.default.iter())
    }

    /// Resolve a label, falling back to the default branch.
    pub fn resolve(&self, source: &str, label: &str) -> Result<&Target> {
        self.branches
            .get(label)
            .or(self.default.as_ref())
            .ok_or_else(|| PipelineError::Router {
                node: source.to_string(),
                label: label.to_string(),
            })
    }
}

/// Builder for [`PipelineGraph`].
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<Arc<dyn TaskNode>>,
    entry: Option<String>,
    edges: Vec<(String, Target)>,
    conditional: Vec<(String, ConditionalEdge)>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(mut self, node: Arc<dyn TaskNode>) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn set_entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Unconditional edge. `to` may be [`END`].
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<Target>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Conditional edge; every label the router declares must be mapped.
    pub fn add_conditional_edges<I, L, T>(self, from: impl Into<String>, router: Router, branches: I) -> Self
    where
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<Target>,
    {
        self.push_conditional(from.into(), router, branches, None)
    }

    /// Conditional edge with a fallback for labels not in `branches`.
    pub fn add_conditional_edges_with_default<I, L, T>(
        self,
        from: impl Into<String>,
        router: Router,
        branches: I,
        default: impl Into<Target>,
    ) -> Self
    where
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<Target>,
    {
        self.push_conditional(from.into(), router, branches, Some(default.into()))
    }

    fn push_conditional<I, L, T>(mut self, from: String, router: Router, branches: I, default: Option<Target>) -> Self
    where
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<Target>,
    {
        let branches = branches
            .into_iter()
            .map(|(label, target)| (label.into(), target.into()))
            .collect();
        self.conditional.push((
            from,
            ConditionalEdge {
                router,
                branches,
                default,
            },
        ));
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<PipelineGraph> {
        if self.nodes.is_empty() {
            return Err(PipelineError::Graph("graph has no nodes".into()));
        }

        let mut index = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let name = node.name().to_string();
            if name == END {
                return Err(PipelineError::Graph(format!("'{END}' is reserved")));
            }
            if index.insert(name.clone(), i).is_some() {
                return Err(PipelineError::Graph(format!("duplicate node name '{name}'")));
            }
        }

        let entry = self
            .entry
            .ok_or_else(|| PipelineError::Graph("no entry node set".into()))?;
        if !index.contains_key(&entry) {
            return Err(PipelineError::Graph(format!("entry '{entry}' is not a node")));
        }

        let check_target = |from: &str, target: &Target| match target {
            Target::Node(to) if !index.contains_key(to) => Err(PipelineError::Graph(format!(
                "edge '{from}' -> '{to}' targets an unknown node"
            ))),
            _ => Ok(()),
        };

        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        for (from, to) in &self.edges {
            if !index.contains_key(from) {
                return Err(PipelineError::Graph(format!("edge source '{from}' is not a node")));
            }
            check_target(from, to)?;
            if let Target::Node(to) = to {
                let succ = successors.entry(from.clone()).or_default();
                if !succ.contains(to) {
                    succ.push(to.clone());
                    predecessors.entry(to.clone()).or_default().push(from.clone());
                }
            }
        }

        let mut conditional = HashMap::new();
        let mut conditional_targets = HashSet::new();
        for (from, edge) in self.conditional {
            if !index.contains_key(&from) {
                return Err(PipelineError::Graph(format!(
                    "conditional edge source '{from}' is not a node"
                )));
            }
            for target in edge.targets() {
                check_target(&from, target)?;
                if let Target::Node(to) = target {
                    conditional_targets.insert(to.clone());
                }
            }
            if edge.default.is_none() {
                if let Some(label) = edge
                    .router
                    .labels()
                    .iter()
                    .find(|l| !edge.branches.contains_key(*l))
                {
                    return Err(PipelineError::Graph(format!(
                        "router on '{from}' declares label '{label}' with no branch and no default"
                    )));
                }
            }
            if let Some(label) = edge
                .branches
                .keys()
                .find(|l| !edge.router.labels().contains(*l))
            {
                return Err(PipelineError::Graph(format!(
                    "branch '{label}' on '{from}' is not a label its router declares"
                )));
            }
            if conditional.insert(from.clone(), edge).is_some() {
                return Err(PipelineError::Graph(format!(
                    "node '{from}' has more than one conditional edge"
                )));
            }
        }

        // The entry starts unconditionally, so nothing may lead into it.
        if predecessors.contains_key(&entry) || conditional_targets.contains(&entry) {
            return Err(PipelineError::Graph(format!("entry '{entry}' has incoming edges")));
        }

        let graph = PipelineGraph {
            nodes: self.nodes,
            index,
            entry,
            successors,
            predecessors,
            conditional,
            conditional_targets,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }
}

/// An immutable, validated graph.
pub struct PipelineGraph {
    nodes: Vec<Arc<dyn TaskNode>>,
    index: HashMap<String, usize>,
    entry: String,
    successors: HashMap<String, Vec<String>>,
    predecessors: HashMap<String, Vec<String>>,
    conditional: HashMap<String, ConditionalEdge>,
    conditional_targets: HashSet<String>,
}

impl std::fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("nodes", &self.node_names())
            .field("entry", &self.entry)
            .field("successors", &self.successors)
            .field("conditional", &self.conditional)
            .finish()
    }
}

impl PipelineGraph {
    pub fn node(&self, name: &str) -> Option<&Arc<dyn TaskNode>> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Node names in insertion order.
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name()).collect()
    }

    /// Unconditional successors.
    pub fn successors(&self, name: &str) -> &[String] {
        self.successors.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Unconditional predecessors.
    pub fn predecessors(&self, name: &str) -> &[String] {
        self.predecessors.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn conditional(&self, name: &str) -> Option<&ConditionalEdge> {
        self.conditional.get(name)
    }

    /// Whether some conditional edge can select `name`.
    pub fn has_conditional_incoming(&self, name: &str) -> bool {
        self.conditional_targets.contains(name)
    }

    /// Kahn's algorithm over unconditional and conditional edges.
    fn check_acyclic(&self) -> Result<()> {
        let mut out: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> =
            self.index.keys().map(|k| (k.as_str(), 0)).collect();

        let all_edges = self
            .successors
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| (from.as_str(), to.as_str())))
            .chain(self.conditional.iter().flat_map(|(from, edge)| {
                edge.targets().filter_map(move |t| match t {
                    Target::Node(to) => Some((from.as_str(), to.as_str())),
                    Target::End => None,
                })
            }));
        for (from, to) in all_edges {
            let targets = out.entry(from).or_default();
            if targets.contains(&to) {
                continue;
            }
            targets.push(to);
            if let Some(d) = in_degree.get_mut(to) {
                *d += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for &to in out.get(node).map(Vec::as_slice).unwrap_or_default() {
                if let Some(d) = in_degree.get_mut(to) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(to);
                    }
                }
            }
        }

        if visited == self.index.len() {
            Ok(())
        } else {
            let mut cyclic: Vec<&str> = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(n, _)| n)
                .collect();
            cyclic.sort_unstable();
            Err(PipelineError::Graph(format!("graph has a cycle through {cyclic:?}")))
        }
    }
}
