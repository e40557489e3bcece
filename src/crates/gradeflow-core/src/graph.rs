//! Graph structure and construction.
//!
//! A [`Graph`] is a fixed topology of named async nodes joined by direct and
//! conditional edges. It is assembled through [`GraphBuilder`], which
//! enforces the ordering contract that makes routing failures impossible at
//! runtime: every edge target, including every conditional branch target,
//! must name a node that is **already registered** when the edge is added.
//! A conditional edge pointing at a node registered later would otherwise
//! build cleanly and then silently stop execution at its predecessor.
//!
//! # Example
//!
//! ```rust
//! use gradeflow_core::graph::{GraphBuilder, NodeContext, NodeOutput, START, END};
//!
//! let mut builder = GraphBuilder::new();
//! builder
//!     .add_node("work", |state, _ctx: NodeContext| {
//!         Box::pin(async move {
//!             let _ = state;
//!             Ok(NodeOutput::Update(serde_json::json!({"done": true})))
//!         })
//!     })
//!     .unwrap();
//! builder.add_edge(START, "work").unwrap();
//! builder.add_edge("work", END).unwrap();
//! let graph = builder.build().unwrap();
//! assert!(graph.node("work").is_some());
//! ```

use crate::error::GraphBuildError;
use crate::send::Send;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Virtual entry node.
pub const START: &str = "__start__";

/// Virtual terminal node.
pub const END: &str = "__end__";

/// Per-invocation context handed to every node.
#[derive(Clone)]
pub struct NodeContext {
    /// Identifier of the run this invocation belongs to.
    pub run_id: String,

    /// Cooperative cancellation token. Nodes poll this at their suspension
    /// points (LLM calls, checkpoint writes, event publishes).
    pub cancel: CancellationToken,

    /// Attempt number for this node, starting at 0. Incremented when the
    /// runtime retries a timed-out node.
    pub attempt: u32,
}

impl NodeContext {
    /// Whether cancellation has been requested for the run.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// What a node hands back to the runtime.
pub enum NodeOutput {
    /// Partial state update, merged key-wise into the run state.
    Update(Value),

    /// Partial update plus a batch of dynamic tasks. The runtime merges
    /// `update`, runs every [`Send`] concurrently (bounded by the worker
    /// pool), merges sibling updates in ascending `task_id` order, and then
    /// continues from the fan-out target's outgoing edge.
    ///
    /// All sends of one fan-out must share the same target node. An empty
    /// batch is allowed and simply falls through to the target's edge.
    Fanout { update: Value, sends: Vec<Send> },

    /// Partial update, then suspend the run. The runtime persists a
    /// checkpoint and returns [`RunStatus::Paused`](crate::runtime::RunStatus)
    /// so an external caller can resume from this node later.
    Pause(Value),
}

impl fmt::Debug for NodeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOutput::Update(_) => f.write_str("Update"),
            NodeOutput::Fanout { sends, .. } => write!(f, "Fanout({} sends)", sends.len()),
            NodeOutput::Pause(_) => f.write_str("Pause"),
        }
    }
}

/// Boxed future returned by node executors.
pub type NodeFuture =
    Pin<Box<dyn Future<Output = std::result::Result<NodeOutput, String>> + std::marker::Send>>;

/// Node executor: current state in, output and routing intent out.
///
/// Errors are plain strings at this boundary; the runtime wraps them into
/// [`GraphError::Node`](crate::error::GraphError) with the node name.
pub type NodeFn =
    Arc<dyn Fn(Value, NodeContext) -> NodeFuture + std::marker::Send + Sync>;

/// Router for conditional edges. Must be pure: routers read state and pick a
/// branch key, they never mutate anything.
pub type RouterFn = Arc<dyn Fn(&Value) -> String + std::marker::Send + Sync>;

/// An outgoing edge.
#[derive(Clone)]
pub enum Edge {
    /// Unconditional transition.
    Direct(String),

    /// Route through `router`; its return value selects a target from
    /// `branches`.
    Conditional {
        router: RouterFn,
        branches: HashMap<String, String>,
    },
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Direct(to) => f.debug_tuple("Direct").field(to).finish(),
            Edge::Conditional { branches, .. } => f
                .debug_struct("Conditional")
                .field("router", &"<fn>")
                .field("branches", branches)
                .finish(),
        }
    }
}

/// A validated, executable graph.
pub struct Graph {
    nodes: HashMap<String, NodeFn>,
    edges: HashMap<String, Edge>,
    entry: String,
}

impl Graph {
    /// Look up a node executor by name.
    pub fn node(&self, name: &str) -> Option<&NodeFn> {
        self.nodes.get(name)
    }

    /// Outgoing edge of a node, if any.
    pub fn edge(&self, name: &str) -> Option<&Edge> {
        self.edges.get(name)
    }

    /// First real node, reached from [`START`].
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Registered node names, for introspection and tests.
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("entry", &self.entry)
            .finish()
    }
}

/// Builder enforcing registration-order validation.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: HashMap<String, NodeFn>,
    edges: HashMap<String, Edge>,
    entry: Option<String>,
}

impl fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("entry", &self.entry)
            .finish()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Names must be unique and must not shadow the virtual
    /// START/END nodes.
    pub fn add_node<F>(&mut self, name: &str, executor: F) -> Result<&mut Self, GraphBuildError>
    where
        F: Fn(Value, NodeContext) -> NodeFuture + std::marker::Send + Sync + 'static,
    {
        if name == START || name == END {
            return Err(GraphBuildError::DuplicateNode(name.to_string()));
        }
        if self.nodes.contains_key(name) {
            return Err(GraphBuildError::DuplicateNode(name.to_string()));
        }
        self.nodes.insert(name.to_string(), Arc::new(executor));
        Ok(self)
    }

    /// Add a direct edge. The target must already be registered (or END).
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<&mut Self, GraphBuildError> {
        self.check_source(from)?;
        self.check_target(from, to)?;
        if from == START {
            self.entry = Some(to.to_string());
            return Ok(self);
        }
        if self.edges.contains_key(from) {
            return Err(GraphBuildError::AmbiguousEdges(from.to_string()));
        }
        self.edges.insert(from.to_string(), Edge::Direct(to.to_string()));
        Ok(self)
    }

    /// Add a conditional edge.
    ///
    /// Every branch target is validated here, at registration time. This is
    /// deliberate and stricter than validating at `build()`: it makes the
    /// "edge points at a node registered later" defect unrepresentable.
    pub fn add_conditional_edge(
        &mut self,
        from: &str,
        router: RouterFn,
        branches: HashMap<String, String>,
    ) -> Result<&mut Self, GraphBuildError> {
        self.check_source(from)?;
        for target in branches.values() {
            self.check_target(from, target)?;
        }
        if self.edges.contains_key(from) {
            return Err(GraphBuildError::AmbiguousEdges(from.to_string()));
        }
        self.edges
            .insert(from.to_string(), Edge::Conditional { router, branches });
        Ok(self)
    }

    fn check_source(&self, from: &str) -> Result<(), GraphBuildError> {
        if from != START && !self.nodes.contains_key(from) {
            return Err(GraphBuildError::UnknownSource(from.to_string()));
        }
        Ok(())
    }

    fn check_target(&self, from: &str, to: &str) -> Result<(), GraphBuildError> {
        if to != END && !self.nodes.contains_key(to) {
            return Err(GraphBuildError::UnknownTarget {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    /// Validate the whole structure and produce an executable [`Graph`].
    ///
    /// Checks: an entry point exists, and every node either has exactly one
    /// outgoing edge or is a fan-out target whose edge is reached through
    /// the fan-in. Nodes without any outgoing edge are rejected unless they
    /// edge to END.
    pub fn build(self) -> Result<Graph, GraphBuildError> {
        let entry = self
            .entry
            .clone()
            .ok_or_else(|| GraphBuildError::InvalidEntry("no edge from START".to_string()))?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphBuildError::InvalidEntry(entry));
        }
        // Re-validate targets; add_* already guarantees this, but build() is
        // the last line of defense if the builder grows new mutation paths.
        for (from, edge) in &self.edges {
            match edge {
                Edge::Direct(to) => {
                    if to != END && !self.nodes.contains_key(to) {
                        return Err(GraphBuildError::UnknownTarget {
                            from: from.clone(),
                            to: to.clone(),
                        });
                    }
                }
                Edge::Conditional { branches, .. } => {
                    for to in branches.values() {
                        if to != END && !self.nodes.contains_key(to) {
                            return Err(GraphBuildError::UnknownTarget {
                                from: from.clone(),
                                to: to.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(Graph {
            nodes: self.nodes,
            edges: self.edges,
            entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(name: &'static str) -> impl Fn(Value, NodeContext) -> NodeFuture {
        move |_state, _ctx| {
            Box::pin(async move { Ok(NodeOutput::Update(json!({ "visited": [name] }))) })
        }
    }

    #[test]
    fn duplicate_node_rejected() {
        let mut builder = GraphBuilder::new();
        builder.add_node("a", noop("a")).unwrap();
        assert!(matches!(
            builder.add_node("a", noop("a")),
            Err(GraphBuildError::DuplicateNode(_))
        ));
    }

    #[test]
    fn direct_edge_to_unregistered_node_rejected() {
        let mut builder = GraphBuilder::new();
        builder.add_node("a", noop("a")).unwrap();
        assert!(matches!(
            builder.add_edge("a", "later"),
            Err(GraphBuildError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn conditional_edge_target_must_be_registered_before_the_edge() {
        let mut builder = GraphBuilder::new();
        builder.add_node("parse", noop("parse")).unwrap();
        // "gate" is only registered afterwards, so wiring the router first
        // must fail even though the final graph would look complete.
        let branches = HashMap::from([("review".to_string(), "gate".to_string())]);
        let router: RouterFn = Arc::new(|_| "review".to_string());
        let err = builder
            .add_conditional_edge("parse", router, branches)
            .unwrap_err();
        assert!(matches!(err, GraphBuildError::UnknownTarget { .. }));
    }

    #[test]
    fn second_outgoing_edge_rejected() {
        let mut builder = GraphBuilder::new();
        builder.add_node("a", noop("a")).unwrap();
        builder.add_node("b", noop("b")).unwrap();
        builder.add_edge("a", "b").unwrap();
        assert!(matches!(
            builder.add_edge("a", END),
            Err(GraphBuildError::AmbiguousEdges(_))
        ));
    }

    #[test]
    fn build_requires_entry() {
        let mut builder = GraphBuilder::new();
        builder.add_node("a", noop("a")).unwrap();
        builder.add_edge("a", END).unwrap();
        assert!(matches!(
            builder.build(),
            Err(GraphBuildError::InvalidEntry(_))
        ));
    }

    #[test]
    fn valid_linear_graph_builds() {
        let mut builder = GraphBuilder::new();
        builder.add_node("a", noop("a")).unwrap();
        builder.add_node("b", noop("b")).unwrap();
        builder.add_edge(START, "a").unwrap();
        builder.add_edge("a", "b").unwrap();
        builder.add_edge("b", END).unwrap();
        let graph = builder.build().unwrap();
        assert_eq!(graph.entry(), "a");
        assert!(graph.edge("b").is_some());
    }
}
