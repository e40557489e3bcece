//! Error types for graph construction and execution.

use thiserror::Error;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while assembling a graph.
///
/// Build errors are always programming errors: the topology is fixed at
/// compile time of the graph, so none of these are retryable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphBuildError {
    /// A node was registered twice under the same name.
    #[error("duplicate node: {0}")]
    DuplicateNode(String),

    /// An edge references a node that has not been registered.
    ///
    /// Conditional branch targets are checked at `add_conditional_edge` time
    /// so that an edge can never point at a node registered later.
    #[error("edge from '{from}' references unknown node '{to}'")]
    UnknownTarget { from: String, to: String },

    /// An edge source does not exist.
    #[error("edge source '{0}' is not a registered node")]
    UnknownSource(String),

    /// A node has more than one outgoing edge.
    #[error("node '{0}' has multiple outgoing edges")]
    AmbiguousEdges(String),

    /// The entry point is missing or unreachable.
    #[error("invalid entry point: {0}")]
    InvalidEntry(String),

    /// A node has no outgoing edge and is not terminal.
    #[error("node '{0}' has no outgoing edge and does not reach END")]
    DeadEnd(String),
}

/// Errors raised during graph execution.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Graph construction failed.
    #[error("graph build error: {0}")]
    Build(#[from] GraphBuildError),

    /// A node executor returned an error.
    #[error("node '{node}' failed: {message}")]
    Node { node: String, message: String },

    /// A router returned a branch key with no mapping.
    #[error("router at '{node}' returned unknown branch '{branch}'")]
    UnknownBranch { node: String, branch: String },

    /// A fan-out referenced a target that is not a registered node, or
    /// mixed targets across one fan-out.
    #[error("invalid fan-out from '{node}': {message}")]
    InvalidFanout { node: String, message: String },

    /// A node exceeded its timeout on the final attempt.
    #[error("node '{node}' timed out after {seconds}s")]
    NodeTimeout { node: String, seconds: f64 },

    /// The run exceeded its overall deadline.
    #[error("run '{run_id}' exceeded its deadline")]
    RunTimeout { run_id: String },

    /// The run was cancelled cooperatively.
    #[error("run '{run_id}' was cancelled")]
    Cancelled { run_id: String },

    /// State could not be serialized or merged.
    #[error("state error: {0}")]
    State(String),
}

impl GraphError {
    /// Node failure with a formatted message.
    pub fn node(node: impl Into<String>, message: impl std::fmt::Display) -> Self {
        GraphError::Node {
            node: node.into(),
            message: message.to_string(),
        }
    }
}
