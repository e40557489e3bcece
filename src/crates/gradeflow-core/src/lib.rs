//! # gradeflow-core - Checkpointable Fan-Out Graph Execution
//!
//! The execution runtime underneath the gradeflow grading engine. It runs a
//! fixed directed acyclic graph of async nodes over a shared JSON state,
//! with conditional routing, dynamic `Send` fan-out, cooperative
//! cancellation, and a checkpoint after every node.
//!
//! ## Core Concepts
//!
//! - **Graph**: nodes connected by direct or conditional edges, validated at
//!   construction time. Conditional-edge targets must already be registered
//!   when the edge is added; a graph that compiles but cannot route is the
//!   bug class this crate refuses to admit.
//! - **State**: a JSON object merged key-wise after every node. Arrays
//!   append, objects deep-merge, scalars overwrite (see [`state`]).
//! - **Fan-out**: a node may return [`NodeOutput::Fanout`] carrying a set of
//!   [`Send`] tasks. The runtime executes them concurrently under a bounded
//!   worker pool and merges their updates in deterministic task-id order.
//! - **Pause**: a node may return [`NodeOutput::Pause`], which persists a
//!   checkpoint and suspends the run until an external caller resumes it.
//!
//! ## Execution Shape
//!
//! ```text
//! START ─> node ─> node ─> [router] ─> gate | skip ─> fanout ─┬─> task ─┐
//!                                                             ├─> task ─┤─> merge ─> ... ─> END
//!                                                             └─> task ─┘
//! ```
//!
//! Every node boundary produces a [`gradeflow_checkpoint`] snapshot, so a run
//! can be resumed from its last completed node after a crash or a pause.

pub mod error;
pub mod graph;
pub mod retry;
pub mod runtime;
pub mod send;
pub mod state;

pub use error::{GraphBuildError, GraphError, Result};
pub use graph::{Graph, GraphBuilder, NodeContext, NodeFn, NodeOutput, END, START};
pub use retry::RetryPolicy;
pub use runtime::{ExecutionObserver, GraphRuntime, NoopObserver, RunOutcome, RunStatus, RuntimeOptions};
pub use send::Send;
pub use state::merge_update;
