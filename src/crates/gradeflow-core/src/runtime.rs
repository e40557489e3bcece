//! Graph execution engine.
//!
//! [`GraphRuntime`] walks a validated [`Graph`] one node at a time, merging
//! each node's partial update into the run state, persisting a checkpoint
//! after every node boundary, and emitting lifecycle notifications through
//! an [`ExecutionObserver`].
//!
//! # Scheduling model
//!
//! Top-level execution is sequential: exactly one node runs at a time,
//! chosen by following the current node's outgoing edge. Concurrency enters
//! only through fan-out: a node returning [`NodeOutput::Fanout`] hands the
//! runtime a batch of [`Send`] tasks that execute in parallel under a
//! `tokio::sync::Semaphore` bounded by `max_parallel_workers`. Sibling
//! updates are merged in ascending `task_id` order, so the merged state is
//! identical regardless of which sibling finished first. A checkpoint is
//! taken after every node AND after each fan-out sibling's update is
//! merged, so a crash mid-fan-out loses at most the siblings that had not
//! been merged yet.
//!
//! # Failure semantics
//!
//! - A sibling task failure becomes an `errors` entry in the merged state
//!   and never cancels the other siblings.
//! - A checkpoint write failure degrades the run to best-effort (a warning
//!   plus an `errors` entry); grading continues.
//! - A node timeout is retried once, then fatal.
//! - A top-level node error fails the run.
//!
//! # Cancellation
//!
//! Cooperative. The runtime checks the token before each node and before
//! each sibling task; nodes are expected to poll it at their own suspension
//! points. In-flight work runs to completion and its results are discarded.

use crate::error::{GraphError, Result};
use crate::graph::{Edge, Graph, NodeContext, NodeOutput, END};
use crate::send::Send as TaskSend;
use crate::state::merge_update;
use gradeflow_checkpoint::{Checkpointer, RunStatus as StoreStatus};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Tuning knobs for one runtime instance.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Size of the fan-out worker pool.
    pub max_parallel_workers: usize,

    /// Per-node execution timeout.
    pub node_timeout: Duration,

    /// End-to-end run deadline.
    pub run_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_parallel_workers: 4,
            node_timeout: Duration::from_secs(300),
            run_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Lifecycle hooks invoked by the runtime.
///
/// All methods have no-op defaults; implement only what you observe. The
/// grading engine adapts this onto its event bus.
pub trait ExecutionObserver: std::marker::Send + Sync {
    fn node_started(&self, run_id: &str, node: &str) {
        let _ = (run_id, node);
    }
    fn node_completed(&self, run_id: &str, node: &str) {
        let _ = (run_id, node);
    }
    fn node_failed(&self, run_id: &str, node: &str, message: &str, retryable: bool) {
        let _ = (run_id, node, message, retryable);
    }
    fn run_paused(&self, run_id: &str, node: &str) {
        let _ = (run_id, node);
    }
    fn checkpoint_degraded(&self, run_id: &str, node: &str, message: &str) {
        let _ = (run_id, node, message);
    }
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

/// Terminal disposition of one `invoke` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// The graph reached END.
    Completed,

    /// A node returned `Pause`; the run is suspended at `node` and can be
    /// resumed from it.
    Paused { node: String },

    /// The run failed. `cancelled` distinguishes cooperative cancellation
    /// from genuine errors.
    Failed { message: String, cancelled: bool },
}

/// Final state plus disposition.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: Value,
    pub status: RunStatus,
}

/// Executes a [`Graph`] over a JSON state.
pub struct GraphRuntime {
    graph: Arc<Graph>,
    options: RuntimeOptions,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    observer: Arc<dyn ExecutionObserver>,
}

impl GraphRuntime {
    pub fn new(graph: Graph, options: RuntimeOptions) -> Self {
        Self {
            graph: Arc::new(graph),
            options,
            checkpointer: None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Attach a checkpoint store. Snapshots are taken after every node.
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Attach lifecycle hooks.
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run the graph to completion, pause, or failure.
    ///
    /// With `resume_from = Some(node)`, execution restarts at the edge
    /// leaving `node`, using `initial_state` as the restored snapshot. This
    /// is how both checkpoint resume and review-gate continuation work.
    pub async fn invoke(
        &self,
        run_id: &str,
        initial_state: Value,
        cancel: CancellationToken,
        resume_from: Option<&str>,
    ) -> Result<RunOutcome> {
        let mut state = initial_state;
        let deadline = Instant::now() + self.options.run_timeout;

        let mut current = match resume_from {
            Some(node) => match self.next_node(node, &state)? {
                Some(next) => next,
                None => {
                    self.mark_status(run_id, StoreStatus::Completed, node).await;
                    return Ok(RunOutcome {
                        state,
                        status: RunStatus::Completed,
                    });
                }
            },
            None => self.graph.entry().to_string(),
        };

        loop {
            if cancel.is_cancelled() {
                return self.finish_cancelled(run_id, state, &current).await;
            }
            if Instant::now() >= deadline {
                let message = format!("run '{run_id}' exceeded its deadline");
                merge_update(
                    &mut state,
                    &json!({ "errors": [error_entry("internal", &current, false, &message)] }),
                );
                self.mark_status(run_id, StoreStatus::Failed, &current).await;
                return Ok(RunOutcome {
                    state,
                    status: RunStatus::Failed {
                        message,
                        cancelled: false,
                    },
                });
            }

            let output = match self.run_node(run_id, &current, &state, &cancel, &mut 0).await {
                Ok(output) => output,
                Err(err) => {
                    let message = err.to_string();
                    self.observer.node_failed(run_id, &current, &message, false);
                    merge_update(
                        &mut state,
                        &json!({ "errors": [error_entry("internal", &current, false, &message)] }),
                    );
                    self.checkpoint(run_id, &current, 0, &mut state).await;
                    self.mark_status(run_id, StoreStatus::Failed, &current).await;
                    return Ok(RunOutcome {
                        state,
                        status: RunStatus::Failed {
                            message,
                            cancelled: false,
                        },
                    });
                }
            };

            match output {
                NodeOutput::Update(update) => {
                    merge_update(&mut state, &update);
                    self.checkpoint(run_id, &current, 0, &mut state).await;
                    self.observer.node_completed(run_id, &current);
                }
                NodeOutput::Pause(update) => {
                    merge_update(&mut state, &update);
                    self.checkpoint(run_id, &current, 0, &mut state).await;
                    self.observer.run_paused(run_id, &current);
                    self.mark_status(run_id, StoreStatus::Paused, &current).await;
                    return Ok(RunOutcome {
                        state,
                        status: RunStatus::Paused { node: current },
                    });
                }
                NodeOutput::Fanout { update, sends } => {
                    merge_update(&mut state, &update);
                    self.checkpoint(run_id, &current, 0, &mut state).await;
                    self.observer.node_completed(run_id, &current);

                    let target = self.fanout_target(&current, &sends)?;
                    if !sends.is_empty() {
                        if cancel.is_cancelled() {
                            return self.finish_cancelled(run_id, state, &current).await;
                        }
                        // Each sibling checkpoints as it merges; no extra
                        // snapshot is needed after the fan-in.
                        self.run_fanout(run_id, &target, sends, &cancel, &mut state)
                            .await;
                    }
                    // Fan-in complete; continue from the target's edge.
                    current = target;
                    match self.next_node(&current, &state)? {
                        Some(next) => current = next,
                        None => return self.finish_completed(run_id, state, &current).await,
                    }
                    continue;
                }
            }

            match self.next_node(&current, &state)? {
                Some(next) => current = next,
                None => return self.finish_completed(run_id, state, &current).await,
            }
        }
    }

    /// Execute one node with the per-node timeout, retrying a timeout once.
    async fn run_node(
        &self,
        run_id: &str,
        node_name: &str,
        state: &Value,
        cancel: &CancellationToken,
        attempt: &mut u32,
    ) -> Result<NodeOutput> {
        let node = self
            .graph
            .node(node_name)
            .ok_or_else(|| GraphError::InvalidFanout {
                node: node_name.to_string(),
                message: format!("'{node_name}' is not a registered node"),
            })?
            .clone();

        loop {
            self.observer.node_started(run_id, node_name);
            let ctx = NodeContext {
                run_id: run_id.to_string(),
                cancel: cancel.clone(),
                attempt: *attempt,
            };
            debug!(run_id, node = node_name, attempt = *attempt, "executing node");
            let fut = node(state.clone(), ctx);
            match timeout(self.options.node_timeout, fut).await {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(message)) => {
                    return Err(GraphError::node(node_name, message));
                }
                Err(_elapsed) if *attempt == 0 => {
                    let seconds = self.options.node_timeout.as_secs_f64();
                    let message = format!("node '{node_name}' timed out after {seconds}s");
                    warn!(run_id, node = node_name, "node timeout, retrying once");
                    self.observer.node_failed(run_id, node_name, &message, true);
                    *attempt += 1;
                }
                Err(_elapsed) => {
                    return Err(GraphError::NodeTimeout {
                        node: node_name.to_string(),
                        seconds: self.options.node_timeout.as_secs_f64(),
                    });
                }
            }
        }
    }

    /// Resolve and validate the fan-out target node.
    ///
    /// All sends must share one registered target. An empty batch falls back
    /// to the fan-out node's direct edge, which by construction points at
    /// the worker node.
    fn fanout_target(&self, node: &str, sends: &[TaskSend]) -> Result<String> {
        let target = match sends.first() {
            Some(first) => first.target.clone(),
            None => match self.graph.edge(node) {
                Some(Edge::Direct(to)) if to != END => to.clone(),
                _ => {
                    return Err(GraphError::InvalidFanout {
                        node: node.to_string(),
                        message: "empty fan-out with no direct worker edge".to_string(),
                    })
                }
            },
        };
        if self.graph.node(&target).is_none() {
            return Err(GraphError::InvalidFanout {
                node: node.to_string(),
                message: format!("fan-out target '{target}' is not a registered node"),
            });
        }
        if let Some(other) = sends.iter().find(|s| s.target != target) {
            return Err(GraphError::InvalidFanout {
                node: node.to_string(),
                message: format!(
                    "mixed fan-out targets '{}' and '{}'",
                    target, other.target
                ),
            });
        }
        Ok(target)
    }

    /// Execute fan-out siblings under the bounded pool.
    ///
    /// Siblings are dispatched and merged in ascending `task_id` order:
    /// every send is spawned up front, then the fan-in awaits the handles
    /// in dispatch order while the later siblings keep running. Each merged
    /// sibling update is checkpointed before the next handle is awaited, so
    /// completed work survives a crash while the rest of the batch is still
    /// in flight.
    async fn run_fanout(
        &self,
        run_id: &str,
        target: &str,
        mut sends: Vec<TaskSend>,
        cancel: &CancellationToken,
        state: &mut Value,
    ) {
        sends.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        let semaphore = Arc::new(Semaphore::new(self.options.max_parallel_workers.max(1)));
        let node = self
            .graph
            .node(target)
            .expect("fan-out target validated")
            .clone();

        let mut handles = Vec::with_capacity(sends.len());
        for send in sends {
            self.observer.node_started(run_id, target);
            let semaphore = Arc::clone(&semaphore);
            let node = node.clone();
            let cancel = cancel.clone();
            let run_id = run_id.to_string();
            let node_timeout = self.options.node_timeout;
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                if cancel.is_cancelled() {
                    return (send.task_id, Err("cancelled".to_string()));
                }
                let ctx = NodeContext {
                    run_id,
                    cancel,
                    attempt: 0,
                };
                let result = match timeout(node_timeout, node(send.task_state, ctx)).await {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(message)) => Err(message),
                    Err(_) => Err(format!(
                        "worker task timed out after {}s",
                        node_timeout.as_secs_f64()
                    )),
                };
                (send.task_id, result)
            }));
        }

        for (index, handle) in handles.into_iter().enumerate() {
            let (task_id, result) = match handle.await {
                Ok(entry) => entry,
                Err(join_err) => (format!("task-{index}"), Err(join_err.to_string())),
            };
            match result {
                Ok(NodeOutput::Update(update)) => {
                    merge_update(state, &update);
                    self.observer.node_completed(run_id, target);
                }
                Ok(_) => {
                    let message =
                        format!("worker task '{task_id}' returned a non-update output");
                    self.observer.node_failed(run_id, target, &message, false);
                    merge_update(
                        state,
                        &json!({ "errors": [error_entry("internal", target, false, &message)] }),
                    );
                }
                Err(message) => {
                    let kind = if message == "cancelled" {
                        "cancelled"
                    } else {
                        "internal"
                    };
                    self.observer.node_failed(run_id, target, &message, false);
                    merge_update(
                        state,
                        &json!({ "errors": [error_entry(kind, target, false, &format!("task '{task_id}': {message}"))] }),
                    );
                }
            }
            self.checkpoint(run_id, target, index as u32, state).await;
        }
    }

    /// Follow the outgoing edge of `node`. `Ok(None)` means END.
    fn next_node(&self, node: &str, state: &Value) -> Result<Option<String>> {
        match self.graph.edge(node) {
            None => Ok(None),
            Some(Edge::Direct(to)) => {
                if to == END {
                    Ok(None)
                } else {
                    Ok(Some(to.clone()))
                }
            }
            Some(Edge::Conditional { router, branches }) => {
                let branch = router(state);
                match branches.get(&branch) {
                    Some(to) if to == END => Ok(None),
                    Some(to) => Ok(Some(to.clone())),
                    None => Err(GraphError::UnknownBranch {
                        node: node.to_string(),
                        branch,
                    }),
                }
            }
        }
    }

    async fn checkpoint(&self, run_id: &str, node: &str, attempt: u32, state: &mut Value) {
        let Some(checkpointer) = &self.checkpointer else {
            return;
        };
        if let Err(err) = checkpointer.save(run_id, node, attempt, state.clone()).await {
            let message = err.to_string();
            warn!(run_id, node, error = %message, "checkpoint write failed, run downgraded to best-effort");
            self.observer.checkpoint_degraded(run_id, node, &message);
            merge_update(
                state,
                &json!({ "errors": [error_entry("checkpoint_failure", node, false, &message)] }),
            );
        }
    }

    async fn mark_status(&self, run_id: &str, status: StoreStatus, stage: &str) {
        if let Some(checkpointer) = &self.checkpointer {
            if let Err(err) = checkpointer.update_status(run_id, status, stage).await {
                warn!(run_id, error = %err, "failed to update run index record");
            }
        }
    }

    async fn finish_completed(
        &self,
        run_id: &str,
        state: Value,
        last_node: &str,
    ) -> Result<RunOutcome> {
        self.mark_status(run_id, StoreStatus::Completed, last_node).await;
        Ok(RunOutcome {
            state,
            status: RunStatus::Completed,
        })
    }

    async fn finish_cancelled(
        &self,
        run_id: &str,
        mut state: Value,
        node: &str,
    ) -> Result<RunOutcome> {
        let message = format!("run '{run_id}' was cancelled");
        merge_update(
            &mut state,
            &json!({ "errors": [error_entry("cancelled", node, false, &message)] }),
        );
        self.mark_status(run_id, StoreStatus::Failed, node).await;
        Ok(RunOutcome {
            state,
            status: RunStatus::Failed {
                message,
                cancelled: true,
            },
        })
    }
}

/// Error entry in the shared state's `errors` array.
///
/// The shape matches the grading engine's error record so snapshots always
/// deserialize cleanly.
fn error_entry(kind: &str, stage: &str, retryable: bool, message: &str) -> Value {
    json!({
        "kind": kind,
        "stage": stage,
        "page_index": null,
        "retryable": retryable,
        "message": message,
        "timestamp": chrono::Utc::now(),
    })
}
