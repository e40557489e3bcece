//! Public run lifecycle API.
//!
//! The orchestrator owns the compiled grading graph, the checkpoint store,
//! and the event bus. Transports (HTTP, WebSocket, CLI) sit on top of this
//! surface and stay out of this crate:
//!
//! - [`start`](Orchestrator::start) / [`resume`](Orchestrator::resume) /
//!   [`abort`](Orchestrator::abort)
//! - [`submit_review`](Orchestrator::submit_review) for the two gates
//! - [`subscribe`](Orchestrator::subscribe) for the per-run event stream
//! - [`get_state`](Orchestrator::get_state) / [`list_active`](Orchestrator::list_active)
//!
//! One run per `batch_id`; restarting a known id resumes from its latest
//! checkpoint instead of grading everything again.

use crate::config::GradingConfig;
use crate::events::{EventBus, EventStream, EventType};
use crate::model::{GradingMode, GradingState, RawPage, RunConfig};
use crate::nodes::{self, names, NodeDeps};
use gradeflow_checkpoint::{CheckpointError, Checkpointer, RunIndexRecord, RunStatus as StoreStatus};
use gradeflow_core::{
    ExecutionObserver, GraphBuildError, GraphRuntime, RunStatus, RuntimeOptions,
};
use llm::LlmClient;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use crate::segment::StudentMapping;

/// Synthetic node name for the pre-graph intake checkpoint.
const SUBMIT_NODE: &str = "submit";

/// Errors surfaced by the orchestrator API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown run: {0}")]
    UnknownRun(String),

    #[error("run {batch_id} is not pending {expected} review")]
    WrongGate { batch_id: String, expected: String },

    #[error("graph build error: {0}")]
    Build(#[from] GraphBuildError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("state error: {0}")]
    State(String),
}

/// Transport-agnostic run submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitInputs {
    /// Ordered answer-page images.
    pub files: Vec<RawPage>,
    /// Ordered rubric-page images; may be empty.
    pub rubrics: Vec<RawPage>,
    /// Page indices where a new student starts.
    pub student_boundaries: Option<Vec<usize>>,
    pub expected_students: Option<usize>,
    pub expected_total_score: Option<f64>,
    /// Overrides the engine default when set.
    pub grading_mode: Option<GradingMode>,
    /// Overrides the engine default when set.
    pub enable_review: Option<bool>,
    pub student_mapping: Option<Vec<StudentMapping>>,
}

/// Response to a submission.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StartReceipt {
    pub batch_id: String,
    pub status: String,
    pub total_pages: usize,
}

/// Which gate a review decision addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewGate {
    Rubric,
    Results,
}

impl ReviewGate {
    fn pending_value(self) -> &'static str {
        match self {
            ReviewGate::Rubric => "rubric",
            ReviewGate::Results => "results",
        }
    }

    fn node_name(self) -> &'static str {
        match self {
            ReviewGate::Rubric => names::RUBRIC_REVIEW,
            ReviewGate::Results => names::RESULTS_REVIEW,
        }
    }
}

/// What the reviewer decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    /// Continue the run, optionally after applying the patch.
    Approve,
    /// Terminate the run.
    Abort,
}

/// Review submission: an action plus an optional field patch applied
/// transactionally to the gate's subject (`parsed_rubric` or
/// `student_results`).
#[derive(Debug, Clone)]
pub struct ReviewDecision {
    pub action: ReviewAction,
    pub patch: Option<Value>,
}

struct RunEntry {
    cancel: CancellationToken,
}

struct Inner {
    config: GradingConfig,
    events: Arc<EventBus>,
    checkpointer: Arc<dyn Checkpointer>,
    runtime: Arc<GraphRuntime>,
    runs: RwLock<HashMap<String, RunEntry>>,
}

/// The grading engine's public API.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build the graph and wire the engine together.
    pub fn new(
        config: GradingConfig,
        llm: Arc<dyn LlmClient>,
        checkpointer: Arc<dyn Checkpointer>,
    ) -> Result<Self, OrchestratorError> {
        let events = Arc::new(EventBus::new(config.event_buffer_size));
        let deps = Arc::new(NodeDeps {
            llm,
            config: config.clone(),
            events: Arc::clone(&events),
        });
        let graph = nodes::build_grading_graph(deps)?;
        let options = RuntimeOptions {
            max_parallel_workers: config.max_parallel_workers,
            node_timeout: config.node_timeout(),
            run_timeout: config.run_timeout(),
        };
        let runtime = GraphRuntime::new(graph, options)
            .with_checkpointer(Arc::clone(&checkpointer))
            .with_observer(Arc::new(EventBusObserver {
                events: Arc::clone(&events),
            }));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                events,
                checkpointer,
                runtime: Arc::new(runtime),
                runs: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Submit a new run under a fresh `batch_id`.
    pub async fn start(&self, inputs: SubmitInputs) -> Result<StartReceipt, OrchestratorError> {
        let batch_id = Uuid::new_v4().to_string();
        self.start_with_id(batch_id, inputs).await
    }

    /// Submit a run under a caller-chosen `batch_id`. Restarting a known id
    /// resumes from its latest checkpoint instead of starting over.
    pub async fn start_with_id(
        &self,
        batch_id: String,
        inputs: SubmitInputs,
    ) -> Result<StartReceipt, OrchestratorError> {
        if let Some(snapshot) = self.inner.checkpointer.load_latest(&batch_id).await? {
            let total_pages = snapshot.state["images"].as_array().map_or(0, Vec::len);
            self.resume(&batch_id).await?;
            return Ok(StartReceipt {
                batch_id,
                status: "running".to_string(),
                total_pages,
            });
        }

        let total_pages = inputs.files.len();
        let state = self.initial_state(&batch_id, inputs);
        let state_value =
            serde_json::to_value(&state).map_err(|e| OrchestratorError::State(e.to_string()))?;

        // Intake checkpoint before the graph touches anything, so a crash
        // during the first node is still resumable.
        self.inner
            .checkpointer
            .save(&batch_id, SUBMIT_NODE, 0, state_value.clone())
            .await?;
        self.inner
            .checkpointer
            .update_status(&batch_id, StoreStatus::Queued, SUBMIT_NODE)
            .await?;

        self.spawn_run(batch_id.clone(), state_value, None).await;
        Ok(StartReceipt {
            batch_id,
            status: "running".to_string(),
            total_pages,
        })
    }

    /// Resume a run from its latest checkpoint.
    pub async fn resume(&self, batch_id: &str) -> Result<(), OrchestratorError> {
        if self.inner.runs.read().await.contains_key(batch_id) {
            // Already executing; resuming is a no-op.
            return Ok(());
        }
        let snapshot = self
            .inner
            .checkpointer
            .load_latest(batch_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownRun(batch_id.to_string()))?;
        let resume_from = if snapshot.node_name == SUBMIT_NODE {
            None
        } else {
            Some(snapshot.node_name.clone())
        };
        info!(batch_id, from = %snapshot.node_name, "resuming run");
        self.spawn_run(batch_id.to_string(), snapshot.state, resume_from)
            .await;
        Ok(())
    }

    /// Request cooperative cancellation.
    pub async fn abort(&self, batch_id: &str, reason: &str) -> Result<(), OrchestratorError> {
        let runs = self.inner.runs.read().await;
        if let Some(entry) = runs.get(batch_id) {
            warn!(batch_id, reason, "aborting run");
            entry.cancel.cancel();
            return Ok(());
        }
        drop(runs);
        // Not executing right now; fail it in place.
        self.inner
            .checkpointer
            .update_status(batch_id, StoreStatus::Failed, "aborted")
            .await?;
        self.inner.events.publish(
            batch_id,
            EventType::RunFailed,
            json!({"kind": "cancelled", "message": reason}),
        );
        self.inner.events.remove(batch_id);
        Ok(())
    }

    /// Apply a review decision to a paused run and resume it.
    pub async fn submit_review(
        &self,
        batch_id: &str,
        gate: ReviewGate,
        decision: ReviewDecision,
    ) -> Result<(), OrchestratorError> {
        let snapshot = self
            .inner
            .checkpointer
            .load_latest(batch_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownRun(batch_id.to_string()))?;

        let mut state = snapshot.state;
        let pending = state["review_pending"].as_str().unwrap_or("none");
        if pending != gate.pending_value() {
            return Err(OrchestratorError::WrongGate {
                batch_id: batch_id.to_string(),
                expected: gate.pending_value().to_string(),
            });
        }

        if decision.action == ReviewAction::Abort {
            self.inner
                .checkpointer
                .update_status(batch_id, StoreStatus::Failed, gate.node_name())
                .await?;
            self.inner.events.publish(
                batch_id,
                EventType::RunFailed,
                json!({"kind": "cancelled", "message": "rejected at review"}),
            );
            self.inner.events.remove(batch_id);
            return Ok(());
        }

        if let Some(patch) = &decision.patch {
            apply_patch(&mut state, gate, patch)?;
        }
        state["review_pending"] = json!("none");

        // The patched snapshot is the one the resumed run will read; saving
        // it before spawning makes the patch transactional.
        self.inner
            .checkpointer
            .save(batch_id, gate.node_name(), snapshot.attempt + 1, state.clone())
            .await?;

        self.spawn_run(
            batch_id.to_string(),
            state,
            Some(gate.node_name().to_string()),
        )
        .await;
        Ok(())
    }

    /// Per-run event stream from this point forward.
    pub async fn subscribe(&self, batch_id: &str) -> EventStream {
        self.inner.events.subscribe(batch_id)
    }

    /// Read-only snapshot of the latest persisted state.
    pub async fn get_state(&self, batch_id: &str) -> Result<GradingState, OrchestratorError> {
        let snapshot = self
            .inner
            .checkpointer
            .load_latest(batch_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownRun(batch_id.to_string()))?;
        GradingState::from_value(&snapshot.state)
            .map_err(|e| OrchestratorError::State(e.to_string()))
    }

    /// Run summaries, optionally filtered by status.
    pub async fn list_active(
        &self,
        status: Option<StoreStatus>,
    ) -> Result<Vec<RunIndexRecord>, OrchestratorError> {
        Ok(self.inner.checkpointer.list_active(status).await?)
    }

    fn initial_state(&self, batch_id: &str, inputs: SubmitInputs) -> GradingState {
        GradingState {
            batch_id: batch_id.to_string(),
            images: inputs.files,
            rubric_files: inputs.rubrics,
            config: RunConfig {
                enable_review: inputs.enable_review.unwrap_or(self.inner.config.enable_review),
                grading_mode: inputs.grading_mode.unwrap_or(self.inner.config.grading_mode),
                max_tokens_per_batch: self.inner.config.max_tokens_per_batch,
                expected_students: inputs.expected_students,
                expected_total_score: inputs.expected_total_score,
                student_boundaries: inputs.student_boundaries,
                student_mapping: inputs.student_mapping,
            },
            ..Default::default()
        }
    }

    async fn spawn_run(&self, batch_id: String, state: Value, resume_from: Option<String>) {
        let cancel = CancellationToken::new();
        self.inner.runs.write().await.insert(
            batch_id.clone(),
            RunEntry {
                cancel: cancel.clone(),
            },
        );

        let inner = Arc::clone(&self.inner);
        let span = info_span!("grading_run", batch_id = %batch_id);
        tokio::spawn(
            async move {
                let outcome = inner
                    .runtime
                    .invoke(&batch_id, state, cancel, resume_from.as_deref())
                    .await;
                let mut paused = false;
                match outcome {
                    Ok(outcome) => match outcome.status {
                        RunStatus::Completed => {
                            inner.events.publish(
                                &batch_id,
                                EventType::RunCompleted,
                                json!({
                                    "total_score": outcome.state["total_score"],
                                    "max_total_score": outcome.state["max_total_score"],
                                    "students": outcome.state["student_results"]
                                        .as_array()
                                        .map_or(0, Vec::len),
                                }),
                            );
                        }
                        RunStatus::Paused { node } => {
                            info!(batch_id = %batch_id, node, "run paused for review");
                            paused = true;
                        }
                        RunStatus::Failed { message, cancelled } => {
                            inner.events.publish(
                                &batch_id,
                                EventType::RunFailed,
                                json!({
                                    "kind": if cancelled { "cancelled" } else { "internal" },
                                    "message": message,
                                }),
                            );
                        }
                    },
                    Err(err) => {
                        warn!(batch_id = %batch_id, error = %err, "run crashed");
                        inner.events.publish(
                            &batch_id,
                            EventType::RunFailed,
                            json!({"kind": "internal", "message": err.to_string()}),
                        );
                    }
                }
                inner.runs.write().await.remove(&batch_id);
                // Terminal runs release their broadcast channel; subscribers
                // drain whatever is buffered and then see the stream close.
                // A paused run keeps its channel for the resume.
                if !paused {
                    inner.events.remove(&batch_id);
                }
            }
            .instrument(span),
        );
    }
}

/// Overwrite patch fields into the gate's subject and refresh the derived
/// fields the patch can invalidate.
fn apply_patch(
    state: &mut Value,
    gate: ReviewGate,
    patch: &Value,
) -> Result<(), OrchestratorError> {
    let Some(patch_map) = patch.as_object() else {
        return Err(OrchestratorError::State(
            "review patch must be a JSON object".to_string(),
        ));
    };

    match gate {
        ReviewGate::Rubric => {
            let rubric = &mut state["parsed_rubric"];
            if rubric.is_null() {
                return Err(OrchestratorError::State(
                    "run has no parsed rubric to patch".to_string(),
                ));
            }
            for (key, value) in patch_map {
                rubric[key] = value.clone();
            }
            // A patched question list owns the derived counters.
            if patch_map.contains_key("questions") {
                let questions = rubric["questions"].as_array().cloned().unwrap_or_default();
                rubric["total_questions"] = json!(questions.len());
                let sum: f64 = questions
                    .iter()
                    .map(|q| q["max_score"].as_f64().unwrap_or(0.0))
                    .sum();
                rubric["total_score"] = json!(sum);
            }
        }
        ReviewGate::Results => {
            if let Some(results) = patch_map.get("student_results") {
                state["student_results"] = results.clone();
            }
            for (key, value) in patch_map {
                if key != "student_results" {
                    state[key.as_str()] = value.clone();
                }
            }
            // Run totals follow the patched per-student totals.
            let students = state["student_results"].as_array().cloned().unwrap_or_default();
            let total: f64 = students
                .iter()
                .map(|s| s["total_score"].as_f64().unwrap_or(0.0))
                .sum();
            let max_total: f64 = students
                .iter()
                .map(|s| s["max_total_score"].as_f64().unwrap_or(0.0))
                .sum();
            state["total_score"] = json!(total);
            state["max_total_score"] = json!(max_total);
        }
    }
    Ok(())
}

/// Bridges runtime lifecycle hooks onto the event bus.
struct EventBusObserver {
    events: Arc<EventBus>,
}

impl ExecutionObserver for EventBusObserver {
    fn node_started(&self, run_id: &str, node: &str) {
        self.events
            .publish(run_id, EventType::NodeStarted, json!({"node": node}));
    }

    fn node_completed(&self, run_id: &str, node: &str) {
        self.events
            .publish(run_id, EventType::NodeCompleted, json!({"node": node}));
    }

    fn node_failed(&self, run_id: &str, node: &str, message: &str, retryable: bool) {
        self.events.publish(
            run_id,
            EventType::NodeFailed,
            json!({"node": node, "message": message, "retryable": retryable, "warning": retryable}),
        );
    }

    fn checkpoint_degraded(&self, run_id: &str, node: &str, message: &str) {
        self.events.publish(
            run_id,
            EventType::NodeFailed,
            json!({
                "node": node,
                "kind": "checkpoint_failure",
                "message": message,
                "warning": true,
            }),
        );
    }
}
