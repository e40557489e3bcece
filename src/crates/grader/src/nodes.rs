//! Node functions and graph assembly.
//!
//! Builds the fixed grading topology:
//!
//! ```text
//! intake -> preprocess -> rubric_parse -> [router] -> rubric_review | rubric_review_skip
//!     -> grading_fanout -> grade_batch x N -> cross_page_merge -> segment
//!     -> [router] -> results_review | results_review_skip -> export
//! ```
//!
//! The review routers route AROUND the gate nodes. A gate that received
//! control and then decided to no-op would still interact with checkpoint
//! bookkeeping and can stall resume; routing around it means a disabled
//! gate is never visited at all, which the event traces verify.
//!
//! Nodes return partial updates only. Anything a node does not mention is
//! left untouched by the merge, and the accumulating fields (`errors`,
//! `cross_page_questions`) are only ever appended to.

use crate::aggregate;
use crate::config::GradingConfig;
use crate::events::{EventBus, EventType};
use crate::merge::merge_student_pages;
use crate::model::{GradingState, Page, PageResult, RubricStatus, RunReport, Stage};
use crate::planner::{self, DefaultTokenEstimator};
use crate::rubric::RubricParser;
use crate::segment::segment;
use crate::worker::{GradingWorker, WorkerTask};
use gradeflow_core::graph::{GraphBuilder, NodeContext, NodeOutput, RouterFn, END, START};
use gradeflow_core::{Graph, GraphBuildError, Send as TaskSend};
use llm::LlmClient;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

/// Shared dependencies captured by every node closure.
pub struct NodeDeps {
    pub llm: Arc<dyn LlmClient>,
    pub config: GradingConfig,
    pub events: Arc<EventBus>,
}

/// Node names, pinned in one place because the orchestrator and the tests
/// reference them.
pub mod names {
    pub const INTAKE: &str = "intake";
    pub const PREPROCESS: &str = "preprocess";
    pub const RUBRIC_PARSE: &str = "rubric_parse";
    pub const RUBRIC_REVIEW: &str = "rubric_review";
    pub const RUBRIC_REVIEW_SKIP: &str = "rubric_review_skip";
    pub const GRADING_FANOUT: &str = "grading_fanout";
    pub const GRADE_BATCH: &str = "grade_batch";
    pub const CROSS_PAGE_MERGE: &str = "cross_page_merge";
    pub const SEGMENT: &str = "segment";
    pub const RESULTS_REVIEW: &str = "results_review";
    pub const RESULTS_REVIEW_SKIP: &str = "results_review_skip";
    pub const EXPORT: &str = "export";
}

/// Assemble the grading graph.
pub fn build_grading_graph(deps: Arc<NodeDeps>) -> Result<Graph, GraphBuildError> {
    let mut builder = GraphBuilder::new();

    macro_rules! node {
        ($name:expr, $handler:ident) => {{
            let deps = Arc::clone(&deps);
            builder.add_node($name, move |state, ctx| {
                let deps = Arc::clone(&deps);
                Box::pin(async move { $handler(deps, state, ctx).await })
            })?;
        }};
    }

    node!(names::INTAKE, intake_node);
    node!(names::PREPROCESS, preprocess_node);
    node!(names::RUBRIC_PARSE, rubric_parse_node);
    node!(names::RUBRIC_REVIEW, rubric_review_node);
    node!(names::RUBRIC_REVIEW_SKIP, review_skip_node);
    node!(names::GRADING_FANOUT, grading_fanout_node);
    node!(names::GRADE_BATCH, grade_batch_node);
    node!(names::CROSS_PAGE_MERGE, cross_page_merge_node);
    node!(names::SEGMENT, segment_node);
    node!(names::RESULTS_REVIEW, results_review_node);
    node!(names::RESULTS_REVIEW_SKIP, review_skip_node);
    node!(names::EXPORT, export_node);

    builder.add_edge(START, names::INTAKE)?;
    builder.add_edge(names::INTAKE, names::PREPROCESS)?;
    builder.add_edge(names::PREPROCESS, names::RUBRIC_PARSE)?;
    builder.add_conditional_edge(
        names::RUBRIC_PARSE,
        review_router(),
        HashMap::from([
            ("review".to_string(), names::RUBRIC_REVIEW.to_string()),
            ("skip".to_string(), names::RUBRIC_REVIEW_SKIP.to_string()),
        ]),
    )?;
    builder.add_edge(names::RUBRIC_REVIEW, names::GRADING_FANOUT)?;
    builder.add_edge(names::RUBRIC_REVIEW_SKIP, names::GRADING_FANOUT)?;
    // Direct worker edge doubles as the empty-fanout fallback.
    builder.add_edge(names::GRADING_FANOUT, names::GRADE_BATCH)?;
    builder.add_edge(names::GRADE_BATCH, names::CROSS_PAGE_MERGE)?;
    builder.add_edge(names::CROSS_PAGE_MERGE, names::SEGMENT)?;
    builder.add_conditional_edge(
        names::SEGMENT,
        review_router(),
        HashMap::from([
            ("review".to_string(), names::RESULTS_REVIEW.to_string()),
            ("skip".to_string(), names::RESULTS_REVIEW_SKIP.to_string()),
        ]),
    )?;
    builder.add_edge(names::RESULTS_REVIEW, names::EXPORT)?;
    builder.add_edge(names::RESULTS_REVIEW_SKIP, names::EXPORT)?;
    builder.add_edge(names::EXPORT, END)?;

    builder.build()
}

/// Pure router shared by both gates: review only when enabled and strict.
fn review_router() -> RouterFn {
    Arc::new(|state: &Value| {
        let enabled = state["config"]["enable_review"].as_bool().unwrap_or(false);
        let strict = state["config"]["grading_mode"].as_str().unwrap_or("strict") == "strict";
        if enabled && strict {
            "review".to_string()
        } else {
            "skip".to_string()
        }
    })
}

fn state_of(value: &Value) -> Result<GradingState, String> {
    GradingState::from_value(value).map_err(|e| format!("state deserialization failed: {e}"))
}

fn progress_event(deps: &NodeDeps, batch_id: &str, stage: Stage, progress: f64) {
    deps.events.publish(
        batch_id,
        EventType::Progress,
        json!({"stage": stage, "progress": progress}),
    );
}

async fn intake_node(
    deps: Arc<NodeDeps>,
    state: Value,
    _ctx: NodeContext,
) -> Result<NodeOutput, String> {
    let grading = state_of(&state)?;
    if grading.images.is_empty() {
        return Err("no answer pages were uploaded".to_string());
    }
    info!(batch_id = %grading.batch_id, pages = grading.images.len(), "run accepted");
    progress_event(&deps, &grading.batch_id, Stage::Intake, 0.05);
    Ok(NodeOutput::Update(json!({
        "current_stage": Stage::Intake,
        "progress": 0.05,
    })))
}

async fn preprocess_node(
    deps: Arc<NodeDeps>,
    state: Value,
    _ctx: NodeContext,
) -> Result<NodeOutput, String> {
    use base64::Engine;
    let grading = state_of(&state)?;
    let engine = base64::engine::general_purpose::STANDARD;

    let mut errors = Vec::new();
    let to_pages = |raw: &[crate::model::RawPage], errors: &mut Vec<Value>| -> Vec<Page> {
        raw.iter()
            .enumerate()
            .map(|(index, page)| {
                let byte_len = match engine.decode(page.data.as_bytes()) {
                    Ok(bytes) => bytes.len(),
                    Err(err) => {
                        errors.push(json!(crate::error::GradingError::new(
                            crate::error::ErrorKind::SchemaViolation,
                            names::PREPROCESS,
                            format!("page {index} is not valid base64: {err}"),
                        )
                        .with_page(index)));
                        // Rough decoded size; the page still flows through.
                        page.data.len() * 3 / 4
                    }
                };
                Page {
                    index,
                    data: page.data.clone(),
                    media_type: page.media_type.clone(),
                    byte_len,
                }
            })
            .collect()
    };

    let processed = to_pages(&grading.images, &mut errors);
    let rubric_images = to_pages(&grading.rubric_files, &mut errors);
    progress_event(&deps, &grading.batch_id, Stage::Preprocess, 0.15);

    Ok(NodeOutput::Update(json!({
        "processed_images": processed,
        "rubric_images": rubric_images,
        "errors": errors,
        "current_stage": Stage::Preprocess,
        "progress": 0.15,
    })))
}

async fn rubric_parse_node(
    deps: Arc<NodeDeps>,
    state: Value,
    ctx: NodeContext,
) -> Result<NodeOutput, String> {
    let grading = state_of(&state)?;
    let parser = RubricParser::new(
        Arc::clone(&deps.llm),
        deps.config.max_parse_retries,
        deps.config.llm_call_timeout(),
        deps.config.fallback_rubric_confidence,
    );
    let outcome = parser
        .parse(
            &grading.rubric_images,
            grading.processed_images.len(),
            grading.config.expected_students,
            grading.config.expected_total_score,
            &ctx.cancel,
        )
        .await;

    if outcome.rubric.status == RubricStatus::Failed {
        // Not even a fallback was possible; the run cannot proceed.
        return Err("rubric parsing produced nothing usable".to_string());
    }

    deps.events.publish(
        &grading.batch_id,
        EventType::PartialResult,
        json!({
            "stage": Stage::RubricParse,
            "total_questions": outcome.rubric.total_questions,
            "total_score": outcome.rubric.total_score,
            "status": outcome.rubric.status,
            "confidence": outcome.rubric.confidence,
        }),
    );
    progress_event(&deps, &grading.batch_id, Stage::RubricParse, 0.3);

    Ok(NodeOutput::Update(json!({
        "parsed_rubric": outcome.rubric,
        "errors": outcome.errors,
        "current_stage": Stage::RubricParse,
        "progress": 0.3,
    })))
}

async fn rubric_review_node(
    deps: Arc<NodeDeps>,
    state: Value,
    _ctx: NodeContext,
) -> Result<NodeOutput, String> {
    let grading = state_of(&state)?;
    deps.events.publish(
        &grading.batch_id,
        EventType::ReviewRequired,
        json!({"gate": "rubric"}),
    );
    Ok(NodeOutput::Pause(json!({
        "review_pending": "rubric",
        "current_stage": Stage::RubricReview,
    })))
}

/// Pass-through placeholder for a disabled gate. Its only job is to keep
/// the downstream state shape identical to the reviewed path.
async fn review_skip_node(
    _deps: Arc<NodeDeps>,
    _state: Value,
    _ctx: NodeContext,
) -> Result<NodeOutput, String> {
    Ok(NodeOutput::Update(json!({"review_pending": "none"})))
}

async fn grading_fanout_node(
    deps: Arc<NodeDeps>,
    state: Value,
    _ctx: NodeContext,
) -> Result<NodeOutput, String> {
    let grading = state_of(&state)?;
    let rubric = grading
        .parsed_rubric
        .as_ref()
        .ok_or_else(|| "grading_fanout reached without a rubric".to_string())?;

    let segmented = segment(
        grading.processed_images.len(),
        &grading.config,
        grading.config.student_mapping.as_deref(),
    );
    let batches = planner::plan(
        &segmented.students,
        &grading.processed_images,
        rubric,
        grading.config.max_tokens_per_batch,
        &DefaultTokenEstimator,
    );

    // One send per student; its batches run sequentially on one worker.
    let mut sends = Vec::new();
    for student in &segmented.students {
        let student_batches: Vec<_> = batches
            .iter()
            .filter(|b| b.student_key == student.student_key)
            .cloned()
            .collect();
        if student_batches.is_empty() {
            continue;
        }
        let task_id = student_batches[0].batch_id_local.clone();
        let pages: Vec<Page> = grading
            .processed_images
            .iter()
            .filter(|p| p.index >= student.start_page && p.index < student.end_page)
            .cloned()
            .collect();
        let task = WorkerTask {
            batch_id: grading.batch_id.clone(),
            student_key: student.student_key.clone(),
            batches: student_batches,
            // Deep copy: each worker rebuilds its own registry from this.
            rubric: planner::rubric_view(rubric),
            pages,
            max_retries: deps.config.max_retries,
            llm_timeout_s: deps.config.llm_call_timeout_s,
        };
        let task_state =
            serde_json::to_value(&task).map_err(|e| format!("task serialization failed: {e}"))?;
        sends.push(TaskSend::new(names::GRADE_BATCH, task_id, task_state));
    }

    info!(
        batch_id = %grading.batch_id,
        students = segmented.students.len(),
        batches = batches.len(),
        workers = sends.len(),
        "dispatching grading fan-out"
    );
    progress_event(&deps, &grading.batch_id, Stage::GradingFanout, 0.35);

    let review_pending = if segmented.needs_confirmation {
        json!("results")
    } else {
        Value::Null
    };
    let mut update = json!({
        "students": segmented.students,
        "batches": batches,
        "errors": segmented.errors,
        "current_stage": Stage::GradingFanout,
        "progress": 0.35,
    });
    if !review_pending.is_null() {
        update["review_pending"] = review_pending;
    }

    Ok(NodeOutput::Fanout { update, sends })
}

async fn grade_batch_node(
    deps: Arc<NodeDeps>,
    task_state: Value,
    ctx: NodeContext,
) -> Result<NodeOutput, String> {
    let task: WorkerTask = serde_json::from_value(task_state)
        .map_err(|e| format!("worker task deserialization failed: {e}"))?;
    let worker = GradingWorker::new(
        Arc::clone(&deps.llm),
        Arc::clone(&deps.events),
        task.max_retries,
    );
    let output = worker.run(&task, &ctx.cancel).await;

    Ok(NodeOutput::Update(json!({
        "grading_results": output.results,
        "errors": output.errors,
        "current_stage": Stage::GradeBatch,
    })))
}

async fn cross_page_merge_node(
    deps: Arc<NodeDeps>,
    state: Value,
    _ctx: NodeContext,
) -> Result<NodeOutput, String> {
    let grading = state_of(&state)?;

    // Regroup the fan-in map by student.
    let mut by_student: BTreeMap<String, Vec<&PageResult>> = BTreeMap::new();
    for (key, result) in &grading.grading_results {
        let student_key = key
            .rsplit_once(':')
            .map(|(student, _)| student.to_string())
            .unwrap_or_else(|| key.clone());
        by_student.entry(student_key).or_default().push(result);
    }

    let mut merged_questions = BTreeMap::new();
    let mut cross_page = Vec::new();
    for (student_key, pages) in by_student {
        let outcome = merge_student_pages(&student_key, &pages);
        cross_page.extend(outcome.merged);
        merged_questions.insert(student_key, outcome.questions);
    }

    progress_event(&deps, &grading.batch_id, Stage::CrossPageMerge, 0.85);
    Ok(NodeOutput::Update(json!({
        "merged_questions": merged_questions,
        "cross_page_questions": cross_page,
        "current_stage": Stage::CrossPageMerge,
        "progress": 0.85,
    })))
}

async fn segment_node(
    deps: Arc<NodeDeps>,
    state: Value,
    _ctx: NodeContext,
) -> Result<NodeOutput, String> {
    let grading = state_of(&state)?;
    let outcome = aggregate::aggregate(
        &grading.students,
        &grading.merged_questions,
        grading.parsed_rubric.as_ref(),
    );

    progress_event(&deps, &grading.batch_id, Stage::Segment, 0.9);
    Ok(NodeOutput::Update(json!({
        "student_results": outcome.student_results,
        "total_score": outcome.total_score,
        "max_total_score": outcome.max_total_score,
        "errors": outcome.errors,
        "current_stage": Stage::Segment,
        "progress": 0.9,
    })))
}

async fn results_review_node(
    deps: Arc<NodeDeps>,
    state: Value,
    _ctx: NodeContext,
) -> Result<NodeOutput, String> {
    let grading = state_of(&state)?;
    deps.events.publish(
        &grading.batch_id,
        EventType::ReviewRequired,
        json!({"gate": "results"}),
    );
    Ok(NodeOutput::Pause(json!({
        "review_pending": "results",
        "current_stage": Stage::ResultsReview,
    })))
}

async fn export_node(
    deps: Arc<NodeDeps>,
    state: Value,
    _ctx: NodeContext,
) -> Result<NodeOutput, String> {
    let grading = state_of(&state)?;
    let report = RunReport {
        batch_id: grading.batch_id.clone(),
        student_count: grading.student_results.len(),
        total_score: grading.total_score,
        max_total_score: grading.max_total_score,
        failed_pages: grading.failed_page_count(),
    };
    info!(
        batch_id = %grading.batch_id,
        students = report.student_count,
        total = report.total_score,
        "run exported"
    );
    progress_event(&deps, &grading.batch_id, Stage::Export, 1.0);
    Ok(NodeOutput::Update(json!({
        "report": report,
        "current_stage": Stage::Completed,
        "progress": 1.0,
    })))
}
