//! Grading worker: grades one student's batches page by page.
//!
//! Each page moves through a small state machine:
//!
//! ```text
//! PENDING -> IN_FLIGHT -> COMPLETED
//!                      -> RETRYABLE_FAILED -> IN_FLIGHT (with backoff)
//!                      -> FATAL_FAILED
//! ```
//!
//! `FATAL_FAILED` is terminal for the page but never for the batch: the
//! page becomes a zero-scored failed result with explanatory feedback, and
//! the worker carries on. The worker rebuilds its own [`RubricRegistry`]
//! from the deep-copied rubric it received; per-question lookups through it
//! are the "agent skill" counted in `PageResult::agent_skill_calls`.

use crate::error::{ErrorKind, GradingError};
use crate::events::{EventBus, EventType};
use crate::model::{
    page_key, Batch, Page, PageResult, PageStatus, ParsedRubric, QuestionResult,
    ScoringPointResult,
};
use crate::rubric::parser::extract_json;
use crate::rubric::RubricRegistry;
use gradeflow_core::RetryPolicy;
use llm::{ChatMessage, CompletionRequest, ContentPart, LlmClient, Role};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const STAGE: &str = "grade_batch";

/// Everything one fan-out task needs, shipped as its task state. The rubric
/// is this task's own deep copy; nothing here aliases the run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    pub batch_id: String,
    pub student_key: String,
    pub batches: Vec<Batch>,
    pub rubric: ParsedRubric,
    pub pages: Vec<Page>,
    pub max_retries: u32,
    pub llm_timeout_s: f64,
}

/// Worker results for fan-in.
#[derive(Debug, Default)]
pub struct WorkerOutput {
    pub results: BTreeMap<String, PageResult>,
    pub errors: Vec<GradingError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    Pending,
    InFlight,
    Completed,
    RetryableFailed,
    FatalFailed,
}

/// Grades the batches of one student sequentially.
pub struct GradingWorker {
    llm: Arc<dyn LlmClient>,
    events: Arc<EventBus>,
    retry: RetryPolicy,
}

impl GradingWorker {
    pub fn new(llm: Arc<dyn LlmClient>, events: Arc<EventBus>, max_retries: u32) -> Self {
        Self {
            llm,
            events,
            retry: RetryPolicy::new(max_retries),
        }
    }

    /// Replace the backoff policy (tests use millisecond delays).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Process every batch of the task in order, pages in index order.
    /// Stops early on cancellation; whatever was graded so far is returned
    /// (the runtime decides whether those results survive).
    pub async fn run(&self, task: &WorkerTask, cancel: &CancellationToken) -> WorkerOutput {
        let registry = RubricRegistry::from_rubric(&task.rubric);
        let mut output = WorkerOutput::default();

        for batch in &task.batches {
            for &page_index in &batch.page_indices {
                if cancel.is_cancelled() {
                    output.errors.push(
                        GradingError::new(ErrorKind::Cancelled, STAGE, "worker cancelled")
                            .with_page(page_index),
                    );
                    return output;
                }
                let Some(page) = task.pages.iter().find(|p| p.index == page_index) else {
                    output.errors.push(
                        GradingError::new(
                            ErrorKind::Internal,
                            STAGE,
                            format!("page {page_index} missing from task state"),
                        )
                        .with_page(page_index),
                    );
                    continue;
                };

                let result = self
                    .grade_page(task, page, &registry, cancel, &mut output.errors)
                    .await;
                self.events.publish(
                    &task.batch_id,
                    EventType::PartialResult,
                    json!({
                        "student_key": task.student_key,
                        "page_index": result.page_index,
                        "status": result.status,
                        "score": result.score,
                        "max_score": result.max_score,
                    }),
                );
                output
                    .results
                    .insert(page_key(&task.student_key, page_index), result);
            }
        }
        output
    }

    /// Grade one page, driving the retry state machine to a terminal state.
    async fn grade_page(
        &self,
        task: &WorkerTask,
        page: &Page,
        registry: &RubricRegistry,
        cancel: &CancellationToken,
        errors: &mut Vec<GradingError>,
    ) -> PageResult {
        let mut state = PageState::Pending;
        let mut attempts = 0u32;
        let skill_calls_before = registry.skill_call_count();
        debug!(page = page.index, ?state, "page queued");

        loop {
            if cancel.is_cancelled() {
                errors.push(
                    GradingError::new(ErrorKind::Cancelled, STAGE, "cancelled mid-page")
                        .with_page(page.index),
                );
                return failed_page(page.index, "grading cancelled before completion");
            }

            state = PageState::InFlight;
            debug!(page = page.index, attempts, ?state, "grading page");
            let outcome = self.call_llm(task, page).await;

            match outcome {
                Ok(content) => match self.interpret(page, &content, registry, errors) {
                    Some(mut result) => {
                        state = PageState::Completed;
                        debug!(page = page.index, ?state, "page graded");
                        result.agent_skill_calls =
                            registry.skill_call_count() - skill_calls_before;
                        return result;
                    }
                    None => {
                        // Unusable payload: retryable up to the cap, then
                        // demoted to a parse failure.
                        attempts += 1;
                        if self.retry.should_retry(attempts) {
                            state = PageState::RetryableFailed;
                            debug!(page = page.index, ?state, "unparseable response, retrying");
                            let entry = GradingError::new(
                                ErrorKind::LlmInvalidResponse,
                                STAGE,
                                "model response was not valid grading JSON",
                            )
                            .with_page(page.index);
                            self.warn_event(task, page.index, &entry);
                            errors.push(entry);
                            tokio::time::sleep(self.retry.backoff_delay(attempts - 1)).await;
                        } else {
                            state = PageState::FatalFailed;
                            warn!(page = page.index, ?state, "unparseable after retries");
                            errors.push(
                                GradingError::new(
                                    ErrorKind::ParseFailure,
                                    STAGE,
                                    "model response stayed unparseable after retries",
                                )
                                .with_page(page.index),
                            );
                            return failed_page(
                                page.index,
                                "the grading model returned unusable output for this page",
                            );
                        }
                    }
                },
                Err(err) => {
                    attempts += 1;
                    let entry = GradingError::from_llm(&err, STAGE).with_page(page.index);
                    let retryable = entry.retryable;
                    self.warn_event(task, page.index, &entry);
                    errors.push(entry);
                    if retryable && self.retry.should_retry(attempts) {
                        state = PageState::RetryableFailed;
                        debug!(page = page.index, ?state, error = %err, "retrying after failure");
                        // Rate limits carry a provider cool-down to honor
                        // on top of the regular backoff ladder.
                        let delay = err
                            .retry_after()
                            .unwrap_or_else(|| self.retry.backoff_delay(attempts - 1));
                        tokio::time::sleep(delay).await;
                    } else {
                        state = PageState::FatalFailed;
                        warn!(page = page.index, ?state, error = %err, "page grading exhausted");
                        return failed_page(
                            page.index,
                            &format!("grading failed after {attempts} attempts: {err}"),
                        );
                    }
                }
            }
        }
    }

    async fn call_llm(&self, task: &WorkerTask, page: &Page) -> Result<String, llm::LlmError> {
        let rubric_json =
            serde_json::to_string(&task.rubric).unwrap_or_else(|_| "{}".to_string());
        let instruction = format!(
            r#"Grade this exam answer page against the rubric below.

Rubric:
{rubric_json}

For every question you can identify on the page, score it. Respond with
ONLY a JSON object of this exact shape:
{{
  "question_numbers": ["<id>", ...],
  "questions": [
    {{
      "question_id": "<id>",
      "score": <number>,
      "max_score": <number>,
      "feedback": "<short feedback>",
      "confidence": <number 0..1>,
      "scoring_points": [
        {{"point_id": "<id>", "awarded": <number>, "evidence": "<text>"}}
      ]
    }}
  ],
  "feedback": "<page-level feedback>",
  "confidence": <number 0..1>
}}"#
        );
        let request = CompletionRequest::new(vec![ChatMessage {
            role: Role::User,
            content: vec![
                ContentPart::Text { text: instruction },
                ContentPart::Image {
                    data: page.data.clone(),
                    media_type: page.media_type.clone(),
                },
            ],
        }])
        .with_timeout(Duration::from_secs_f64(task.llm_timeout_s));
        self.llm.complete(request).await.map(|r| r.content)
    }

    /// Turn a raw model response into a `PageResult`, or `None` when the
    /// payload is unusable and worth a retry.
    fn interpret(
        &self,
        page: &Page,
        content: &str,
        registry: &RubricRegistry,
        errors: &mut Vec<GradingError>,
    ) -> Option<PageResult> {
        let json_text = extract_json(content)?;
        let wire: WirePageGrade = serde_json::from_str(&json_text).ok()?;

        let mut details = Vec::with_capacity(wire.questions.len());
        let mut question_numbers = wire.question_numbers.clone();

        for graded in wire.questions {
            let lookup = registry.get_rubric_for_question(&graded.question_id);
            // Exact rubric entries own the max score; a default rubric
            // defers to the model's claim when it made one.
            let max_score = if lookup.is_default {
                graded.max_score.unwrap_or(lookup.rubric.max_score)
            } else {
                lookup.rubric.max_score
            };

            let mut score = graded.score;
            if score < 0.0 {
                errors.push(
                    GradingError::new(
                        ErrorKind::SchemaViolation,
                        STAGE,
                        format!(
                            "question '{}' scored {score}, coerced to 0",
                            graded.question_id
                        ),
                    )
                    .with_page(page.index),
                );
                score = 0.0;
            } else if score > max_score {
                errors.push(
                    GradingError::new(
                        ErrorKind::SchemaViolation,
                        STAGE,
                        format!(
                            "question '{}' scored {score} above max {max_score}, clamped",
                            graded.question_id
                        ),
                    )
                    .with_page(page.index),
                );
                score = max_score;
            }

            if !question_numbers.contains(&graded.question_id) {
                question_numbers.push(graded.question_id.clone());
            }

            details.push(QuestionResult {
                question_id: graded.question_id,
                score,
                max_score,
                feedback: graded.feedback.unwrap_or_default(),
                rubric_refs: vec![lookup.rubric.question_id.clone()],
                scoring_point_results: graded
                    .scoring_points
                    .into_iter()
                    .map(|p| ScoringPointResult {
                        point_id: p.point_id,
                        awarded: p.awarded,
                        evidence: p.evidence.unwrap_or_default(),
                    })
                    .collect(),
                page_indices: vec![page.index],
                is_cross_page: false,
                merge_source: Vec::new(),
            });
        }

        Some(PageResult {
            page_index: page.index,
            status: PageStatus::Completed,
            score: details.iter().map(|d| d.score).sum(),
            max_score: details.iter().map(|d| d.max_score).sum(),
            question_numbers,
            question_details: details,
            feedback: wire.feedback.unwrap_or_default(),
            confidence: wire.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            agent_skill_calls: 0,
        })
    }

    fn warn_event(&self, task: &WorkerTask, page_index: usize, entry: &GradingError) {
        self.events.publish(
            &task.batch_id,
            EventType::NodeFailed,
            json!({
                "node": STAGE,
                "page_index": page_index,
                "retryable": entry.retryable,
                "kind": entry.kind,
                "message": entry.message,
                "warning": true,
            }),
        );
    }
}

/// Zero-scored terminal result for a page that could not be graded.
fn failed_page(page_index: usize, feedback: &str) -> PageResult {
    PageResult {
        page_index,
        status: PageStatus::Failed,
        score: 0.0,
        max_score: 0.0,
        question_numbers: Vec::new(),
        question_details: Vec::new(),
        feedback: feedback.to_string(),
        confidence: 0.0,
        agent_skill_calls: 0,
    }
}

#[derive(Debug, Deserialize)]
struct WirePageGrade {
    #[serde(default)]
    question_numbers: Vec<String>,
    #[serde(default)]
    questions: Vec<WireQuestionGrade>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireQuestionGrade {
    question_id: String,
    score: f64,
    #[serde(default)]
    max_score: Option<f64>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    scoring_points: Vec<WirePointAward>,
}

#[derive(Debug, Deserialize)]
struct WirePointAward {
    point_id: String,
    awarded: f64,
    #[serde(default)]
    evidence: Option<String>,
}

/// Build the scripted-stub reply for one page. Shared by unit and
/// integration tests so every scenario speaks the same wire dialect.
pub fn stub_page_reply(questions: &[(&str, f64, f64)], confidence: f64) -> String {
    let entries: Vec<serde_json::Value> = questions
        .iter()
        .map(|(qid, score, max)| {
            json!({
                "question_id": qid,
                "score": score,
                "max_score": max,
                "feedback": format!("question {qid}"),
                "confidence": confidence,
                "scoring_points": [],
            })
        })
        .collect();
    json!({
        "question_numbers": questions.iter().map(|(q, _, _)| q).collect::<Vec<_>>(),
        "questions": entries,
        "feedback": "stub page feedback",
        "confidence": confidence,
    })
    .to_string()
}
