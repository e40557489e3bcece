//! Core data model for grading runs.
//!
//! [`GradingState`] is the single state container shared by every node of
//! the grading graph. It serializes to a JSON object whose field shapes line
//! up with the runtime's merge reducers: the collections that accumulate
//! (`errors`, `cross_page_questions`) are arrays, the maps that fan-in from
//! parallel workers (`grading_results`, `merged_questions`) are `BTreeMap`s
//! so snapshots serialize deterministically, and the scalars (`progress`,
//! `current_stage`) track the most recent writer.

use crate::error::GradingError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How strictly the run treats human review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GradingMode {
    /// Review gates are skipped unconditionally.
    Assist,
    /// Review gates pause the run when enabled.
    #[default]
    Strict,
}

/// Which review gate, if any, the run is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPending {
    #[default]
    None,
    Rubric,
    Results,
}

/// Stage marker mirroring the graph topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Intake,
    Preprocess,
    RubricParse,
    RubricReview,
    GradingFanout,
    GradeBatch,
    CrossPageMerge,
    Segment,
    ResultsReview,
    Export,
    Completed,
    Failed,
}

/// An uploaded page before preprocessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPage {
    /// Original file name, when the transport supplied one.
    #[serde(default)]
    pub name: Option<String>,

    /// Base64-encoded image bytes.
    pub data: String,

    /// IANA media type, e.g. `image/png`.
    pub media_type: String,
}

/// A validated page with its position in the upload preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub index: usize,
    pub data: String,
    pub media_type: String,
    /// Decoded byte length, used by the token estimator.
    pub byte_len: usize,
}

/// Atomic rubric element: one checkbox with its own point value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringPoint {
    pub point_id: String,
    pub description: String,
    pub score: f64,
    #[serde(default)]
    pub is_required: bool,
}

/// Scoring criteria for one main question.
///
/// Sub-parts ("7(1)", "7(2)") are scoring points inside one
/// `QuestionRubric`; they are never separate entries, and only main
/// question ids count toward `ParsedRubric::total_questions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionRubric {
    pub question_id: String,
    pub max_score: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scoring_points: Vec<ScoringPoint>,
    #[serde(default)]
    pub standard_answer: Option<String>,
}

/// Parse outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RubricStatus {
    #[default]
    Success,
    Fallback,
    Failed,
}

/// Structured rubric produced by the parser (or synthesized as a fallback).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParsedRubric {
    pub total_questions: usize,
    pub total_score: f64,
    pub questions: Vec<QuestionRubric>,
    pub confidence: f64,
    pub status: RubricStatus,
}

impl ParsedRubric {
    /// Sum of question max scores.
    pub fn question_score_sum(&self) -> f64 {
        self.questions.iter().map(|q| q.max_score).sum()
    }
}

/// Contiguous half-open page range `[start_page, end_page)` belonging to
/// one student. Boundaries partition the page space exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentBoundary {
    pub student_key: String,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub student_name: Option<String>,
    pub start_page: usize,
    pub end_page: usize,
}

impl StudentBoundary {
    pub fn page_count(&self) -> usize {
        self.end_page.saturating_sub(self.start_page)
    }
}

/// Unit of work for one grading worker: contiguous pages of one student.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id_local: String,
    pub student_key: String,
    pub page_indices: Vec<usize>,
    pub estimated_tokens: u64,
    #[serde(default)]
    pub retry_count: u32,
}

/// Terminal status of one graded page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Completed,
    Failed,
}

/// Award decision for one scoring point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringPointResult {
    pub point_id: String,
    pub awarded: f64,
    #[serde(default)]
    pub evidence: String,
}

/// Grading outcome for one question (possibly merged across pages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question_id: String,
    pub score: f64,
    pub max_score: f64,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub rubric_refs: Vec<String>,
    #[serde(default)]
    pub scoring_point_results: Vec<ScoringPointResult>,
    pub page_indices: Vec<usize>,
    #[serde(default)]
    pub is_cross_page: bool,
    #[serde(default)]
    pub merge_source: Vec<usize>,
}

/// Grading outcome for one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub page_index: usize,
    pub status: PageStatus,
    pub score: f64,
    pub max_score: f64,
    #[serde(default)]
    pub question_numbers: Vec<String>,
    #[serde(default)]
    pub question_details: Vec<QuestionResult>,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub confidence: f64,
    /// Rubric registry lookups made while grading this page.
    #[serde(default)]
    pub agent_skill_calls: u32,
}

/// Telemetry entry for a question detected on more than one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedQuestion {
    pub question_id: String,
    pub student_key: String,
    pub page_indices: Vec<usize>,
    pub confidence: f64,
    pub merge_reason: String,
}

/// Aggregated result for one student.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentResult {
    pub student_key: String,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub student_name: Option<String>,
    pub start_page: usize,
    pub question_results: Vec<QuestionResult>,
    pub total_score: f64,
    pub max_total_score: f64,
    #[serde(default)]
    pub needs_review: bool,
}

/// Effective per-run options, frozen at intake.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunConfig {
    pub enable_review: bool,
    pub grading_mode: GradingMode,
    pub max_tokens_per_batch: u64,
    #[serde(default)]
    pub expected_students: Option<usize>,
    #[serde(default)]
    pub expected_total_score: Option<f64>,
    #[serde(default)]
    pub student_boundaries: Option<Vec<usize>>,
    #[serde(default)]
    pub student_mapping: Option<Vec<crate::segment::StudentMapping>>,
}

/// Final report assembled by the export stage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunReport {
    pub batch_id: String,
    pub student_count: usize,
    pub total_score: f64,
    pub max_total_score: f64,
    pub failed_pages: usize,
}

/// The shared state container of one grading run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GradingState {
    pub batch_id: String,

    // Inputs, immutable after intake.
    #[serde(default)]
    pub images: Vec<RawPage>,
    #[serde(default)]
    pub rubric_files: Vec<RawPage>,
    #[serde(default)]
    pub config: RunConfig,

    // Derived.
    #[serde(default)]
    pub processed_images: Vec<Page>,
    #[serde(default)]
    pub rubric_images: Vec<Page>,
    #[serde(default)]
    pub parsed_rubric: Option<ParsedRubric>,
    #[serde(default)]
    pub students: Vec<StudentBoundary>,
    #[serde(default)]
    pub batches: Vec<Batch>,

    // Results.
    #[serde(default)]
    pub grading_results: BTreeMap<String, PageResult>,
    #[serde(default)]
    pub merged_questions: BTreeMap<String, Vec<QuestionResult>>,
    #[serde(default)]
    pub cross_page_questions: Vec<MergedQuestion>,
    #[serde(default)]
    pub student_results: Vec<StudentResult>,
    #[serde(default)]
    pub total_score: f64,
    #[serde(default)]
    pub max_total_score: f64,
    #[serde(default)]
    pub report: Option<RunReport>,

    // Control.
    #[serde(default)]
    pub current_stage: Stage,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub errors: Vec<GradingError>,
    #[serde(default)]
    pub review_pending: ReviewPending,
}

/// Key of `grading_results` entries: `"{student_key}:{page_index}"`.
pub fn page_key(student_key: &str, page_index: usize) -> String {
    format!("{student_key}:{page_index}")
}

impl GradingState {
    /// Deserialize the state out of a runtime JSON value.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// Count of pages that ended up `Failed`.
    pub fn failed_page_count(&self) -> usize {
        self.grading_results
            .values()
            .filter(|r| r.status == PageStatus::Failed)
            .count()
    }
}
