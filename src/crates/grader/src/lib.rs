//! # grader - AI-Assisted Exam Grading Engine
//!
//! Ingests student answer-page images and an optional rubric, grades every
//! page against structured scoring criteria with a vision LLM, reconciles
//! questions that span pages, and emits per-student results with streaming
//! progress. Execution runs on the `gradeflow-core` graph runtime with a
//! checkpoint after every stage, so runs survive restarts and can pause for
//! human review.
//!
//! ## The grading graph
//!
//! ```text
//! intake -> preprocess -> rubric_parse -> [router] -> rubric_review | rubric_review_skip
//!     -> grading_fanout -> grade_batch x N -> cross_page_merge -> segment
//!     -> [router] -> results_review | results_review_skip -> export
//! ```
//!
//! Review routers route **around** the gate nodes: when review is disabled
//! (or the run is in assist mode) the gate is replaced by a pass-through
//! placeholder, and the downstream state shape is identical either way.
//!
//! ## Entry point
//!
//! [`Orchestrator`] is the public API: submit a run, stream its events,
//! pause at review gates, resume after restarts, abort cooperatively.
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::new(config, llm_client, checkpointer);
//! let receipt = orchestrator.start(inputs).await?;
//! let mut events = orchestrator.subscribe(&receipt.batch_id).await?;
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event.event_type);
//! }
//! ```

pub mod aggregate;
pub mod config;
pub mod error;
pub mod events;
pub mod merge;
pub mod model;
pub mod nodes;
pub mod orchestrator;
pub mod planner;
pub mod rubric;
pub mod segment;
pub mod worker;

pub use config::GradingConfig;
pub use error::{ErrorKind, GradingError};
pub use events::{EventBus, EventType, RunEvent};
pub use model::{
    Batch, GradingMode, GradingState, Page, PageResult, ParsedRubric, QuestionResult,
    QuestionRubric, RawPage, ReviewPending, RubricStatus, ScoringPoint, Stage, StudentBoundary,
    StudentResult,
};
pub use orchestrator::{
    Orchestrator, OrchestratorError, ReviewAction, ReviewDecision, ReviewGate, StartReceipt,
    StudentMapping, SubmitInputs,
};
