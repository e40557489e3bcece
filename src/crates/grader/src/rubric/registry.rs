//! In-memory rubric index.
//!
//! Each grading worker rebuilds its own registry from the deep-copied
//! rubric it received, so no worker ever aliases shared rubric data. The
//! lookup (`get_rubric_for_question`) is the "agent skill" a worker invokes
//! once per identified question; calls are counted for telemetry.

use crate::model::{ParsedRubric, QuestionRubric};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Confidence attached to a synthesized default rubric.
const DEFAULT_RUBRIC_CONFIDENCE: f64 = 0.3;

/// Max score assumed when a question is unknown to the rubric.
const DEFAULT_MAX_SCORE: f64 = 10.0;

/// Result of a registry lookup.
#[derive(Debug, Clone)]
pub struct RubricLookup {
    pub rubric: QuestionRubric,
    /// Whether this is a synthesized default rather than a parsed entry.
    pub is_default: bool,
    pub confidence: f64,
}

/// Constant-time rubric lookup by question id.
pub struct RubricRegistry {
    by_question: HashMap<String, QuestionRubric>,
    skill_calls: AtomicU32,
}

impl RubricRegistry {
    /// Build an index from a rubric copy. Later duplicates are ignored; the
    /// parser has already flagged them.
    pub fn from_rubric(rubric: &ParsedRubric) -> Self {
        let mut by_question = HashMap::with_capacity(rubric.questions.len());
        for question in &rubric.questions {
            by_question
                .entry(question.question_id.clone())
                .or_insert_with(|| question.clone());
        }
        Self {
            by_question,
            skill_calls: AtomicU32::new(0),
        }
    }

    /// The agent skill: fetch the rubric for one question id.
    ///
    /// Unknown ids get a default rubric (`is_default = true`, confidence
    /// 0.3) so grading can proceed; the caller decides how much to trust it.
    pub fn get_rubric_for_question(&self, question_id: &str) -> RubricLookup {
        self.skill_calls.fetch_add(1, Ordering::Relaxed);
        match self.by_question.get(question_id) {
            Some(rubric) => {
                debug!(question_id, "rubric lookup hit");
                RubricLookup {
                    rubric: rubric.clone(),
                    is_default: false,
                    confidence: 1.0,
                }
            }
            None => {
                debug!(question_id, "rubric lookup miss, default rubric");
                RubricLookup {
                    rubric: QuestionRubric {
                        question_id: question_id.to_string(),
                        max_score: DEFAULT_MAX_SCORE,
                        description: format!("default rubric for question {question_id}"),
                        scoring_points: Vec::new(),
                        standard_answer: None,
                    },
                    is_default: true,
                    confidence: DEFAULT_RUBRIC_CONFIDENCE,
                }
            }
        }
    }

    /// Total lookups made through this registry.
    pub fn skill_call_count(&self) -> u32 {
        self.skill_calls.load(Ordering::Relaxed)
    }

    /// Number of indexed questions.
    pub fn len(&self) -> usize {
        self.by_question.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_question.is_empty()
    }
}
