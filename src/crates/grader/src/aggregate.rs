//! Result aggregation.
//!
//! Builds per-student results from the merged question results, computes
//! run totals, and orders students by their first page. Invariant
//! violations are recorded as non-fatal errors and flag the student with
//! `needs_review` instead of failing the run.

use crate::error::{ErrorKind, GradingError};
use crate::model::{ParsedRubric, QuestionResult, StudentBoundary, StudentResult};
use std::collections::{BTreeMap, HashSet};

const STAGE: &str = "segment";

/// Aggregation result.
#[derive(Debug, Default)]
pub struct AggregateOutcome {
    pub student_results: Vec<StudentResult>,
    pub total_score: f64,
    pub max_total_score: f64,
    pub errors: Vec<GradingError>,
}

/// Build ordered student results.
pub fn aggregate(
    students: &[StudentBoundary],
    merged_questions: &BTreeMap<String, Vec<QuestionResult>>,
    rubric: Option<&ParsedRubric>,
) -> AggregateOutcome {
    let mut ordered: Vec<&StudentBoundary> = students.iter().collect();
    ordered.sort_by_key(|s| s.start_page);

    let mut outcome = AggregateOutcome::default();
    for boundary in ordered {
        let questions = merged_questions
            .get(&boundary.student_key)
            .cloned()
            .unwrap_or_default();

        let total_score: f64 = questions.iter().map(|q| q.score).sum();
        let max_total_score: f64 = questions.iter().map(|q| q.max_score).sum();
        let mut needs_review = false;

        // More distinct questions than the rubric defines means the worker
        // hallucinated ids or the rubric is incomplete; either way a human
        // should look.
        if let Some(rubric) = rubric {
            let distinct: HashSet<&str> =
                questions.iter().map(|q| q.question_id.as_str()).collect();
            if rubric.total_questions > 0 && distinct.len() > rubric.total_questions {
                needs_review = true;
                outcome.errors.push(GradingError::new(
                    ErrorKind::SchemaViolation,
                    STAGE,
                    format!(
                        "student '{}' answered {} distinct questions, rubric defines {}",
                        boundary.student_key,
                        distinct.len(),
                        rubric.total_questions
                    ),
                ));
            }
        }

        for question in &questions {
            if question.score > question.max_score {
                needs_review = true;
                outcome.errors.push(GradingError::new(
                    ErrorKind::SchemaViolation,
                    STAGE,
                    format!(
                        "student '{}' question '{}' scored {} above max {}",
                        boundary.student_key,
                        question.question_id,
                        question.score,
                        question.max_score
                    ),
                ));
            }
        }

        outcome.total_score += total_score;
        outcome.max_total_score += max_total_score;
        outcome.student_results.push(StudentResult {
            student_key: boundary.student_key.clone(),
            student_id: boundary.student_id.clone(),
            student_name: boundary.student_name.clone(),
            start_page: boundary.start_page,
            question_results: questions,
            total_score,
            max_total_score,
            needs_review,
        });
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RubricStatus;

    fn boundary(key: &str, start: usize, end: usize) -> StudentBoundary {
        StudentBoundary {
            student_key: key.to_string(),
            student_id: None,
            student_name: None,
            start_page: start,
            end_page: end,
        }
    }

    fn question(qid: &str, score: f64, max: f64) -> QuestionResult {
        QuestionResult {
            question_id: qid.to_string(),
            score,
            max_score: max,
            feedback: String::new(),
            rubric_refs: Vec::new(),
            scoring_point_results: Vec::new(),
            page_indices: vec![0],
            is_cross_page: false,
            merge_source: Vec::new(),
        }
    }

    #[test]
    fn totals_are_sums_of_question_scores() {
        let students = vec![boundary("S1", 0, 3)];
        let mut merged = BTreeMap::new();
        merged.insert(
            "S1".to_string(),
            vec![
                question("1", 8.0, 10.0),
                question("2", 9.0, 10.0),
                question("3", 10.0, 10.0),
            ],
        );
        let outcome = aggregate(&students, &merged, None);
        assert_eq!(outcome.student_results.len(), 1);
        assert_eq!(outcome.student_results[0].total_score, 27.0);
        assert_eq!(outcome.student_results[0].max_total_score, 30.0);
        assert_eq!(outcome.total_score, 27.0);
        assert!(!outcome.student_results[0].needs_review);
    }

    #[test]
    fn students_ordered_by_start_page() {
        let students = vec![boundary("S2", 3, 6), boundary("S1", 0, 3)];
        let mut merged = BTreeMap::new();
        merged.insert("S1".to_string(), vec![question("1", 5.0, 10.0)]);
        merged.insert("S2".to_string(), vec![question("1", 6.0, 10.0)]);
        let outcome = aggregate(&students, &merged, None);
        assert_eq!(outcome.student_results[0].student_key, "S1");
        assert_eq!(outcome.student_results[1].student_key, "S2");
    }

    #[test]
    fn too_many_distinct_questions_flags_review() {
        let rubric = ParsedRubric {
            total_questions: 1,
            total_score: 10.0,
            questions: Vec::new(),
            confidence: 0.9,
            status: RubricStatus::Success,
        };
        let students = vec![boundary("S1", 0, 1)];
        let mut merged = BTreeMap::new();
        merged.insert(
            "S1".to_string(),
            vec![question("1", 5.0, 10.0), question("2", 5.0, 10.0)],
        );
        let outcome = aggregate(&students, &merged, Some(&rubric));
        assert!(outcome.student_results[0].needs_review);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].kind, ErrorKind::SchemaViolation);
    }

    #[test]
    fn student_without_results_gets_zero_totals() {
        let students = vec![boundary("S1", 0, 2)];
        let merged = BTreeMap::new();
        let outcome = aggregate(&students, &merged, None);
        assert_eq!(outcome.student_results[0].total_score, 0.0);
        assert_eq!(outcome.student_results[0].question_results.len(), 0);
    }
}
