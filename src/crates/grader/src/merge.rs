//! Cross-page question reconciliation.
//!
//! A long answer often continues onto the next page, and both pages report
//! the same question id. The merger detects those fragments per student and
//! folds them into one [`QuestionResult`]:
//!
//! - score: `min(sum of page scores, max_score)`
//! - scoring points: union by `point_id`, max award per point
//! - feedback: concatenated in page order
//! - confidence telemetry: min of page confidences, discounted

use crate::model::{MergedQuestion, PageResult, QuestionResult, ScoringPointResult};
use std::collections::BTreeMap;

/// Empirical discount applied to merged-question confidence.
const CROSS_PAGE_CONFIDENCE_DISCOUNT: f64 = 0.9;

/// Merge outcome for one student.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub questions: Vec<QuestionResult>,
    pub merged: Vec<MergedQuestion>,
}

/// Reconcile one student's page results into per-question results.
///
/// `page_results` must be that student's pages; they are processed in page
/// order regardless of input order. Single-page questions pass through
/// unchanged.
pub fn merge_student_pages(student_key: &str, page_results: &[&PageResult]) -> MergeOutcome {
    let mut ordered: Vec<&PageResult> = page_results.to_vec();
    ordered.sort_by_key(|r| r.page_index);

    // Question id -> fragments in page order. BTreeMap keeps the output
    // ordering stable across runs.
    let mut fragments: BTreeMap<String, Vec<(&PageResult, &QuestionResult)>> = BTreeMap::new();
    for page in &ordered {
        for question in &page.question_details {
            fragments
                .entry(question.question_id.clone())
                .or_default()
                .push((page, question));
        }
    }

    let mut outcome = MergeOutcome::default();
    for (question_id, parts) in fragments {
        if parts.len() == 1 {
            outcome.questions.push(parts[0].1.clone());
            continue;
        }

        let pages: Vec<usize> = parts.iter().map(|(page, _)| page.page_index).collect();
        let max_score = parts
            .iter()
            .map(|(_, q)| q.max_score)
            .fold(0.0_f64, f64::max);
        let summed: f64 = parts.iter().map(|(_, q)| q.score).sum();
        let score = summed.min(max_score);

        // Union of scoring points, best award wins per point.
        let mut points: BTreeMap<String, ScoringPointResult> = BTreeMap::new();
        for (_, question) in &parts {
            for point in &question.scoring_point_results {
                points
                    .entry(point.point_id.clone())
                    .and_modify(|existing| {
                        if point.awarded > existing.awarded {
                            *existing = point.clone();
                        }
                    })
                    .or_insert_with(|| point.clone());
            }
        }

        let feedback = parts
            .iter()
            .map(|(_, q)| q.feedback.as_str())
            .filter(|f| !f.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let mut rubric_refs: Vec<String> = Vec::new();
        for (_, question) in &parts {
            for reference in &question.rubric_refs {
                if !rubric_refs.contains(reference) {
                    rubric_refs.push(reference.clone());
                }
            }
        }

        let min_confidence = parts
            .iter()
            .map(|(page, _)| page.confidence)
            .fold(1.0_f64, f64::min);

        outcome.merged.push(MergedQuestion {
            question_id: question_id.clone(),
            student_key: student_key.to_string(),
            page_indices: pages.clone(),
            confidence: min_confidence * CROSS_PAGE_CONFIDENCE_DISCOUNT,
            merge_reason: format!("question '{question_id}' reported on {} pages", pages.len()),
        });

        outcome.questions.push(QuestionResult {
            question_id,
            score,
            max_score,
            feedback,
            rubric_refs,
            scoring_point_results: points.into_values().collect(),
            page_indices: pages.clone(),
            is_cross_page: true,
            merge_source: pages,
        });
    }

    outcome
}
