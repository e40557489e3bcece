//! Student segmentation.
//!
//! Groups the processed pages into per-student contiguous ranges. The
//! output always partitions `[0, page_count)` exactly: no overlap, no gap.
//! Explicit information wins over heuristics; when the heuristic has to
//! guess, the outcome is flagged for review instead of silently trusted.

use crate::error::{ErrorKind, GradingError};
use crate::model::{RunConfig, StudentBoundary};
use serde::{Deserialize, Serialize};
use tracing::debug;

const STAGE: &str = "grading_fanout";

/// Boundary guesses below this confidence request human confirmation.
const CONFIRMATION_THRESHOLD: f64 = 0.8;

/// Caller-supplied identity mapping (§ submit inputs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentMapping {
    pub student_key: String,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub student_name: Option<String>,
    pub start_index: usize,
    pub end_index: usize,
}

/// Segmentation result.
#[derive(Debug, Clone)]
pub struct SegmentOutcome {
    pub students: Vec<StudentBoundary>,
    /// True when a heuristic guess was not confident enough.
    pub needs_confirmation: bool,
    pub errors: Vec<GradingError>,
}

/// Partition `page_count` pages into student boundaries.
///
/// Priority order: explicit `student_mapping`, then explicit
/// `student_boundaries`, then the `expected_students` heuristic, then a
/// single student covering everything. The no-signal default is the
/// single-student policy.
pub fn segment(
    page_count: usize,
    config: &RunConfig,
    mapping: Option<&[StudentMapping]>,
) -> SegmentOutcome {
    if page_count == 0 {
        return SegmentOutcome {
            students: Vec::new(),
            needs_confirmation: false,
            errors: Vec::new(),
        };
    }

    if let Some(mapping) = mapping {
        if let Some(outcome) = from_mapping(page_count, mapping) {
            return outcome;
        }
    }

    if let Some(boundaries) = config.student_boundaries.as_deref() {
        if let Some(outcome) = from_boundaries(page_count, boundaries) {
            return outcome;
        }
        // Inconsistent boundaries fall through to the heuristic, noted.
        debug!(?boundaries, page_count, "supplied boundaries are inconsistent, falling back");
        let mut outcome = heuristic(page_count, config.expected_students);
        outcome.errors.push(
            GradingError::new(
                ErrorKind::BoundaryAmbiguous,
                STAGE,
                "supplied student_boundaries were inconsistent with the page count",
            ),
        );
        outcome.needs_confirmation = true;
        return outcome;
    }

    heuristic(page_count, config.expected_students)
}

fn from_mapping(page_count: usize, mapping: &[StudentMapping]) -> Option<SegmentOutcome> {
    if mapping.is_empty() {
        return None;
    }
    let mut sorted: Vec<&StudentMapping> = mapping.iter().collect();
    sorted.sort_by_key(|m| m.start_index);

    let mut cursor = 0usize;
    let mut students = Vec::with_capacity(sorted.len());
    for entry in sorted {
        if entry.start_index != cursor || entry.end_index <= entry.start_index {
            return None;
        }
        cursor = entry.end_index;
        students.push(StudentBoundary {
            student_key: entry.student_key.clone(),
            student_id: entry.student_id.clone(),
            student_name: entry.student_name.clone(),
            start_page: entry.start_index,
            end_page: entry.end_index,
        });
    }
    if cursor != page_count {
        return None;
    }
    Some(SegmentOutcome {
        students,
        needs_confirmation: false,
        errors: Vec::new(),
    })
}

fn from_boundaries(page_count: usize, boundaries: &[usize]) -> Option<SegmentOutcome> {
    if boundaries.is_empty() || boundaries[0] != 0 {
        return None;
    }
    if boundaries.windows(2).any(|w| w[1] <= w[0]) {
        return None;
    }
    if *boundaries.last().expect("non-empty") >= page_count {
        return None;
    }
    let mut students = Vec::with_capacity(boundaries.len());
    for (i, &start) in boundaries.iter().enumerate() {
        let end = boundaries.get(i + 1).copied().unwrap_or(page_count);
        students.push(StudentBoundary {
            student_key: format!("S{}", i + 1),
            student_id: None,
            student_name: None,
            start_page: start,
            end_page: end,
        });
    }
    Some(SegmentOutcome {
        students,
        needs_confirmation: false,
        errors: Vec::new(),
    })
}

/// Split into `expected_students` even contiguous groups, or one group when
/// no expectation is set.
fn heuristic(page_count: usize, expected_students: Option<usize>) -> SegmentOutcome {
    let students_wanted = expected_students.unwrap_or(1).max(1).min(page_count);
    if students_wanted <= 1 {
        return SegmentOutcome {
            students: vec![StudentBoundary {
                student_key: "S1".to_string(),
                student_id: None,
                student_name: None,
                start_page: 0,
                end_page: page_count,
            }],
            needs_confirmation: false,
            errors: Vec::new(),
        };
    }

    // Even split. Confidence is high only when the pages divide evenly;
    // a ragged split is a guess the reviewer should confirm.
    let confidence = if page_count % students_wanted == 0 { 0.9 } else { 0.6 };
    let base = page_count / students_wanted;
    let remainder = page_count % students_wanted;
    let mut students = Vec::with_capacity(students_wanted);
    let mut cursor = 0usize;
    for i in 0..students_wanted {
        let span = base + usize::from(i < remainder);
        students.push(StudentBoundary {
            student_key: format!("S{}", i + 1),
            student_id: None,
            student_name: None,
            start_page: cursor,
            end_page: cursor + span,
        });
        cursor += span;
    }

    let needs_confirmation = confidence < CONFIRMATION_THRESHOLD;
    let errors = if needs_confirmation {
        vec![GradingError::new(
            ErrorKind::BoundaryAmbiguous,
            STAGE,
            format!(
                "{page_count} pages split across {students_wanted} students unevenly (confidence {confidence})"
            ),
        )]
    } else {
        Vec::new()
    };

    SegmentOutcome {
        students,
        needs_confirmation,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(boundaries: Option<Vec<usize>>, expected: Option<usize>) -> RunConfig {
        RunConfig {
            student_boundaries: boundaries,
            expected_students: expected,
            ..Default::default()
        }
    }

    fn assert_partitions(students: &[StudentBoundary], page_count: usize) {
        let mut covered = vec![false; page_count];
        for student in students {
            for page in student.start_page..student.end_page {
                assert!(!covered[page], "page {page} covered twice");
                covered[page] = true;
            }
        }
        assert!(covered.iter().all(|&c| c), "not every page covered");
    }

    #[test]
    fn explicit_boundaries_used_verbatim() {
        let outcome = segment(6, &config(Some(vec![0, 3]), Some(2)), None);
        assert_eq!(outcome.students.len(), 2);
        assert_eq!(outcome.students[0].start_page..outcome.students[0].end_page, 0..3);
        assert_eq!(outcome.students[1].start_page..outcome.students[1].end_page, 3..6);
        assert!(!outcome.needs_confirmation);
        assert_partitions(&outcome.students, 6);
    }

    #[test]
    fn single_student_default_when_no_signal() {
        let outcome = segment(5, &config(None, None), None);
        assert_eq!(outcome.students.len(), 1);
        assert_eq!(outcome.students[0].page_count(), 5);
        assert_partitions(&outcome.students, 5);
    }

    #[test]
    fn even_split_is_confident() {
        let outcome = segment(6, &config(None, Some(3)), None);
        assert_eq!(outcome.students.len(), 3);
        assert!(!outcome.needs_confirmation);
        assert_partitions(&outcome.students, 6);
    }

    #[test]
    fn ragged_split_requests_confirmation() {
        let outcome = segment(7, &config(None, Some(3)), None);
        assert_eq!(outcome.students.len(), 3);
        assert!(outcome.needs_confirmation);
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.kind == ErrorKind::BoundaryAmbiguous));
        assert_partitions(&outcome.students, 7);
    }

    #[test]
    fn inconsistent_boundaries_fall_back_flagged() {
        let outcome = segment(4, &config(Some(vec![0, 9]), None), None);
        assert!(outcome.needs_confirmation);
        assert_partitions(&outcome.students, 4);
    }

    #[test]
    fn mapping_wins_over_everything() {
        let mapping = vec![
            StudentMapping {
                student_key: "alice".to_string(),
                student_id: Some("1001".to_string()),
                student_name: Some("Alice".to_string()),
                start_index: 0,
                end_index: 2,
            },
            StudentMapping {
                student_key: "bob".to_string(),
                student_id: None,
                student_name: None,
                start_index: 2,
                end_index: 4,
            },
        ];
        let outcome = segment(4, &config(Some(vec![0, 1]), Some(4)), Some(&mapping));
        assert_eq!(outcome.students.len(), 2);
        assert_eq!(outcome.students[0].student_key, "alice");
        assert_eq!(outcome.students[0].student_id.as_deref(), Some("1001"));
        assert_partitions(&outcome.students, 4);
    }

    #[test]
    fn expected_students_capped_by_page_count() {
        let outcome = segment(2, &config(None, Some(5)), None);
        assert_eq!(outcome.students.len(), 2);
        assert_partitions(&outcome.students, 2);
    }
}
