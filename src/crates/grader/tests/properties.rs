//! Property-based invariants over the pure pipeline stages.

use grader::merge::merge_student_pages;
use grader::model::{
    Page, PageResult, PageStatus, ParsedRubric, QuestionResult, RubricStatus, RunConfig,
    StudentBoundary,
};
use grader::planner::{plan, DefaultTokenEstimator};
use grader::segment::segment;
use proptest::prelude::*;

fn pages(count: usize) -> Vec<Page> {
    (0..count)
        .map(|index| Page {
            index,
            data: "QUJD".to_string(),
            media_type: "image/png".to_string(),
            byte_len: 3,
        })
        .collect()
}

fn empty_rubric() -> ParsedRubric {
    ParsedRubric {
        total_questions: 0,
        total_score: 0.0,
        questions: Vec::new(),
        confidence: 0.3,
        status: RubricStatus::Fallback,
    }
}

proptest! {
    // Boundaries partition [0, page_count) exactly: no overlap, no gap.
    #[test]
    fn segmentation_partitions_pages_exactly(
        page_count in 1usize..40,
        expected in proptest::option::of(1usize..8),
    ) {
        let config = RunConfig {
            expected_students: expected,
            ..Default::default()
        };
        let outcome = segment(page_count, &config, None);

        let mut covered = vec![0u8; page_count];
        for student in &outcome.students {
            prop_assert!(student.start_page < student.end_page);
            prop_assert!(student.end_page <= page_count);
            for page in student.start_page..student.end_page {
                covered[page] += 1;
            }
        }
        prop_assert!(covered.iter().all(|&c| c == 1));
    }

    // Supplied boundaries are honored verbatim whenever consistent.
    #[test]
    fn consistent_boundaries_are_used_verbatim(
        splits in proptest::collection::btree_set(1usize..30, 0..4),
        tail in 1usize..10,
    ) {
        let mut boundaries = vec![0usize];
        boundaries.extend(splits.iter().copied());
        let page_count = boundaries.last().unwrap() + tail;

        let config = RunConfig {
            student_boundaries: Some(boundaries.clone()),
            ..Default::default()
        };
        let outcome = segment(page_count, &config, None);
        prop_assert_eq!(outcome.students.len(), boundaries.len());
        for (student, &start) in outcome.students.iter().zip(boundaries.iter()) {
            prop_assert_eq!(student.start_page, start);
        }
        prop_assert_eq!(outcome.students.last().unwrap().end_page, page_count);
    }

    // Batches stay within one student and cover that student's pages once.
    #[test]
    fn planner_preserves_student_atomicity(
        spans in proptest::collection::vec(1usize..6, 1..5),
        budget in 3_000u64..30_000,
    ) {
        let mut students = Vec::new();
        let mut cursor = 0usize;
        for (i, span) in spans.iter().enumerate() {
            students.push(StudentBoundary {
                student_key: format!("S{}", i + 1),
                student_id: None,
                student_name: None,
                start_page: cursor,
                end_page: cursor + span,
            });
            cursor += span;
        }
        let all_pages = pages(cursor);
        let batches = plan(&students, &all_pages, &empty_rubric(), budget, &DefaultTokenEstimator);

        let mut covered = vec![0u8; cursor];
        for batch in &batches {
            let student = students
                .iter()
                .find(|s| s.student_key == batch.student_key)
                .expect("batch belongs to a student");
            for &page in &batch.page_indices {
                prop_assert!(page >= student.start_page && page < student.end_page);
                covered[page] += 1;
            }
            // Over-budget batches only happen for single pages.
            if batch.estimated_tokens > budget {
                prop_assert_eq!(batch.page_indices.len(), 1);
            }
        }
        prop_assert!(covered.iter().all(|&c| c == 1));
    }

    // Merged scores never exceed the max, and cross-page results always
    // span at least two pages.
    #[test]
    fn merge_caps_scores_and_tracks_pages(
        fragment_scores in proptest::collection::vec(0.0f64..12.0, 2..6),
    ) {
        let max_score = 10.0;
        let page_results: Vec<PageResult> = fragment_scores
            .iter()
            .enumerate()
            .map(|(index, &score)| PageResult {
                page_index: index,
                status: PageStatus::Completed,
                score: score.min(max_score),
                max_score,
                question_numbers: vec!["5".to_string()],
                question_details: vec![QuestionResult {
                    question_id: "5".to_string(),
                    score: score.min(max_score),
                    max_score,
                    feedback: String::new(),
                    rubric_refs: Vec::new(),
                    scoring_point_results: Vec::new(),
                    page_indices: vec![index],
                    is_cross_page: false,
                    merge_source: Vec::new(),
                }],
                feedback: String::new(),
                confidence: 0.9,
                agent_skill_calls: 1,
            })
            .collect();
        let refs: Vec<&PageResult> = page_results.iter().collect();
        let outcome = merge_student_pages("S1", &refs);

        prop_assert_eq!(outcome.questions.len(), 1);
        let merged = &outcome.questions[0];
        prop_assert!(merged.is_cross_page);
        prop_assert!(merged.score <= merged.max_score + 1e-9);
        prop_assert!(merged.page_indices.len() >= 2);
        let expected: f64 = page_results.iter().map(|p| p.score).sum::<f64>().min(max_score);
        prop_assert!((merged.score - expected).abs() < 1e-9);
    }
}
