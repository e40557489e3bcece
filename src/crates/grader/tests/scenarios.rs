//! End-to-end grading scenarios driven through the orchestrator with the
//! deterministic scripted client and the in-memory checkpoint store.

use base64::Engine;
use futures::StreamExt;
use grader::events::{EventType, RunEvent};
use grader::model::{GradingMode, PageStatus, RawPage};
use grader::worker::stub_page_reply;
use grader::{
    ErrorKind, GradingConfig, Orchestrator, ReviewAction, ReviewDecision, ReviewGate,
    SubmitInputs,
};
use gradeflow_checkpoint::{Checkpointer, InMemoryCheckpointer, RunStatus};
use llm::{LlmClient, ScriptedClient, ScriptedOutcome};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn raw_pages(count: usize) -> Vec<RawPage> {
    (0..count)
        .map(|i| RawPage {
            name: Some(format!("page-{i}.png")),
            data: base64::engine::general_purpose::STANDARD.encode(format!("page-{i}")),
            media_type: "image/png".to_string(),
        })
        .collect()
}

fn rubric_reply(question_id: &str, max_score: f64) -> String {
    json!({
        "total_questions": 1,
        "total_score": max_score,
        "confidence": 0.95,
        "questions": [{
            "question_id": question_id,
            "max_score": max_score,
            "description": "scripted question",
            "standard_answer": null,
            "scoring_points": []
        }]
    })
    .to_string()
}

/// Single-worker config so scripted replies land on pages in order.
fn test_config() -> GradingConfig {
    GradingConfig {
        max_parallel_workers: 1,
        ..Default::default()
    }
}

fn orchestrator(client: ScriptedClient) -> (Orchestrator, Arc<InMemoryCheckpointer>) {
    orchestrator_with(test_config(), Arc::new(client))
}

fn orchestrator_with(
    config: GradingConfig,
    client: Arc<dyn LlmClient>,
) -> (Orchestrator, Arc<InMemoryCheckpointer>) {
    // RUST_LOG=debug makes a failing scenario narrate itself.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let checkpointer = Arc::new(InMemoryCheckpointer::new());
    let orchestrator = Orchestrator::new(config, client, checkpointer.clone())
        .expect("grading graph builds");
    (orchestrator, checkpointer)
}

/// Collect events until one matches `last`, with a hard timeout.
async fn drain_until(
    events: &mut grader::events::EventStream,
    last: impl Fn(&RunEvent) -> bool,
    limit: Duration,
) -> Vec<RunEvent> {
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let event = tokio::time::timeout(remaining, events.next())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        let done = last(&event);
        collected.push(event);
        if done {
            return collected;
        }
    }
}

fn started_nodes(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.event_type == EventType::NodeStarted)
        .map(|e| e.payload["node"].as_str().unwrap().to_string())
        .collect()
}

// S1: one student, three pages, no rubric, review disabled.
#[tokio::test]
async fn single_student_assist_run_grades_three_pages() {
    let client = ScriptedClient::new(vec![
        ScriptedOutcome::Reply(stub_page_reply(&[("1", 8.0, 10.0)], 0.9)),
        ScriptedOutcome::Reply(stub_page_reply(&[("2", 9.0, 10.0)], 0.9)),
        ScriptedOutcome::Reply(stub_page_reply(&[("3", 10.0, 10.0)], 0.9)),
    ]);
    let (orchestrator, _) = orchestrator(client);
    let mut events = orchestrator.subscribe("s1").await;

    let receipt = orchestrator
        .start_with_id(
            "s1".to_string(),
            SubmitInputs {
                files: raw_pages(3),
                enable_review: Some(false),
                grading_mode: Some(GradingMode::Assist),
                expected_students: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(receipt.total_pages, 3);

    let trace = drain_until(
        &mut events,
        |e| e.event_type == EventType::RunCompleted,
        Duration::from_secs(30),
    )
    .await;

    let state = orchestrator.get_state("s1").await.unwrap();
    assert_eq!(state.student_results.len(), 1);
    let student = &state.student_results[0];
    assert_eq!(student.total_score, 27.0);
    assert_eq!(student.question_results.len(), 3);
    assert!(state.cross_page_questions.is_empty());
    assert_eq!(state.progress, 1.0);

    // The event trace visits the placeholder path, never a gate.
    let nodes = started_nodes(&trace);
    assert_eq!(
        nodes,
        vec![
            "intake",
            "preprocess",
            "rubric_parse",
            "rubric_review_skip",
            "grading_fanout",
            "grade_batch",
            "cross_page_merge",
            "segment",
            "results_review_skip",
            "export",
        ]
    );
    assert!(!nodes.contains(&"rubric_review".to_string()));
    assert!(!nodes.contains(&"results_review".to_string()));
}

// S2: two students with an explicit boundary, aggregated in page order.
#[tokio::test]
async fn two_students_with_boundaries_grade_independently() {
    let replies = [
        ("1", 8.0),
        ("2", 9.0),
        ("3", 10.0), // student 1, pages 0..3
        ("1", 5.0),
        ("2", 6.0),
        ("3", 7.0), // student 2, pages 3..6
    ]
    .iter()
    .map(|&(q, s)| ScriptedOutcome::Reply(stub_page_reply(&[(q, s, 10.0)], 0.9)))
    .collect();
    let (orchestrator, _) = orchestrator(ScriptedClient::new(replies));
    let mut events = orchestrator.subscribe("s2").await;

    orchestrator
        .start_with_id(
            "s2".to_string(),
            SubmitInputs {
                files: raw_pages(6),
                student_boundaries: Some(vec![0, 3]),
                expected_students: Some(2),
                enable_review: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    drain_until(
        &mut events,
        |e| e.event_type == EventType::RunCompleted,
        Duration::from_secs(30),
    )
    .await;

    let state = orchestrator.get_state("s2").await.unwrap();
    assert_eq!(state.batches.len(), 2);
    assert_eq!(state.student_results.len(), 2);
    assert_eq!(state.student_results[0].student_key, "S1");
    assert_eq!(state.student_results[0].start_page, 0);
    assert_eq!(state.student_results[0].total_score, 27.0);
    assert_eq!(state.student_results[1].student_key, "S2");
    assert_eq!(state.student_results[1].start_page, 3);
    assert_eq!(state.student_results[1].total_score, 18.0);
    assert_eq!(state.total_score, 45.0);
}

// S4: question 5 spans pages 2 and 3 and merges once.
#[tokio::test]
async fn cross_page_question_merges_with_capped_score() {
    let client = ScriptedClient::new(vec![
        ScriptedOutcome::Reply(stub_page_reply(&[("1", 8.0, 10.0)], 0.9)),
        ScriptedOutcome::Reply(stub_page_reply(&[("2", 9.0, 10.0)], 0.9)),
        ScriptedOutcome::Reply(stub_page_reply(&[("5", 4.0, 10.0)], 0.9)),
        ScriptedOutcome::Reply(stub_page_reply(&[("5", 5.0, 10.0)], 0.9)),
    ]);
    let (orchestrator, _) = orchestrator(client);
    let mut events = orchestrator.subscribe("s4").await;

    orchestrator
        .start_with_id(
            "s4".to_string(),
            SubmitInputs {
                files: raw_pages(4),
                enable_review: Some(false),
                expected_students: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    drain_until(
        &mut events,
        |e| e.event_type == EventType::RunCompleted,
        Duration::from_secs(30),
    )
    .await;

    let state = orchestrator.get_state("s4").await.unwrap();
    let merged = state.student_results[0]
        .question_results
        .iter()
        .find(|q| q.question_id == "5")
        .expect("question 5 present");
    assert!(merged.is_cross_page);
    assert_eq!(merged.score, 9.0);
    assert_eq!(merged.max_score, 10.0);
    assert_eq!(merged.page_indices, vec![2, 3]);
    assert_eq!(merged.merge_source, vec![2, 3]);
    assert!(merged.score <= merged.max_score);
    assert!(merged.page_indices.len() >= 2);

    assert_eq!(state.cross_page_questions.len(), 1);
    assert_eq!(state.cross_page_questions[0].question_id, "5");
}

// S5: a transient failure recovers on retry and stays on the record.
#[tokio::test]
async fn transient_llm_failure_recovers_and_is_recorded() {
    let client = ScriptedClient::new(vec![
        ScriptedOutcome::Transient("connection reset".to_string()),
        ScriptedOutcome::Reply(stub_page_reply(&[("1", 7.0, 10.0)], 0.9)),
    ]);
    let (orchestrator, _) = orchestrator(client);
    let mut events = orchestrator.subscribe("s5").await;

    orchestrator
        .start_with_id(
            "s5".to_string(),
            SubmitInputs {
                files: raw_pages(1),
                enable_review: Some(false),
                expected_students: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let trace = drain_until(
        &mut events,
        |e| e.event_type == EventType::RunCompleted,
        Duration::from_secs(30),
    )
    .await;

    let state = orchestrator.get_state("s5").await.unwrap();
    let page = &state.grading_results["S1:0"];
    assert_eq!(page.status, PageStatus::Completed);
    assert_eq!(page.score, 7.0);

    let retryable: Vec<_> = state
        .errors
        .iter()
        .filter(|e| e.kind == ErrorKind::LlmTransient && e.retryable)
        .collect();
    assert_eq!(retryable.len(), 1);
    assert_eq!(retryable[0].page_index, Some(0));

    // One warning-grade failure event, and the batch still completed.
    let warnings: Vec<_> = trace
        .iter()
        .filter(|e| {
            e.event_type == EventType::NodeFailed
                && e.payload["warning"].as_bool().unwrap_or(false)
        })
        .collect();
    assert_eq!(warnings.len(), 1);
    assert!(trace.iter().any(|e| {
        e.event_type == EventType::NodeCompleted && e.payload["node"] == "grade_batch"
    }));
}

// S6: strict review pauses at both gates; a rubric patch flows into totals.
#[tokio::test]
async fn review_gates_pause_and_patch_applies() {
    let client = ScriptedClient::new(vec![
        ScriptedOutcome::Reply(rubric_reply("1", 10.0)),
        ScriptedOutcome::Reply(stub_page_reply(&[("1", 7.0, 10.0)], 0.9)),
    ]);
    let (orchestrator, _) = orchestrator(client);
    let mut events = orchestrator.subscribe("s6").await;

    orchestrator
        .start_with_id(
            "s6".to_string(),
            SubmitInputs {
                files: raw_pages(1),
                rubrics: raw_pages(1),
                enable_review: Some(true),
                grading_mode: Some(GradingMode::Strict),
                expected_students: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let to_gate = drain_until(
        &mut events,
        |e| e.event_type == EventType::ReviewRequired,
        Duration::from_secs(30),
    )
    .await;
    assert_eq!(to_gate.last().unwrap().payload["gate"], "rubric");

    // Give the pause a moment to land in the checkpoint store.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let paused = orchestrator.get_state("s6").await.unwrap();
    assert_eq!(
        serde_json::to_value(paused.review_pending).unwrap(),
        json!("rubric")
    );

    // Reduce question 1 from 10 to 8 points.
    orchestrator
        .submit_review(
            "s6",
            ReviewGate::Rubric,
            ReviewDecision {
                action: ReviewAction::Approve,
                patch: Some(json!({
                    "questions": [{
                        "question_id": "1",
                        "max_score": 8.0,
                        "description": "scripted question",
                        "standard_answer": null,
                        "scoring_points": []
                    }]
                })),
            },
        )
        .await
        .unwrap();

    let to_results_gate = drain_until(
        &mut events,
        |e| e.event_type == EventType::ReviewRequired,
        Duration::from_secs(30),
    )
    .await;
    assert_eq!(to_results_gate.last().unwrap().payload["gate"], "results");

    tokio::time::sleep(Duration::from_millis(100)).await;
    orchestrator
        .submit_review(
            "s6",
            ReviewGate::Results,
            ReviewDecision {
                action: ReviewAction::Approve,
                patch: None,
            },
        )
        .await
        .unwrap();

    drain_until(
        &mut events,
        |e| e.event_type == EventType::RunCompleted,
        Duration::from_secs(30),
    )
    .await;

    let state = orchestrator.get_state("s6").await.unwrap();
    // The patched rubric owns the max: 8, not 10.
    assert_eq!(state.max_total_score, 8.0);
    assert_eq!(state.total_score, 7.0);
    assert_eq!(state.parsed_rubric.unwrap().total_score, 8.0);
}

// Property 6: a run interrupted at a gate and resumed produces the same
// results as an uninterrupted run with the same scripted client.
#[tokio::test]
async fn resumed_run_matches_uninterrupted_run() {
    let scripts = || {
        vec![
            ScriptedOutcome::Reply(rubric_reply("1", 10.0)),
            ScriptedOutcome::Reply(stub_page_reply(&[("1", 6.5, 10.0)], 0.9)),
        ]
    };
    let inputs = |review: bool| SubmitInputs {
        files: raw_pages(1),
        rubrics: raw_pages(1),
        enable_review: Some(review),
        expected_students: Some(1),
        ..Default::default()
    };

    // Uninterrupted reference run.
    let (plain, _) = orchestrator(ScriptedClient::new(scripts()));
    let mut plain_events = plain.subscribe("ref").await;
    plain
        .start_with_id("ref".to_string(), inputs(false))
        .await
        .unwrap();
    drain_until(
        &mut plain_events,
        |e| e.event_type == EventType::RunCompleted,
        Duration::from_secs(30),
    )
    .await;
    let reference = plain.get_state("ref").await.unwrap();

    // Interrupted run: pause at both gates, approve without changes.
    let (gated, _) = orchestrator(ScriptedClient::new(scripts()));
    let mut gated_events = gated.subscribe("gated").await;
    gated
        .start_with_id("gated".to_string(), inputs(true))
        .await
        .unwrap();
    drain_until(
        &mut gated_events,
        |e| e.event_type == EventType::ReviewRequired,
        Duration::from_secs(30),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    gated
        .submit_review(
            "gated",
            ReviewGate::Rubric,
            ReviewDecision {
                action: ReviewAction::Approve,
                patch: None,
            },
        )
        .await
        .unwrap();
    drain_until(
        &mut gated_events,
        |e| e.event_type == EventType::ReviewRequired,
        Duration::from_secs(30),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    gated
        .submit_review(
            "gated",
            ReviewGate::Results,
            ReviewDecision {
                action: ReviewAction::Approve,
                patch: None,
            },
        )
        .await
        .unwrap();
    drain_until(
        &mut gated_events,
        |e| e.event_type == EventType::RunCompleted,
        Duration::from_secs(30),
    )
    .await;
    let resumed = gated.get_state("gated").await.unwrap();

    assert_eq!(
        serde_json::to_value(&reference.student_results).unwrap(),
        serde_json::to_value(&resumed.student_results).unwrap()
    );
    assert_eq!(reference.total_score, resumed.total_score);
    assert_eq!(reference.max_total_score, resumed.max_total_score);
}

// Partial failure: an exhausted page zero-scores, siblings survive.
#[tokio::test]
async fn failed_page_zero_scores_without_failing_the_run() {
    let client = ScriptedClient::new(vec![
        ScriptedOutcome::Transient("down".to_string()),
        ScriptedOutcome::Transient("down".to_string()),
        ScriptedOutcome::Transient("down".to_string()),
        ScriptedOutcome::Reply(stub_page_reply(&[("2", 9.0, 10.0)], 0.9)),
    ]);
    let (orchestrator, _) = orchestrator(client);
    let mut events = orchestrator.subscribe("partial").await;

    orchestrator
        .start_with_id(
            "partial".to_string(),
            SubmitInputs {
                files: raw_pages(2),
                enable_review: Some(false),
                expected_students: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    drain_until(
        &mut events,
        |e| e.event_type == EventType::RunCompleted,
        Duration::from_secs(60),
    )
    .await;

    let state = orchestrator.get_state("partial").await.unwrap();
    let failed = &state.grading_results["S1:0"];
    assert_eq!(failed.status, PageStatus::Failed);
    assert_eq!(failed.score, 0.0);
    assert!(!failed.feedback.is_empty());
    let graded = &state.grading_results["S1:1"];
    assert_eq!(graded.status, PageStatus::Completed);
    assert_eq!(state.report.unwrap().failed_pages, 1);
}

// Property 9: cancellation during fan-out terminates promptly and flags
// the run.
#[tokio::test]
async fn cancellation_during_grading_terminates_promptly() {
    let client = ScriptedClient::always(stub_page_reply(&[("1", 5.0, 10.0)], 0.9))
        .with_delay(Duration::from_millis(300));
    let (orchestrator, checkpointer) = orchestrator(client);
    let mut events = orchestrator.subscribe("cancel-me").await;

    orchestrator
        .start_with_id(
            "cancel-me".to_string(),
            SubmitInputs {
                files: raw_pages(6),
                enable_review: Some(false),
                expected_students: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    drain_until(
        &mut events,
        |e| e.event_type == EventType::NodeStarted && e.payload["node"] == "grade_batch",
        Duration::from_secs(30),
    )
    .await;
    orchestrator.abort("cancel-me", "operator cancelled").await.unwrap();

    let trace = drain_until(
        &mut events,
        |e| e.event_type == EventType::RunFailed,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(trace.last().unwrap().payload["kind"], "cancelled");

    let failed = checkpointer
        .list_active(Some(RunStatus::Failed))
        .await
        .unwrap();
    assert!(failed.iter().any(|r| r.batch_id == "cancel-me"));
}

// Restarting a known batch id resumes instead of regrading.
#[tokio::test]
async fn restarting_a_known_batch_id_resumes() {
    let client = ScriptedClient::new(vec![ScriptedOutcome::Reply(stub_page_reply(
        &[("1", 9.0, 10.0)],
        0.9,
    ))]);
    let (orchestrator, checkpointer) = orchestrator(client);
    let mut events = orchestrator.subscribe("idem").await;

    orchestrator
        .start_with_id(
            "idem".to_string(),
            SubmitInputs {
                files: raw_pages(1),
                enable_review: Some(false),
                expected_students: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    drain_until(
        &mut events,
        |e| e.event_type == EventType::RunCompleted,
        Duration::from_secs(30),
    )
    .await;
    let snapshots_after_first = checkpointer.snapshot_count("idem").await;

    // The scripted client is exhausted; a real regrade would fail loudly.
    let receipt = orchestrator
        .start_with_id(
            "idem".to_string(),
            SubmitInputs {
                files: raw_pages(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(receipt.status, "running");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let state = orchestrator.get_state("idem").await.unwrap();
    assert_eq!(state.student_results.len(), 1);
    assert_eq!(state.student_results[0].total_score, 9.0);
    // Resume from a completed run re-executes nothing.
    assert_eq!(checkpointer.snapshot_count("idem").await, snapshots_after_first);
}
