//! Rubric parsing from scoring-guide images.
//!
//! One vision call turns the uploaded rubric pages into a [`ParsedRubric`].
//! The prompt pins down the two recognition rules everything downstream
//! depends on: only MAIN question numbers become questions, and sub-parts
//! become scoring points inside their main question. The parser then
//! validates the result structurally and semantically, re-parses on
//! semantic violations up to a cap, and synthesizes a per-page fallback
//! rubric when parsing cannot produce anything usable.

use crate::error::{ErrorKind, GradingError};
use crate::model::{
    Page, ParsedRubric, QuestionRubric, RubricStatus, ScoringPoint,
};
use llm::{ChatMessage, CompletionRequest, LlmClient, LlmError};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const STAGE: &str = "rubric_parse";

/// Question/sub-part score sum tolerance.
const TOTAL_SCORE_TOLERANCE: f64 = 0.5;
const POINT_SCORE_TOLERANCE: f64 = 0.1;

/// Max score per synthetic fallback question when nothing better is known.
const FALLBACK_DEFAULT_MAX_SCORE: f64 = 10.0;

const PARSE_PROMPT: &str = r#"You are reading an exam scoring rubric. Convert it to JSON.

Strict recognition rules:
1. Only MAIN question numbers become entries in "questions". Main numbers
   look like "1", "7", "十一", "二". Count only these in "total_questions".
2. Sub-parts such as "7(1)", "7(2)", "7.1" are NEVER separate questions.
   They become entries of the main question's "scoring_points" array, with
   "point_id" like "7.1".
3. Every score is a number. The sub-part scores of a question must add up
   to that question's "max_score".

Respond with ONLY a JSON object of this exact shape:
{
  "total_questions": <int>,
  "total_score": <number>,
  "confidence": <number 0..1>,
  "questions": [
    {
      "question_id": "<main number>",
      "max_score": <number>,
      "description": "<short description>",
      "standard_answer": "<answer text or null>",
      "scoring_points": [
        {"point_id": "<id>", "description": "<text>", "score": <number>, "is_required": <bool>}
      ]
    }
  ]
}"#;

fn subpart_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"^\s*(\d+)\s*[.\-(（]\s*\d+").expect("valid sub-part pattern")
    })
}

/// Outcome of a parse attempt: always a rubric, plus any warnings recorded
/// along the way. Only a `Failed` status is fatal for the run.
pub struct ParseOutcome {
    pub rubric: ParsedRubric,
    pub errors: Vec<GradingError>,
}

/// Drives the LLM to produce structured scoring criteria.
pub struct RubricParser {
    llm: Arc<dyn LlmClient>,
    max_parse_retries: u32,
    llm_timeout: Duration,
    fallback_confidence: f64,
}

impl RubricParser {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        max_parse_retries: u32,
        llm_timeout: Duration,
        fallback_confidence: f64,
    ) -> Self {
        Self {
            llm,
            max_parse_retries,
            llm_timeout,
            fallback_confidence,
        }
    }

    /// Parse rubric images into scoring criteria.
    ///
    /// `total_answer_pages`, `expected_students`, and
    /// `expected_total_score` feed the fallback synthesis when parsing is
    /// impossible. An empty rubric upload goes straight to the fallback.
    pub async fn parse(
        &self,
        rubric_images: &[Page],
        total_answer_pages: usize,
        expected_students: Option<usize>,
        expected_total_score: Option<f64>,
        cancel: &CancellationToken,
    ) -> ParseOutcome {
        let mut errors = Vec::new();

        if rubric_images.is_empty() {
            debug!("no rubric uploaded, synthesizing fallback");
            return self.fallback(
                total_answer_pages,
                expected_students,
                expected_total_score,
                errors,
            );
        }

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                errors.push(GradingError::new(
                    ErrorKind::Cancelled,
                    STAGE,
                    "rubric parse cancelled",
                ));
                return self.fallback(
                    total_answer_pages,
                    expected_students,
                    expected_total_score,
                    errors,
                );
            }

            match self.call_llm(rubric_images).await {
                Ok(content) => match self.interpret(&content, &mut errors) {
                    Interpretation::Accepted(rubric) => {
                        return ParseOutcome { rubric, errors };
                    }
                    Interpretation::Retry(reason) => {
                        errors.push(GradingError::new(
                            ErrorKind::LlmInvalidResponse,
                            STAGE,
                            reason,
                        ));
                    }
                },
                Err(err) => {
                    let recorded = GradingError::from_llm(&err, STAGE);
                    let retryable = recorded.retryable;
                    errors.push(recorded);
                    if !retryable {
                        warn!(error = %err, "rubric parse failed without retry");
                        return self.fallback(
                            total_answer_pages,
                            expected_students,
                            expected_total_score,
                            errors,
                        );
                    }
                }
            }

            attempt += 1;
            if attempt > self.max_parse_retries {
                errors.push(GradingError::new(
                    ErrorKind::ParseFailure,
                    STAGE,
                    format!("rubric parse gave up after {attempt} attempts"),
                ));
                return self.fallback(
                    total_answer_pages,
                    expected_students,
                    expected_total_score,
                    errors,
                );
            }
        }
    }

    async fn call_llm(&self, rubric_images: &[Page]) -> Result<String, LlmError> {
        let mut content = vec![llm::ContentPart::Text {
            text: PARSE_PROMPT.to_string(),
        }];
        for page in rubric_images {
            content.push(llm::ContentPart::Image {
                data: page.data.clone(),
                media_type: page.media_type.clone(),
            });
        }
        let request = CompletionRequest::new(vec![ChatMessage {
            role: llm::Role::User,
            content,
        }])
        .with_timeout(self.llm_timeout);
        let response = self.llm.complete(request).await?;
        Ok(response.content)
    }

    /// Validate a raw response into a rubric, or ask for a re-parse.
    fn interpret(&self, content: &str, errors: &mut Vec<GradingError>) -> Interpretation {
        let Some(json) = extract_json(content) else {
            return Interpretation::Retry("response contained no JSON object".to_string());
        };
        let wire: WireRubric = match serde_json::from_str(&json) {
            Ok(wire) => wire,
            Err(err) => {
                return Interpretation::Retry(format!("response JSON did not match schema: {err}"))
            }
        };

        let questions: Vec<QuestionRubric> = wire
            .questions
            .into_iter()
            .map(|q| QuestionRubric {
                question_id: q.question_id,
                max_score: q.max_score,
                description: q.description.unwrap_or_default(),
                scoring_points: q
                    .scoring_points
                    .into_iter()
                    .map(|p| ScoringPoint {
                        point_id: p.point_id,
                        description: p.description.unwrap_or_default(),
                        score: p.score,
                        is_required: p.is_required.unwrap_or(false),
                    })
                    .collect(),
                standard_answer: q.standard_answer,
            })
            .collect();

        if questions.is_empty() {
            return Interpretation::Retry("rubric contained no questions".to_string());
        }

        // Duplicate ids are a semantic violation worth a re-parse.
        let mut seen = HashSet::new();
        for question in &questions {
            if !seen.insert(question.question_id.clone()) {
                return Interpretation::Retry(format!(
                    "duplicate question_id '{}'",
                    question.question_id
                ));
            }
        }

        // Main-vs-sub confusion: a "7.1"-shaped id whose main question "7"
        // is absent means sub-parts leaked into the question list.
        let ids: HashSet<&str> = questions.iter().map(|q| q.question_id.as_str()).collect();
        for question in &questions {
            if let Some(captures) = subpart_pattern().captures(&question.question_id) {
                let main = captures.get(1).expect("pattern has a main group").as_str();
                if !ids.contains(main) {
                    return Interpretation::Retry(format!(
                        "question_id '{}' looks like a sub-part of absent question '{main}'",
                        question.question_id
                    ));
                }
            }
        }

        let mut status = RubricStatus::Success;
        let total_score = if wire.total_score > 0.0 {
            wire.total_score
        } else {
            questions.iter().map(|q| q.max_score).sum()
        };

        let question_sum: f64 = questions.iter().map(|q| q.max_score).sum();
        if (question_sum - total_score).abs() > TOTAL_SCORE_TOLERANCE {
            status = RubricStatus::Fallback;
            errors.push(GradingError::new(
                ErrorKind::SchemaViolation,
                STAGE,
                format!(
                    "question max scores sum to {question_sum} but total_score is {total_score}"
                ),
            ));
        }

        for question in &questions {
            if question.scoring_points.is_empty() {
                continue;
            }
            let point_sum: f64 = question.scoring_points.iter().map(|p| p.score).sum();
            if (point_sum - question.max_score).abs() > POINT_SCORE_TOLERANCE {
                errors.push(GradingError::new(
                    ErrorKind::SchemaViolation,
                    STAGE,
                    format!(
                        "scoring points of question '{}' sum to {point_sum}, max_score is {}",
                        question.question_id, question.max_score
                    ),
                ));
            }
        }

        Interpretation::Accepted(ParsedRubric {
            total_questions: questions.len(),
            total_score,
            questions,
            confidence: wire.confidence.unwrap_or(0.8).clamp(0.0, 1.0),
            status,
        })
    }

    /// Synthesize a per-page rubric when parsing produced nothing usable.
    ///
    /// One synthetic question per page of a single student's span. With an
    /// expected total score, the points are divided evenly; otherwise each
    /// page defaults to ten points.
    fn fallback(
        &self,
        total_answer_pages: usize,
        expected_students: Option<usize>,
        expected_total_score: Option<f64>,
        errors: Vec<GradingError>,
    ) -> ParseOutcome {
        if total_answer_pages == 0 {
            return ParseOutcome {
                rubric: ParsedRubric {
                    status: RubricStatus::Failed,
                    confidence: 0.0,
                    ..Default::default()
                },
                errors,
            };
        }
        let students = expected_students.unwrap_or(1).max(1);
        let pages_per_student = total_answer_pages.div_ceil(students);
        let per_page_score = expected_total_score
            .map(|total| total / pages_per_student as f64)
            .unwrap_or(FALLBACK_DEFAULT_MAX_SCORE);

        let questions: Vec<QuestionRubric> = (0..pages_per_student)
            .map(|i| QuestionRubric {
                question_id: format!("P{}", i + 1),
                max_score: per_page_score,
                description: format!("page {} of one student's submission", i + 1),
                scoring_points: Vec::new(),
                standard_answer: None,
            })
            .collect();

        ParseOutcome {
            rubric: ParsedRubric {
                total_questions: questions.len(),
                total_score: per_page_score * pages_per_student as f64,
                questions,
                confidence: self.fallback_confidence,
                status: RubricStatus::Fallback,
            },
            errors,
        }
    }
}

enum Interpretation {
    Accepted(ParsedRubric),
    Retry(String),
}

/// Pull the JSON object out of a model response, tolerating code fences and
/// surrounding prose.
pub fn extract_json(content: &str) -> Option<String> {
    let trimmed = content.trim();
    let body = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.strip_suffix("```").unwrap_or(rest)
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.strip_suffix("```").unwrap_or(rest)
    } else {
        trimmed
    };
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end < start {
        return None;
    }
    Some(body[start..=end].to_string())
}

#[derive(Deserialize)]
struct WireRubric {
    #[serde(default)]
    total_score: f64,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    questions: Vec<WireQuestion>,
}

#[derive(Deserialize)]
struct WireQuestion {
    question_id: String,
    max_score: f64,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    standard_answer: Option<String>,
    #[serde(default)]
    scoring_points: Vec<WirePoint>,
}

#[derive(Deserialize)]
struct WirePoint {
    point_id: String,
    #[serde(default)]
    description: Option<String>,
    score: f64,
    #[serde(default)]
    is_required: Option<bool>,
}
