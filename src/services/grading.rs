use serde_json::{json, Value};
use thiserror::Error;

use crate::core::config::OracleQuality;
use crate::db::models::JobPayload;
use crate::db::types::GradingMethod;
use crate::services::oracle::{
    normalize_rubric_grade, OracleError, OracleOperation, OraclePayload, OracleRequest,
    ScoringOracle,
};
use crate::services::rubric::{map_scores, RubricCriterionScore, RubricSnapshot};
use crate::services::similarity::{SimilarityEngine, SimilarityError, SimilarityResult};
use crate::services::text::{normalize, round2};

/// Failed attempts after which a queue item is parked as `failed`.
pub(crate) const MAX_RETRIES: i32 = 3;

const STRENGTH_THRESHOLD: f64 = 0.7;

#[derive(Debug, Error)]
pub(crate) enum GradingError {
    #[error("submission text is empty")]
    EmptySubmission,
    #[error("no answer key available for key-match grading")]
    MissingAnswerKey,
    #[error("activity max grade must be a positive number, got {0}")]
    InvalidMaxGrade(f64),
    #[error(transparent)]
    Similarity(#[from] SimilarityError),
}

/// Progress of one queue item through the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GradingStage {
    New,
    Scored,
    Finalizing,
    AutoReleased,
    AwaitingReview,
}

impl GradingStage {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Scored => "scored",
            Self::Finalizing => "finalizing",
            Self::AutoReleased => "auto_released",
            Self::AwaitingReview => "awaiting_review",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GradingOutcome {
    pub(crate) method: GradingMethod,
    pub(crate) grade: f64,
    pub(crate) max_grade: f64,
    pub(crate) confidence: f64,
    pub(crate) reasoning: String,
    pub(crate) criteria: Vec<RubricCriterionScore>,
    pub(crate) analysis: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailurePlan {
    Retry { retries: i32, delay: time::Duration },
    Fail { retries: i32 },
}

/// Linear backoff: the n-th failure waits `n × step` before the next attempt.
pub(crate) fn plan_failure(current_retries: i32, backoff_step: time::Duration) -> FailurePlan {
    let retries = current_retries.saturating_add(1).clamp(1, MAX_RETRIES);
    if retries < MAX_RETRIES {
        FailurePlan::Retry { retries, delay: backoff_step * retries }
    } else {
        FailurePlan::Fail { retries }
    }
}

pub(crate) struct Grader<'a> {
    oracle: Option<&'a dyn ScoringOracle>,
    quality: OracleQuality,
}

impl<'a> Grader<'a> {
    pub(crate) fn new(oracle: Option<&'a dyn ScoringOracle>, quality: OracleQuality) -> Self {
        Self { oracle, quality }
    }

    pub(crate) async fn grade(&self, payload: &JobPayload) -> Result<GradingOutcome, GradingError> {
        if normalize(&payload.submission_text).is_empty() {
            return Err(GradingError::EmptySubmission);
        }
        if !(payload.max_grade.is_finite() && payload.max_grade > 0.0) {
            return Err(GradingError::InvalidMaxGrade(payload.max_grade));
        }

        let rubric = payload.rubric_snapshot.as_ref().filter(|snapshot| !snapshot.is_empty());
        let rubric_fallback = match (rubric, self.oracle) {
            (Some(snapshot), Some(oracle)) => {
                match self.grade_with_rubric(oracle, snapshot, payload).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(err) => {
                        tracing::warn!(
                            module_instance_id = %payload.module_instance_id,
                            user_id = %payload.userid,
                            error = %err,
                            "Rubric grading failed, falling back to key match"
                        );
                        Some(format!("rubric grading failed: {err}"))
                    }
                }
            }
            (Some(_), None) => Some(String::from("no scoring oracle configured for rubric grading")),
            (None, _) => None,
        };

        self.grade_with_key(payload, rubric_fallback).await
    }

    async fn grade_with_rubric(
        &self,
        oracle: &dyn ScoringOracle,
        snapshot: &RubricSnapshot,
        payload: &JobPayload,
    ) -> Result<GradingOutcome, OracleError> {
        let request = OracleRequest {
            operation: OracleOperation::RubricGrade,
            quality: self.quality,
            payload: OraclePayload {
                question: payload.question.clone().unwrap_or_else(|| payload.module_name.clone()),
                submission: payload.submission_text.clone(),
                rubric_json: Some(serde_json::to_string(snapshot).unwrap_or_default()),
                answer_key: payload.answer_key.clone().filter(|key| !key.trim().is_empty()),
                custom_instructions: payload.custom_instructions.clone(),
            },
        };

        let response = oracle.grade(&request).await?;
        let provider = response.provider.clone();
        let oracle_grade = normalize_rubric_grade(response.content)?;
        let mapping = map_scores(&oracle_grade.criteria, snapshot);

        let (grade, confidence) = if mapping.max_score > 0.0 {
            let ratio = mapping.calculated_score / mapping.max_score;
            (ratio * payload.max_grade, ratio * 100.0)
        } else {
            (mapping.calculated_score, 0.0)
        };
        let grade = round2(grade);
        let confidence = round2(confidence.clamp(0.0, 100.0));

        let mut reasoning = oracle_grade.feedback.clone();
        if !reasoning.is_empty() {
            reasoning.push_str("\n\n");
        }
        reasoning.push_str(&format!(
            "Rubric total {}/{} scaled to {grade}/{}.",
            mapping.calculated_score, mapping.max_score, payload.max_grade
        ));
        for warning in &mapping.warnings {
            reasoning.push_str("\n- ");
            reasoning.push_str(warning);
        }

        let (strengths, improvements) = rubric_highlights(&mapping.criteria);
        let method = snapshot.kind.grading_method();
        let analysis = json!({
            "method": method.as_str(),
            "provider": provider,
            "rubric_version": snapshot.version,
            "oracle_score": oracle_grade.score,
            "oracle_max_score": oracle_grade.max_score,
            "mapping": mapping,
            "warnings": mapping.warnings,
            "strengths": strengths,
            "improvements": improvements,
        });

        Ok(GradingOutcome {
            method,
            grade,
            max_grade: payload.max_grade,
            confidence,
            reasoning,
            criteria: mapping.criteria,
            analysis,
        })
    }

    async fn grade_with_key(
        &self,
        payload: &JobPayload,
        rubric_fallback: Option<String>,
    ) -> Result<GradingOutcome, GradingError> {
        let key = payload
            .answer_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(GradingError::MissingAnswerKey)?;

        let similarity = SimilarityEngine::new(self.oracle, self.quality)
            .with_question(payload.question.as_deref())
            .analyze(key, &payload.submission_text)
            .await?;

        let grade = round2(similarity.final_percent / 100.0 * payload.max_grade);
        let mut reasoning = similarity.reasoning.clone();
        if let Some(reason) = &similarity.fallback_reason {
            reasoning.push_str(&format!(" Semantic scoring unavailable ({reason})."));
        }
        reasoning.push_str(&format!(
            " Grade = {:.2}% of {} = {grade}.",
            similarity.final_percent, payload.max_grade
        ));

        let (strengths, improvements) = keymatch_highlights(&similarity);
        let analysis = json!({
            "method": GradingMethod::Keymatch.as_str(),
            "similarity": similarity,
            "rubric_fallback_reason": rubric_fallback,
            "strengths": strengths,
            "improvements": improvements,
        });

        Ok(GradingOutcome {
            method: GradingMethod::Keymatch,
            grade,
            max_grade: payload.max_grade,
            confidence: similarity.final_percent,
            reasoning,
            criteria: Vec::new(),
            analysis,
        })
    }
}

fn rubric_highlights(criteria: &[RubricCriterionScore]) -> (Vec<String>, Vec<String>) {
    let mut strengths = Vec::new();
    let mut improvements = Vec::new();

    for criterion in criteria {
        let mut line = format!("{} ({}/{})", criterion.name, criterion.score, criterion.max_score);
        if !criterion.feedback.is_empty() {
            line.push_str(": ");
            line.push_str(&criterion.feedback);
        }

        let strong = criterion.max_score > 0.0
            && criterion.score >= STRENGTH_THRESHOLD * criterion.max_score;
        if strong {
            strengths.push(line);
        } else {
            improvements.push(line);
        }
    }

    (strengths, improvements)
}

fn keymatch_highlights(similarity: &SimilarityResult) -> (Vec<String>, Vec<String>) {
    let strengths = similarity.matched_terms.clone();
    let improvements = similarity
        .partial_terms
        .iter()
        .map(|term| format!("{term} (partially addressed)"))
        .chain(similarity.missing_terms.iter().cloned())
        .collect();
    (strengths, improvements)
}

/// Reads the export lists back out of a stored `rubric_analysis` document.
pub(crate) fn stored_highlights(analysis: &Value) -> (Vec<String>, Vec<String>) {
    let list = |key: &str| -> Vec<String> {
        analysis
            .get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    };
    (list("strengths"), list("improvements"))
}
