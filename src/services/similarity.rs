use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;

use crate::core::config::OracleQuality;
use crate::services::oracle::{
    normalize_semantic, OracleError, OracleOperation, OraclePayload, OracleRequest,
    ScoringOracle, SemanticAssessment,
};
use crate::services::text::{normalize, round2, terms};

const COVERAGE_WEIGHT: f64 = 0.7;
const JACCARD_WEIGHT: f64 = 0.3;
const PARTIAL_CREDIT: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum SimilarityError {
    #[error("answer key has no usable terms")]
    EmptyKey,
    #[error("submission text is empty")]
    EmptySubmission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SimilarityMethod {
    Overlap,
    Semantic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct SimilarityResult {
    pub(crate) method: SimilarityMethod,
    pub(crate) matched_terms: Vec<String>,
    pub(crate) missing_terms: Vec<String>,
    pub(crate) partial_terms: Vec<String>,
    pub(crate) final_percent: f64,
    pub(crate) reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) coverage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) jaccard_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) fallback_reason: Option<String>,
}

fn validated_terms(key: &str, student: &str) -> Result<(Vec<String>, Vec<String>), SimilarityError> {
    if normalize(student).is_empty() {
        return Err(SimilarityError::EmptySubmission);
    }

    let key_terms = terms(key);
    if key_terms.is_empty() {
        return Err(SimilarityError::EmptyKey);
    }

    Ok((key_terms, terms(student)))
}

/// Deterministic term-overlap score: 0.7 × coverage + 0.3 × Jaccard.
pub(crate) fn analyze_overlap(key: &str, student: &str) -> Result<SimilarityResult, SimilarityError> {
    let (key_terms, student_terms) = validated_terms(key, student)?;
    Ok(overlap_from_terms(&key_terms, &student_terms))
}

fn overlap_from_terms(key_terms: &[String], student_terms: &[String]) -> SimilarityResult {
    let student_set: HashSet<&str> = student_terms.iter().map(String::as_str).collect();
    let (matched, missing): (Vec<String>, Vec<String>) =
        key_terms.iter().cloned().partition(|term| student_set.contains(term.as_str()));

    let key_count = key_terms.len();
    let shared = matched.len();
    let union = key_count + student_set.len() - shared;

    let coverage = ratio_percent(shared, key_count);
    let jaccard = ratio_percent(shared, union);
    let final_percent = round2(COVERAGE_WEIGHT * coverage + JACCARD_WEIGHT * jaccard).clamp(0.0, 100.0);

    let reasoning = format!(
        "Overlap method: {shared} of {key_count} key terms found in the submission \
         (coverage = {shared}/{key_count} × 100 = {coverage:.2}%); {shared} shared of {union} \
         distinct terms across both texts (Jaccard = {shared}/{union} × 100 = {jaccard:.2}%); \
         final = {COVERAGE_WEIGHT} × {coverage:.2} + {JACCARD_WEIGHT} × {jaccard:.2} = {final_percent:.2}%."
    );

    SimilarityResult {
        method: SimilarityMethod::Overlap,
        matched_terms: matched,
        missing_terms: missing,
        partial_terms: Vec::new(),
        final_percent,
        reasoning,
        coverage_percent: Some(round2(coverage)),
        jaccard_percent: Some(round2(jaccard)),
        fallback_reason: None,
    }
}

fn ratio_percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

pub(crate) fn semantic_from_assessment(assessment: SemanticAssessment) -> SimilarityResult {
    let full = assessment.matched_concepts.len();
    let partial = assessment.partially_matched_concepts.len();
    let missing = assessment.missing_concepts.len();
    let total = full + partial + missing;

    let (raw_percent, derivation) = if total > 0 {
        let value = (full as f64 + PARTIAL_CREDIT * partial as f64) / total as f64 * 100.0;
        (value, format!("({full} + {PARTIAL_CREDIT} × {partial}) / {total} × 100"))
    } else {
        let value = assessment.similarity_percent.unwrap_or(0.0);
        (value, String::from("oracle similarity_percent"))
    };
    let final_percent = round2(raw_percent.clamp(0.0, 100.0));

    let mut reasoning = format!(
        "Semantic method: {full} matched, {partial} partially matched and {missing} missing \
         of {total} concepts; final = {derivation} = {final_percent:.2}%."
    );
    if !assessment.reasoning.is_empty() {
        reasoning.push(' ');
        reasoning.push_str(&assessment.reasoning);
    }

    SimilarityResult {
        method: SimilarityMethod::Semantic,
        matched_terms: assessment.matched_concepts,
        missing_terms: assessment.missing_concepts,
        partial_terms: assessment.partially_matched_concepts,
        final_percent,
        reasoning,
        coverage_percent: None,
        jaccard_percent: None,
        fallback_reason: None,
    }
}

/// Semantic scoring through the oracle when one is configured, term overlap otherwise.
/// Any oracle failure degrades to overlap; input validation errors never do.
pub(crate) struct SimilarityEngine<'a> {
    oracle: Option<&'a dyn ScoringOracle>,
    quality: OracleQuality,
    question: Option<&'a str>,
}

impl<'a> SimilarityEngine<'a> {
    pub(crate) fn new(oracle: Option<&'a dyn ScoringOracle>, quality: OracleQuality) -> Self {
        Self { oracle, quality, question: None }
    }

    pub(crate) fn with_question(mut self, question: Option<&'a str>) -> Self {
        self.question = question;
        self
    }

    pub(crate) async fn analyze(
        &self,
        key: &str,
        student: &str,
    ) -> Result<SimilarityResult, SimilarityError> {
        let Some(oracle) = self.oracle else {
            return analyze_overlap(key, student);
        };
        let (key_terms, student_terms) = validated_terms(key, student)?;

        match self.semantic(oracle, key, student).await {
            Ok(result) => Ok(result),
            Err(err) => {
                metrics::counter!("similarity_fallback_total", "reason" => err.reason())
                    .increment(1);
                tracing::warn!(error = %err, "Semantic scoring failed, using term overlap");

                let mut result = overlap_from_terms(&key_terms, &student_terms);
                result.fallback_reason = Some(err.to_string());
                Ok(result)
            }
        }
    }

    async fn semantic(
        &self,
        oracle: &dyn ScoringOracle,
        key: &str,
        student: &str,
    ) -> Result<SimilarityResult, OracleError> {
        let request = OracleRequest {
            operation: OracleOperation::SemanticSimilarity,
            quality: self.quality,
            payload: OraclePayload {
                question: self.question.unwrap_or_default().to_string(),
                submission: student.to_string(),
                answer_key: Some(key.to_string()),
                ..OraclePayload::default()
            },
        };

        let response = oracle.grade(&request).await?;
        let assessment = normalize_semantic(response.content)?;
        Ok(semantic_from_assessment(assessment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::oracle::testing::ScriptedOracle;
    use serde_json::json;

    #[test]
    fn worked_example_blends_coverage_and_jaccard() {
        let result = analyze_overlap(
            "mitochondria produce energy via atp synthesis",
            "the mitochondria make atp energy",
        )
        .expect("overlap");

        assert_eq!(result.matched_terms, vec!["mitochondria", "energy", "atp"]);
        assert_eq!(result.missing_terms, vec!["produce", "via", "synthesis"]);
        assert_eq!(result.coverage_percent, Some(50.0));
        assert_eq!(result.jaccard_percent, Some(37.5));
        assert_eq!(result.final_percent, 46.25);
        assert!(result.reasoning.contains("3 of 6 key terms"));
        assert!(result.reasoning.contains("46.25%"));
    }

    #[test]
    fn identical_text_scores_full_marks() {
        let text = "Photosynthesis converts light energy into chemical energy";
        let result = analyze_overlap(text, text).expect("overlap");
        assert_eq!(result.final_percent, 100.0);
        assert!(result.missing_terms.is_empty());
    }

    #[test]
    fn disjoint_text_scores_zero() {
        let result = analyze_overlap("osmosis diffusion membrane", "gravity orbits planets")
            .expect("overlap");
        assert_eq!(result.final_percent, 0.0);
        assert!(result.matched_terms.is_empty());
    }

    #[test]
    fn case_and_punctuation_do_not_change_the_score() {
        let key = "Newton's laws describe force, mass and acceleration.";
        let plain = analyze_overlap(key, "force equals mass times acceleration").unwrap();
        let noisy = analyze_overlap(key, "FORCE -- equals... MASS; times (acceleration)!!").unwrap();
        assert_eq!(plain.final_percent, noisy.final_percent);
        assert_eq!(plain.matched_terms, noisy.matched_terms);
    }

    #[test]
    fn empty_submission_is_an_error_not_a_zero() {
        assert_eq!(
            analyze_overlap("some answer key", "   ").unwrap_err(),
            SimilarityError::EmptySubmission
        );
        assert_eq!(
            analyze_overlap("some answer key", "<p>&nbsp;</p>").unwrap_err(),
            SimilarityError::EmptySubmission
        );
    }

    #[test]
    fn key_without_usable_terms_is_rejected() {
        assert_eq!(analyze_overlap("a an of", "anything here").unwrap_err(), SimilarityError::EmptyKey);
    }

    #[test]
    fn overlap_percent_stays_in_range() {
        let pairs = [
            ("alpha beta gamma", "alpha"),
            ("alpha", "alpha beta gamma delta epsilon"),
            ("one two three four", "four three two one five six seven"),
            ("x y z words here", "ab"),
        ];
        for (key, student) in pairs {
            let result = analyze_overlap(key, student).unwrap();
            assert!((0.0..=100.0).contains(&result.final_percent), "{key} / {student}");
        }
    }

    #[test]
    fn more_coverage_never_lowers_the_score() {
        let key = "cell membrane controls transport";
        let one = analyze_overlap(key, "membrane").unwrap();
        let two = analyze_overlap(key, "membrane transport").unwrap();
        let three = analyze_overlap(key, "membrane transport controls").unwrap();
        assert!(one.final_percent <= two.final_percent);
        assert!(two.final_percent <= three.final_percent);
    }

    #[test]
    fn semantic_percent_counts_partial_matches_at_half_weight() {
        let result = semantic_from_assessment(SemanticAssessment {
            matched_concepts: vec!["a".into(), "b".into()],
            partially_matched_concepts: vec!["c".into()],
            missing_concepts: vec!["d".into()],
            similarity_percent: Some(10.0),
            reasoning: String::from("fine"),
        });
        assert_eq!(result.final_percent, 62.5);
        assert_eq!(result.partial_terms, vec!["c"]);
        assert!(result.reasoning.ends_with("fine"));
    }

    #[test]
    fn semantic_percent_without_concepts_uses_clamped_oracle_value() {
        let result = semantic_from_assessment(SemanticAssessment {
            matched_concepts: Vec::new(),
            partially_matched_concepts: Vec::new(),
            missing_concepts: Vec::new(),
            similarity_percent: Some(130.0),
            reasoning: String::new(),
        });
        assert_eq!(result.final_percent, 100.0);
    }

    #[tokio::test]
    async fn engine_uses_oracle_when_available() {
        let oracle = ScriptedOracle::new(vec![Ok(json!({
            "matched_concepts": ["energy"],
            "partially_matched_concepts": [],
            "missing_concepts": ["synthesis"],
            "reasoning": "half"
        }))]);
        let engine = SimilarityEngine::new(Some(&oracle), OracleQuality::Fast)
            .with_question(Some("What do mitochondria do?"));

        let result = engine.analyze("energy synthesis", "energy").await.expect("analyze");

        assert_eq!(result.method, SimilarityMethod::Semantic);
        assert_eq!(result.final_percent, 50.0);
        let requests = oracle.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].operation, OracleOperation::SemanticSimilarity);
        assert_eq!(requests[0].payload.question, "What do mitochondria do?");
    }

    #[tokio::test]
    async fn engine_falls_back_to_overlap_on_oracle_failure() {
        let oracle = ScriptedOracle::new(vec![Err(OracleError::Timeout)]);
        let engine = SimilarityEngine::new(Some(&oracle), OracleQuality::Balanced);

        let result = engine.analyze("energy synthesis", "energy").await.expect("analyze");

        assert_eq!(result.method, SimilarityMethod::Overlap);
        assert_eq!(result.fallback_reason.as_deref(), Some("oracle request timed out"));
        assert_eq!(result.matched_terms, vec!["energy"]);
    }

    #[tokio::test]
    async fn engine_falls_back_on_malformed_content() {
        let oracle = ScriptedOracle::new(vec![Ok(json!({"verdict": "good"}))]);
        let engine = SimilarityEngine::new(Some(&oracle), OracleQuality::Balanced);

        let result = engine.analyze("energy synthesis", "energy").await.expect("analyze");

        assert_eq!(result.method, SimilarityMethod::Overlap);
        assert!(result.fallback_reason.is_some());
    }

    #[tokio::test]
    async fn engine_validates_before_calling_oracle() {
        let oracle = ScriptedOracle::new(Vec::new());
        let engine = SimilarityEngine::new(Some(&oracle), OracleQuality::Balanced);

        let err = engine.analyze("energy synthesis", "").await.unwrap_err();

        assert_eq!(err, SimilarityError::EmptySubmission);
        assert!(oracle.requests().is_empty());
    }
}
