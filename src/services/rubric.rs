use serde::{Deserialize, Serialize};

use crate::db::models::id_string;
use crate::db::types::GradingMethod;
use crate::services::oracle::OracleCriterion;
use crate::services::text::{normalize_label, round2};

/// Snapshot kinds stored on the queue payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RubricKind {
    #[default]
    Rubric,
    RubricRanges,
}

impl RubricKind {
    pub(crate) fn grading_method(self) -> GradingMethod {
        match self {
            Self::Rubric => GradingMethod::Rubric,
            Self::RubricRanges => GradingMethod::RubricRanges,
        }
    }
}

/// Immutable copy of the rubric as it looked when the job was queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RubricSnapshot {
    #[serde(default)]
    pub(crate) kind: RubricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) version: Option<String>,
    pub(crate) criteria: Vec<RubricCriterion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RubricCriterion {
    #[serde(deserialize_with = "id_string")]
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) max_score: f64,
    #[serde(default)]
    pub(crate) levels: Vec<RubricLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RubricLevel {
    #[serde(deserialize_with = "id_string")]
    pub(crate) id: String,
    #[serde(alias = "definition")]
    pub(crate) label: String,
    pub(crate) score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct RubricCriterionScore {
    pub(crate) criterion_id: String,
    pub(crate) name: String,
    pub(crate) score: f64,
    pub(crate) max_score: f64,
    pub(crate) feedback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) level: Option<RubricLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct RubricMapping {
    pub(crate) criteria: Vec<RubricCriterionScore>,
    pub(crate) warnings: Vec<String>,
    pub(crate) calculated_score: f64,
    pub(crate) max_score: f64,
}

impl RubricSnapshot {
    pub(crate) fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub(crate) fn max_score(&self) -> f64 {
        self.criteria.iter().map(|criterion| criterion.max_score.max(0.0)).sum()
    }
}

/// Level whose score equals `score`, else the nearest one. Ties go to the earlier level.
pub(crate) fn level_for_score(levels: &[RubricLevel], score: f64) -> Option<&RubricLevel> {
    if let Some(exact) = levels.iter().find(|level| (level.score - score).abs() < f64::EPSILON) {
        return Some(exact);
    }

    levels.iter().fold(None, |best: Option<&RubricLevel>, level| match best {
        Some(current) if (current.score - score).abs() <= (level.score - score).abs() => Some(current),
        _ => Some(level),
    })
}

fn find_match(
    rubric_name: &str,
    ai_criteria: &[OracleCriterion],
    used: &[bool],
) -> Option<usize> {
    let unused = || ai_criteria.iter().enumerate().filter(|(index, _)| !used[*index]);

    if let Some((index, _)) = unused().find(|(_, item)| normalize_label(&item.name) == rubric_name) {
        return Some(index);
    }

    unused()
        .find(|(_, item)| {
            let ai_name = normalize_label(&item.name);
            !ai_name.is_empty() && rubric_name.contains(&ai_name)
        })
        .map(|(index, _)| index)
}

/// Reconciles free-form criterion scores with the snapshot. Shape mismatches never fail;
/// they only add warnings.
pub(crate) fn map_scores(ai_criteria: &[OracleCriterion], rubric: &RubricSnapshot) -> RubricMapping {
    let mut used = vec![false; ai_criteria.len()];
    let mut warnings = Vec::new();
    let mut criteria = Vec::with_capacity(rubric.criteria.len());

    for criterion in &rubric.criteria {
        let max_score = criterion.max_score.max(0.0);
        let rubric_name = normalize_label(&criterion.name);

        let (score, feedback) = match find_match(&rubric_name, ai_criteria, &used) {
            Some(index) => {
                used[index] = true;
                let item = &ai_criteria[index];
                (clamp_score(item.score, max_score, &criterion.name, &mut warnings), item.feedback.clone())
            }
            None => {
                warnings.push(format!(
                    "Missing criteria: '{}' was not scored by the grader and was awarded 0",
                    criterion.name
                ));
                (0.0, String::new())
            }
        };

        criteria.push(RubricCriterionScore {
            criterion_id: criterion.id.clone(),
            name: criterion.name.clone(),
            score,
            max_score,
            feedback,
            level: level_for_score(&criterion.levels, score).cloned(),
        });
    }

    for (item, _) in ai_criteria.iter().zip(&used).filter(|(_, used)| !**used) {
        warnings.push(format!(
            "Warning: rubric changed; the grader scored '{}', which is not in the rubric snapshot",
            item.name
        ));
    }

    RubricMapping {
        calculated_score: round2(criteria.iter().map(|item| item.score).sum()),
        max_score: round2(criteria.iter().map(|item| item.max_score).sum()),
        criteria,
        warnings,
    }
}

fn clamp_score(score: f64, max_score: f64, name: &str, warnings: &mut Vec<String>) -> f64 {
    if !score.is_finite() {
        warnings.push(format!("Score for '{name}' was not a number and was set to 0"));
        return 0.0;
    }
    if score > max_score {
        warnings.push(format!("Score for '{name}' clamped from {score} to the maximum {max_score}"));
        return max_score;
    }
    if score < 0.0 {
        warnings.push(format!("Score for '{name}' clamped from {score} to 0"));
        return 0.0;
    }
    score
}
