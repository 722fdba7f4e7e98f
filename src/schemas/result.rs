use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::{AuditEntry, GradingResult, ResultCriterion};
use crate::db::types::{GradingMethod, ResultStatus};
use crate::services::grading::stored_highlights;

use super::AuditEntryResponse;

#[derive(Debug, Serialize)]
pub(crate) struct CriterionResponse {
    pub(crate) criterion_id: String,
    pub(crate) name: String,
    pub(crate) score: f64,
    pub(crate) max_score: f64,
    pub(crate) level: Option<String>,
    pub(crate) feedback: Option<String>,
}

impl From<ResultCriterion> for CriterionResponse {
    fn from(criterion: ResultCriterion) -> Self {
        Self {
            criterion_id: criterion.criterion_id,
            name: criterion.name,
            score: criterion.score,
            max_score: criterion.max_score,
            level: criterion.level_label,
            feedback: criterion.feedback,
        }
    }
}

/// Result as review UIs and the external API see it.
#[derive(Debug, Serialize)]
pub(crate) struct ResultResponse {
    pub(crate) id: String,
    pub(crate) queue_id: String,
    pub(crate) module_instance_id: String,
    pub(crate) user_id: String,
    pub(crate) course_id: String,
    pub(crate) grade: f64,
    pub(crate) max_grade: f64,
    pub(crate) status: ResultStatus,
    pub(crate) method: GradingMethod,
    pub(crate) reasoning: String,
    pub(crate) confidence: f64,
    pub(crate) strengths: Vec<String>,
    pub(crate) improvements: Vec<String>,
    pub(crate) criteria: Vec<CriterionResponse>,
    pub(crate) reviewed: bool,
    pub(crate) reviewer_id: Option<String>,
    pub(crate) reject_reason: Option<String>,
    pub(crate) gradebook_synced: bool,
    pub(crate) created_at: String,
    pub(crate) reviewed_at: Option<String>,
    pub(crate) analysis: serde_json::Value,
    pub(crate) audit: Vec<AuditEntryResponse>,
}

impl ResultResponse {
    pub(crate) fn from_parts(
        result: GradingResult,
        criteria: Vec<ResultCriterion>,
        audit: Vec<AuditEntry>,
    ) -> Self {
        let (strengths, improvements) = stored_highlights(&result.rubric_analysis.0);
        Self {
            id: result.id,
            queue_id: result.queue_id,
            module_instance_id: result.module_instance_id,
            user_id: result.user_id,
            course_id: result.course_id,
            grade: result.grade,
            max_grade: result.max_grade,
            status: result.status,
            method: result.method,
            reasoning: result.reasoning,
            confidence: result.confidence,
            strengths,
            improvements,
            criteria: criteria.into_iter().map(CriterionResponse::from).collect(),
            reviewed: result.reviewed,
            reviewer_id: result.reviewer_id,
            reject_reason: result.reject_reason,
            gradebook_synced: result.gradebook_synced_at.is_some(),
            created_at: format_primitive(result.created_at),
            reviewed_at: result.reviewed_at.map(format_primitive),
            analysis: result.rubric_analysis.0,
            audit: audit.into_iter().map(AuditEntryResponse::from).collect(),
        }
    }
}

/// Listing row; criteria and analysis are only served by the detail endpoint.
#[derive(Debug, Serialize)]
pub(crate) struct ResultSummaryResponse {
    pub(crate) id: String,
    pub(crate) module_instance_id: String,
    pub(crate) user_id: String,
    pub(crate) grade: f64,
    pub(crate) max_grade: f64,
    pub(crate) status: ResultStatus,
    pub(crate) method: GradingMethod,
    pub(crate) confidence: f64,
    pub(crate) created_at: String,
    pub(crate) reviewed_at: Option<String>,
}

impl From<GradingResult> for ResultSummaryResponse {
    fn from(result: GradingResult) -> Self {
        Self {
            id: result.id,
            module_instance_id: result.module_instance_id,
            user_id: result.user_id,
            grade: result.grade,
            max_grade: result.max_grade,
            status: result.status,
            method: result.method,
            confidence: result.confidence,
            created_at: format_primitive(result.created_at),
            reviewed_at: result.reviewed_at.map(format_primitive),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ReleaseRequest {
    #[validate(length(min = 1, message = "reviewer_id must not be empty"))]
    pub(crate) reviewer_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct RejectRequest {
    #[validate(length(min = 1, message = "reviewer_id must not be empty"))]
    pub(crate) reviewer_id: String,
    #[serde(default)]
    #[validate(length(max = 2000, message = "reason must be at most 2000 characters"))]
    pub(crate) reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ReviewResponse {
    pub(crate) id: String,
    pub(crate) status: ResultStatus,
    pub(crate) reviewer_id: Option<String>,
    pub(crate) reviewed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) gradebook_synced: Option<bool>,
}

impl ReviewResponse {
    pub(crate) fn new(result: &GradingResult, gradebook_synced: Option<bool>) -> Self {
        Self {
            id: result.id.clone(),
            status: result.status,
            reviewer_id: result.reviewer_id.clone(),
            reviewed_at: result.reviewed_at.map(format_primitive),
            gradebook_synced,
        }
    }
}
