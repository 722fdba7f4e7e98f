use serde::{Deserialize, Deserializer, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::types::{AuditEvent, GradingMethod, QueueStatus, ResultStatus};
use crate::services::rubric::RubricSnapshot;

#[derive(Debug, Clone, FromRow)]
pub(crate) struct QueueItem {
    pub(crate) id: String,
    pub(crate) module_instance_id: String,
    pub(crate) user_id: String,
    pub(crate) status: QueueStatus,
    pub(crate) payload: Json<serde_json::Value>,
    pub(crate) retries: i32,
    pub(crate) next_run_at: Option<PrimitiveDateTime>,
    pub(crate) last_error: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) started_at: Option<PrimitiveDateTime>,
    /// Set on every claim; outcome updates only apply while it still matches.
    pub(crate) claim_token: Option<Uuid>,
    pub(crate) completed_at: Option<PrimitiveDateTime>,
    pub(crate) updated_at: PrimitiveDateTime,
}

/// Submission context carried by a queue item. Stored as JSONB; the worker only ever
/// appends to `trace`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct JobPayload {
    #[serde(deserialize_with = "id_string")]
    pub(crate) userid: String,
    #[serde(deserialize_with = "id_string")]
    pub(crate) courseid: String,
    #[serde(deserialize_with = "id_string")]
    pub(crate) module_instance_id: String,
    pub(crate) module_name: String,
    pub(crate) submission_text: String,
    #[serde(default)]
    pub(crate) answer_key: Option<String>,
    #[serde(default)]
    pub(crate) rubric_snapshot: Option<RubricSnapshot>,
    pub(crate) max_grade: f64,
    #[serde(default)]
    pub(crate) question: Option<String>,
    #[serde(default)]
    pub(crate) custom_instructions: Option<String>,
    #[serde(default)]
    pub(crate) auto_release: bool,
    #[serde(default)]
    pub(crate) trace: Vec<TraceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct TraceEntry {
    pub(crate) at: String,
    pub(crate) event: AuditEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) retries: Option<i32>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub(crate) struct GradingResult {
    pub(crate) id: String,
    pub(crate) queue_id: String,
    pub(crate) module_instance_id: String,
    pub(crate) user_id: String,
    pub(crate) course_id: String,
    pub(crate) grade: f64,
    pub(crate) max_grade: f64,
    pub(crate) reasoning: String,
    pub(crate) confidence: f64,
    pub(crate) method: GradingMethod,
    pub(crate) rubric_analysis: Json<serde_json::Value>,
    pub(crate) status: ResultStatus,
    pub(crate) reviewed: bool,
    pub(crate) reviewer_id: Option<String>,
    pub(crate) reject_reason: Option<String>,
    pub(crate) gradebook_synced_at: Option<PrimitiveDateTime>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) reviewed_at: Option<PrimitiveDateTime>,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub(crate) struct ResultCriterion {
    pub(crate) id: String,
    pub(crate) result_id: String,
    pub(crate) position: i32,
    pub(crate) criterion_id: String,
    pub(crate) name: String,
    pub(crate) score: f64,
    pub(crate) max_score: f64,
    pub(crate) level_id: Option<String>,
    pub(crate) level_label: Option<String>,
    pub(crate) feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub(crate) struct AuditEntry {
    pub(crate) id: i64,
    pub(crate) queue_id: Option<String>,
    pub(crate) result_id: Option<String>,
    pub(crate) event: AuditEvent,
    pub(crate) message: Option<String>,
    pub(crate) details: Json<serde_json::Value>,
    pub(crate) created_at: PrimitiveDateTime,
}

/// Host systems send numeric ids; everything downstream keys on strings.
pub(crate) fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Int(i64),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Text(value) => Ok(value),
        RawId::Int(value) => Ok(value.to_string()),
    }
}
