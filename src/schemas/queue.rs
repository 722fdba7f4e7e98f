use serde::{Deserialize, Deserializer, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::{id_string, AuditEntry, JobPayload, QueueItem};
use crate::db::types::QueueStatus;
use crate::repositories::queue::QueueStats;
use crate::services::rubric::RubricSnapshot;

use super::AuditEntryResponse;

/// Submission event sent by the host when a learner submits.
#[derive(Debug, Deserialize, Validate)]
pub(crate) struct EnqueueRequest {
    #[serde(deserialize_with = "id_string")]
    #[validate(length(min = 1, message = "userid must not be empty"))]
    pub(crate) userid: String,
    #[serde(deserialize_with = "id_string")]
    #[validate(length(min = 1, message = "courseid must not be empty"))]
    pub(crate) courseid: String,
    #[serde(deserialize_with = "id_string")]
    #[validate(length(min = 1, message = "module_instance_id must not be empty"))]
    pub(crate) module_instance_id: String,
    #[validate(length(min = 1, message = "module_name must not be empty"))]
    pub(crate) module_name: String,
    pub(crate) submission_text: String,
    #[serde(default)]
    pub(crate) answer_key: Option<String>,
    #[serde(default)]
    pub(crate) rubric_snapshot: Option<RubricSnapshot>,
    #[validate(range(exclusive_min = 0.0, message = "max_grade must be positive"))]
    pub(crate) max_grade: f64,
    #[serde(default)]
    pub(crate) question: Option<String>,
    #[serde(default)]
    pub(crate) custom_instructions: Option<String>,
    #[serde(default)]
    pub(crate) auto_release: bool,
}

impl EnqueueRequest {
    pub(crate) fn into_payload(self) -> JobPayload {
        JobPayload {
            userid: self.userid,
            courseid: self.courseid,
            module_instance_id: self.module_instance_id,
            module_name: self.module_name,
            submission_text: self.submission_text,
            answer_key: self.answer_key,
            rubric_snapshot: self.rubric_snapshot,
            max_grade: self.max_grade,
            question: self.question,
            custom_instructions: self.custom_instructions,
            auto_release: self.auto_release,
            trace: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct EnqueueResponse {
    pub(crate) queue_id: String,
    pub(crate) status: QueueStatus,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct BatchTriggerRequest {
    #[serde(deserialize_with = "id_string")]
    #[validate(length(min = 1, message = "module_instance_id must not be empty"))]
    pub(crate) module_instance_id: String,
    #[serde(default, deserialize_with = "optional_id_list")]
    pub(crate) user_ids: Option<Vec<String>>,
}

fn optional_id_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Id(#[serde(deserialize_with = "id_string")] String);

    let ids = Option::<Vec<Id>>::deserialize(deserializer)?;
    Ok(ids.map(|ids| ids.into_iter().map(|Id(id)| id).collect()))
}

#[derive(Debug, Serialize)]
pub(crate) struct QueueItemResponse {
    pub(crate) id: String,
    pub(crate) module_instance_id: String,
    pub(crate) user_id: String,
    pub(crate) status: QueueStatus,
    pub(crate) retries: i32,
    pub(crate) next_run_at: Option<String>,
    pub(crate) last_error: Option<String>,
    pub(crate) created_at: String,
    pub(crate) started_at: Option<String>,
    pub(crate) completed_at: Option<String>,
    pub(crate) trace: serde_json::Value,
    pub(crate) audit: Vec<AuditEntryResponse>,
}

impl QueueItemResponse {
    pub(crate) fn from_parts(item: QueueItem, audit: Vec<AuditEntry>) -> Self {
        let trace = item.payload.0.get("trace").cloned().unwrap_or_else(|| serde_json::json!([]));
        Self {
            id: item.id,
            module_instance_id: item.module_instance_id,
            user_id: item.user_id,
            status: item.status,
            retries: item.retries,
            next_run_at: item.next_run_at.map(format_primitive),
            last_error: item.last_error,
            created_at: format_primitive(item.created_at),
            started_at: item.started_at.map(format_primitive),
            completed_at: item.completed_at.map(format_primitive),
            trace,
            audit: audit.into_iter().map(AuditEntryResponse::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueueStatsQuery {
    #[serde(default)]
    pub(crate) module_instance_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct QueueStatsResponse {
    pub(crate) pending: i64,
    pub(crate) processing: i64,
    pub(crate) completed: i64,
    pub(crate) failed: i64,
    pub(crate) total: i64,
    pub(crate) oldest_pending_at: Option<String>,
    pub(crate) average_processing_seconds: Option<f64>,
}

impl From<QueueStats> for QueueStatsResponse {
    fn from(stats: QueueStats) -> Self {
        Self {
            pending: stats.pending,
            processing: stats.processing,
            completed: stats.completed,
            failed: stats.failed,
            total: stats.total,
            oldest_pending_at: stats.oldest_pending_at.map(format_primitive),
            average_processing_seconds: stats
                .average_processing_seconds
                .map(|seconds| (seconds * 100.0).round() / 100.0),
        }
    }
}
