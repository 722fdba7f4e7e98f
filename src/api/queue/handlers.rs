use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::redis::batch_rate_key;
use crate::core::state::AppState;
use crate::db::types::QueueStatus;
use crate::repositories;
use crate::schemas::queue::{
    BatchTriggerRequest, EnqueueRequest, EnqueueResponse, QueueItemResponse, QueueStatsQuery,
    QueueStatsResponse,
};
use crate::services::enqueue::{self, BatchSummary, EnqueueOutcome};

pub(super) async fn enqueue_submission(
    State(state): State<AppState>,
    Json(payload): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    match enqueue::enqueue(state.db(), &payload.into_payload()).await? {
        EnqueueOutcome::Queued { queue_id } => Ok((
            StatusCode::ACCEPTED,
            Json(EnqueueResponse { queue_id, status: QueueStatus::Pending }),
        )),
        EnqueueOutcome::AlreadyGraded { result_id } => Err(ApiError::Conflict(format!(
            "Submission already has result {result_id}"
        ))),
        EnqueueOutcome::AlreadyQueued { queue_id } => {
            Err(ApiError::Conflict(format!("Submission is already queued as {queue_id}")))
        }
    }
}

pub(super) async fn trigger_batch(
    State(state): State<AppState>,
    Json(payload): Json<BatchTriggerRequest>,
) -> Result<Json<BatchSummary>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let api = state.settings().api();
    let allowed = match state
        .redis()
        .rate_limit(
            &batch_rate_key(&payload.module_instance_id),
            api.batch_rate_limit,
            api.batch_rate_window_seconds,
        )
        .await
    {
        Ok(allowed) => allowed,
        Err(err) => {
            tracing::warn!(error = %err, "Batch rate limiter unavailable; allowing request");
            true
        }
    };
    if !allowed {
        return Err(ApiError::TooManyRequests("Too many batch triggers for this module instance"));
    }

    let summary = enqueue::trigger_batch(
        state.db(),
        state.submissions(),
        &payload.module_instance_id,
        payload.user_ids.as_deref(),
    )
    .await?;

    Ok(Json(summary))
}

pub(super) async fn queue_stats(
    State(state): State<AppState>,
    Query(params): Query<QueueStatsQuery>,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    let module_instance_id = params.module_instance_id.as_deref().filter(|id| !id.is_empty());
    let stats = repositories::queue::stats(state.db(), module_instance_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load queue stats"))?;

    Ok(Json(stats.into()))
}

pub(super) async fn get_queue_item(
    State(state): State<AppState>,
    Path(queue_id): Path<String>,
) -> Result<Json<QueueItemResponse>, ApiError> {
    let item = repositories::queue::find_by_id(state.db(), &queue_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load queue item"))?
        .ok_or_else(|| ApiError::NotFound("Queue item not found".to_string()))?;
    let audit = repositories::audit::list_for_queue(state.db(), &item.id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load queue audit log"))?;

    Ok(Json(QueueItemResponse::from_parts(item, audit)))
}
