use axum::extract::{Path, Query, State};
use axum::Json;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::pagination::{PaginatedResponse, MAX_LIMIT};
use crate::core::state::AppState;
use crate::repositories;
use crate::schemas::result::{
    RejectRequest, ReleaseRequest, ResultResponse, ResultSummaryResponse, ReviewResponse,
};
use crate::services::review::{self, ReleaseMode};

use super::queries::ListResultsQuery;

pub(super) async fn list_results(
    State(state): State<AppState>,
    Query(params): Query<ListResultsQuery>,
) -> Result<Json<PaginatedResponse<ResultSummaryResponse>>, ApiError> {
    let skip = params.skip.max(0);
    let limit = params.limit.clamp(1, MAX_LIMIT);
    let module_instance_id = params.module_instance_id.as_deref().filter(|id| !id.is_empty());

    let results =
        repositories::results::list(state.db(), module_instance_id, params.status, skip, limit)
            .await
            .map_err(|e| ApiError::internal(e, "Failed to list results"))?;
    let total_count = repositories::results::count(state.db(), module_instance_id, params.status)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to count results"))?;

    Ok(Json(PaginatedResponse {
        items: results.into_iter().map(ResultSummaryResponse::from).collect(),
        total_count,
        skip,
        limit,
    }))
}

pub(super) async fn get_result(
    State(state): State<AppState>,
    Path(result_id): Path<String>,
) -> Result<Json<ResultResponse>, ApiError> {
    let result = repositories::results::find_by_id(state.db(), &result_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load result"))?
        .ok_or_else(|| ApiError::NotFound("Result not found".to_string()))?;
    let criteria = repositories::result_criteria::list_by_result(state.db(), &result.id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load result criteria"))?;
    let audit = repositories::audit::list_for_result(state.db(), &result.id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load result audit log"))?;

    Ok(Json(ResultResponse::from_parts(result, criteria, audit)))
}

pub(super) async fn release_result(
    State(state): State<AppState>,
    Path(result_id): Path<String>,
    Json(payload): Json<ReleaseRequest>,
) -> Result<Json<ReviewResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let outcome = review::release(
        state.db(),
        state.gradebook(),
        &result_id,
        Some(&payload.reviewer_id),
        ReleaseMode::Reviewer,
    )
    .await?;

    Ok(Json(ReviewResponse::new(&outcome.result, Some(outcome.gradebook_synced))))
}

pub(super) async fn reject_result(
    State(state): State<AppState>,
    Path(result_id): Path<String>,
    Json(payload): Json<RejectRequest>,
) -> Result<Json<ReviewResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let reason = payload.reason.as_deref().map(str::trim).filter(|reason| !reason.is_empty());
    let result =
        review::reject(state.db(), state.gradebook(), &result_id, &payload.reviewer_id, reason)
            .await?;

    Ok(Json(ReviewResponse::new(&result, None)))
}
