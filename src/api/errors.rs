use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::enqueue::EnqueueError;
use crate::services::review::ReviewError;
use crate::services::submission_source::SourceError;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests(&'static str),
    BadGateway(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }

    fn parts(self) -> (StatusCode, String) {
        match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::TooManyRequests(message) => {
                (StatusCode::TOO_MANY_REQUESTS, message.to_string())
            }
            ApiError::BadGateway(message) => {
                tracing::warn!(error = %message, "Upstream request failed");
                (StatusCode::BAD_GATEWAY, message)
            }
            ApiError::ServiceUnavailable(message) => {
                tracing::error!(error = %message, "Service unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, message)
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = self.parts();
        (status, Json(ErrorResponse { status: status.as_u16(), detail })).into_response()
    }
}

impl From<ReviewError> for ApiError {
    fn from(err: ReviewError) -> Self {
        match err {
            ReviewError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ReviewError::IllegalTransition { .. } => ApiError::Conflict(err.to_string()),
            ReviewError::Database(err) => ApiError::internal(err, "Failed to update result"),
        }
    }
}

impl From<EnqueueError> for ApiError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::Invalid(message) => ApiError::BadRequest(message),
            EnqueueError::Database(err) => ApiError::internal(err, "Failed to enqueue submission"),
        }
    }
}

impl From<SourceError> for ApiError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotConfigured => ApiError::ServiceUnavailable(err.to_string()),
            other => ApiError::BadGateway(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::ResultStatus;

    #[test]
    fn illegal_transition_maps_to_conflict() {
        let err = ApiError::from(ReviewError::IllegalTransition {
            id: "r1".into(),
            from: ResultStatus::Released,
            to: ResultStatus::Rejected,
        });
        let (status, detail) = err.parts();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(detail, "result r1 is already released and cannot become rejected");
    }

    #[test]
    fn source_errors_split_by_cause() {
        let (status, _) = ApiError::from(SourceError::NotConfigured).parts();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) =
            ApiError::from(SourceError::Status { status: 500, body: String::new() }).parts();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }
}
