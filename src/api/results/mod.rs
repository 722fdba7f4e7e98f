mod handlers;
mod queries;

use axum::{routing::get, routing::post, Router};

use crate::core::state::AppState;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::list_results))
        .route("/:result_id", get(handlers::get_result))
        .route("/:result_id/release", post(handlers::release_result))
        .route("/:result_id/reject", post(handlers::reject_result))
}
