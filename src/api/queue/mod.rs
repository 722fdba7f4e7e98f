mod handlers;

use axum::{routing::get, routing::post, Router};

use crate::core::state::AppState;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(handlers::enqueue_submission))
        .route("/batch", post(handlers::trigger_batch))
        .route("/stats", get(handlers::queue_stats))
        .route("/:queue_id", get(handlers::get_queue_item))
}
