use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::handlers::{api, broadcasts, calls};
use crate::state::AppState;

/// Create the API router
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/call", post(calls::place_call))
        .route(
            "/api/call/{call_id}",
            get(calls::get_call).delete(calls::cancel_call),
        )
        .route("/api/broadcast", post(broadcasts::start_broadcast))
        .route("/api/broadcasts", get(broadcasts::list_broadcasts))
        .route("/api/broadcasts/{broadcast_id}", get(broadcasts::get_broadcast))
        .route("/api/call_history", get(api::call_history))
        .route("/api/groups", get(api::list_groups).post(api::create_group))
        .route("/api/stats", get(api::engine_stats))
}
