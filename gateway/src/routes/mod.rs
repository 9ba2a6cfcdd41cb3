pub mod api;

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::api::health_check;
use crate::state::AppState;

/// Full application router: public health check plus the `/api` surface.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(api::create_api_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
