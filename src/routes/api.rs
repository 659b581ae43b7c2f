use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{api, capability};
use crate::state::AppState;
use std::sync::Arc;

pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(api::health_check))
        .route("/sessions", get(api::list_sessions))
        .route("/capability/grant", post(capability::grant_handler))
        .route("/capability/frame", post(capability::frame_handler))
        .route("/capability/stop", post(capability::stop_handler))
        .layer(TraceLayer::new_for_http())
}
