use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{Value, json};

use crate::state::AppState;

/// Health check handler
/// Returns a simple JSON response indicating the server is running
pub async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({
        "status": "OK"
    })))
}

/// Snapshot listing of every live session, for the monitoring layer.
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Value> {
    let sessions = state.sessions.list_snapshots();
    Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}
