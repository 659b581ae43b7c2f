//! HTTP surface for capability token grant, use, and revocation.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;

use crate::core::capability::UseError;
use crate::errors::AppError;
use crate::state::AppState;

use super::parse_snowflake;

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub guild_id: String,
    pub channel_id: String,
    pub requester_id: String,
    pub target_id: String,
    /// Requested lifetime; clamped server-side
    pub ttl_minutes: Option<u64>,
}

/// `POST /capability/grant`
pub async fn grant_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GrantRequest>,
) -> Result<Response, AppError> {
    let guild_id = parse_snowflake(&req.guild_id, "guild_id")?;
    let channel_id = parse_snowflake(&req.channel_id, "channel_id")?;
    let requester_id = parse_snowflake(&req.requester_id, "requester_id")?;
    let target_id = parse_snowflake(&req.target_id, "target_id")?;

    let outcome = state.capabilities.grant(
        guild_id,
        channel_id,
        requester_id,
        target_id,
        req.ttl_minutes.map(|m| Duration::from_secs(m.saturating_mul(60))),
    )?;
    Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
pub struct FrameRequest {
    pub token: String,
    pub mime_type: String,
    pub data_base64: String,
}

/// `POST /capability/frame`
///
/// Always answers with `{accepted, reason}`; rejections add a human
/// `error` string alongside the machine-readable reason.
pub async fn frame_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FrameRequest>,
) -> Result<Response, AppError> {
    let data = BASE64
        .decode(&req.data_base64)
        .map_err(|_| AppError::BadRequest("Invalid base64 frame payload".to_string()))?;

    match state
        .capabilities
        .use_token(&req.token, req.mime_type, data)
        .await
    {
        Ok(()) => Ok(Json(json!({
            "accepted": true,
            "reason": null,
        }))
        .into_response()),
        Err(err) => {
            let status = use_error_status(&err);
            Ok((
                status,
                Json(json!({
                    "accepted": false,
                    "reason": err.reason_code(),
                    "error": err.to_string(),
                })),
            )
                .into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub token: String,
    pub reason: Option<String>,
}

/// `POST /capability/stop`
pub async fn stop_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StopRequest>,
) -> Json<serde_json::Value> {
    let reason = req.reason.as_deref().unwrap_or("requester_stop");
    let revoked = state.capabilities.revoke(&req.token, reason);
    Json(json!({ "revoked": revoked }))
}

fn use_error_status(err: &UseError) -> StatusCode {
    match err {
        UseError::UnknownToken | UseError::Expired => StatusCode::UNAUTHORIZED,
        UseError::RequesterNotPresent | UseError::TargetNotPresent => StatusCode::FORBIDDEN,
        UseError::NotArmed | UseError::SinkRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
}
