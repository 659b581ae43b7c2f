use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::core::capability::{GrantError, UseError};
use crate::core::session::SessionError;

/// Application error type
#[derive(Debug)]
pub enum AppError {
    InternalServerError(String),
    BadRequest(String),
    NotFound(String),
    /// Capability rejection with a machine-readable reason code
    Capability {
        status: StatusCode,
        reason: &'static str,
        message: String,
    },
}

impl AppError {
    fn parts(&self) -> (StatusCode, Option<&'static str>, String) {
        match self {
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal server error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    None,
                    "Internal server error".to_string(),
                )
            }
            AppError::BadRequest(msg) => {
                tracing::warn!("Bad request: {msg}");
                (StatusCode::BAD_REQUEST, None, msg.clone())
            }
            AppError::NotFound(msg) => {
                tracing::warn!("Not found: {msg}");
                (StatusCode::NOT_FOUND, None, msg.clone())
            }
            AppError::Capability {
                status,
                reason,
                message,
            } => {
                tracing::warn!("Capability rejection ({reason}): {message}");
                (*status, Some(reason), message.clone())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, reason, message) = self.parts();
        let mut body = json!({
            "error": message,
            "status": status.as_u16(),
        });
        if let Some(reason) = reason {
            body["reason"] = json!(reason);
        }
        (status, Json(body)).into_response()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InternalServerError(msg) => write!(f, "Internal server error: {msg}"),
            AppError::BadRequest(msg) => write!(f, "Bad request: {msg}"),
            AppError::NotFound(msg) => write!(f, "Not found: {msg}"),
            AppError::Capability {
                reason, message, ..
            } => write!(f, "Capability rejection ({reason}): {message}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<GrantError> for AppError {
    fn from(err: GrantError) -> Self {
        AppError::Capability {
            status: StatusCode::FORBIDDEN,
            reason: err.reason_code(),
            message: err.to_string(),
        }
    }
}

impl From<UseError> for AppError {
    fn from(err: UseError) -> Self {
        let status = match err {
            UseError::UnknownToken | UseError::Expired => StatusCode::UNAUTHORIZED,
            UseError::RequesterNotPresent | UseError::TargetNotPresent => StatusCode::FORBIDDEN,
            UseError::NotArmed | UseError::SinkRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        AppError::Capability {
            status,
            reason: err.reason_code(),
            message: err.to_string(),
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(guild) => {
                AppError::NotFound(format!("No session for guild {guild}"))
            }
            other => AppError::InternalServerError(other.to_string()),
        }
    }
}

// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;
