//! API request handlers

pub mod domains;
pub mod health;
pub mod jobs;
pub mod send;
pub mod servers;

pub use health::*;

use axum::{http::StatusCode, Json};
use relaymail_core::{DispatchError, JobError, RemainingQuota};
use serde::Serialize;
use tracing::error;

use crate::auth::{require_scope, AuthContext};

/// Error response
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    /// Quota left, on rate-limit rejections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<RemainingQuota>,
}

/// Handler error: status plus JSON body
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: message.into(),
            remaining: None,
        }),
    )
}

fn status_from(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

impl From<DispatchError> for ErrorResponse {
    fn from(e: DispatchError) -> Self {
        Self {
            error: e.code().to_string(),
            message: e.to_string(),
            remaining: None,
        }
    }
}

pub(crate) fn dispatch_error(e: DispatchError) -> ApiError {
    let status = status_from(e.status_code());
    if status.is_server_error() {
        error!("Request failed: {}", e);
    }
    (status, Json(ErrorResponse::from(e)))
}

pub(crate) fn job_error(e: JobError) -> ApiError {
    let status = status_from(e.status_code());
    if status.is_server_error() {
        error!("Job request failed: {}", e);
    }
    api_error(status, e.code(), e.to_string())
}

pub(crate) fn check_scope(auth: &AuthContext, scope: &str) -> Result<(), ApiError> {
    require_scope(auth, scope).map_err(|status| {
        api_error(
            status,
            "FORBIDDEN",
            format!("API key lacks the '{}' scope", scope),
        )
    })
}
