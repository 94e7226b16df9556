//! Direct send handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use relaymail_core::{SendRequest, SendResponse};
use relaymail_storage::{SendRecord, SCOPE_ADMIN, SCOPE_SEND};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::{api_error, check_scope, dispatch_error, ApiError, ErrorResponse};
use crate::auth::{AppState, AuthContext};

/// Send record response
#[derive(Debug, Serialize)]
pub struct SendRecordResponse {
    pub id: Uuid,
    pub from_address: String,
    pub to_address: String,
    pub domain: String,
    pub server_name: String,
    pub status: String,
    pub remote_message_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SendRecord> for SendRecordResponse {
    fn from(s: SendRecord) -> Self {
        Self {
            id: s.id,
            from_address: s.from_address,
            to_address: s.to_address,
            domain: s.domain,
            server_name: s.server_name,
            status: s.status,
            remote_message_id: s.remote_message_id,
            last_error: s.last_error,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

/// Send one message now
///
/// POST /api/v1/send
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<SendRequest>,
) -> Result<(StatusCode, Json<SendResponse>), ApiError> {
    check_scope(&auth, SCOPE_SEND)?;

    let key = &auth.api_key;
    let per_minute = key.rate_limit_per_minute.max(0) as u32;
    let per_hour = key.rate_limit_per_hour.max(0) as u32;
    let limiter_key = key.id.to_string();

    if !state.limiter.allow(&limiter_key, per_minute, per_hour) {
        warn!(api_key = %key.id, "Send rejected by rate limit");
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse {
                error: "RATE_LIMIT_EXCEEDED".to_string(),
                message: "Rate limit exceeded for this API key".to_string(),
                remaining: Some(state.limiter.remaining(&limiter_key, per_minute, per_hour)),
            }),
        ));
    }

    let response = state
        .sends
        .send_now(input, Some(key))
        .await
        .map_err(dispatch_error)?;

    Ok((StatusCode::OK, Json(response)))
}

/// Get a send record
///
/// GET /api/v1/sends/:id
pub async fn get_send(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<SendRecordResponse>, ApiError> {
    check_scope(&auth, SCOPE_SEND)?;

    let record = state
        .sends
        .get(id)
        .await
        .map_err(dispatch_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "Send not found"))?;

    // keys only see their own sends unless they are admins
    if record.api_key_id != Some(auth.api_key.id) && !auth.has_scope(SCOPE_ADMIN) {
        return Err(api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "Send not found"));
    }

    Ok(Json(SendRecordResponse::from(record)))
}
