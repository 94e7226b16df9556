//! Server registry handlers

use axum::{extract::State, Extension, Json};
use relaymail_core::ServerHealth;
use relaymail_storage::SCOPE_ADMIN;
use serde::Serialize;
use std::sync::Arc;

use super::{check_scope, ApiError};
use crate::auth::{AppState, AuthContext};

#[derive(Debug, Serialize)]
pub struct ServerListResponse {
    pub servers: Vec<ServerHealth>,
}

/// Describe every configured server with a live health probe
///
/// GET /api/v1/servers
pub async fn list_servers(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<ServerListResponse>, ApiError> {
    check_scope(&auth, SCOPE_ADMIN)?;

    Ok(Json(ServerListResponse {
        servers: state.registry.describe_all().await,
    }))
}
