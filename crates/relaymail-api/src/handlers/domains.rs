//! Domain deployment handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use relaymail_storage::{DomainConfig, DomainDeployment, UpdateDomain, SCOPE_ADMIN};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::{api_error, check_scope, dispatch_error, ApiError};
use crate::auth::{AppState, AuthContext};

/// Deployment response
#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    pub server_name: String,
    pub status: String,
    pub deployed_hash: Option<String>,
    pub last_error: Option<String>,
    pub deployed_at: Option<DateTime<Utc>>,
}

impl From<DomainDeployment> for DeploymentResponse {
    fn from(d: DomainDeployment) -> Self {
        Self {
            server_name: d.server_name,
            status: d.status,
            deployed_hash: d.deployed_hash,
            last_error: d.last_error,
            deployed_at: d.deployed_at,
        }
    }
}

/// Domain response
#[derive(Debug, Serialize)]
pub struct DomainResponse {
    pub id: Uuid,
    pub name: String,
    pub delivery_mode: String,
    pub redirect_to: Option<String>,
    pub bcc_to: Option<String>,
    pub dkim_selector: Option<String>,
    pub dkim_enabled: bool,
    pub rate_limit_per_minute: i32,
    pub rate_limit_per_hour: i32,
    pub config_hash: String,
    pub deployments: Vec<DeploymentResponse>,
    pub updated_at: DateTime<Utc>,
}

impl From<DomainConfig> for DomainResponse {
    fn from(c: DomainConfig) -> Self {
        let d = c.domain;
        Self {
            id: d.id,
            name: d.name,
            delivery_mode: d.delivery_mode,
            redirect_to: d.redirect_to,
            bcc_to: d.bcc_to,
            dkim_selector: d.dkim_selector,
            dkim_enabled: d.dkim_enabled,
            rate_limit_per_minute: d.rate_limit_per_minute,
            rate_limit_per_hour: d.rate_limit_per_hour,
            config_hash: d.config_hash,
            deployments: c.deployments.into_iter().map(Into::into).collect(),
            updated_at: d.updated_at,
        }
    }
}

/// GET /api/v1/domains/:name
pub async fn get_domain(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Json<DomainResponse>, ApiError> {
    check_scope(&auth, SCOPE_ADMIN)?;

    let config = state.domains.get(&name).await.map_err(dispatch_error)?;
    Ok(Json(DomainResponse::from(config)))
}

/// Update domain settings; deployments with an older hash become outdated
///
/// PATCH /api/v1/domains/:name
pub async fn update_domain(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
    Json(input): Json<UpdateDomain>,
) -> Result<Json<DomainResponse>, ApiError> {
    check_scope(&auth, SCOPE_ADMIN)?;

    state
        .domains
        .update_domain(&name, input)
        .await
        .map_err(dispatch_error)?;
    let config = state.domains.get(&name).await.map_err(dispatch_error)?;
    Ok(Json(DomainResponse::from(config)))
}

/// Push the domain to a server
///
/// POST /api/v1/domains/:name/deployments/:server
pub async fn deploy_domain(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((name, server)): Path<(String, String)>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    check_scope(&auth, SCOPE_ADMIN)?;

    let deployment = state
        .domains
        .deploy(&name, &server)
        .await
        .map_err(dispatch_error)?;
    Ok(Json(DeploymentResponse::from(deployment)))
}

/// Remove the domain from a server
///
/// DELETE /api/v1/domains/:name/deployments/:server
pub async fn undeploy_domain(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((name, server)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    check_scope(&auth, SCOPE_ADMIN)?;

    let removed = state
        .domains
        .undeploy(&name, &server)
        .await
        .map_err(dispatch_error)?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{} is not deployed to {}", name, server),
        ))
    }
}
