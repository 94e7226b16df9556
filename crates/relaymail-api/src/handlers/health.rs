//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use relaymail_core::ServerHealth;
use relaymail_storage::DatabasePool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::AppState;

/// Basic health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Unhealthy,
    /// Memory backend, nothing to probe
    Skipped,
}

/// Database check result
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Storage plus a live probe of every configured MTA server
#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    /// "healthy" when storage is usable and at least one server answers, else "degraded"
    pub status: String,
    pub database: ComponentHealth,
    pub servers: Vec<ServerHealth>,
}

async fn database_health(pool: Option<&DatabasePool>) -> ComponentHealth {
    let Some(pool) = pool else {
        return ComponentHealth {
            status: ComponentStatus::Skipped,
            latency_ms: None,
            error: None,
        };
    };

    match pool.ping().await {
        Ok(latency) => ComponentHealth {
            status: ComponentStatus::Healthy,
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
        },
        Err(e) => ComponentHealth {
            status: ComponentStatus::Unhealthy,
            latency_ms: None,
            error: Some(e.to_string()),
        },
    }
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

/// GET /health/live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Ready once storage answers and there is somewhere to send mail
///
/// GET /health/ready
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    let database = database_health(state.db_pool.as_ref()).await;
    if database.status == ComponentStatus::Unhealthy || state.registry.is_empty() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

/// GET /health/detailed
pub async fn health_detailed(State(state): State<Arc<AppState>>) -> Json<DetailedHealthResponse> {
    let (database, servers) = tokio::join!(
        database_health(state.db_pool.as_ref()),
        state.registry.describe_all()
    );

    let healthy =
        database.status != ComponentStatus::Unhealthy && servers.iter().any(|s| s.healthy);
    Json(DetailedHealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        database,
        servers,
    })
}
