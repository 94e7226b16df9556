//! Authentication module

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::Response,
};
use relaymail_core::{DomainSync, JobManager, RateLimiter, SendService, ServerRegistry};
use relaymail_storage::{ApiKey, ApiKeyRepository, DatabasePool, Repositories};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub repos: Repositories,
    /// Present for the postgres backend; readiness probes it
    pub db_pool: Option<DatabasePool>,
    pub registry: Arc<ServerRegistry>,
    pub sends: Arc<SendService>,
    pub jobs: Arc<JobManager>,
    pub domains: Arc<DomainSync>,
    pub limiter: Arc<RateLimiter>,
}

/// Authenticated context extracted from API key
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key: ApiKey,
    /// Scopes granted to this API key
    pub scopes: Vec<String>,
}

impl AuthContext {
    /// Check if the authenticated context has a specific scope
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == "*" || s == scope)
    }
}

/// Read the presented key from `Authorization: Bearer` or `X-API-Key`
pub fn extract_api_key(req: &Request) -> Option<&str> {
    let headers = req.headers();
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// Extract the prefix from an API key (first 8 characters)
fn extract_key_prefix(api_key: &str) -> Option<&str> {
    api_key.get(..8)
}

/// Hash an API key for comparison
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify an API key against a stored hash.
///
/// Supports both Argon2 hashes (`$argon2...`) and legacy SHA-256 hex hashes.
fn verify_api_key(api_key: &str, stored_hash: &str) -> bool {
    if stored_hash.starts_with("$argon2") {
        return PasswordHash::new(stored_hash)
            .ok()
            .and_then(|parsed_hash| {
                Argon2::default()
                    .verify_password(api_key.as_bytes(), &parsed_hash)
                    .ok()
            })
            .is_some();
    }

    hash_api_key(api_key) == stored_hash
}

/// Resolve a presented key to its stored record
///
/// Lookup is by the 8-character prefix; every candidate sharing the prefix is
/// hash-checked. Expired keys are rejected even when the hash matches.
async fn authenticate(
    keys: &Arc<dyn ApiKeyRepository>,
    presented: &str,
) -> Result<ApiKey, StatusCode> {
    let Some(prefix) = extract_key_prefix(presented) else {
        warn!("API key too short");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let candidates = keys.find_by_prefix(prefix).await.map_err(|e| {
        error!(prefix, "Storage error while looking up API key: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let Some(key) = candidates
        .into_iter()
        .find(|candidate| verify_api_key(presented, &candidate.key_hash))
    else {
        warn!(prefix, "No API key matches");
        return Err(StatusCode::UNAUTHORIZED);
    };

    if key.is_expired() {
        warn!(key_id = %key.id, "API key has expired");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let touch = keys.clone();
    let key_id = key.id;
    tokio::spawn(async move {
        if let Err(e) = touch.update_last_used(key_id).await {
            error!(%key_id, "Failed to update API key last_used_at: {}", e);
        }
    });

    debug!(key_id = %key.id, name = %key.name, "API key authenticated");
    Ok(key)
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let api_key = extract_api_key(&request).ok_or_else(|| {
        warn!("Missing API key in request to {}", request.uri().path());
        StatusCode::UNAUTHORIZED
    })?;

    let validated_key = authenticate(&state.repos.api_keys, api_key).await?;

    let auth_context = AuthContext {
        scopes: validated_key.scopes_vec(),
        api_key: validated_key,
    };
    request.extensions_mut().insert(auth_context);

    Ok(next.run(request).await)
}

/// Check if the authenticated key has a specific scope
/// Returns an error if scope is missing
pub fn require_scope(auth_context: &AuthContext, scope: &str) -> Result<(), StatusCode> {
    if !auth_context.has_scope(scope) {
        warn!(
            "Scope access denied: API key {} lacks scope '{}'",
            auth_context.api_key.id, scope
        );
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(())
}
