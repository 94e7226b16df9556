//! API Key repository

use crate::db::DatabasePool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaymail_common::types::ApiKeyId;
use relaymail_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Scope required for direct sends
pub const SCOPE_SEND: &str = "send";

/// Scope required for job and server administration
pub const SCOPE_ADMIN: &str = "admin";

/// API Key model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: serde_json::Value,
    /// Sender domains this key may use; empty means any
    pub allowed_domains: serde_json::Value,
    /// Zero disables the limit
    pub rate_limit_per_minute: i32,
    /// Zero disables the limit
    pub rate_limit_per_hour: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at < Utc::now())
    }

    /// Get scopes as a vector
    pub fn scopes_vec(&self) -> Vec<String> {
        serde_json::from_value(self.scopes.clone()).unwrap_or_default()
    }

    /// Check if the API key has a specific scope
    pub fn has_scope(&self, scope: &str) -> bool {
        let scopes = self.scopes_vec();
        scopes.iter().any(|s| s == "*" || s == scope)
    }

    /// Get allowed sender domains as a vector
    pub fn allowed_domains_vec(&self) -> Vec<String> {
        serde_json::from_value(self.allowed_domains.clone()).unwrap_or_default()
    }

    /// Whether this key may send from `domain`
    pub fn allows_domain(&self, domain: &str) -> bool {
        let allowed = self.allowed_domains_vec();
        allowed.is_empty() || allowed.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }
}

/// API key repository trait
#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// Find an API key by its prefix (for initial lookup)
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>>;

    /// Update last_used_at timestamp
    async fn update_last_used(&self, id: ApiKeyId) -> Result<()>;
}

/// Database API key repository
pub struct DbApiKeyRepository {
    pool: DatabasePool,
}

impl DbApiKeyRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiKeyRepository for DbApiKeyRepository {
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>> {
        sqlx::query_as::<_, ApiKey>(
            r#"
            SELECT * FROM api_keys
            WHERE key_prefix = $1
              AND (expires_at IS NULL OR expires_at > NOW())
            LIMIT 10
            "#,
        )
        .bind(prefix)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn update_last_used(&self, id: ApiKeyId) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(scopes: serde_json::Value, domains: serde_json::Value) -> ApiKey {
        ApiKey {
            id: uuid::Uuid::new_v4(),
            name: "test".to_string(),
            key_hash: String::new(),
            key_prefix: "rm_test0".to_string(),
            scopes,
            allowed_domains: domains,
            rate_limit_per_minute: 0,
            rate_limit_per_hour: 0,
            expires_at: None,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_scopes() {
        let send_only = key(serde_json::json!(["send"]), serde_json::json!([]));
        assert!(send_only.has_scope(SCOPE_SEND));
        assert!(!send_only.has_scope(SCOPE_ADMIN));

        let wildcard = key(serde_json::json!(["*"]), serde_json::json!([]));
        assert!(wildcard.has_scope(SCOPE_ADMIN));
    }

    #[test]
    fn test_allowed_domains() {
        let any = key(serde_json::json!(["send"]), serde_json::json!([]));
        assert!(any.allows_domain("example.com"));

        let restricted = key(serde_json::json!(["send"]), serde_json::json!(["Example.com"]));
        assert!(restricted.allows_domain("example.com"));
        assert!(!restricted.allows_domain("other.org"));
    }

    #[test]
    fn test_expiry() {
        let mut k = key(serde_json::json!([]), serde_json::json!([]));
        assert!(!k.is_expired());
        k.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(k.is_expired());
    }
}
