//! Domain repository

use crate::db::DatabasePool;
use crate::models::{DeploymentStatus, Domain, DomainConfig, DomainDeployment, Page, UpdateDomain};
use async_trait::async_trait;
use chrono::Utc;
use relaymail_common::types::DomainId;
use relaymail_common::{Error, Result};
use uuid::Uuid;

/// Domain repository trait
#[async_trait]
pub trait DomainRepository: Send + Sync {
    /// Look up a domain and its deployments by (case-folded) name
    async fn get_by_name(&self, name: &str) -> Result<Option<DomainConfig>>;

    /// List domains ordered by name
    async fn list(&self, limit: i64, offset: i64) -> Result<Page<Domain>>;

    /// Apply a settings change and store the new config hash
    async fn update(&self, id: DomainId, input: UpdateDomain) -> Result<Option<Domain>>;

    /// Record the result of pushing a domain to a server
    async fn upsert_deployment(
        &self,
        domain_id: DomainId,
        server_name: &str,
        status: DeploymentStatus,
        deployed_hash: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<DomainDeployment>;

    /// Drop the deployment record for one server
    async fn delete_deployment(&self, domain_id: DomainId, server_name: &str) -> Result<bool>;

    /// Mark deployed rows whose hash differs from `current_hash` as outdated
    async fn mark_outdated(&self, domain_id: DomainId, current_hash: &str) -> Result<u64>;
}

/// Apply an update to a domain row in memory and refresh its hash
pub fn apply_domain_update(domain: &mut Domain, input: UpdateDomain) {
    if let Some(mode) = input.delivery_mode {
        domain.delivery_mode = mode.to_string();
    }
    if let Some(redirect_to) = input.redirect_to {
        domain.redirect_to = redirect_to;
    }
    if let Some(bcc_to) = input.bcc_to {
        domain.bcc_to = bcc_to;
    }
    if let Some(selector) = input.dkim_selector {
        domain.dkim_selector = selector;
    }
    if let Some(enabled) = input.dkim_enabled {
        domain.dkim_enabled = enabled;
    }
    if let Some(limit) = input.rate_limit_per_minute {
        domain.rate_limit_per_minute = limit;
    }
    if let Some(limit) = input.rate_limit_per_hour {
        domain.rate_limit_per_hour = limit;
    }
    domain.config_hash = domain.compute_config_hash();
    domain.updated_at = Utc::now();
}

/// Database domain repository
pub struct DbDomainRepository {
    pool: DatabasePool,
}

impl DbDomainRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn get(&self, id: DomainId) -> Result<Option<Domain>> {
        sqlx::query_as::<_, Domain>("SELECT * FROM domains WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

#[async_trait]
impl DomainRepository for DbDomainRepository {
    async fn get_by_name(&self, name: &str) -> Result<Option<DomainConfig>> {
        let domain = sqlx::query_as::<_, Domain>("SELECT * FROM domains WHERE name = $1")
            .bind(name.to_ascii_lowercase())
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let Some(domain) = domain else {
            return Ok(None);
        };

        let deployments = sqlx::query_as::<_, DomainDeployment>(
            r#"
            SELECT * FROM domain_deployments
            WHERE domain_id = $1
            ORDER BY position ASC, server_name ASC
            "#,
        )
        .bind(domain.id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Some(DomainConfig { domain, deployments }))
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Page<Domain>> {
        let items = sqlx::query_as::<_, Domain>(
            "SELECT * FROM domains ORDER BY name ASC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM domains")
            .fetch_one(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Page::new(items, total))
    }

    async fn update(&self, id: DomainId, input: UpdateDomain) -> Result<Option<Domain>> {
        let Some(mut domain) = self.get(id).await? else {
            return Ok(None);
        };
        apply_domain_update(&mut domain, input);

        sqlx::query_as::<_, Domain>(
            r#"
            UPDATE domains
            SET delivery_mode = $2, redirect_to = $3, bcc_to = $4, dkim_selector = $5,
                dkim_enabled = $6, rate_limit_per_minute = $7, rate_limit_per_hour = $8,
                config_hash = $9, updated_at = $10
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&domain.delivery_mode)
        .bind(&domain.redirect_to)
        .bind(&domain.bcc_to)
        .bind(&domain.dkim_selector)
        .bind(domain.dkim_enabled)
        .bind(domain.rate_limit_per_minute)
        .bind(domain.rate_limit_per_hour)
        .bind(&domain.config_hash)
        .bind(domain.updated_at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn upsert_deployment(
        &self,
        domain_id: DomainId,
        server_name: &str,
        status: DeploymentStatus,
        deployed_hash: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<DomainDeployment> {
        let deployed_at = (status == DeploymentStatus::Deployed).then(Utc::now);

        // New rows go to the end of the domain's server order
        sqlx::query_as::<_, DomainDeployment>(
            r#"
            INSERT INTO domain_deployments
                (id, domain_id, server_name, status, deployed_hash, position, last_error, deployed_at)
            VALUES (
                $1, $2, $3, $4, $5,
                (SELECT COALESCE(MAX(position) + 1, 0) FROM domain_deployments WHERE domain_id = $2),
                $6, $7
            )
            ON CONFLICT (domain_id, server_name) DO UPDATE
            SET status = EXCLUDED.status,
                deployed_hash = COALESCE(EXCLUDED.deployed_hash, domain_deployments.deployed_hash),
                last_error = EXCLUDED.last_error,
                deployed_at = COALESCE(EXCLUDED.deployed_at, domain_deployments.deployed_at)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(domain_id)
        .bind(server_name)
        .bind(status.to_string())
        .bind(deployed_hash)
        .bind(last_error)
        .bind(deployed_at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn delete_deployment(&self, domain_id: DomainId, server_name: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM domain_deployments WHERE domain_id = $1 AND server_name = $2",
        )
        .bind(domain_id)
        .bind(server_name)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_outdated(&self, domain_id: DomainId, current_hash: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE domain_deployments
            SET status = 'outdated'
            WHERE domain_id = $1
              AND status = 'deployed'
              AND deployed_hash IS DISTINCT FROM $2
            "#,
        )
        .bind(domain_id)
        .bind(current_hash)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
