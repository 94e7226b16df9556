//! Campaign repository

use crate::db::DatabasePool;
use crate::models::{Campaign, CampaignVariant};
use async_trait::async_trait;
use relaymail_common::types::CampaignId;
use relaymail_common::{Error, Result};

/// Campaign repository trait
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    /// Get a campaign by ID
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>>;

    /// Variants of a campaign in creation order
    async fn variants(&self, campaign_id: CampaignId) -> Result<Vec<CampaignVariant>>;
}

/// Database campaign repository
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignRepository for DbCampaignRepository {
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn variants(&self, campaign_id: CampaignId) -> Result<Vec<CampaignVariant>> {
        sqlx::query_as::<_, CampaignVariant>(
            "SELECT * FROM campaign_variants WHERE campaign_id = $1 ORDER BY id ASC",
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
