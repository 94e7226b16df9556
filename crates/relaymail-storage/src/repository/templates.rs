//! Template repository

use crate::db::DatabasePool;
use crate::models::Template;
use async_trait::async_trait;
use relaymail_common::types::TemplateId;
use relaymail_common::{Error, Result};

/// Template repository trait
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn get(&self, id: TemplateId) -> Result<Option<Template>>;
    async fn get_by_name(&self, name: &str) -> Result<Option<Template>>;
}

/// Database template repository
pub struct DbTemplateRepository {
    pool: DatabasePool,
}

impl DbTemplateRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for DbTemplateRepository {
    async fn get(&self, id: TemplateId) -> Result<Option<Template>> {
        sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Template>> {
        sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE name = $1")
            .bind(name)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}
