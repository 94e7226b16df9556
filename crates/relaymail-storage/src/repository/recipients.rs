//! Recipient repository

use crate::db::DatabasePool;
use crate::models::{Page, Recipient};
use async_trait::async_trait;
use relaymail_common::types::RecipientId;
use relaymail_common::{Error, Result};
use uuid::Uuid;

/// Recipient repository trait
#[async_trait]
pub trait RecipientRepository: Send + Sync {
    /// Get a recipient by ID
    async fn get(&self, id: RecipientId) -> Result<Option<Recipient>>;

    /// Page through a recipient list in a stable order
    async fn list_by_list(
        &self,
        recipient_list_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Page<Recipient>>;
}

/// Database recipient repository
pub struct DbRecipientRepository {
    pool: DatabasePool,
}

impl DbRecipientRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientRepository for DbRecipientRepository {
    async fn get(&self, id: RecipientId) -> Result<Option<Recipient>> {
        sqlx::query_as::<_, Recipient>("SELECT * FROM recipients WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_by_list(
        &self,
        recipient_list_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Page<Recipient>> {
        let items = sqlx::query_as::<_, Recipient>(
            r#"
            SELECT * FROM recipients
            WHERE recipient_list_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(recipient_list_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM recipients WHERE recipient_list_id = $1")
                .bind(recipient_list_id)
                .fetch_one(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Page::new(items, total))
    }
}
