//! Direct send repository

use crate::db::DatabasePool;
use crate::models::{NewSend, SendRecord, SendStatus};
use async_trait::async_trait;
use chrono::Utc;
use relaymail_common::types::SendId;
use relaymail_common::{Error, Result};
use uuid::Uuid;

/// Send record repository trait
#[async_trait]
pub trait SendRepository: Send + Sync {
    /// Insert a record in `pending` status
    async fn create(&self, input: NewSend) -> Result<SendRecord>;

    /// Get a send record by ID
    async fn get(&self, id: SendId) -> Result<Option<SendRecord>>;

    /// Move a pending record to its terminal status
    async fn finish(
        &self,
        id: SendId,
        status: SendStatus,
        remote_message_id: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<Option<SendRecord>>;
}

/// Database send repository
pub struct DbSendRepository {
    pool: DatabasePool,
}

impl DbSendRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SendRepository for DbSendRepository {
    async fn create(&self, input: NewSend) -> Result<SendRecord> {
        let now = Utc::now();

        sqlx::query_as::<_, SendRecord>(
            r#"
            INSERT INTO sends (
                id, api_key_id, from_address, to_address, domain, server_name,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.api_key_id)
        .bind(&input.from_address)
        .bind(&input.to_address)
        .bind(&input.domain)
        .bind(&input.server_name)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: SendId) -> Result<Option<SendRecord>> {
        sqlx::query_as::<_, SendRecord>("SELECT * FROM sends WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn finish(
        &self,
        id: SendId,
        status: SendStatus,
        remote_message_id: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<Option<SendRecord>> {
        sqlx::query_as::<_, SendRecord>(
            r#"
            UPDATE sends
            SET status = $2, remote_message_id = $3, last_error = $4, updated_at = $5
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(remote_message_id)
        .bind(last_error)
        .bind(Utc::now())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
