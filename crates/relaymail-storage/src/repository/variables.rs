//! Global template variable repository

use crate::db::DatabasePool;
use async_trait::async_trait;
use relaymail_common::{Error, Result};
use std::collections::HashMap;

/// Global variable repository trait
#[async_trait]
pub trait VariableRepository: Send + Sync {
    /// All global variables
    async fn all(&self) -> Result<HashMap<String, String>>;

    /// Create or replace one variable
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Database global variable repository
pub struct DbVariableRepository {
    pool: DatabasePool,
}

impl DbVariableRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VariableRepository for DbVariableRepository {
    async fn all(&self) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM global_variables")
                .fetch_all(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().collect())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO global_variables (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
