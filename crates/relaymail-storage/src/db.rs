//! PostgreSQL pool and embedded migrations

use relaymail_common::config::DatabaseConfig;
use relaymail_common::{Error, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::{Duration, Instant};
use tracing::{debug, info};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Shared connection pool handed to every `Db*` repository
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Connect using the `[database]` section; only the postgres backend has a pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = connection_url(config)?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect: {}", e)))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;

        info!(known = MIGRATOR.iter().count(), "Schema is up to date");
        Ok(())
    }

    /// Round-trip a trivial query and report how long it took
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Ping failed: {}", e)))?;

        let elapsed = start.elapsed();
        debug!(latency_ms = elapsed.as_millis() as u64, "Database ping");
        Ok(elapsed)
    }
}

fn connection_url(config: &DatabaseConfig) -> Result<&str> {
    if config.backend != "postgres" {
        return Err(Error::Config(format!(
            "Backend {} has no connection pool",
            config.backend
        )));
    }

    config
        .url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| Error::Config("database.url is required for postgres".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_requires_a_url() {
        let config = DatabaseConfig {
            url: Some("postgres://localhost/relaymail".to_string()),
            ..Default::default()
        };
        assert_eq!(
            connection_url(&config).unwrap(),
            "postgres://localhost/relaymail"
        );

        assert!(connection_url(&DatabaseConfig::default()).is_err());

        let blank = DatabaseConfig {
            url: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(connection_url(&blank).is_err());
    }

    #[test]
    fn memory_backend_has_no_pool() {
        let config = DatabaseConfig {
            backend: "memory".to_string(),
            url: Some("postgres://ignored".to_string()),
            ..Default::default()
        };
        assert!(matches!(connection_url(&config), Err(Error::Config(_))));
    }
}
