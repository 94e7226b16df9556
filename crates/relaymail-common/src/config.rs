//! Configuration for relaymail

use crate::types::StrategyKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "RELAYMAIL_CONFIG";

/// Prefix for environment overrides (`RELAYMAIL__ENGINE__BATCH_SIZE=50`)
pub const ENV_PREFIX: &str = "RELAYMAIL";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Server selection and failover
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Campaign dispatch engine
    #[serde(default)]
    pub engine: EngineConfig,

    /// API rate limiter
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// MTA servers reachable over HTTP
    #[serde(default)]
    pub servers: Vec<MtaServerConfig>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind address for the REST API
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
        }
    }
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// Server selection and failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Selection strategy used when no server is preferred
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Try alternate servers when the selected one fails
    #[serde(default = "default_failover_enabled")]
    pub failover_enabled: bool,

    /// Maximum number of alternate servers tried after the primary
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            failover_enabled: default_failover_enabled(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_failover_enabled() -> bool {
    true
}

fn default_max_retries() -> u32 {
    2
}

/// Dispatch engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between polling ticks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Pending items pulled per job per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Maximum concurrent dispatch units
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Queued items checked against the MTA per tick
    #[serde(default = "default_reconcile_batch_size")]
    pub reconcile_batch_size: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            reconcile_batch_size: default_reconcile_batch_size(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_batch_size() -> i64 {
    100
}

fn default_concurrency() -> usize {
    10
}

fn default_reconcile_batch_size() -> i64 {
    100
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Seconds between sweeps of expired counters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// One MTA server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtaServerConfig {
    /// Unique server name used by deployments and job items
    pub name: String,

    /// Base URL of the MTA HTTP API
    pub url: String,

    /// Bearer token for the MTA API
    pub api_key: Option<String>,

    /// Weight for the weighted selection strategy
    #[serde(default = "default_server_weight")]
    pub weight: u32,

    /// Request timeout in seconds
    #[serde(default = "default_server_timeout")]
    pub timeout_secs: u64,
}

fn default_server_weight() -> u32 {
    1
}

fn default_server_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the first file found plus environment overrides
    pub fn load() -> crate::Result<Self> {
        let mut candidates = Vec::new();
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            candidates.push(PathBuf::from(path));
        }
        candidates.push(PathBuf::from("./relaymail.toml"));
        candidates.push(PathBuf::from("/etc/relaymail/relaymail.toml"));

        let mut builder = config::Config::builder();
        if let Some(path) = candidates.into_iter().find(|p| p.exists()) {
            tracing::info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(crate::Error::Config("Server name must not be empty".to_string()));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(crate::Error::Config(format!(
                    "Duplicate server name: {}",
                    server.name
                )));
            }
        }

        if self.engine.concurrency == 0 {
            return Err(crate::Error::Config(
                "engine.concurrency must be at least 1".to_string(),
            ));
        }
        if self.engine.batch_size <= 0 || self.engine.reconcile_batch_size <= 0 {
            return Err(crate::Error::Config(
                "engine batch sizes must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api.bind, "0.0.0.0:8080");
        assert_eq!(config.routing.strategy, StrategyKind::RoundRobin);
        assert!(config.routing.failover_enabled);
        assert_eq!(config.routing.max_retries, 2);
        assert_eq!(config.engine.batch_size, 100);
        assert_eq!(config.engine.concurrency, 10);
        assert_eq!(config.rate_limit.sweep_interval_secs, 300);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
backend = "postgres"
url = "postgres://localhost/relaymail"

[routing]
strategy = "weighted"
max_retries = 1

[engine]
batch_size = 50

[[servers]]
name = "mta-a"
url = "http://mta-a:8025"
weight = 3

[[servers]]
name = "mta-b"
url = "http://mta-b:8025"
api_key = "secret"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.database.url.as_deref(), Some("postgres://localhost/relaymail"));
        assert_eq!(config.routing.strategy, StrategyKind::Weighted);
        assert_eq!(config.routing.max_retries, 1);
        assert_eq!(config.engine.batch_size, 50);
        assert_eq!(config.engine.concurrency, 10);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].weight, 3);
        assert_eq!(config.servers[1].weight, 1);
        assert_eq!(config.servers[1].timeout_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_server_names_rejected() {
        let toml = r#"
[[servers]]
name = "mta-a"
url = "http://one"

[[servers]]
name = "mta-a"
url = "http://two"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
