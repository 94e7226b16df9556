//! Server registry - named MTA clients in configuration order

use super::client::{ClientError, HttpMtaClient, MtaClient};
use relaymail_common::config::MtaServerConfig;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

struct ServerEntry {
    name: String,
    url: String,
    weight: u32,
    client: Arc<dyn MtaClient>,
}

/// Health of one server as seen by a live probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerHealth {
    pub name: String,
    pub url: String,
    pub weight: u32,
    pub healthy: bool,
    pub error: Option<String>,
}

/// Registry of configured MTA servers
#[derive(Default)]
pub struct ServerRegistry {
    servers: Vec<ServerEntry>,
}

impl ServerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build HTTP clients for every `[[servers]]` entry
    pub fn from_config(servers: &[MtaServerConfig]) -> Result<Self, ClientError> {
        let mut registry = Self::new();
        for server in servers {
            let client = HttpMtaClient::new(server)?;
            registry.register(&server.name, &server.url, server.weight, Arc::new(client));
        }
        info!("Registered {} MTA servers", registry.servers.len());
        Ok(registry)
    }

    /// Add a server; a later registration under the same name replaces the earlier one
    pub fn register(&mut self, name: &str, url: &str, weight: u32, client: Arc<dyn MtaClient>) {
        let entry = ServerEntry {
            name: name.to_string(),
            url: url.to_string(),
            weight,
            client,
        };
        match self.servers.iter_mut().find(|s| s.name == name) {
            Some(existing) => *existing = entry,
            None => self.servers.push(entry),
        }
    }

    /// Client for a named server
    pub fn get(&self, name: &str) -> Option<Arc<dyn MtaClient>> {
        self.servers
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.client.clone())
    }

    /// Whether a server of that name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.servers.iter().any(|s| s.name == name)
    }

    /// Server names in configuration order
    pub fn names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    /// Weight of a named server; unknown servers weigh 1
    pub fn weight(&self, name: &str) -> u32 {
        self.servers
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.weight)
            .unwrap_or(1)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Probe every server concurrently, reporting in configuration order
    pub async fn describe_all(&self) -> Vec<ServerHealth> {
        let mut probes = JoinSet::new();
        for (index, server) in self.servers.iter().enumerate() {
            let client = server.client.clone();
            probes.spawn(async move { (index, client.health().await) });
        }

        let mut results: Vec<Option<Result<(), ClientError>>> = vec![None; self.servers.len()];
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => debug!("Health probe task failed: {}", e),
            }
        }

        self.servers
            .iter()
            .zip(results)
            .map(|(server, result)| {
                let error = match result {
                    Some(Ok(())) => None,
                    Some(Err(e)) => Some(e.to_string()),
                    None => Some("health probe aborted".to_string()),
                };
                ServerHealth {
                    name: server.name.clone(),
                    url: server.url.clone(),
                    weight: server.weight,
                    healthy: error.is_none(),
                    error,
                }
            })
            .collect()
    }
}
