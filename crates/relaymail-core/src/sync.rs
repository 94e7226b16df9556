//! Domain sync - pushes domain settings to MTA servers and tracks drift

use crate::delivery::{DomainSpec, ServerRegistry};
use crate::error::DispatchError;
use relaymail_storage::{
    DeploymentStatus, Domain, DomainConfig, DomainDeployment, DomainRepository, UpdateDomain,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Domain deployment manager
pub struct DomainSync {
    domains: Arc<dyn DomainRepository>,
    registry: Arc<ServerRegistry>,
}

impl DomainSync {
    pub fn new(domains: Arc<dyn DomainRepository>, registry: Arc<ServerRegistry>) -> Self {
        Self { domains, registry }
    }

    async fn load(&self, name: &str) -> Result<DomainConfig, DispatchError> {
        self.domains
            .get_by_name(name)
            .await?
            .ok_or_else(|| DispatchError::DomainNotFound(name.to_string()))
    }

    /// Push the domain's current settings to one server and record the result
    pub async fn deploy(
        &self,
        domain_name: &str,
        server_name: &str,
    ) -> Result<DomainDeployment, DispatchError> {
        let config = self.load(domain_name).await?;
        let client = self.registry.get(server_name).ok_or_else(|| {
            DispatchError::InvalidRequest(format!("server {} is not configured", server_name))
        })?;

        let domain = &config.domain;
        match client.push_domain(&DomainSpec::from(domain)).await {
            Ok(()) => {
                let deployment = self
                    .domains
                    .upsert_deployment(
                        domain.id,
                        server_name,
                        DeploymentStatus::Deployed,
                        Some(&domain.config_hash),
                        None,
                    )
                    .await?;
                info!(domain = %domain.name, server = %server_name, hash = %domain.config_hash, "Domain deployed");
                Ok(deployment)
            }
            Err(e) => {
                let error_text = e.to_string();
                self.domains
                    .upsert_deployment(
                        domain.id,
                        server_name,
                        DeploymentStatus::Failed,
                        None,
                        Some(&error_text),
                    )
                    .await?;
                warn!(domain = %domain.name, server = %server_name, error = %error_text, "Domain deploy failed");
                Err(DispatchError::ServerFailed {
                    server: server_name.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Remove the domain from one server and drop its deployment row
    pub async fn undeploy(&self, domain_name: &str, server_name: &str) -> Result<bool, DispatchError> {
        let config = self.load(domain_name).await?;
        let client = self.registry.get(server_name).ok_or_else(|| {
            DispatchError::InvalidRequest(format!("server {} is not configured", server_name))
        })?;

        client
            .remove_domain(&config.domain.name)
            .await
            .map_err(|source| DispatchError::ServerFailed {
                server: server_name.to_string(),
                source,
            })?;

        let removed = self
            .domains
            .delete_deployment(config.domain.id, server_name)
            .await?;
        info!(domain = %config.domain.name, server = %server_name, "Domain undeployed");
        Ok(removed)
    }

    /// Persist new settings; deployments carrying an older hash become outdated
    pub async fn update_domain(
        &self,
        domain_name: &str,
        input: UpdateDomain,
    ) -> Result<Domain, DispatchError> {
        let config = self.load(domain_name).await?;
        let domain = self
            .domains
            .update(config.domain.id, input)
            .await?
            .ok_or_else(|| DispatchError::DomainNotFound(domain_name.to_string()))?;

        let outdated = self
            .domains
            .mark_outdated(domain.id, &domain.config_hash)
            .await?;
        if outdated > 0 {
            info!(domain = %domain.name, outdated, "Domain deployments outdated");
        }

        Ok(domain)
    }

    pub async fn get(&self, domain_name: &str) -> Result<DomainConfig, DispatchError> {
        self.load(domain_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMta;
    use pretty_assertions::assert_eq;
    use relaymail_storage::{DeliveryMode, MemoryStore};

    async fn setup(servers: Vec<(&str, Arc<MockMta>)>) -> (Arc<MemoryStore>, DomainSync) {
        let store = Arc::new(MemoryStore::new());
        store.insert_domain(Domain::new("example.com")).await;

        let mut registry = ServerRegistry::new();
        for (name, client) in servers {
            registry.register(name, &format!("http://{}", name), 1, client);
        }
        let sync = DomainSync::new(store.clone(), Arc::new(registry));
        (store, sync)
    }

    #[tokio::test]
    async fn test_deploy_records_hash() {
        let mta = MockMta::ok("a");
        let (_store, sync) = setup(vec![("a", mta.clone())]).await;

        let deployment = sync.deploy("Example.COM", "a").await.unwrap();
        assert_eq!(deployment.status_enum(), Some(DeploymentStatus::Deployed));

        let config = sync.get("example.com").await.unwrap();
        assert_eq!(deployment.deployed_hash.as_deref(), Some(config.domain.config_hash.as_str()));
        assert_eq!(mta.pushed()[0].name, "example.com");
        assert_eq!(config.routable_servers(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_deploy_failure_recorded() {
        let (_store, sync) = setup(vec![("bad", MockMta::failing("refused"))]).await;

        let err = sync.deploy("example.com", "bad").await.unwrap_err();
        assert!(matches!(err, DispatchError::ServerFailed { .. }));

        let config = sync.get("example.com").await.unwrap();
        assert_eq!(config.deployments.len(), 1);
        assert_eq!(config.deployments[0].status_enum(), Some(DeploymentStatus::Failed));
        assert!(config.deployments[0].last_error.as_deref().unwrap().contains("refused"));
        assert!(config.routable_servers().is_empty());
    }

    #[tokio::test]
    async fn test_update_marks_deployments_outdated() {
        let (_store, sync) = setup(vec![("a", MockMta::ok("a")), ("b", MockMta::ok("b"))]).await;
        sync.deploy("example.com", "a").await.unwrap();
        sync.deploy("example.com", "b").await.unwrap();
        let before = sync.get("example.com").await.unwrap().domain.config_hash;

        let updated = sync
            .update_domain(
                "example.com",
                UpdateDomain {
                    delivery_mode: Some(DeliveryMode::Sandbox),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_ne!(updated.config_hash, before);

        let config = sync.get("example.com").await.unwrap();
        assert_eq!(config.outdated_servers(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(config.routable_servers(), vec!["a".to_string(), "b".to_string()]);

        // redeploying clears the re-sync flag for that server only
        sync.deploy("example.com", "b").await.unwrap();
        let config = sync.get("example.com").await.unwrap();
        assert_eq!(config.outdated_servers(), vec!["a".to_string()]);
        assert_eq!(config.deployments[1].status_enum(), Some(DeploymentStatus::Deployed));
    }

    #[tokio::test]
    async fn test_undeploy_and_unknowns() {
        let (_store, sync) = setup(vec![("a", MockMta::ok("a"))]).await;
        sync.deploy("example.com", "a").await.unwrap();

        assert!(sync.undeploy("example.com", "a").await.unwrap());
        assert!(sync.get("example.com").await.unwrap().deployments.is_empty());

        assert!(matches!(
            sync.deploy("missing.test", "a").await,
            Err(DispatchError::DomainNotFound(_))
        ));
        assert!(matches!(
            sync.deploy("example.com", "nope").await,
            Err(DispatchError::InvalidRequest(_))
        ));
    }
}
