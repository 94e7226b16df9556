//! Domain router - picks an MTA server for a sender domain and fails over

use super::strategy::{select, SelectionState, Strategy};
use crate::delivery::{ClientError, OutboundMessage, ServerRegistry};
use crate::error::DispatchError;
use relaymail_common::config::RoutingConfig;
use relaymail_common::types::sender_domain;
use relaymail_storage::DomainRepository;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Outcome of routing: the chosen primary plus every eligible server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub domain: String,
    pub primary: String,
    /// Eligible servers in deployment order, primary included
    pub servers: Vec<String>,
}

/// A successful delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Server that accepted the message
    pub server_name: String,
    pub remote_message_id: String,
    /// Number of servers tried, the accepting one included
    pub attempts: u32,
}

/// Domain router
pub struct DomainRouter {
    domains: Arc<dyn DomainRepository>,
    registry: Arc<ServerRegistry>,
    config: RoutingConfig,
    state: Mutex<SelectionState>,
}

impl DomainRouter {
    /// Create a new router
    pub fn new(
        domains: Arc<dyn DomainRepository>,
        registry: Arc<ServerRegistry>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            domains,
            registry,
            config,
            state: Mutex::new(SelectionState::new()),
        }
    }

    /// Resolve the sender's domain and choose a primary server.
    ///
    /// `preferred` wins when it names an eligible server.
    pub async fn route(&self, from: &str, preferred: Option<&str>) -> Result<Route, DispatchError> {
        if from.trim().is_empty() {
            return Err(DispatchError::InvalidRequest(
                "sender address is required".to_string(),
            ));
        }
        let domain = sender_domain(from).ok_or_else(|| {
            DispatchError::InvalidRequest(format!("invalid sender address: {}", from))
        })?;

        let config = self
            .domains
            .get_by_name(&domain)
            .await?
            .ok_or_else(|| DispatchError::DomainNotFound(domain.clone()))?;

        let servers: Vec<String> = config
            .routable_servers()
            .into_iter()
            .filter(|name| self.registry.contains(name))
            .collect();
        if servers.is_empty() {
            return Err(DispatchError::NoServersAvailable(domain));
        }

        let primary = match preferred.filter(|p| servers.iter().any(|s| s.as_str() == *p)) {
            Some(name) => name.to_string(),
            None => self.select(&domain, &servers),
        };

        info!(
            domain = %domain,
            server = %primary,
            strategy = %self.config.strategy,
            eligible = servers.len(),
            "Routing decision"
        );

        Ok(Route {
            domain,
            primary,
            servers,
        })
    }

    fn select(&self, domain: &str, servers: &[String]) -> String {
        let strategy = Strategy::for_servers(self.config.strategy, servers, |name| {
            self.registry.weight(name)
        });
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let index = select(&strategy, domain, servers, &mut state).unwrap_or(0);
        servers[index].clone()
    }

    /// Deliver through the route's primary, failing over to alternates.
    ///
    /// Each failover round tries one server not yet tried; the number of
    /// rounds is capped by both `max_retries` and the alternate count.
    pub async fn deliver(
        &self,
        route: &Route,
        message: &OutboundMessage,
    ) -> Result<Delivery, DispatchError> {
        let first_error = match self.attempt(&route.domain, &route.primary, message).await {
            Ok(remote_message_id) => {
                return Ok(Delivery {
                    server_name: route.primary.clone(),
                    remote_message_id,
                    attempts: 1,
                })
            }
            Err(e) => e,
        };

        if !self.config.failover_enabled || route.servers.len() <= 1 {
            return Err(DispatchError::ServerFailed {
                server: route.primary.clone(),
                source: first_error,
            });
        }

        let alternates: Vec<&String> = route
            .servers
            .iter()
            .filter(|s| **s != route.primary)
            .collect();
        let rounds = (self.config.max_retries as usize).min(alternates.len());

        let mut attempts = 1;
        let mut last = first_error;
        for server in alternates.into_iter().take(rounds) {
            attempts += 1;
            info!(
                domain = %route.domain,
                server = %server,
                attempt = attempts,
                "Failing over to alternate server"
            );
            match self.attempt(&route.domain, server, message).await {
                Ok(remote_message_id) => {
                    return Ok(Delivery {
                        server_name: server.clone(),
                        remote_message_id,
                        attempts,
                    })
                }
                Err(e) => last = e,
            }
        }

        Err(DispatchError::AllServersFailed {
            domain: route.domain.clone(),
            attempts,
            last,
        })
    }

    async fn attempt(
        &self,
        domain: &str,
        server: &str,
        message: &OutboundMessage,
    ) -> Result<String, ClientError> {
        let client = self
            .registry
            .get(server)
            .ok_or_else(|| ClientError::Transport(format!("server {} is not registered", server)))?;

        match client.send(message).await {
            Ok(id) => {
                debug!(domain = %domain, server = %server, remote_id = %id, "Delivery attempt succeeded");
                Ok(id)
            }
            Err(e) => {
                warn!(domain = %domain, server = %server, error = %e, "Delivery attempt failed");
                Err(e)
            }
        }
    }

    /// Route and deliver in one call
    pub async fn send(
        &self,
        message: &OutboundMessage,
        preferred: Option<&str>,
    ) -> Result<Delivery, DispatchError> {
        let route = self.route(&message.from, preferred).await?;
        self.deliver(&route, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMta;
    use pretty_assertions::assert_eq;
    use relaymail_common::types::StrategyKind;
    use relaymail_storage::{DeploymentStatus, Domain, MemoryStore};
    use std::collections::HashMap;

    fn message() -> OutboundMessage {
        OutboundMessage {
            from: "News <news@Example.com>".to_string(),
            to: "user@example.org".to_string(),
            reply_to: None,
            subject: "Hi".to_string(),
            html: None,
            text: Some("Hello".to_string()),
            headers: HashMap::new(),
        }
    }

    async fn store_with(domain: &str, servers: &[(&str, DeploymentStatus)]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let domain = Domain::new(domain);
        store.insert_domain(domain.clone()).await;
        for (server, status) in servers {
            store
                .upsert_deployment(domain.id, server, *status, Some(&domain.config_hash), None)
                .await
                .unwrap();
        }
        store
    }

    fn config(strategy: StrategyKind, failover_enabled: bool, max_retries: u32) -> RoutingConfig {
        RoutingConfig {
            strategy,
            failover_enabled,
            max_retries,
        }
    }

    #[tokio::test]
    async fn test_round_robin_over_deployments() {
        let store = store_with(
            "example.com",
            &[("a", DeploymentStatus::Deployed), ("b", DeploymentStatus::Deployed)],
        )
        .await;
        let mut registry = ServerRegistry::new();
        registry.register("a", "http://a", 1, MockMta::ok("a"));
        registry.register("b", "http://b", 1, MockMta::ok("b"));

        let router = DomainRouter::new(
            store,
            Arc::new(registry),
            config(StrategyKind::RoundRobin, true, 2),
        );

        let mut picks = Vec::new();
        for _ in 0..4 {
            picks.push(router.route("news@example.com", None).await.unwrap().primary);
        }
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_failed_and_unregistered_servers_are_not_eligible() {
        let store = store_with(
            "example.com",
            &[
                ("broken", DeploymentStatus::Failed),
                ("unregistered", DeploymentStatus::Deployed),
                ("live", DeploymentStatus::Deployed),
            ],
        )
        .await;
        let mut registry = ServerRegistry::new();
        registry.register("broken", "http://b", 1, MockMta::ok("b"));
        registry.register("live", "http://l", 1, MockMta::ok("l"));

        let router = DomainRouter::new(
            store,
            Arc::new(registry),
            config(StrategyKind::RoundRobin, true, 2),
        );

        for _ in 0..3 {
            let route = router.route("news@example.com", None).await.unwrap();
            assert_eq!(route.servers, vec!["live"]);
            assert_eq!(route.primary, "live");
        }
    }

    #[tokio::test]
    async fn test_outdated_servers_stay_in_rotation() {
        let store = store_with(
            "example.com",
            &[
                ("stale", DeploymentStatus::Outdated),
                ("live", DeploymentStatus::Deployed),
            ],
        )
        .await;
        let mut registry = ServerRegistry::new();
        registry.register("stale", "http://s", 1, MockMta::ok("s"));
        registry.register("live", "http://l", 1, MockMta::ok("l"));

        let router = DomainRouter::new(
            store,
            Arc::new(registry),
            config(StrategyKind::FirstHealthy, true, 2),
        );

        let route = router.route("news@example.com", None).await.unwrap();
        assert_eq!(route.servers, vec!["stale", "live"]);
        assert_eq!(route.primary, "stale");
    }

    #[tokio::test]
    async fn test_route_errors() {
        let store = store_with("example.com", &[("a", DeploymentStatus::Failed)]).await;
        let mut registry = ServerRegistry::new();
        registry.register("a", "http://a", 1, MockMta::ok("a"));
        let router = DomainRouter::new(
            store,
            Arc::new(registry),
            config(StrategyKind::RoundRobin, true, 2),
        );

        assert!(matches!(
            router.route("", None).await,
            Err(DispatchError::InvalidRequest(_))
        ));
        assert!(matches!(
            router.route("no-at-sign", None).await,
            Err(DispatchError::InvalidRequest(_))
        ));
        assert!(matches!(
            router.route("x@unknown.org", None).await,
            Err(DispatchError::DomainNotFound(d)) if d == "unknown.org"
        ));
        assert!(matches!(
            router.route("x@EXAMPLE.com", None).await,
            Err(DispatchError::NoServersAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_preferred_server_honoured_when_eligible() {
        let store = store_with(
            "example.com",
            &[("a", DeploymentStatus::Deployed), ("b", DeploymentStatus::Deployed)],
        )
        .await;
        let mut registry = ServerRegistry::new();
        registry.register("a", "http://a", 1, MockMta::ok("a"));
        registry.register("b", "http://b", 1, MockMta::ok("b"));
        let router = DomainRouter::new(
            store,
            Arc::new(registry),
            config(StrategyKind::FirstHealthy, true, 2),
        );

        let route = router.route("news@example.com", Some("b")).await.unwrap();
        assert_eq!(route.primary, "b");

        let route = router.route("news@example.com", Some("zzz")).await.unwrap();
        assert_eq!(route.primary, "a");
    }

    #[tokio::test]
    async fn test_failover_to_alternate() {
        let store = store_with(
            "example.com",
            &[("bad", DeploymentStatus::Deployed), ("good", DeploymentStatus::Deployed)],
        )
        .await;
        let good = MockMta::ok("good");
        let mut registry = ServerRegistry::new();
        registry.register("bad", "http://bad", 1, MockMta::failing("connection refused"));
        registry.register("good", "http://good", 1, good.clone());

        let router = DomainRouter::new(
            store,
            Arc::new(registry),
            config(StrategyKind::FirstHealthy, true, 1),
        );

        let delivery = router.send(&message(), None).await.unwrap();
        assert_eq!(delivery.server_name, "good");
        assert_eq!(delivery.remote_message_id, "good-1");
        assert_eq!(delivery.attempts, 2);
        assert_eq!(good.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_failover_disabled_returns_primary_error() {
        let store = store_with(
            "example.com",
            &[("bad", DeploymentStatus::Deployed), ("good", DeploymentStatus::Deployed)],
        )
        .await;
        let good = MockMta::ok("good");
        let mut registry = ServerRegistry::new();
        registry.register("bad", "http://bad", 1, MockMta::failing("connection refused"));
        registry.register("good", "http://good", 1, good.clone());

        let router = DomainRouter::new(
            store,
            Arc::new(registry),
            config(StrategyKind::FirstHealthy, false, 2),
        );

        match router.send(&message(), None).await {
            Err(DispatchError::ServerFailed { server, source }) => {
                assert_eq!(server, "bad");
                assert!(matches!(source, ClientError::Transport(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(good.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_single_server_fails_immediately() {
        let store = store_with("example.com", &[("bad", DeploymentStatus::Deployed)]).await;
        let mut registry = ServerRegistry::new();
        registry.register("bad", "http://bad", 1, MockMta::failing("timeout"));
        let router = DomainRouter::new(
            store,
            Arc::new(registry),
            config(StrategyKind::RoundRobin, true, 3),
        );

        assert!(matches!(
            router.send(&message(), None).await,
            Err(DispatchError::ServerFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_failover_rounds_capped_by_max_retries() {
        let store = store_with(
            "example.com",
            &[
                ("s1", DeploymentStatus::Deployed),
                ("s2", DeploymentStatus::Deployed),
                ("s3", DeploymentStatus::Deployed),
                ("s4", DeploymentStatus::Deployed),
            ],
        )
        .await;
        let s4 = MockMta::ok("s4");
        let mut registry = ServerRegistry::new();
        registry.register("s1", "http://1", 1, MockMta::failing("e1"));
        registry.register("s2", "http://2", 1, MockMta::failing("e2"));
        registry.register("s3", "http://3", 1, MockMta::failing("e3"));
        registry.register("s4", "http://4", 1, s4.clone());

        let router = DomainRouter::new(
            store,
            Arc::new(registry),
            config(StrategyKind::FirstHealthy, true, 2),
        );

        match router.send(&message(), None).await {
            Err(DispatchError::AllServersFailed { domain, attempts, last }) => {
                assert_eq!(domain, "example.com");
                assert_eq!(attempts, 3);
                assert_eq!(last.to_string(), "Transport error: e3");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // s4 was beyond the retry budget
        assert_eq!(s4.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_weighted_counter_is_global() {
        let store = store_with(
            "example.com",
            &[("a", DeploymentStatus::Deployed), ("b", DeploymentStatus::Deployed)],
        )
        .await;
        let mut registry = ServerRegistry::new();
        registry.register("a", "http://a", 2, MockMta::ok("a"));
        registry.register("b", "http://b", 1, MockMta::ok("b"));
        let router = DomainRouter::new(
            store,
            Arc::new(registry),
            config(StrategyKind::Weighted, true, 2),
        );

        let mut picks = Vec::new();
        for _ in 0..6 {
            picks.push(router.route("news@example.com", None).await.unwrap().primary);
        }
        assert_eq!(picks, vec!["a", "a", "b", "a", "a", "b"]);
    }
}
