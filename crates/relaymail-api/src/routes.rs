//! API routes

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{auth_middleware, AppState};
use crate::handlers::{domains, health, jobs, send, servers};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    // Health check routes (no auth required)
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness))
        .route("/detailed", get(health::health_detailed))
        .with_state(state.clone());

    // Job routes
    let job_routes = Router::new()
        .route("/", get(jobs::list_jobs).post(jobs::create_job))
        .route("/:id", get(jobs::get_job))
        .route("/:id/pause", post(jobs::pause_job))
        .route("/:id/resume", post(jobs::resume_job))
        .route("/:id/cancel", post(jobs::cancel_job))
        .route("/:id/retry", post(jobs::retry_job));

    // Domain routes
    let domain_routes = Router::new()
        .route("/:name", get(domains::get_domain).patch(domains::update_domain))
        .route(
            "/:name/deployments/:server",
            post(domains::deploy_domain).delete(domains::undeploy_domain),
        );

    // API v1 routes with authentication
    let api_v1 = Router::new()
        .route("/send", post(send::send_message))
        .route("/sends/:id", get(send::get_send))
        .route("/servers", get(servers::list_servers))
        .nest("/jobs", job_routes)
        .nest("/domains", domain_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state.clone());

    Router::new()
        .nest("/health", health_routes)
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_api_key;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use relaymail_common::config::RoutingConfig;
    use relaymail_common::types::StrategyKind;
    use relaymail_core::delivery::{ClientError, DomainSpec, OutboundMessage, RemoteStatus};
    use relaymail_core::{
        ContentResolver, DomainRouter, DomainSync, JobManager, MtaClient, RateLimiter,
        SendService, ServerRegistry,
    };
    use relaymail_storage::{
        ApiKey, Campaign, DeploymentStatus, Domain, DomainRepository, MemoryStore, Recipient,
        Repositories,
    };
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const SEND_KEY: &str = "rm_send_0123456789";
    const ADMIN_KEY: &str = "rm_admn_0123456789";

    struct AcceptAll {
        count: AtomicUsize,
    }

    #[async_trait]
    impl MtaClient for AcceptAll {
        async fn send(&self, _message: &OutboundMessage) -> Result<String, ClientError> {
            let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("mta-{}", n))
        }

        async fn status(&self, _remote_id: &str) -> Result<RemoteStatus, ClientError> {
            Ok(RemoteStatus {
                status: "queued".to_string(),
                last_error: None,
            })
        }

        async fn health(&self) -> Result<(), ClientError> {
            Ok(())
        }

        async fn push_domain(&self, _domain: &DomainSpec) -> Result<(), ClientError> {
            Ok(())
        }

        async fn remove_domain(&self, _name: &str) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn api_key(raw: &str, scopes: &[&str], per_minute: i32) -> ApiKey {
        ApiKey {
            id: uuid::Uuid::new_v4(),
            name: raw[..7].to_string(),
            key_hash: hash_api_key(raw),
            key_prefix: raw[..8].to_string(),
            scopes: json!(scopes),
            allowed_domains: json!([]),
            rate_limit_per_minute: per_minute,
            rate_limit_per_hour: 0,
            expires_at: None,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    struct TestApp {
        router: Router,
        store: Arc<MemoryStore>,
    }

    async fn app() -> TestApp {
        let store = Arc::new(MemoryStore::new());
        store.insert_api_key(api_key(SEND_KEY, &["send"], 2)).await;
        store.insert_api_key(api_key(ADMIN_KEY, &["admin"], 0)).await;

        let domain = Domain::new("example.com");
        store.insert_domain(domain.clone()).await;
        store
            .upsert_deployment(
                domain.id,
                "mta1",
                DeploymentStatus::Deployed,
                Some(&domain.config_hash),
                None,
            )
            .await
            .unwrap();

        let mut registry = ServerRegistry::new();
        registry.register(
            "mta1",
            "http://mta1",
            1,
            Arc::new(AcceptAll {
                count: AtomicUsize::new(0),
            }),
        );
        let registry = Arc::new(registry);

        let repos = Repositories::memory(store.clone());
        let resolver = Arc::new(ContentResolver::new(
            repos.templates.clone(),
            repos.variables.clone(),
        ));
        let router = Arc::new(DomainRouter::new(
            repos.domains.clone(),
            registry.clone(),
            RoutingConfig {
                strategy: StrategyKind::RoundRobin,
                failover_enabled: true,
                max_retries: 2,
            },
        ));

        let state = AppState {
            sends: Arc::new(SendService::new(repos.sends.clone(), resolver, router)),
            jobs: Arc::new(JobManager::new(&repos, registry.clone(), StrategyKind::RoundRobin)),
            domains: Arc::new(DomainSync::new(repos.domains.clone(), registry.clone())),
            limiter: Arc::new(RateLimiter::new()),
            db_pool: None,
            registry,
            repos,
        };

        TestApp {
            router: create_router(state),
            store,
        }
    }

    async fn call(
        app: &TestApp,
        method: &str,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("authorization", format!("Bearer {}", key));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn send_body() -> Value {
        json!({
            "from": "news@example.com",
            "to": "ann@example.org",
            "subject": "Hello",
            "text": "Body"
        })
    }

    #[tokio::test]
    async fn test_health_needs_no_key() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, _) = call(&app, "GET", "/health/ready", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_requires_valid_key() {
        let app = app().await;

        let (status, _) = call(&app, "GET", "/api/v1/servers", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) =
            call(&app, "GET", "/api/v1/servers", Some("rm_admn_wrong"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&app, "GET", "/api/v1/servers", Some(SEND_KEY), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "FORBIDDEN");

        let (status, body) = call(&app, "GET", "/api/v1/servers", Some(ADMIN_KEY), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["servers"][0]["name"], "mta1");
        assert_eq!(body["servers"][0]["healthy"], true);
    }

    #[tokio::test]
    async fn test_send_and_fetch_record() {
        let app = app().await;

        let (status, body) =
            call(&app, "POST", "/api/v1/send", Some(SEND_KEY), Some(send_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "sent");
        assert_eq!(body["server_name"], "mta1");
        assert_eq!(body["remote_message_id"], "mta-1");

        let id = body["id"].as_str().unwrap().to_string();
        let (status, record) =
            call(&app, "GET", &format!("/api/v1/sends/{}", id), Some(SEND_KEY), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["domain"], "example.com");
        assert_eq!(record["status"], "sent");
    }

    #[tokio::test]
    async fn test_send_errors_map_to_status_codes() {
        let app = app().await;

        let mut body = send_body();
        body["to"] = json!("nobody");
        let (status, err) = call(&app, "POST", "/api/v1/send", Some(SEND_KEY), Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"], "INVALID_REQUEST");

        // admin keys lack the send scope
        let (status, err) =
            call(&app, "POST", "/api/v1/send", Some(ADMIN_KEY), Some(send_body())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(err["error"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_unknown_domain_is_404() {
        let app = app().await;
        let mut body = send_body();
        body["from"] = json!("news@unknown.test");

        let (status, err) = call(&app, "POST", "/api/v1/send", Some(SEND_KEY), Some(body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"], "DOMAIN_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_send_is_rate_limited() {
        let app = app().await;

        for _ in 0..2 {
            let (status, _) =
                call(&app, "POST", "/api/v1/send", Some(SEND_KEY), Some(send_body())).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, err) =
            call(&app, "POST", "/api/v1/send", Some(SEND_KEY), Some(send_body())).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err["error"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(err["remaining"]["per_minute"], 0);
        assert_eq!(err["remaining"]["per_hour"], Value::Null);
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let app = app().await;

        let list_id = uuid::Uuid::new_v4();
        let campaign = Campaign::new("launch", "news@example.com", list_id);
        app.store.insert_campaign(campaign.clone()).await;
        for i in 0..3 {
            app.store
                .insert_recipient(Recipient::new(list_id, &format!("r{}@example.org", i), None))
                .await;
        }

        let (status, job) = call(
            &app,
            "POST",
            "/api/v1/jobs",
            Some(ADMIN_KEY),
            Some(json!({"campaign_id": campaign.id, "servers": ["mta1"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(job["status"], "running");
        assert_eq!(job["stats"]["total"], 3);
        assert_eq!(job["stats"]["pending"], 3);

        let id = job["id"].as_str().unwrap().to_string();

        let (status, job) =
            call(&app, "POST", &format!("/api/v1/jobs/{}/pause", id), Some(ADMIN_KEY), None)
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "paused");

        let (status, err) =
            call(&app, "POST", &format!("/api/v1/jobs/{}/pause", id), Some(ADMIN_KEY), None)
                .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "INVALID_TRANSITION");

        let (status, job) = call(
            &app,
            "POST",
            &format!("/api/v1/jobs/{}/retry", id),
            Some(ADMIN_KEY),
            Some(json!({"action": "failed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "running");

        let (status, page) =
            call(&app, "GET", "/api/v1/jobs?status=running", Some(ADMIN_KEY), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);

        let (status, _) =
            call(&app, "GET", "/api/v1/jobs?status=bogus", Some(ADMIN_KEY), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, err) = call(
            &app,
            "GET",
            &format!("/api/v1/jobs/{}", uuid::Uuid::new_v4()),
            Some(ADMIN_KEY),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"], "JOB_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_domain_update_marks_outdated() {
        let app = app().await;

        let (status, domain) = call(
            &app,
            "PATCH",
            "/api/v1/domains/example.com",
            Some(ADMIN_KEY),
            Some(json!({"delivery_mode": "sandbox"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(domain["delivery_mode"], "sandbox");
        assert_eq!(domain["deployments"][0]["status"], "outdated");

        // outdated deployments keep delivering until re-synced
        let (status, sent) =
            call(&app, "POST", "/api/v1/send", Some(SEND_KEY), Some(send_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sent["server_name"], "mta1");

        let (status, deployment) = call(
            &app,
            "POST",
            "/api/v1/domains/example.com/deployments/mta1",
            Some(ADMIN_KEY),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deployment["status"], "deployed");

        let config = DomainRepository::get_by_name(&*app.store, "example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(config.outdated_servers().is_empty());
        assert_eq!(config.routable_servers(), vec!["mta1".to_string()]);
    }
}
