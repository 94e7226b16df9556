//! relaymail - send-dispatch server entry point

use anyhow::{Context, Result};
use relaymail_api::AppState;
use relaymail_common::config::{Config, LoggingConfig};
use relaymail_core::{
    ContentResolver, DispatchEngine, DomainRouter, DomainSync, JobManager, RateLimiter,
    SendService, ServerRegistry,
};
use relaymail_storage::{DatabasePool, MemoryStore, Repositories};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting relaymail...");

    // Initialize storage
    let (repos, db_pool) = match config.database.backend.as_str() {
        "memory" => {
            warn!("Using in-memory storage; all data is lost on shutdown");
            (Repositories::memory(Arc::new(MemoryStore::new())), None)
        }
        _ => {
            let db_pool = DatabasePool::connect(&config.database).await?;
            db_pool.migrate().await?;

            (Repositories::postgres(db_pool.clone()), Some(db_pool))
        }
    };

    // Initialize MTA server registry
    let registry = Arc::new(
        ServerRegistry::from_config(&config.servers).context("Failed to build MTA clients")?,
    );
    if registry.is_empty() {
        warn!("No MTA servers configured; sends will fail until servers are added");
    } else {
        info!("Registered {} MTA servers: {:?}", registry.len(), registry.names());
    }

    // Build the pipeline
    let resolver = Arc::new(ContentResolver::new(
        repos.templates.clone(),
        repos.variables.clone(),
    ));
    let router = Arc::new(DomainRouter::new(
        repos.domains.clone(),
        registry.clone(),
        config.routing.clone(),
    ));
    let sends = Arc::new(SendService::new(
        repos.sends.clone(),
        resolver.clone(),
        router,
    ));
    let jobs = Arc::new(JobManager::new(
        &repos,
        registry.clone(),
        config.routing.strategy,
    ));
    let domains = Arc::new(DomainSync::new(repos.domains.clone(), registry.clone()));

    // Start rate limit sweeper
    let shutdown = CancellationToken::new();
    let limiter = Arc::new(RateLimiter::new());
    let sweeper_handle = limiter.spawn_sweeper(
        Duration::from_secs(config.rate_limit.sweep_interval_secs.max(1)),
        shutdown.clone(),
    );

    // Start dispatch engine
    let engine = DispatchEngine::new(&repos, resolver, registry.clone(), &config.engine);
    engine.start();

    // Start API server
    let state = AppState {
        repos,
        db_pool,
        registry,
        sends,
        jobs,
        domains,
        limiter,
    };
    let app = relaymail_api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.api.bind)
        .await
        .with_context(|| format!("Failed to bind API server to {}", config.api.bind))?;
    info!("Starting API server on {}", config.api.bind);

    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!("API server error: {}", e);
        }
    });

    info!("relaymail started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Stop accepting requests, then drain the in-flight dispatch batch
    shutdown.cancel();
    if let Err(e) = api_handle.await {
        warn!("API server task failed: {}", e);
    }
    engine.stop().await;
    if let Err(e) = sweeper_handle.await {
        warn!("Rate limit sweeper task failed: {}", e);
    }

    info!("relaymail shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},relaymail=debug", config.level))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
