// Scoreflow API server
//
// Wires the core together: storage backend, provider registry, event bus,
// workflow queue, orchestration engine and the HTTP surface (spec intake,
// read endpoints, SSE event stream).

mod providers;
mod specs;
mod sse;
mod workflows;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scoreflow_core::EventBus;
use scoreflow_engine::{
    EngineConfig, OrchestrationEngine, QueueConfig, StepRegistry, WorkflowExecutor, WorkflowQueue,
};
use scoreflow_providers::{ProviderLoader, ProviderRegistry};
use scoreflow_storage::StorageBackend;

use crate::sse::SseBroker;

/// Server configuration from environment variables
#[derive(Debug, Clone)]
struct Config {
    database_url: Option<String>,
    providers_dir: String,
    workspace_root: String,
    listen_addr: String,
    queue_workers: usize,
    tick_interval: Duration,
    core_version: String,
}

impl Config {
    fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            providers_dir: std::env::var("PROVIDERS_DIR")
                .unwrap_or_else(|_| "./providers".to_string()),
            workspace_root: std::env::var("WORKSPACE_ROOT")
                .unwrap_or_else(|_| "./workspaces".to_string()),
            listen_addr: std::env::var("LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            queue_workers: std::env::var("QUEUE_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            tick_interval: std::env::var("TICK_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(5)),
            core_version: std::env::var("SCOREFLOW_CORE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    dev_mode: bool,
    providers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scoreflow=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(core_version = %config.core_version, "scoreflow-api starting...");

    // Storage backend: Postgres when configured, in-memory dev mode otherwise
    let db = match &config.database_url {
        Some(url) => {
            let db = StorageBackend::postgres(url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Connected to database");
            db
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory storage (dev mode)");
            StorageBackend::in_memory()
        }
    };

    // Load providers and build the registry
    let registry = Arc::new(ProviderRegistry::new());
    let loader = ProviderLoader::new(&config.core_version);
    match loader
        .load_directory(std::path::Path::new(&config.providers_dir))
        .await
    {
        Ok(providers) => {
            let count = providers.len();
            registry
                .register_all(providers)
                .context("Provider registration failed")?;
            tracing::info!(count, dir = %config.providers_dir, "Providers registered");
        }
        Err(e) => {
            tracing::warn!(error = %e, dir = %config.providers_dir, "Provider directory not loaded");
        }
    }

    // Event bus and SSE broker
    let bus = Arc::new(EventBus::new());
    let broker = Arc::new(SseBroker::new(bus.clone()));

    // Executor, queue, orchestration engine
    let steps = Arc::new(StepRegistry::with_builtins());
    let executor = Arc::new(
        WorkflowExecutor::new(db.clone(), bus.clone(), steps)
            .with_workspace_root(&config.workspace_root),
    );
    let queue = Arc::new(WorkflowQueue::new(
        db.clone(),
        executor.clone(),
        bus.clone(),
        QueueConfig {
            workers: config.queue_workers,
            ..QueueConfig::default()
        },
    ));
    queue.start().await;

    let engine = Arc::new(OrchestrationEngine::new(
        db.clone(),
        registry.clone(),
        queue.clone(),
        bus.clone(),
        EngineConfig {
            tick_interval: config.tick_interval,
            ..EngineConfig::default()
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_handle = {
        let engine = engine.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            engine.run(shutdown_rx).await;
        })
    };

    // Build router
    let health_state = (db.clone(), registry.clone());
    let app = Router::new()
        .route(
            "/health",
            get(move || {
                let (db, registry) = health_state.clone();
                async move {
                    Json(HealthResponse {
                        status: "ok",
                        version: env!("CARGO_PKG_VERSION"),
                        dev_mode: db.is_dev_mode(),
                        providers: registry.list().len(),
                    })
                }
            }),
        )
        .merge(specs::routes(specs::AppState {
            db: db.clone(),
            bus: bus.clone(),
            registry: registry.clone(),
        }))
        .merge(workflows::routes(workflows::AppState {
            db: db.clone(),
            executor: executor.clone(),
            queue: queue.clone(),
        }))
        .merge(providers::routes(providers::AppState {
            registry: registry.clone(),
        }))
        .merge(sse::routes(sse::AppState {
            broker: broker.clone(),
        }))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    // Orderly teardown: engine first, then queue (joins workers), then the
    // streaming surfaces
    let _ = shutdown_tx.send(true);
    let _ = engine_handle.await;
    executor.shutdown();
    queue.stop().await;
    broker.close().await;
    bus.close().await;

    tracing::info!("scoreflow-api stopped");
    Ok(())
}
