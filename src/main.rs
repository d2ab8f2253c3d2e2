use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod error;
mod handlers;
mod models;
mod services;
mod utils;

use handlers::{create_app, AppState};
use models::config::{AppConfig, DirectoryConfig};
use services::aggregation::AggregationEngine;
use services::batch::BatchLoadEvaluator;
use services::directory::{NodeDirectory, RedisDirectory};
use services::gateway::MetricsGateway;
use services::session::SessionManager;
use services::store::KvStore;
use services::tags::{AliasStore, TagStore};
use services::threshold::ThresholdStore;
use utils::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let loaded = AppConfig::load();
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => AppConfig::default(),
    };

    // Initialize logging
    let _log_guard = init_logging(&config.logging)?;
    if let Err(e) = &loaded {
        warn!("Failed to load configuration, using defaults: {}", e);
    }

    info!("Starting Fleet Load Monitor v{}", env!("CARGO_PKG_VERSION"));

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.metrics.request_timeout_secs))
        .user_agent(concat!("fleet-load-monitor/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building HTTP client")?;

    // Remote metrics API
    let session = Arc::new(SessionManager::new(client.clone(), &config.metrics));
    if !session.has_credentials() {
        warn!("No metrics API credentials configured; metric requests will fail with an authentication error");
    }
    let gateway = Arc::new(MetricsGateway::new(client, Arc::clone(&session), &config.metrics));

    // Local stores
    let store = Arc::new(
        KvStore::open(&config.storage.path)
            .await
            .with_context(|| format!("opening local store at {}", config.storage.path))?,
    );
    let thresholds = Arc::new(ThresholdStore::new(Arc::clone(&store)));
    let aliases = Arc::new(AliasStore::new(Arc::clone(&store)));
    let tags = Arc::new(TagStore::new(Arc::clone(&store)));

    let directory = Arc::new(connect_directory(&config.directory, Arc::clone(&aliases)).await);

    let engine = Arc::new(AggregationEngine::new(
        gateway,
        Arc::clone(&thresholds),
        Arc::clone(&directory),
        &config.aggregation,
    ));
    let batch = Arc::new(BatchLoadEvaluator::new(
        Arc::clone(&tags),
        Arc::clone(&thresholds),
        Arc::clone(&engine),
    ));

    // Start background session refresh
    let refresh_task = session
        .has_credentials()
        .then(|| session.spawn_refresh_task(Duration::from_secs(config.metrics.refresh_interval_secs)));

    // Create and run the web server
    let app = create_app(AppState {
        engine,
        thresholds,
        aliases,
        tags,
        directory,
        batch,
    });

    let addr = config.server.address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(task) = refresh_task {
        task.stop().await;
    }
    if let Err(e) = store.flush().await {
        warn!("Failed to flush local store: {}", e);
    }
    info!("Fleet Load Monitor stopped");

    Ok(())
}

async fn connect_directory(config: &DirectoryConfig, aliases: Arc<AliasStore>) -> NodeDirectory {
    let Some(url) = config.url.as_deref() else {
        warn!("No node directory URL configured");
        return NodeDirectory::disabled(config.key_prefix.clone(), aliases);
    };

    match RedisDirectory::connect(url, Duration::from_secs(config.timeout_secs)).await {
        Ok(backend) => {
            info!("Connected to node directory");
            NodeDirectory::new(Arc::new(backend), config.key_prefix.clone(), aliases)
        }
        Err(e) => {
            warn!("Node directory unavailable: {}", e);
            NodeDirectory::disabled(config.key_prefix.clone(), aliases)
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
