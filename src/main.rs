use anyhow::{Context, Result};
use atelier::api::start_api_server;
use atelier::{
    AccessGate, AppState, CollectionStore, CommentRateLimiter, CommentStore, Config,
    GalleryService, HttpImageService, HttpKvStore, KvStore, UrlSigner,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Atelier gallery service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let kv: Arc<dyn KvStore> =
        Arc::new(HttpKvStore::new(&config.kv).context("Failed to initialize KV client")?);

    let comments = Arc::new(
        CommentStore::new(&config.database)
            .await
            .context("Failed to initialize comment store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        comments
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let gate = Arc::new(AccessGate::new(kv.clone()));
    if let Some(key) = &config.access.bootstrap_admin_key {
        let seeded = gate
            .bootstrap(key)
            .await
            .context("Failed to bootstrap site credential")?;
        if seeded {
            info!("Stored initial site credential");
        }
    }

    let signer = Arc::new(UrlSigner::new(&config.delivery));
    let images = Arc::new(
        HttpImageService::new(&config.images)
            .context("Failed to initialize image service client")?,
    );
    let collections = Arc::new(CollectionStore::new(kv.clone()));
    let gallery = Arc::new(GalleryService::new(
        collections.clone(),
        images,
        signer,
        config.images.delete_concurrency,
    ));
    let limiter = Arc::new(CommentRateLimiter::new(kv, &config.comments));

    // Create API state
    let state = AppState {
        config: Arc::new(config),
        collections,
        gallery,
        comments,
        limiter,
        gate,
    };

    // Spawn API server task
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(state).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Gallery service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down gallery service");

    api_handle.abort();

    info!("Gallery service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
