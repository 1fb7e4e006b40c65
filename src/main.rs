//! model-router - routes requests to a bounded pool of llama-server instances.

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use model_router::api;
use model_router::auth;
use model_router::backend::ProcessBackend;
use model_router::pool::SlotPool;
use model_router::registry::ModelRegistry;
use model_router::{AppState, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Make sure config.toml exists or set ROUTER__BACKEND__SERVER_BINARY and friends.",
            e
        )
    })?;
    tracing::info!(
        "Starting model-router: capacity={}, autoload={}",
        config.pool.capacity,
        config.pool.autoload
    );

    let registry = Arc::new(ModelRegistry::from_config(&config));
    if registry.is_empty() {
        tracing::warn!("No models registered; declare [[models]] entries or set backend.model_dir");
    }

    let backend = Arc::new(ProcessBackend::new(config.backend.clone()));
    let pool = SlotPool::new(&config.pool, registry.clone(), backend);

    let state = Arc::new(AppState::new(config.clone(), registry, pool.clone()));

    // Build router; everything under /v1 sits behind the API key gate.
    let app = Router::new()
        .nest(
            "/v1",
            api::router().layer(axum::middleware::from_fn_with_state(
                state.clone(),
                auth::require_api_key,
            )),
        )
        .route("/health", axum::routing::get(api::health::health))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.api.host, config.api.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop any instances still resident before exiting.
    pool.unload_all().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}
