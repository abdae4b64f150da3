use anyhow::Result;
use axum::{
    extract::State,
    http::{StatusCode, Uri},
    middleware,
    response::Json,
    routing::{any, get},
    Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_quota::{
    bypass::StaticBypassList,
    config::{AppConfig, StoreBackend},
    events::{FanoutSink, TracingSink},
    key::RateKeyScheme,
    metrics::Metrics,
    pipeline::{admission_middleware, AdmissionStage, HeaderIdentity},
    redis::RedisClient,
    store::{BucketStore, MemoryBucketStore, RedisBucketStore},
    AdmissionEngine,
};

#[derive(Clone)]
struct AppState {
    engine: Arc<AdmissionEngine>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edge_quota=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting edge-quota admission service");

    let config = AppConfig::load(None)?;
    info!(
        limit = config.quota.limit,
        window_seconds = config.quota.window_seconds,
        enabled = config.enabled,
        store = ?config.store,
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new()?);
    let engine = Arc::new(create_engine(&config, metrics.clone()).await?);

    let stage = Arc::new(
        AdmissionStage::new(
            engine.clone(),
            config.quota,
            Arc::new(HeaderIdentity::new(&config.identity_header)?),
        )
        .with_enabled(config.enabled),
    );

    let state = AppState { engine, metrics };
    let app = Router::new()
        .route("/api/*path", any(echo))
        .route_layer(middleware::from_fn_with_state(stage, admission_middleware))
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Service stopped");
    Ok(())
}

async fn create_engine(config: &AppConfig, metrics: Arc<Metrics>) -> Result<AdmissionEngine> {
    let store: Arc<dyn BucketStore> = match config.store {
        StoreBackend::Redis => {
            let client = RedisClient::new(&config.redis).await?;
            Arc::new(RedisBucketStore::new(client))
        }
        StoreBackend::Memory => {
            warn!("Using in-process bucket store; quotas are not shared between instances");
            Arc::new(MemoryBucketStore::new(config.memory_capacity))
        }
    };

    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(metrics.clone());

    Ok(AdmissionEngine::new(store)
        .with_bypass(Arc::new(StaticBypassList::new(config.bypass.clone())))
        .with_sink(Arc::new(sink))
        .with_key_scheme(RateKeyScheme::new(config.key_prefix.clone()))
        .with_store_timeout(config.store_timeout())
        .with_grace(std::time::Duration::from_secs(config.grace_seconds))
        .with_metrics(metrics))
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        return;
    }
    info!("Received Ctrl+C, shutting down");
}

async fn echo(uri: Uri) -> Json<serde_json::Value> {
    Json(json!({ "path": uri.path(), "admitted": true }))
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.engine.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            warn!("Health check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
