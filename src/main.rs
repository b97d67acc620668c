mod cache;
mod circuit_breaker;
mod clock;
mod config;
mod context;
mod downstream;
mod error;
mod gateway;
mod metrics;
mod middleware;
mod ratelimit;
mod retry;
mod store;

use std::{
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Context;
use axum::{
    Json,
    Router,
    body::Body,
    extract::{
        ConnectInfo,
        State,
    },
    http::{
        Request,
        header,
    },
    response::IntoResponse,
    routing::{
        any,
        get,
    },
};
use gateway::Gateway;
use serde_json::json;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::{
    GatewayConfig,
    LogFormat,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = GatewayConfig::from_env().context("failed to build gateway config")?;
    init_tracing(cfg.log_format);

    let bind_addr = cfg.bind_addr;
    let gateway = Arc::new(
        Gateway::from_config(cfg)
            .await
            .context("failed to initialise gateway")?,
    );

    tokio::spawn(sweep_expired(gateway.clone()));

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(addr = %bind_addr, "API gateway listening");

    axum::serve(
        listener,
        app(gateway).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("gateway server error")?;

    tracing::info!("gateway stopped");
    Ok(())
}

fn app(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(any(proxy_handler))
        .with_state(gateway)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn metrics_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gateway.metrics().render_prometheus(),
    )
}

async fn proxy_handler(
    State(gateway): State<Arc<Gateway>>,
    request: Request<Body>,
) -> axum::response::Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    gateway.handle_http(request, client_ip).await
}

/// Periodically drops stale cache entries and expired store keys.
async fn sweep_expired(gateway: Arc<Gateway>) {
    let mut ticker = tokio::time::interval(gateway.sweep_interval());
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let purged = gateway.purge_expired_cache();
        if purged > 0 {
            tracing::debug!(purged, "swept expired cache entries");
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received; draining connections");
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}
