//! Market data harvester
//!
//! Single-binary service that:
//! 1. Loads jobs and upstream tokens from TOML config
//! 2. Schedules collection jobs against the quota-limited data provider
//! 3. Stores normalized rows in the repository
//! 4. Serves health, metrics and the admin API on one listener

mod admin;
mod app;
mod collectors;
mod config;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use credential_pool::PoolStatus;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::HttpTransport;

use crate::admin::AdminState;
use crate::app::Harvester;
use crate::config::Config;

/// Upper bound on draining in-flight admin requests after a signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the axum router with health, metrics and admin routes.
///
/// `max_connections` caps concurrently served requests.
fn build_router(state: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(admin::routes())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting market-harvester");

    // Before any component emits metrics
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.admin.listen_addr,
        upstream_url = %config.upstream.url,
        credentials = config.upstream.credentials.len(),
        jobs = config.jobs.len(),
        "configuration loaded"
    );

    let transport = Arc::new(HttpTransport::new(
        reqwest::Client::new(),
        config.upstream.url.clone(),
        Duration::from_secs(config.upstream.timeout_secs),
    ));
    let harvester = Arc::new(Harvester::build(&config, transport)?);
    harvester.register_jobs(&config.jobs).await?;
    harvester.start()?;

    let app = build_router(
        AdminState::new(harvester.clone(), prometheus),
        config.admin.max_connections,
    );
    let listener = TcpListener::bind(config.admin.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.admin.listen_addr))?;
    info!(addr = %config.admin.listen_addr, "accepting requests");

    // The drain timeout starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    // Cancels running jobs, which also unblocks any manual trigger being drained.
    harvester.shutdown().await;

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Returns 200 while at least one credential is usable, 503 otherwise.
async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let harvester = &state.harvester;
    let pool = harvester.pool().get_stats().await;
    let jobs = harvester.scheduler().list_jobs().await;
    let running_jobs: u32 = jobs.iter().map(|j| j.running).sum();
    let tables = harvester.repository().table_sizes().await;

    let status_code = match pool.status {
        PoolStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        PoolStatus::Healthy | PoolStatus::Degraded => StatusCode::OK,
    };
    let body = serde_json::json!({
        "status": pool.status.label(),
        "credentials": {
            "total": pool.total,
            "healthy": pool.healthy,
            "unhealthy": pool.unhealthy,
        },
        "scheduler_running": harvester.scheduler().is_running(),
        "jobs": jobs.len(),
        "running_jobs": running_jobs,
        "tables": tables,
        "uptime_seconds": harvester.uptime().as_secs(),
    });

    (
        status_code,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT.
///
/// If a handler cannot be installed, that branch never fires and the other
/// one still can.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
