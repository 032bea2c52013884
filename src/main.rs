use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod adapters;
mod aggregator;
mod api;
mod blacklist;
mod cache;
mod catalog;
mod config;
mod cost;
mod discovery;
mod error;
mod failover;
mod finder;
mod pricing;
mod score;
mod state;
mod stats;
mod tags;

pub use config::Config;
pub use error::RouterError;
pub use state::RouterState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /health and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smart_ai_router=info,tower_http=warn".into()),
        )
        .init();

    // Load config
    let config_path = std::env::var("SAR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/smart-ai-router/config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!(
        port = config.gateway.port,
        channels = config.channels.len(),
        strategy = %config.routing.default_strategy,
        "smart-ai-router starting"
    );

    let pricing = match &config.gateway.pricing_file {
        Some(path) => pricing::PricingStore::load(path)
            .with_context(|| format!("Failed to load pricing file {}", path.display()))?,
        None => pricing::PricingStore::empty(),
    };

    let config = Arc::new(config);
    let state = Arc::new(RouterState::new(Arc::clone(&config), config_path.clone(), pricing));

    // Background workers: model discovery, auth-recovery probe,
    // cache/blacklist sweepers, config watcher.
    tokio::spawn(discovery::run(Arc::clone(&state)));
    tokio::spawn(discovery::health_reset(Arc::clone(&state)));
    tokio::spawn(sweeper(Arc::clone(&state)));
    tokio::spawn(config_watcher(Arc::clone(&state)));

    let addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.port).parse()?;
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let app = api::router(Arc::clone(&state))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .layer(tower_http::cors::CorsLayer::permissive());

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /health and exit 0 on 200, 1 otherwise.
/// Invoked via `smart-ai-router --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("SAR_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(7601);

    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: periodic cache and blacklist sweeps.
async fn sweeper(state: Arc<RouterState>) {
    let interval_secs = state.config().cache.cleanup_interval_seconds.max(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.tick().await; // skip the immediate first tick
    loop {
        interval.tick().await;
        state.cache.sweep().await;
        state.blacklist.sweep().await;
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on change.
///
/// Uses filesystem `mtime` for change detection — no inotify/kqueue dependencies.
/// Parse failures are logged and ignored; the running config is unchanged.
async fn config_watcher(state: Arc<RouterState>) {
    let path = state.config_path.clone();

    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    // Initial tick fires immediately; skip it so we don't reload on startup.
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(&path) {
            Ok(new_cfg) => {
                state.replace_config(Arc::new(new_cfg));
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed — keeping previous config");
            }
        }
    }
}
