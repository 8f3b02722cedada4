mod cache;
mod coalesce;
mod config;
mod error;
mod forge;
mod health;
mod http;
mod key;
mod metrics;
mod projbase;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::{CacheStore, SystemClock};
use crate::config::Config;
use crate::forge::github::GitHubBackend;
use crate::forge::{ManifestSource, Provider};
use crate::metrics::MetricsRegistry;
use crate::projbase::ProjectBase;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "projbase", about = "package.json metadata cache for forge-hosted repositories")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/projbase/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    /// Cache shared by every provider.
    pub store: Arc<dyn CacheStore>,
    /// One lookup pipeline per supported forge.
    pub projects: Arc<HashMap<Provider, Arc<ProjectBase>>>,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting projbase");

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Cache ----
    let store = cache::build_store(&config.cache, Arc::new(SystemClock))
        .await
        .context("failed to initialise cache backend")?;
    tracing::info!(
        backend = config.cache.backend.as_str(),
        max_age_ms = config.cache.max_age_ms,
        max_stale_ms = config.cache.max_stale_ms,
        "cache initialised"
    );

    // ---- Forge backends ----
    let http_client = reqwest::Client::builder()
        .user_agent(config.upstream.user_agent.clone())
        .timeout(Duration::from_secs(config.upstream.request_timeout_secs))
        .build()
        .context("failed to build reqwest client")?;

    let github: Arc<dyn ManifestSource> = Arc::new(
        GitHubBackend::new(&config.upstream, http_client, metrics.clone())
            .context("failed to initialise GitHub backend")?,
    );
    tracing::info!(api_url = %config.upstream.api_url, "forge backend initialised");

    let mut projects = HashMap::new();
    for source in [github] {
        let provider = source.provider();
        let project = ProjectBase::new(Arc::clone(&store), source, metrics.clone());
        projects.insert(provider, Arc::new(project));
    }

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        metrics,
        store,
        projects: Arc::new(projects),
    };

    run_http_server(state).await?;

    tracing::info!("projbase shut down cleanly");
    Ok(())
}
