// The adapter modules (storage, queue, coordination) expose their full
// contracts even where the current call graph exercises only part of them.
// Allow dead_code crate-wide rather than annotating each adapter surface.
#![allow(dead_code)]

mod cache;
mod config;
mod coordination;
mod fleet;
mod health;
mod http;
mod metrics;
mod queue;
mod storage;
mod validate;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "cloudmirror",
    about = "Cross-region artifact mirroring redirect proxy"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/cloudmirror/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub fleet: Arc<fleet::Fleet>,
    pub metrics: MetricsRegistry,
    pub status_pool: fred::clients::Pool,
    pub sqs: aws_sdk_sqs::Client,
    pub validator_client: reqwest::Client,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let app = http::handler::create_router(Arc::clone(&state));

    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

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
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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

    tracing::info!(config_path = %cli.config, "starting cloudmirror");

    // ---- Infrastructure clients ----
    let mut aws_config_loader =
        aws_config::from_env().region(aws_config::Region::new(config.aws.region.clone()));
    if config.aws.use_fips {
        aws_config_loader = aws_config_loader.use_fips(true);
    }
    let aws_config = aws_config_loader.load().await;
    let sqs = aws_sdk_sqs::Client::new(&aws_config);

    let http_client = reqwest::Client::builder()
        .user_agent("cloudmirror/0.1")
        .build()
        .context("failed to build origin HTTP client")?;
    let validator_client =
        validate::build_validator_client(config.redirect.validator_timeout_secs)?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Status store ----
    let status_store =
        coordination::StatusStore::connect(&config.status_store, metrics.clone()).await?;

    // ---- Fleet: one cache pool per region ----
    let fleet = fleet::build_and_start(
        Arc::clone(&config),
        &aws_config,
        status_store.clone(),
        metrics.clone(),
        http_client,
        validator_client.clone(),
    )
    .await?;
    let fleet = Arc::new(fleet);

    tracing::info!(pools = fleet.pools.len(), "fleet started");

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        fleet: Arc::clone(&fleet),
        metrics,
        status_pool: status_store.pool().clone(),
        sqs,
        validator_client,
    });

    // ---- Serve until shutdown ----
    run_http_server(state).await?;

    fleet.shutdown();
    tracing::info!("cloudmirror shut down cleanly");
    Ok(())
}
