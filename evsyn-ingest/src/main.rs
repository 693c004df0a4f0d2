//! evsyn-ingest - study data ingestion service
//!
//! Accepts researcher-submitted study batches (CSV / Excel / RevMan exports),
//! runs them through the ingestion pipeline and streams progress over SSE.

use anyhow::{Context, Result};
use clap::Parser;
use evsyn_common::config::{load_or_default, ConfigResolver};
use evsyn_common::events::EventBus;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use evsyn_ingest::config::{build_inference_client, registry_settings, MODULE_NAME};
use evsyn_ingest::workflow::PipelineRegistry;
use evsyn_ingest::AppState;

/// Service lifecycle events buffered for slow /events clients
const EVENT_BUS_CAPACITY: usize = 100;

#[derive(Parser, Debug)]
#[command(name = "evsyn-ingest")]
#[command(about = "Study data ingestion pipeline service")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file (EVSYN_CONFIG when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides [server] bind_address)
    #[arg(short, long, env = "EVSYN_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = ConfigResolver::new(MODULE_NAME).resolve(args.config.as_deref());
    let config = load_or_default(config_path.as_deref()).context("Failed to load configuration")?;

    let default_filter = format!(
        "evsyn_ingest={level},evsyn_common={level},tower_http={level}",
        level = config.logging.level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting evsyn-ingest v{}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: compiled defaults"),
    }

    let client = build_inference_client(&config.inference)
        .context("Failed to initialize inference client")?;
    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
    let registry = Arc::new(PipelineRegistry::new(
        client,
        registry_settings(&config),
        event_bus,
    ));

    let shutdown = CancellationToken::new();
    let sweeper = registry.clone().spawn_eviction_sweeper(
        Duration::from_secs(config.retention.sweep_interval_secs),
        shutdown.clone(),
    );

    let app = evsyn_ingest::build_router(AppState::new(registry.clone()));

    let bind = args.bind.unwrap_or(config.server.bind_address);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    registry.cancel_all().await;
    shutdown.cancel();
    let _ = sweeper.await;

    info!("evsyn-ingest stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
