//! Homeward Tracker - main entry point
//!
//! Tracks one patient: polls the care API for live position and home,
//! keeps an OpenRouteService route between them, and serves the fused
//! snapshot to the caregiver dashboard over HTTP and SSE.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use homeward_common::config::{resolve_value, TomlConfig};
use homeward_common::model::SubjectId;
use homeward_common::time::{millis_to_duration, SystemClock};
use homeward_tracker::api::{self, AppContext};
use homeward_tracker::clients::{CareApiClient, OpenRouteServiceClient};
use homeward_tracker::{Sources, TrackingEngine};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Care API timeout when the config does not set one
const DEFAULT_API_TIMEOUT_MS: u64 = 10_000;

/// Command-line arguments for homeward-tracker
#[derive(Parser, Debug)]
#[command(name = "homeward-tracker")]
#[command(about = "Live patient tracking and route synchronization service")]
#[command(version)]
struct Args {
    /// Path to config.toml
    #[arg(short, long, env = "HOMEWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Patient to track [env: HOMEWARD_PATIENT_ID]
    #[arg(short, long)]
    patient_id: Option<String>,

    /// Care API base URL [env: HOMEWARD_API_URL]
    #[arg(long)]
    api_url: Option<String>,

    /// OpenRouteService API key [env: HOMEWARD_ORS_API_KEY]
    #[arg(long)]
    ors_api_key: Option<String>,

    /// Address to serve the dashboard API on [env: HOMEWARD_BIND]
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "homeward_tracker=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting Homeward Tracker v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let args = Args::parse();
    let toml = TomlConfig::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;

    let patient_id = resolve_value(args.patient_id, "HOMEWARD_PATIENT_ID", toml.api.patient_id.clone())
        .ok_or_else(|| anyhow!("No patient id: pass --patient-id, set HOMEWARD_PATIENT_ID or [api] patient_id"))?;
    let api_url = resolve_value(args.api_url, "HOMEWARD_API_URL", toml.api.base_url.clone())
        .ok_or_else(|| anyhow!("No care API URL: pass --api-url, set HOMEWARD_API_URL or [api] base_url"))?;
    let ors_api_key = resolve_value(args.ors_api_key, "HOMEWARD_ORS_API_KEY", toml.routing.api_key.clone())
        .ok_or_else(|| anyhow!("No OpenRouteService key: pass --ors-api-key, set HOMEWARD_ORS_API_KEY or [routing] api_key"))?;

    let toml_bind = toml
        .server
        .bind_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid [server] bind_addr: {}", toml.server.bind_addr))?;
    let bind = resolve_value(args.bind, "HOMEWARD_BIND", Some(toml_bind)).unwrap_or(toml_bind);

    info!(patient_id = %patient_id, api_url = %api_url, "Tracking configuration resolved");

    let care_api = Arc::new(
        CareApiClient::new(
            api_url,
            millis_to_duration(toml.api.timeout_ms.unwrap_or(DEFAULT_API_TIMEOUT_MS)),
        )
        .context("Failed to create care API client")?,
    );
    let routes = Arc::new(
        OpenRouteServiceClient::new(
            toml.routing.base_url.clone(),
            ors_api_key,
            toml.routing.profile.clone(),
            millis_to_duration(toml.routing.timeout_ms),
        )
        .context("Failed to create OpenRouteService client")?,
    );

    let engine = Arc::new(
        TrackingEngine::new(
            toml.engine.clone(),
            Sources::new(care_api.clone(), care_api, routes),
            Arc::new(SystemClock),
        )
        .context("Invalid engine configuration")?,
    );

    engine
        .start(SubjectId::new(patient_id))
        .await
        .context("Failed to start tracking engine")?;

    let served = api::run(
        AppContext {
            engine: Arc::clone(&engine),
        },
        bind,
        shutdown_signal(),
    )
    .await;

    // Stop tracking even when the server failed
    engine.stop().await;
    served.context("HTTP server error")?;

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
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
