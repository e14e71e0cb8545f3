//! HTTP request handlers

use axum::{extract::State, http::StatusCode, Json};
use homeward_common::model::{RouteSummary, SyncSnapshot};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::server::AppContext;
use crate::error::Error;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    pub engine_running: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

/// Snapshot together with its render-ready summary
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub snapshot: SyncSnapshot,
    pub summary: RouteSummary,
}

type ApiError = (StatusCode, Json<StatusResponse>);

/// GET /health
pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "homeward-tracker".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        engine_running: ctx.engine.is_running(),
    })
}

/// GET /api/snapshot
pub async fn get_snapshot(State(ctx): State<AppContext>) -> Json<SnapshotResponse> {
    let snapshot = ctx.engine.snapshot();
    Json(SnapshotResponse {
        summary: snapshot.summary(),
        snapshot: (*snapshot).clone(),
    })
}

/// POST /api/reference/refresh
pub async fn refresh_reference(
    State(ctx): State<AppContext>,
) -> Result<(StatusCode, Json<StatusResponse>), ApiError> {
    ctx.engine.force_refresh_reference().map_err(reject)?;
    info!("Reference refresh requested");
    Ok(accepted())
}

/// POST /api/route/retry
pub async fn retry_route(
    State(ctx): State<AppContext>,
) -> Result<(StatusCode, Json<StatusResponse>), ApiError> {
    ctx.engine.retry_route_now().map_err(reject)?;
    info!("Route recomputation requested");
    Ok(accepted())
}

fn accepted() -> (StatusCode, Json<StatusResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(StatusResponse {
            status: "accepted".to_string(),
        }),
    )
}

fn reject(e: Error) -> ApiError {
    warn!("Request rejected: {}", e);
    let code = match e {
        Error::InvalidState(_) => StatusCode::CONFLICT,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        code,
        Json(StatusResponse {
            status: format!("error: {}", e),
        }),
    )
}
