//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::server::state::ServerState;
use crate::storage::status::DeployStatusRecord;
use crate::telemetry::{collect_metrics, HostMetrics};
use crate::utils::version_info;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub host_id: String,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub err_streak: u32,
    pub host: HostMetrics,
}

/// Health check handler. Reports `degraded` while the control plane is
/// unreachable.
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let cycle = state.controller.state().await;
    let in_cooldown = cycle.is_in_cooldown();
    let status = if cycle.err_streak > 0 { "degraded" } else { "healthy" };

    Json(HealthResponse {
        status: status.to_string(),
        service: "deployd".to_string(),
        version: version_info().version,
        host_id: state.identity.host_id.clone(),
        last_cycle_at: (cycle.last_completed_at != DateTime::<Utc>::MIN_UTC).then_some(cycle.last_completed_at),
        cooldown_until: in_cooldown.then_some(cycle.cooldown_ends_at),
        err_streak: cycle.err_streak,
        host: collect_metrics(),
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Environments response
#[derive(Debug, Serialize)]
pub struct EnvsResponse {
    pub envs: Vec<DeployStatusRecord>,
    pub total: usize,
}

/// Every local status record
pub async fn envs_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let envs: Vec<DeployStatusRecord> = state.store.load_all().await.into_values().collect();
    let total = envs.len();
    Json(EnvsResponse { envs, total })
}

/// One environment's status record
pub async fn env_handler(
    State(state): State<Arc<ServerState>>,
    Path(env_name): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .store
        .load(&env_name)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
