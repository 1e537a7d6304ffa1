//! Maintenance scheduler endpoints.

use axum::{Json, extract::State};

use crate::auth::OperatorAuth;
use crate::error::ApiError;
use crate::maintenance::{CycleReport, MaintenanceStatus};
use crate::server::AppState;

/// Scheduler health and anomaly report.
#[utoipa::path(
    get,
    path = "/maintenance/status",
    responses(
        (status = 200, description = "Scheduler status", body = MaintenanceStatus),
    ),
    security(("bearer_auth" = [])),
    tag = "maintenance"
)]
pub async fn maintenance_status(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<MaintenanceStatus>, ApiError> {
    let status = state.maintenance.status().await?;
    Ok(Json(status))
}

/// Trigger a maintenance cycle immediately.
#[utoipa::path(
    post,
    path = "/maintenance/run",
    responses(
        (status = 200, description = "Completed cycle report", body = CycleReport),
    ),
    security(("bearer_auth" = [])),
    tag = "maintenance"
)]
pub async fn run_maintenance_cycle(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<CycleReport>, ApiError> {
    let report = state.maintenance.run_cycle().await?;
    Ok(Json(report))
}
