//! Connection management endpoints.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::UserExtension;
use crate::error::ApiError;
use crate::oauth::{ConnectionTestReport, ConnectionView};
use crate::recovery::RecoveryReport;
use crate::server::AppState;
use crate::store::{AuditLogEntry, AuditStore};

use super::request_metadata;

/// List the authenticated user's connections.
#[utoipa::path(
    get,
    path = "/connections",
    params(crate::auth::UserHeader),
    responses(
        (status = 200, description = "Connections for the user", body = Vec<ConnectionView>),
    ),
    security(("bearer_auth" = [])),
    tag = "connections"
)]
pub async fn list_connections(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
) -> Result<Json<Vec<ConnectionView>>, ApiError> {
    let views = state.oauth.get_user_connections(&user.0).await?;
    Ok(Json(views))
}

/// Get one connection's status.
#[utoipa::path(
    get,
    path = "/connections/{integration}",
    params(
        ("integration" = String, Path, description = "Integration identifier"),
        crate::auth::UserHeader,
    ),
    responses(
        (status = 200, description = "Connection status", body = ConnectionView),
        (status = 404, description = "No such connection", body = ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "connections"
)]
pub async fn get_connection(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Path(integration): Path<String>,
) -> Result<Json<ConnectionView>, ApiError> {
    let view = state
        .oauth
        .get_connection_status(&user.0, &integration)
        .await?;
    Ok(Json(view))
}

/// Response for `DELETE /connections/{integration}`.
#[derive(Debug, Serialize, ToSchema)]
pub struct DisconnectResponse {
    pub removed: bool,
}

/// Remove a connection. Idempotent.
#[utoipa::path(
    delete,
    path = "/connections/{integration}",
    params(
        ("integration" = String, Path, description = "Integration identifier"),
        crate::auth::UserHeader,
    ),
    responses(
        (status = 200, description = "Disconnect result", body = DisconnectResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "connections"
)]
pub async fn disconnect(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Path(integration): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, ApiError> {
    let removed = state
        .oauth
        .disconnect(&user.0, &integration, request_metadata(&headers))
        .await?;
    Ok(Json(DisconnectResponse { removed }))
}

/// Force a token refresh for one connection.
#[utoipa::path(
    post,
    path = "/connections/{integration}/refresh",
    params(
        ("integration" = String, Path, description = "Integration identifier"),
        crate::auth::UserHeader,
    ),
    responses(
        (status = 200, description = "Refreshed connection", body = ConnectionView),
        (status = 404, description = "No such connection", body = ApiError),
        (status = 409, description = "Reconnect required", body = ApiError),
        (status = 502, description = "Provider failure", body = ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "connections"
)]
pub async fn refresh_connection(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Path(integration): Path<String>,
) -> Result<Json<ConnectionView>, ApiError> {
    let record = state.oauth.refresh_tokens(&user.0, &integration).await?;
    Ok(Json(ConnectionView::from_record(&record, chrono::Utc::now())))
}

/// Probe a connection against the provider.
#[utoipa::path(
    post,
    path = "/connections/{integration}/test",
    params(
        ("integration" = String, Path, description = "Integration identifier"),
        crate::auth::UserHeader,
    ),
    responses(
        (status = 200, description = "Test report", body = ConnectionTestReport),
        (status = 404, description = "No such connection", body = ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "connections"
)]
pub async fn test_connection(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Path(integration): Path<String>,
) -> Result<Json<ConnectionTestReport>, ApiError> {
    let report = state.oauth.test_connection(&user.0, &integration).await?;
    Ok(Json(report))
}

/// Attempt automated recovery of one broken connection.
#[utoipa::path(
    post,
    path = "/connections/{integration}/recover",
    params(
        ("integration" = String, Path, description = "Integration identifier"),
        crate::auth::UserHeader,
    ),
    responses(
        (status = 200, description = "Recovery report", body = RecoveryReport),
        (status = 404, description = "No such connection", body = ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "recovery"
)]
pub async fn recover_connection(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Path(integration): Path<String>,
) -> Result<Json<RecoveryReport>, ApiError> {
    let report = state
        .recovery
        .attempt_recovery(&user.0, &integration, None)
        .await?;
    Ok(Json(report))
}

/// Attempt recovery of all of the user's broken connections.
#[utoipa::path(
    post,
    path = "/connections/recover",
    params(crate::auth::UserHeader),
    responses(
        (status = 200, description = "Recovery reports", body = Vec<RecoveryReport>),
    ),
    security(("bearer_auth" = [])),
    tag = "recovery"
)]
pub async fn recover_all_connections(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
) -> Result<Json<Vec<RecoveryReport>>, ApiError> {
    let reports = state.recovery.bulk_recovery(&user.0).await?;
    Ok(Json(reports))
}

/// Query parameters for the audit feed.
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct AuditQuery {
    /// Maximum entries to return (default 50, capped at 200)
    pub limit: Option<usize>,
}

/// Recent audit events for the authenticated user.
#[utoipa::path(
    get,
    path = "/audit",
    params(AuditQuery, crate::auth::UserHeader),
    responses(
        (status = 200, description = "Audit entries, newest first", body = Vec<AuditLogEntry>),
    ),
    security(("bearer_auth" = [])),
    tag = "audit"
)]
pub async fn list_audit_events(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditLogEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(50).min(200);
    let entries = state
        .oauth
        .audit()
        .list_for_user(&user.0, limit)
        .await
        .map_err(crate::oauth::OAuthError::from)?;
    Ok(Json(entries))
}
