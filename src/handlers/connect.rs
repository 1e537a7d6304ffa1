//! OAuth initiation endpoint.

use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::auth::UserExtension;
use crate::error::ApiError;
use crate::oauth::AuthorizeUrl;
use crate::server::AppState;
use crate::store::{AuditEventType, AuditLogEntry};

use super::request_metadata;

/// Optional body for `POST /connect/{integration}`.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ConnectRequest {
    /// Where to send the user's browser after the callback completes.
    pub return_url: Option<String>,
}

/// Start the OAuth flow for an integration.
#[utoipa::path(
    post,
    path = "/connect/{integration}",
    params(
        ("integration" = String, Path, description = "Integration identifier"),
        crate::auth::UserHeader,
    ),
    request_body = Option<ConnectRequest>,
    responses(
        (status = 200, description = "Authorize URL generated", body = AuthorizeUrl),
        (status = 400, description = "Integration not configured for OAuth", body = ApiError),
        (status = 404, description = "Unknown integration", body = ApiError),
        (status = 429, description = "Rate limited", body = ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "oauth"
)]
pub async fn start_oauth_flow(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Path(integration): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ConnectRequest>>,
) -> Result<Json<AuthorizeUrl>, ApiError> {
    let decision = state
        .security
        .check_rate_limit(&format!("connect:{}", user.0));
    if !decision.allowed {
        state
            .oauth
            .audit()
            .append(
                AuditLogEntry::new(
                    Some(user.0.clone()),
                    integration.clone(),
                    AuditEventType::SecurityViolation,
                    "OAuth initiation rate limit exceeded",
                )
                .with_request(request_metadata(&headers)),
            )
            .await
            .map_err(crate::oauth::OAuthError::from)?;

        let mut error = ApiError::new(
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "Too many OAuth initiations; slow down",
        );
        if let Some(retry_after) = decision.retry_after_secs {
            error = error.with_retry_after(retry_after);
        }
        return Err(error);
    }

    let return_url = body.and_then(|Json(b)| b.return_url);
    let authorize = state
        .oauth
        .generate_auth_url(&user.0, &integration, return_url, request_metadata(&headers))
        .await?;

    Ok(Json(authorize))
}
