//! OAuth provider callback endpoint.
//!
//! Hit by the user's browser after the provider authorize screen. Responses
//! are redirects; failure detail stays in the audit log and only a coarse
//! reason code rides in the redirect query string.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::Redirect,
};
use tracing::info;

use crate::oauth::CallbackParams;
use crate::server::AppState;

use super::request_metadata;

/// Complete the OAuth flow from the provider redirect.
#[utoipa::path(
    get,
    path = "/callback",
    params(
        ("code" = Option<String>, Query, description = "Authorization code"),
        ("state" = Option<String>, Query, description = "Opaque state token"),
        ("error" = Option<String>, Query, description = "Provider error code"),
    ),
    responses(
        (status = 303, description = "Redirect back to the application"),
    ),
    tag = "oauth"
)]
pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> Redirect {
    let base = state.config.base_url.trim_end_matches('/').to_string();

    match state
        .oauth
        .handle_callback(params, request_metadata(&headers))
        .await
    {
        Ok(outcome) => {
            info!(
                integration_id = %outcome.integration_id,
                "OAuth callback completed"
            );
            let target = outcome.return_url.unwrap_or_else(|| {
                format!(
                    "{}/integrations?connected={}",
                    base, outcome.integration_id
                )
            });
            Redirect::to(&target)
        }
        Err(err) => {
            let reason = err.callback_reason();
            Redirect::to(&format!("{}/integrations?error={}", base, reason))
        }
    }
}
