//! Webhook receiver with HMAC verification.
//!
//! Providers push events here with an HMAC-SHA256 signature over the raw
//! body. Verification failures are rejected with 401 and always audit-logged
//! as security violations; deliveries are rate limited per integration.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
};
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::server::AppState;
use crate::store::{AuditEventType, AuditLogEntry};

use super::request_metadata;

/// Header consulted when the integration does not declare its own.
const DEFAULT_SIGNATURE_HEADER: &str = "X-Webhook-Signature";

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
}

/// Receive a provider webhook.
#[utoipa::path(
    post,
    path = "/webhooks/{integration}",
    params(("integration" = String, Path, description = "Integration identifier")),
    responses(
        (status = 200, description = "Webhook accepted", body = WebhookAck),
        (status = 401, description = "Signature verification failed", body = ApiError),
        (status = 404, description = "Unknown integration", body = ApiError),
        (status = 429, description = "Rate limited", body = ApiError),
    ),
    tag = "webhooks"
)]
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(integration): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let definition = state
        .oauth
        .integrations()
        .get(&integration)
        .ok_or_else(|| crate::error::not_found("Unknown integration"))?;

    let decision = state
        .security
        .check_rate_limit(&format!("webhook:{}", integration));
    if !decision.allowed {
        state
            .oauth
            .audit()
            .append(
                AuditLogEntry::new(
                    None,
                    integration.clone(),
                    AuditEventType::SecurityViolation,
                    "Webhook delivery rate limit exceeded",
                )
                .with_request(request_metadata(&headers)),
            )
            .await
            .map_err(crate::oauth::OAuthError::from)?;

        let mut error = ApiError::new(
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "Webhook delivery rate exceeded",
        );
        if let Some(retry_after) = decision.retry_after_secs {
            error = error.with_retry_after(retry_after);
        }
        return Err(error);
    }

    let Some(secret) = state.credentials.webhook_secret(&integration) else {
        return Err(crate::error::not_found(
            "Integration does not accept webhooks",
        ));
    };

    let signature_header = definition
        .webhook_signature_header
        .as_deref()
        .unwrap_or(DEFAULT_SIGNATURE_HEADER);
    let signature = headers
        .get(signature_header)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if let Err(err) = state
        .security
        .verify_webhook_signature(&body, signature, secret)
    {
        warn!(
            integration_id = %integration,
            error = %err,
            "Webhook signature verification failed"
        );
        state
            .oauth
            .audit()
            .append(
                AuditLogEntry::new(
                    None,
                    integration.clone(),
                    AuditEventType::SecurityViolation,
                    "Webhook signature verification failed",
                )
                .with_request(request_metadata(&headers))
                .with_metadata(serde_json::json!({
                    "signature_header": signature_header,
                    "body_bytes": body.len(),
                })),
            )
            .await
            .map_err(crate::oauth::OAuthError::from)?;
        metrics::counter!(
            "webhook_signature_failures_total",
            "integration" => integration.clone()
        )
        .increment(1);

        return Err(crate::error::unauthorized(Some(
            "Webhook signature verification failed",
        )));
    }

    info!(
        integration_id = %integration,
        body_bytes = body.len(),
        "Webhook verified"
    );
    metrics::counter!("webhook_received_total", "integration" => integration).increment(1);

    Ok(Json(WebhookAck { received: true }))
}
