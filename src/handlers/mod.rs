//! HTTP handlers for the Integration Hub API.

pub mod admin;
pub mod callback;
pub mod connect;
pub mod connections;
pub mod maintenance;
pub mod webhooks;

use axum::http::HeaderMap;

use crate::store::RequestMetadata;

/// Pull request provenance out of the incoming headers for audit entries.
pub(crate) fn request_metadata(headers: &HeaderMap) -> RequestMetadata {
    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    RequestMetadata {
        ip_address,
        user_agent,
    }
}
