//! # HTTP Server
//!
//! Application state composition, router construction, OpenAPI documentation,
//! and the serve loop with graceful shutdown.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{FromRef, Request},
    middleware::Next,
    response::Response,
    routing::{delete, get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::auth::auth_middleware;
use crate::classify::ErrorClassifier;
use crate::config::AppConfig;
use crate::crypto::CryptoKey;
use crate::handlers;
use crate::maintenance::TokenMaintenanceScheduler;
use crate::oauth::{OAuthManager, default_http_client};
use crate::recovery::RecoveryService;
use crate::registry::{CredentialRegistry, IntegrationRegistry};
use crate::security::{RateLimitSettings, SecurityManager};
use crate::store::MemoryStore;
use crate::telemetry::{TraceContext, with_trace_context};

/// Shared application state. Every service is built once at startup and
/// injected; request handlers receive them through this struct.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub security: Arc<SecurityManager>,
    pub credentials: Arc<CredentialRegistry>,
    pub oauth: Arc<OAuthManager>,
    pub recovery: Arc<RecoveryService>,
    pub maintenance: Arc<TokenMaintenanceScheduler>,
}

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

impl AppState {
    /// Compose the full service graph from a validated configuration.
    pub fn from_config(config: Arc<AppConfig>) -> anyhow::Result<Self> {
        let key_bytes = config
            .crypto_key
            .clone()
            .context("crypto key missing from configuration")?;
        let crypto_key =
            CryptoKey::new(key_bytes).map_err(|e| anyhow::anyhow!("invalid crypto key: {}", e))?;

        let security = Arc::new(SecurityManager::new(
            crypto_key,
            RateLimitSettings {
                window_seconds: config.rate_limit.window_seconds,
                max_requests: config.rate_limit.max_requests,
            },
        ));
        let credentials = Arc::new(config.credential_registry());
        let integrations = Arc::new(IntegrationRegistry::builtin());
        let classifier = Arc::new(ErrorClassifier::new());
        let store = MemoryStore::shared();
        let http = default_http_client().context("failed to build HTTP client")?;

        let oauth = Arc::new(OAuthManager::new(
            Arc::clone(&security),
            integrations,
            Arc::clone(&credentials),
            classifier,
            store.clone(),
            store,
            http,
            config.redirect_uri(),
        ));
        let recovery = Arc::new(RecoveryService::new(Arc::clone(&oauth)));
        let maintenance = Arc::new(TokenMaintenanceScheduler::new(
            Arc::clone(&oauth),
            Arc::clone(&recovery),
            config.maintenance.clone(),
        ));

        Ok(Self {
            config,
            security,
            credentials,
            oauth,
            recovery,
            maintenance,
        })
    }
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::connect::start_oauth_flow,
        handlers::callback::oauth_callback,
        handlers::connections::list_connections,
        handlers::connections::get_connection,
        handlers::connections::disconnect,
        handlers::connections::refresh_connection,
        handlers::connections::test_connection,
        handlers::connections::recover_connection,
        handlers::connections::recover_all_connections,
        handlers::connections::list_audit_events,
        handlers::maintenance::maintenance_status,
        handlers::maintenance::run_maintenance_cycle,
        handlers::admin::run_connection_test_suite,
        handlers::webhooks::receive_webhook,
    ),
    components(schemas(
        crate::error::ApiError,
        crate::error::UpstreamError,
        crate::oauth::AuthorizeUrl,
        crate::oauth::ConnectionView,
        crate::oauth::ConnectionTestReport,
        crate::recovery::RecoveryReport,
        crate::maintenance::CycleReport,
        crate::maintenance::MaintenanceStatus,
        crate::store::ConnectionStatus,
        crate::store::ConnectionHealth,
        crate::store::AuditLogEntry,
        crate::store::AuditEventType,
        crate::classify::ErrorKind,
        crate::classify::RecoveryAction,
        handlers::connect::ConnectRequest,
        handlers::connections::DisconnectResponse,
        handlers::webhooks::WebhookAck,
        handlers::admin::TestSuiteReport,
        handlers::admin::TestSuiteItem,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "oauth", description = "OAuth flow initiation and callback"),
        (name = "connections", description = "Connection lifecycle management"),
        (name = "recovery", description = "Automated connection recovery"),
        (name = "maintenance", description = "Token maintenance scheduler"),
        (name = "webhooks", description = "Provider webhook receiver"),
        (name = "admin", description = "Operator diagnostics"),
        (name = "audit", description = "Audit trail"),
    )
)]
pub struct ApiDoc;

/// Attach a trace context to every request, honoring an inbound
/// `X-Trace-Id` header when one is present.
async fn trace_context_middleware(mut request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let context = TraceContext { trace_id };
    request.extensions_mut().insert(context.clone());
    with_trace_context(context, next.run(request)).await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/connect/{integration}", post(handlers::connect::start_oauth_flow))
        .route("/connections", get(handlers::connections::list_connections))
        .route(
            "/connections/recover",
            post(handlers::connections::recover_all_connections),
        )
        .route(
            "/connections/{integration}",
            get(handlers::connections::get_connection),
        )
        .route(
            "/connections/{integration}",
            delete(handlers::connections::disconnect),
        )
        .route(
            "/connections/{integration}/refresh",
            post(handlers::connections::refresh_connection),
        )
        .route(
            "/connections/{integration}/test",
            post(handlers::connections::test_connection),
        )
        .route(
            "/connections/{integration}/recover",
            post(handlers::connections::recover_connection),
        )
        .route("/audit", get(handlers::connections::list_audit_events))
        .route(
            "/maintenance/status",
            get(handlers::maintenance::maintenance_status),
        )
        .route(
            "/maintenance/run",
            post(handlers::maintenance::run_maintenance_cycle),
        )
        .route(
            "/admin/test-connections",
            post(handlers::admin::run_connection_test_suite),
        )
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .route("/callback", get(handlers::callback::oauth_callback))
        .route(
            "/webhooks/{integration}",
            post(handlers::webhooks::receive_webhook),
        );

    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(protected)
        .merge(public)
        .layer(axum::middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API until the shutdown token fires.
pub async fn run_server(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_addr().context("invalid bind address")?;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    info!(addr = %bind_addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")?;

    info!("API server stopped");
    Ok(())
}
