//! # OAuth Lifecycle Manager
//!
//! Orchestrates the authorization-code flow end to end: authorize URL
//! generation, callback handling with token exchange, encrypted token
//! persistence, refresh with per-connection single-flight protection, and
//! connection status reads with lazy expiry derivation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use utoipa::ToSchema;

use crate::classify::{ClassifiedError, ErrorClassifier, ErrorKind};
use crate::error::ApiError;
use crate::registry::{CredentialRegistry, IntegrationDefinition, IntegrationRegistry};
use crate::security::{STATE_MAX_AGE_MS, SecurityError, SecurityManager};
use crate::store::{
    AuditEventType, AuditLogEntry, AuditStore, ConnectionRecord, ConnectionStatus,
    ConnectionHealth, ConnectionStore, RequestMetadata, StoreError,
};

/// Default timeout for outbound provider calls.
pub const PROVIDER_TIMEOUT_SECS: u64 = 15;

/// Slack applied when deciding whether a concurrent refresh already did the
/// work: a token valid for at least this long is not refreshed again.
const REFRESH_SHORT_CIRCUIT_SECS: i64 = 120;

/// Errors surfaced by OAuth lifecycle operations.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("unknown integration '{0}'")]
    IntegrationNotFound(String),
    #[error("integration '{0}' has no OAuth credentials configured")]
    OAuthNotConfigured(String),
    #[error("no connection exists for integration '{0}'")]
    NotConnected(String),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ClassifiedError),
    #[error("invalid authorize URL for integration '{integration_id}': {message}")]
    InvalidAuthorizeUrl {
        integration_id: String,
        message: String,
    },
}

impl OAuthError {
    /// Coarse reason code used in browser-facing callback redirects. Raw
    /// provider detail never rides in the redirect.
    pub fn callback_reason(&self) -> &'static str {
        match self {
            OAuthError::Security(_) => "state",
            OAuthError::IntegrationNotFound(_)
            | OAuthError::OAuthNotConfigured(_)
            | OAuthError::InvalidAuthorizeUrl { .. } => "config",
            OAuthError::Provider(_) => "token",
            OAuthError::NotConnected(_) | OAuthError::Store(_) => "internal",
        }
    }
}

impl From<OAuthError> for ApiError {
    fn from(error: OAuthError) -> Self {
        use axum::http::StatusCode;

        match error {
            OAuthError::IntegrationNotFound(id) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND".to_string(),
                format!("Unknown integration '{}'", id),
            ),
            OAuthError::NotConnected(id) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND".to_string(),
                format!("No connection exists for integration '{}'", id),
            ),
            OAuthError::OAuthNotConfigured(id) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "OAUTH_NOT_CONFIGURED".to_string(),
                format!("Integration '{}' has no OAuth credentials configured", id),
            ),
            OAuthError::Security(err) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED".to_string(),
                err.to_string(),
            ),
            OAuthError::Provider(classified) => {
                let mut api = match classified.kind {
                    ErrorKind::RateLimited => ApiError::new(
                        StatusCode::TOO_MANY_REQUESTS,
                        "RATE_LIMITED".to_string(),
                        classified.message.clone(),
                    ),
                    ErrorKind::ProviderError
                    | ErrorKind::NetworkError
                    | ErrorKind::Timeout => ApiError::new(
                        StatusCode::BAD_GATEWAY,
                        "PROVIDER_ERROR".to_string(),
                        classified.message.clone(),
                    ),
                    ErrorKind::InvalidGrant | ErrorKind::TokenExpired => ApiError::new(
                        StatusCode::CONFLICT,
                        "RECONNECT_REQUIRED".to_string(),
                        classified.message.clone(),
                    ),
                    _ => ApiError::new(
                        StatusCode::BAD_REQUEST,
                        "OAUTH_ERROR".to_string(),
                        classified.message.clone(),
                    ),
                };
                if let Some(retry_after) = classified.retry_after_secs {
                    api = api.with_retry_after(retry_after);
                }
                api.with_details(serde_json::json!({ "kind": classified.kind.code() }))
            }
            OAuthError::Store(err) => {
                error!(error = ?err, "Store failure in OAuth operation");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
            OAuthError::InvalidAuthorizeUrl { .. } => {
                error!(error = %error, "Invalid authorize URL");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
        }
    }
}

/// Response of `generate_auth_url`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuthorizeUrl {
    pub integration_id: String,
    pub url: String,
}

/// Query parameters a provider sends to the callback endpoint.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Successful callback outcome.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub user_id: String,
    pub integration_id: String,
    pub return_url: Option<String>,
}

/// Sanitized projection of a connection record for API responses.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ConnectionView {
    pub integration_id: String,
    pub status: ConnectionStatus,
    pub health: ConnectionHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_email: Option<String>,
}

impl ConnectionView {
    /// Project a record, deriving `expired` lazily from the expiry timestamp.
    pub fn from_record(record: &ConnectionRecord, now: DateTime<Utc>) -> Self {
        Self {
            integration_id: record.integration_id.clone(),
            status: record.effective_status(now),
            health: record.health,
            scope: record.scope.clone(),
            expires_at: record.expires_at,
            connected_at: record.connected_at,
            last_used_at: record.last_used_at,
            last_error: record.last_error.clone(),
            error_count: record.error_count,
            provider_username: record.provider_username.clone(),
            provider_email: record.provider_email.clone(),
        }
    }
}

/// Result of a connection test.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ConnectionTestReport {
    pub integration_id: String,
    pub healthy: bool,
    pub status: ConnectionStatus,
    pub message: String,
}

/// Token endpoint response body (exchange and refresh share the shape).
#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_type: Option<String>,
    scope: Option<String>,
    expires_in: Option<i64>,
}

/// Decoded token material after a successful exchange or refresh.
#[derive(Debug)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

type RefreshKey = (String, String);

/// OAuth lifecycle orchestrator. All collaborators are injected.
pub struct OAuthManager {
    security: Arc<SecurityManager>,
    integrations: Arc<IntegrationRegistry>,
    credentials: Arc<CredentialRegistry>,
    classifier: Arc<ErrorClassifier>,
    connections: Arc<dyn ConnectionStore>,
    audit: Arc<dyn AuditStore>,
    http: reqwest::Client,
    redirect_uri: String,
    /// Per-(user, integration) refresh locks for single-flight protection.
    refresh_locks: Mutex<HashMap<RefreshKey, Arc<Mutex<()>>>>,
}

/// Build the shared HTTP client used for provider calls.
pub fn default_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(StdDuration::from_secs(PROVIDER_TIMEOUT_SECS))
        .build()
}

impl OAuthManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        security: Arc<SecurityManager>,
        integrations: Arc<IntegrationRegistry>,
        credentials: Arc<CredentialRegistry>,
        classifier: Arc<ErrorClassifier>,
        connections: Arc<dyn ConnectionStore>,
        audit: Arc<dyn AuditStore>,
        http: reqwest::Client,
        redirect_uri: String,
    ) -> Self {
        Self {
            security,
            integrations,
            credentials,
            classifier,
            connections,
            audit,
            http,
            redirect_uri,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn connections(&self) -> &Arc<dyn ConnectionStore> {
        &self.connections
    }

    pub fn audit(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    pub fn integrations(&self) -> &Arc<IntegrationRegistry> {
        &self.integrations
    }

    fn definition(&self, integration_id: &str) -> Result<&IntegrationDefinition, OAuthError> {
        self.integrations
            .get(integration_id)
            .ok_or_else(|| OAuthError::IntegrationNotFound(integration_id.to_string()))
    }

    /// Build the provider authorize URL for a user, embedding a fresh state
    /// token (and PKCE challenge where the integration requires it).
    #[instrument(skip(self), fields(integration_id, user_id))]
    pub async fn generate_auth_url(
        &self,
        user_id: &str,
        integration_id: &str,
        return_url: Option<String>,
        request: RequestMetadata,
    ) -> Result<AuthorizeUrl, OAuthError> {
        let definition = self.definition(integration_id)?;
        if !self.credentials.is_ready(integration_id) {
            return Err(OAuthError::OAuthNotConfigured(integration_id.to_string()));
        }
        let credentials = self
            .credentials
            .get(integration_id)
            .ok_or_else(|| OAuthError::OAuthNotConfigured(integration_id.to_string()))?;

        let pkce = definition.requires_pkce.then(|| self.security.generate_pkce());
        let state = self.security.generate_state(
            integration_id,
            user_id,
            return_url,
            pkce.as_ref().map(|p| p.verifier.clone()),
        )?;

        let mut url = Url::parse(&definition.authorize_url).map_err(|e| {
            OAuthError::InvalidAuthorizeUrl {
                integration_id: integration_id.to_string(),
                message: e.to_string(),
            }
        })?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &credentials.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scope", &definition.scopes.join(" "))
                .append_pair("state", &state);
            if let Some(pkce) = &pkce {
                query
                    .append_pair("code_challenge", &pkce.challenge)
                    .append_pair("code_challenge_method", pkce.method);
            }
            for (key, value) in &definition.extra_authorize_params {
                query.append_pair(key, value);
            }
        }

        self.audit
            .append(
                AuditLogEntry::new(
                    Some(user_id.to_string()),
                    integration_id,
                    AuditEventType::ConnectionInitiated,
                    format!("OAuth flow initiated for {}", definition.display_name),
                )
                .with_request(request),
            )
            .await?;

        counter!("oauth_flow_initiated_total", "integration" => integration_id.to_string())
            .increment(1);

        Ok(AuthorizeUrl {
            integration_id: integration_id.to_string(),
            url: url.to_string(),
        })
    }

    /// Process the provider redirect: validate state, exchange the code, and
    /// persist the connection. Every failure path writes a
    /// `connection_failed` audit entry.
    #[instrument(skip_all)]
    pub async fn handle_callback(
        &self,
        params: CallbackParams,
        request: RequestMetadata,
    ) -> Result<CallbackOutcome, OAuthError> {
        let state_token = params.state.as_deref().unwrap_or_default();
        let state = match self.security.parse_state(state_token) {
            Ok(state) => state,
            Err(err) => {
                self.audit_rejected_state(None, "unknown", &err, request)
                    .await?;
                return Err(err.into());
            }
        };
        if let Err(err) = self.security.validate_state_age(&state, STATE_MAX_AGE_MS) {
            self.audit_rejected_state(
                Some(state.user_id.as_str()),
                &state.integration_id,
                &err,
                request,
            )
            .await?;
            return Err(err.into());
        }

        let outcome = self
            .complete_callback(&state, &params, request.clone())
            .await;

        if let Err(err) = &outcome {
            warn!(
                integration_id = %state.integration_id,
                error = %err,
                "OAuth callback failed"
            );
            self.audit
                .append(
                    AuditLogEntry::new(
                        Some(state.user_id.clone()),
                        state.integration_id.clone(),
                        AuditEventType::ConnectionFailed,
                        format!("OAuth callback failed: {}", err),
                    )
                    .with_request(request),
                )
                .await?;
            counter!(
                "oauth_callback_failure_total",
                "integration" => state.integration_id.clone()
            )
            .increment(1);
        }

        outcome
    }

    /// Rejected state tokens are security violations; the audit entry is
    /// written before the callback short-circuits.
    async fn audit_rejected_state(
        &self,
        user_id: Option<&str>,
        integration_id: &str,
        err: &SecurityError,
        request: RequestMetadata,
    ) -> Result<(), OAuthError> {
        warn!(integration_id, error = %err, "Rejected OAuth callback state");
        self.audit
            .append(
                AuditLogEntry::new(
                    user_id.map(str::to_string),
                    integration_id,
                    AuditEventType::SecurityViolation,
                    format!("OAuth callback state rejected: {}", err),
                )
                .with_request(request),
            )
            .await?;
        counter!(
            "oauth_state_rejected_total",
            "integration" => integration_id.to_string()
        )
        .increment(1);
        Ok(())
    }

    async fn complete_callback(
        &self,
        state: &crate::security::OAuthState,
        params: &CallbackParams,
        request: RequestMetadata,
    ) -> Result<CallbackOutcome, OAuthError> {
        // Provider-reported denial comes before any token work.
        if let Some(provider_error) = &params.error {
            let kind = self.classifier.kind_for_code(provider_error);
            let kind = if kind == ErrorKind::Unknown {
                ErrorKind::AccessDenied
            } else {
                kind
            };
            let message = params
                .error_description
                .clone()
                .unwrap_or_else(|| format!("provider returned {}", provider_error));
            return Err(ClassifiedError {
                kind,
                message,
                provider_code: Some(provider_error.clone()),
                retry_after_secs: None,
            }
            .into());
        }

        let definition = self.definition(&state.integration_id)?;
        let credentials = self
            .credentials
            .get(&state.integration_id)
            .ok_or_else(|| OAuthError::OAuthNotConfigured(state.integration_id.clone()))?;

        let code = params.code.as_deref().ok_or_else(|| {
            OAuthError::Security(SecurityError::InvalidState(
                "callback is missing the authorization code".to_string(),
            ))
        })?;

        let grant = self
            .exchange_code_for_tokens(definition, credentials, code, state.pkce_verifier.as_deref())
            .await?;

        let mut record = self
            .connections
            .find(&state.user_id, &state.integration_id)
            .await?
            .unwrap_or_else(|| ConnectionRecord::new(&state.user_id, &state.integration_id));

        let now = Utc::now();
        record.access_token = Some(self.security.encrypt_token(
            &state.user_id,
            &state.integration_id,
            &grant.access_token,
        )?);
        record.refresh_token = match &grant.refresh_token {
            Some(token) => Some(self.security.encrypt_token(
                &state.user_id,
                &state.integration_id,
                token,
            )?),
            None => None,
        };
        record.token_type = grant.token_type.clone();
        record.scope = grant.scope.clone();
        record.expires_at = grant.expires_at;
        record.connected_at = Some(now);
        record.last_error = None;
        record.error_count = 0;
        record.health = ConnectionHealth::Healthy;
        record.set_status(ConnectionStatus::Connected);

        // Identity enrichment is best effort; a failed lookup never fails the flow.
        if let Some(user_info_url) = &definition.user_info_url {
            if let Some(identity) = self
                .fetch_provider_identity(user_info_url, &grant.access_token)
                .await
            {
                record.provider_user_id = identity.id;
                record.provider_username = identity.username;
                record.provider_email = identity.email;
            }
        }

        self.connections.upsert(record).await?;

        self.audit
            .append(
                AuditLogEntry::new(
                    Some(state.user_id.clone()),
                    state.integration_id.clone(),
                    AuditEventType::ConnectionCompleted,
                    format!("Connected {}", definition.display_name),
                )
                .with_request(request),
            )
            .await?;

        info!(
            integration_id = %state.integration_id,
            "OAuth connection established"
        );
        counter!(
            "oauth_callback_success_total",
            "integration" => state.integration_id.clone()
        )
        .increment(1);

        Ok(CallbackOutcome {
            user_id: state.user_id.clone(),
            integration_id: state.integration_id.clone(),
            return_url: state.return_url.clone(),
        })
    }

    /// Exchange an authorization code at the provider token endpoint.
    pub async fn exchange_code_for_tokens(
        &self,
        definition: &IntegrationDefinition,
        credentials: &crate::registry::OAuthCredentials,
        code: &str,
        pkce_verifier: Option<&str>,
    ) -> Result<TokenGrant, ClassifiedError> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.redirect_uri.clone()),
            ("client_id", credentials.client_id.clone()),
            ("client_secret", credentials.client_secret.clone()),
        ];
        if let Some(verifier) = pkce_verifier {
            form.push(("code_verifier", verifier.to_string()));
        }

        self.request_token(&definition.token_url, &form).await
    }

    /// POST a grant request and decode or classify the response.
    async fn request_token(
        &self,
        token_url: &str,
        form: &[(&str, String)],
    ) -> Result<TokenGrant, ClassifiedError> {
        let started = std::time::Instant::now();
        let response = self
            .http
            .post(token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| self.classifier.classify_transport(&e))?;
        histogram!("oauth_token_request_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response
            .text()
            .await
            .map_err(|e| self.classifier.classify_transport(&e))?;

        if !status.is_success() {
            return Err(self
                .classifier
                .classify_response(status.as_u16(), &body, retry_after));
        }

        let parsed: TokenEndpointResponse = serde_json::from_str(&body)
            .map_err(|_| self.classifier.malformed_token_response())?;
        let access_token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.classifier.malformed_token_response())?;

        Ok(TokenGrant {
            access_token,
            refresh_token: parsed.refresh_token,
            token_type: parsed.token_type,
            scope: parsed.scope,
            expires_at: parsed
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }

    async fn refresh_lock(&self, key: RefreshKey) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Refresh the connection's tokens, holding a per-(user, integration)
    /// lock across the critical section. A caller that arrives while another
    /// refresh is in flight waits for it and reuses the result instead of
    /// issuing a second provider call.
    #[instrument(skip(self), fields(user_id, integration_id))]
    pub async fn refresh_tokens(
        &self,
        user_id: &str,
        integration_id: &str,
    ) -> Result<ConnectionRecord, OAuthError> {
        self.refresh_tokens_if_expiring_within(user_id, integration_id, REFRESH_SHORT_CIRCUIT_SECS)
            .await
    }

    /// Like [`refresh_tokens`](Self::refresh_tokens), but treats any token
    /// still valid past `min_validity_secs` as fresh enough to skip. The
    /// maintenance scheduler passes its lookahead window here so tokens
    /// expiring soon are renewed before they lapse.
    pub async fn refresh_tokens_if_expiring_within(
        &self,
        user_id: &str,
        integration_id: &str,
        min_validity_secs: i64,
    ) -> Result<ConnectionRecord, OAuthError> {
        let key = (user_id.to_string(), integration_id.to_string());
        let lock = self.refresh_lock(key.clone()).await;
        let guard = lock.lock().await;
        let result = self
            .refresh_locked(user_id, integration_id, min_validity_secs)
            .await;
        drop(guard);
        self.release_refresh_lock(&key, &lock).await;
        result
    }

    /// Remove the lock entry once it has no other holders, so the map does
    /// not grow one entry per (user, integration) forever.
    async fn release_refresh_lock(&self, key: &RefreshKey, lock: &Arc<Mutex<()>>) {
        let mut locks = self.refresh_locks.lock().await;
        // The map and this caller hold the only references when uncontended;
        // waiters cloned theirs under the same map lock.
        if Arc::strong_count(lock) == 2 {
            locks.remove(key);
        }
    }

    async fn refresh_locked(
        &self,
        user_id: &str,
        integration_id: &str,
        min_validity_secs: i64,
    ) -> Result<ConnectionRecord, OAuthError> {
        let mut record = self
            .connections
            .find(user_id, integration_id)
            .await?
            .ok_or_else(|| OAuthError::NotConnected(integration_id.to_string()))?;

        // A concurrent flight may have just refreshed; don't do it again.
        let now = Utc::now();
        if record.status == ConnectionStatus::Connected
            && matches!(
                record.expires_at,
                Some(expires_at) if expires_at > now + Duration::seconds(min_validity_secs)
            )
        {
            debug!(integration_id, "Token already fresh, skipping refresh");
            return Ok(record);
        }

        // Fast fail when there is nothing to refresh with. No network call.
        let Some(refresh_ciphertext) = record.refresh_token.clone() else {
            record.set_status(ConnectionStatus::Expired);
            record.last_error = Some("token_expired: no refresh token available".to_string());
            self.connections.upsert(record).await?;
            counter!(
                "oauth_refresh_failure_total",
                "integration" => integration_id.to_string(),
                "kind" => "token_expired"
            )
            .increment(1);
            return Err(ClassifiedError::new(
                ErrorKind::TokenExpired,
                "connection has no refresh token; user must reconnect",
            )
            .into());
        };

        let definition = self.definition(integration_id)?;
        let credentials = self
            .credentials
            .get(integration_id)
            .ok_or_else(|| OAuthError::OAuthNotConfigured(integration_id.to_string()))?;

        let refresh_token =
            self.security
                .decrypt_token(user_id, integration_id, &refresh_ciphertext)?;

        let previous_status = record.effective_status(now);
        record.set_status(ConnectionStatus::Refreshing);
        self.connections.upsert(record.clone()).await?;

        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
            ("client_id", credentials.client_id.clone()),
            ("client_secret", credentials.client_secret.clone()),
        ];
        let outcome = self.request_token(&definition.token_url, &form).await;

        // Every outcome flows through here so the record always leaves
        // `refreshing` for a terminal status.
        self.finish_refresh(record, previous_status, outcome).await
    }

    async fn finish_refresh(
        &self,
        mut record: ConnectionRecord,
        previous_status: ConnectionStatus,
        outcome: Result<TokenGrant, ClassifiedError>,
    ) -> Result<ConnectionRecord, OAuthError> {
        let user_id = record.user_id.clone();
        let integration_id = record.integration_id.clone();

        match outcome {
            Ok(grant) => {
                record.access_token = Some(self.security.encrypt_token(
                    &user_id,
                    &integration_id,
                    &grant.access_token,
                )?);
                // Rotated refresh tokens always replace the stored one.
                if let Some(new_refresh) = &grant.refresh_token {
                    record.refresh_token = Some(self.security.encrypt_token(
                        &user_id,
                        &integration_id,
                        new_refresh,
                    )?);
                }
                if grant.token_type.is_some() {
                    record.token_type = grant.token_type;
                }
                if grant.scope.is_some() {
                    record.scope = grant.scope;
                }
                record.expires_at = grant.expires_at;
                record.last_refreshed_at = Some(Utc::now());
                record.last_error = None;
                record.error_count = 0;
                record.health = ConnectionHealth::Healthy;
                record.set_status(ConnectionStatus::Connected);
                self.connections.upsert(record.clone()).await?;

                self.audit
                    .append(AuditLogEntry::new(
                        Some(user_id),
                        integration_id.clone(),
                        AuditEventType::TokenRefreshed,
                        "Access token refreshed",
                    ))
                    .await?;
                counter!(
                    "oauth_refresh_success_total",
                    "integration" => integration_id
                )
                .increment(1);

                Ok(record)
            }
            Err(classified) => {
                record.error_count = record.error_count.saturating_add(1);
                record.last_error = Some(format!(
                    "{}: {}",
                    classified.kind.code(),
                    classified.message
                ));

                if classified.is_retryable() {
                    // Transient fault: restore the previous terminal status
                    // so the scheduler retries on a later cycle.
                    record.health = ConnectionHealth::Warning;
                    record.set_status(previous_status);
                } else {
                    // invalid_grant and friends mean the user must reconnect.
                    record.health = ConnectionHealth::Error;
                    record.set_status(ConnectionStatus::Error);
                }
                self.connections.upsert(record).await?;

                self.audit
                    .append(
                        AuditLogEntry::new(
                            Some(user_id),
                            integration_id.clone(),
                            AuditEventType::TokenRefreshFailed,
                            format!("Token refresh failed: {}", classified.message),
                        )
                        .with_metadata(serde_json::json!({
                            "kind": classified.kind.code(),
                            "retryable": classified.is_retryable(),
                        })),
                    )
                    .await?;
                counter!(
                    "oauth_refresh_failure_total",
                    "integration" => integration_id,
                    "kind" => classified.kind.code()
                )
                .increment(1);

                Err(classified.into())
            }
        }
    }

    /// Remove a connection. Idempotent; returns whether one existed.
    #[instrument(skip(self), fields(user_id, integration_id))]
    pub async fn disconnect(
        &self,
        user_id: &str,
        integration_id: &str,
        request: RequestMetadata,
    ) -> Result<bool, OAuthError> {
        let existed = self.connections.delete(user_id, integration_id).await?;
        if existed {
            self.audit
                .append(
                    AuditLogEntry::new(
                        Some(user_id.to_string()),
                        integration_id,
                        AuditEventType::ConnectionRemoved,
                        "Connection removed",
                    )
                    .with_request(request),
                )
                .await?;
            counter!(
                "oauth_disconnect_total",
                "integration" => integration_id.to_string()
            )
            .increment(1);
        }
        Ok(existed)
    }

    /// Probe the connection against the integration's health endpoint. An
    /// integration without one is assumed healthy while tokens are valid.
    #[instrument(skip(self), fields(user_id, integration_id))]
    pub async fn test_connection(
        &self,
        user_id: &str,
        integration_id: &str,
    ) -> Result<ConnectionTestReport, OAuthError> {
        let definition = self.definition(integration_id)?;
        let mut record = self
            .connections
            .find(user_id, integration_id)
            .await?
            .ok_or_else(|| OAuthError::NotConnected(integration_id.to_string()))?;

        let now = Utc::now();
        let status = record.effective_status(now);
        if status != ConnectionStatus::Connected {
            return Ok(ConnectionTestReport {
                integration_id: integration_id.to_string(),
                healthy: false,
                status,
                message: format!("connection is {:?}", status).to_lowercase(),
            });
        }

        let Some(health_check_url) = definition.health_check_url.clone() else {
            record.health = ConnectionHealth::Healthy;
            record.last_used_at = Some(now);
            self.connections.upsert(record).await?;
            return Ok(ConnectionTestReport {
                integration_id: integration_id.to_string(),
                healthy: true,
                status,
                message: "no health endpoint defined; connection assumed healthy".to_string(),
            });
        };

        let access_ciphertext = record.access_token.clone().ok_or_else(|| {
            OAuthError::NotConnected(integration_id.to_string())
        })?;
        let access_token =
            self.security
                .decrypt_token(user_id, integration_id, &access_ciphertext)?;

        let (healthy, message) = match self
            .http
            .get(&health_check_url)
            .bearer_auth(&access_token)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                (true, "provider accepted the credentials".to_string())
            }
            Ok(response) if response.status().as_u16() == 401 => {
                (false, "provider rejected the access token".to_string())
            }
            Ok(response) => (
                false,
                format!("health endpoint returned HTTP {}", response.status().as_u16()),
            ),
            Err(e) => {
                let classified = self.classifier.classify_transport(&e);
                (false, classified.message)
            }
        };

        record.health = if healthy {
            ConnectionHealth::Healthy
        } else {
            ConnectionHealth::Error
        };
        record.last_used_at = Some(now);
        self.connections.upsert(record).await?;

        self.audit
            .append(AuditLogEntry::new(
                Some(user_id.to_string()),
                integration_id,
                AuditEventType::ConnectionTested,
                format!("Connection test: {}", message),
            ))
            .await?;

        Ok(ConnectionTestReport {
            integration_id: integration_id.to_string(),
            healthy,
            status,
            message,
        })
    }

    /// Current status with lazy expiry derivation; never writes the store.
    pub async fn get_connection_status(
        &self,
        user_id: &str,
        integration_id: &str,
    ) -> Result<ConnectionView, OAuthError> {
        self.definition(integration_id)?;
        let record = self
            .connections
            .find(user_id, integration_id)
            .await?
            .ok_or_else(|| OAuthError::NotConnected(integration_id.to_string()))?;
        Ok(ConnectionView::from_record(&record, Utc::now()))
    }

    /// All of a user's connections, projected with lazy expiry derivation.
    pub async fn get_user_connections(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConnectionView>, OAuthError> {
        let now = Utc::now();
        let records = self.connections.list_for_user(user_id).await?;
        Ok(records
            .iter()
            .map(|record| ConnectionView::from_record(record, now))
            .collect())
    }

    async fn fetch_provider_identity(
        &self,
        user_info_url: &str,
        access_token: &str,
    ) -> Option<ProviderIdentity> {
        let response = self
            .http
            .get(user_info_url)
            .bearer_auth(access_token)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!(
                status = response.status().as_u16(),
                "Provider identity lookup failed"
            );
            return None;
        }
        let body: serde_json::Value = response.json().await.ok()?;
        Some(ProviderIdentity::from_json(&body))
    }
}

#[derive(Debug, Default)]
struct ProviderIdentity {
    id: Option<String>,
    username: Option<String>,
    email: Option<String>,
}

impl ProviderIdentity {
    /// Providers disagree on field names; probe the common ones.
    fn from_json(body: &serde_json::Value) -> Self {
        let pick = |keys: &[&str]| {
            keys.iter().find_map(|key| {
                body.get(*key).and_then(|v| match v {
                    serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
            })
        };
        Self {
            id: pick(&["id", "user_id", "sub"]),
            username: pick(&["username", "login", "name", "preferred_username"]),
            email: pick(&["email"]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoKey;
    use crate::registry::OAuthCredentials;
    use crate::security::RateLimitSettings;
    use crate::store::MemoryStore;

    fn test_manager() -> (OAuthManager, Arc<MemoryStore>) {
        let store = MemoryStore::shared();
        let key = CryptoKey::new(vec![9u8; 32]).expect("valid test key");
        let security = Arc::new(SecurityManager::new(key, RateLimitSettings::default()));

        let mut credentials = CredentialRegistry::new();
        for id in ["shopify", "salesforce", "slack"] {
            credentials.insert(
                id,
                OAuthCredentials {
                    client_id: format!("{}-client", id),
                    client_secret: format!("{}-secret", id),
                    webhook_secret: None,
                },
            );
        }

        let manager = OAuthManager::new(
            security,
            Arc::new(IntegrationRegistry::builtin()),
            Arc::new(credentials),
            Arc::new(ErrorClassifier::new()),
            store.clone(),
            store.clone(),
            reqwest::Client::new(),
            "https://hub.crewflow.dev/callback".to_string(),
        );
        (manager, store)
    }

    #[tokio::test]
    async fn test_generate_auth_url_plain() {
        let (manager, store) = test_manager();
        let authorize = manager
            .generate_auth_url("user-1", "shopify", None, RequestMetadata::default())
            .await
            .unwrap();

        let url = Url::parse(&authorize.url).unwrap();
        let params: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        assert_eq!(params["client_id"], "shopify-client");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], "https://hub.crewflow.dev/callback");
        assert!(params["scope"].contains("read_products"));
        assert!(!params.contains_key("code_challenge"));

        // State decodes back to the initiating identity
        let state = crate::security::SecurityManager::new(
            CryptoKey::new(vec![9u8; 32]).unwrap(),
            RateLimitSettings::default(),
        )
        .parse_state(&params["state"])
        .unwrap();
        assert_eq!(state.user_id, "user-1");
        assert_eq!(state.integration_id, "shopify");
        assert!(state.pkce_verifier.is_none());

        let entries = AuditStore::list_for_user(store.as_ref(), "user-1", 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, AuditEventType::ConnectionInitiated);
    }

    #[tokio::test]
    async fn test_generate_auth_url_pkce_and_quirks() {
        let (manager, _) = test_manager();
        let authorize = manager
            .generate_auth_url("user-1", "salesforce", None, RequestMetadata::default())
            .await
            .unwrap();

        let url = Url::parse(&authorize.url).unwrap();
        let params: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        assert_eq!(params["code_challenge_method"], "S256");
        assert!(!params["code_challenge"].is_empty());
        assert_eq!(params["prompt"], "login consent");

        // Verifier rides inside the state and matches the challenge
        let state = manager.security.parse_state(&params["state"]).unwrap();
        let verifier = state.pkce_verifier.unwrap();
        assert!(manager.security.validate_pkce(&verifier, &params["code_challenge"]));
    }

    #[tokio::test]
    async fn test_generate_auth_url_failure_modes() {
        let (manager, _) = test_manager();

        let err = manager
            .generate_auth_url("user-1", "jira", None, RequestMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::IntegrationNotFound(_)));

        // hubspot is in the catalog but has no credentials in the fixture
        let err = manager
            .generate_auth_url("user-1", "hubspot", None, RequestMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::OAuthNotConfigured(_)));
    }

    #[tokio::test]
    async fn test_callback_rejects_bad_state() {
        let (manager, store) = test_manager();

        let err = manager
            .handle_callback(
                CallbackParams {
                    code: Some("abc".to_string()),
                    state: Some("garbage".to_string()),
                    ..Default::default()
                },
                RequestMetadata::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.callback_reason(), "state");

        // The rejection itself is audit-logged even though the callback
        // short-circuits before a user is known.
        let entries = AuditStore::list_recent(store.as_ref(), 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, AuditEventType::SecurityViolation);
        assert!(entries[0].user_id.is_none());
    }

    #[tokio::test]
    async fn test_callback_audits_expired_state() {
        let (manager, store) = test_manager();
        let mut state = manager
            .security
            .parse_state(
                &manager
                    .security
                    .generate_state("shopify", "user-1", None, None)
                    .unwrap(),
            )
            .unwrap();
        state.issued_at_ms -= STATE_MAX_AGE_MS + 60_000;
        let token = base64_url::encode(&serde_json::to_vec(&state).unwrap());

        let err = manager
            .handle_callback(
                CallbackParams {
                    code: Some("abc".to_string()),
                    state: Some(token),
                    ..Default::default()
                },
                RequestMetadata::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.callback_reason(), "state");

        let entries = AuditStore::list_for_user(store.as_ref(), "user-1", 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, AuditEventType::SecurityViolation);
        assert_eq!(entries[0].integration_id, "shopify");
    }

    #[tokio::test]
    async fn test_callback_provider_denial() {
        let (manager, store) = test_manager();
        let state = manager
            .security
            .generate_state("shopify", "user-1", None, None)
            .unwrap();

        let err = manager
            .handle_callback(
                CallbackParams {
                    state: Some(state),
                    error: Some("access_denied".to_string()),
                    error_description: Some("user cancelled".to_string()),
                    ..Default::default()
                },
                RequestMetadata::default(),
            )
            .await
            .unwrap_err();

        match err {
            OAuthError::Provider(classified) => {
                assert_eq!(classified.kind, ErrorKind::AccessDenied);
                assert_eq!(classified.message, "user cancelled");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let entries = AuditStore::list_for_user(store.as_ref(), "user-1", 10)
            .await
            .unwrap();
        assert!(
            entries
                .iter()
                .any(|e| e.event_type == AuditEventType::ConnectionFailed)
        );
    }

    #[tokio::test]
    async fn test_refresh_fast_fails_without_refresh_token() {
        let (manager, store) = test_manager();

        let mut record = ConnectionRecord::new("user-1", "shopify");
        record.set_status(ConnectionStatus::Connected);
        record.expires_at = Some(Utc::now() - Duration::minutes(5));
        record.access_token = Some(vec![1, 2, 3]);
        ConnectionStore::upsert(store.as_ref(), record).await.unwrap();

        let err = manager.refresh_tokens("user-1", "shopify").await.unwrap_err();
        match err {
            OAuthError::Provider(classified) => {
                assert_eq!(classified.kind, ErrorKind::TokenExpired)
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Record dropped to a terminal status, never stuck in refreshing
        let record = ConnectionStore::find(store.as_ref(), "user-1", "shopify")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ConnectionStatus::Expired);
    }

    #[tokio::test]
    async fn test_refresh_short_circuits_fresh_token() {
        let (manager, store) = test_manager();

        let mut record = ConnectionRecord::new("user-1", "shopify");
        record.set_status(ConnectionStatus::Connected);
        record.expires_at = Some(Utc::now() + Duration::hours(2));
        record.access_token = Some(vec![1, 2, 3]);
        ConnectionStore::upsert(store.as_ref(), record.clone())
            .await
            .unwrap();

        // No wiremock server is running, so any network call would fail;
        // success here proves no provider call was made.
        let refreshed = manager.refresh_tokens("user-1", "shopify").await.unwrap();
        assert_eq!(refreshed.status, ConnectionStatus::Connected);
        assert_eq!(refreshed.id, record.id);
    }

    #[tokio::test]
    async fn test_refresh_lock_entries_released() {
        let (manager, store) = test_manager();

        let mut record = ConnectionRecord::new("user-1", "shopify");
        record.set_status(ConnectionStatus::Connected);
        record.expires_at = Some(Utc::now() + Duration::hours(2));
        record.access_token = Some(vec![1, 2, 3]);
        ConnectionStore::upsert(store.as_ref(), record).await.unwrap();

        let (first, second) = tokio::join!(
            manager.refresh_tokens("user-1", "shopify"),
            manager.refresh_tokens("user-1", "shopify"),
        );
        first.unwrap();
        second.unwrap();

        // No residue per (user, integration) after the guards drop.
        assert!(manager.refresh_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_unknown_connection() {
        let (manager, _) = test_manager();
        let err = manager.refresh_tokens("user-1", "shopify").await.unwrap_err();
        assert!(matches!(err, OAuthError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let (manager, store) = test_manager();
        ConnectionStore::upsert(store.as_ref(), ConnectionRecord::new("user-1", "shopify"))
            .await
            .unwrap();

        assert!(
            manager
                .disconnect("user-1", "shopify", RequestMetadata::default())
                .await
                .unwrap()
        );
        assert!(
            !manager
                .disconnect("user-1", "shopify", RequestMetadata::default())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_status_reads_derive_expired_without_writing() {
        let (manager, store) = test_manager();

        let mut record = ConnectionRecord::new("user-1", "shopify");
        record.set_status(ConnectionStatus::Connected);
        record.expires_at = Some(Utc::now() - Duration::seconds(10));
        ConnectionStore::upsert(store.as_ref(), record).await.unwrap();

        let view = manager
            .get_connection_status("user-1", "shopify")
            .await
            .unwrap();
        assert_eq!(view.status, ConnectionStatus::Expired);

        // Stored status is untouched
        let stored = ConnectionStore::find(store.as_ref(), "user-1", "shopify")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_list_user_connections() {
        let (manager, store) = test_manager();
        for integration in ["shopify", "slack"] {
            let mut record = ConnectionRecord::new("user-1", integration);
            record.set_status(ConnectionStatus::Connected);
            ConnectionStore::upsert(store.as_ref(), record).await.unwrap();
        }
        ConnectionStore::upsert(store.as_ref(), ConnectionRecord::new("user-2", "slack"))
            .await
            .unwrap();

        let views = manager.get_user_connections("user-1").await.unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].integration_id, "shopify");
        assert_eq!(views[1].integration_id, "slack");
    }

    #[test]
    fn test_provider_identity_field_probing() {
        let identity = ProviderIdentity::from_json(&serde_json::json!({
            "sub": 12345,
            "preferred_username": "jdoe",
            "email": "jdoe@example.com",
        }));
        assert_eq!(identity.id.as_deref(), Some("12345"));
        assert_eq!(identity.username.as_deref(), Some("jdoe"));
        assert_eq!(identity.email.as_deref(), Some("jdoe@example.com"));

        let empty = ProviderIdentity::from_json(&serde_json::json!({"email": ""}));
        assert!(empty.id.is_none());
        assert!(empty.email.is_none());
    }
}
