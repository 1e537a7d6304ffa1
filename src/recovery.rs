//! # Recovery Service
//!
//! Drives one recovery action per classified connection error: refresh for
//! expired tokens, a connectivity re-probe for transient faults, teardown of
//! dead grants so the user can reconnect, and manual markers for everything
//! else. Bulk recovery walks a user's broken connections with per-item
//! isolation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

use crate::classify::{ErrorKind, RecoveryAction};
use crate::oauth::{OAuthError, OAuthManager};
use crate::store::{
    AuditEventType, AuditLogEntry, AuditStore, ConnectionStatus, ConnectionStore,
    RequestMetadata,
};

/// Outcome of one recovery attempt.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RecoveryReport {
    pub integration_id: String,
    pub kind: ErrorKind,
    pub action: RecoveryAction,
    pub succeeded: bool,
    pub message: String,
}

/// Per-kind attempt accounting, exposed through the maintenance status.
#[derive(Debug, Clone, Copy, Default, Serialize, ToSchema)]
pub struct RecoveryStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

pub struct RecoveryService {
    oauth: Arc<OAuthManager>,
    stats: Mutex<HashMap<ErrorKind, RecoveryStats>>,
}

impl RecoveryService {
    pub fn new(oauth: Arc<OAuthManager>) -> Self {
        Self {
            oauth,
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of per-kind recovery counters.
    pub fn stats_snapshot(&self) -> HashMap<ErrorKind, RecoveryStats> {
        self.stats.lock().expect("recovery stats poisoned").clone()
    }

    fn record_attempt(&self, kind: ErrorKind, succeeded: bool) {
        let mut stats = self.stats.lock().expect("recovery stats poisoned");
        let entry = stats.entry(kind).or_default();
        entry.attempts += 1;
        if succeeded {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }

        counter!("recovery_attempts_total", "kind" => kind.code()).increment(1);
        if succeeded {
            counter!("recovery_success_total", "kind" => kind.code()).increment(1);
        } else {
            counter!("recovery_failure_total", "kind" => kind.code()).increment(1);
        }
    }

    /// Attempt recovery for one connection. When `kind` is not supplied it is
    /// reconstructed from the stored `last_error` code prefix.
    #[instrument(skip(self), fields(user_id, integration_id))]
    pub async fn attempt_recovery(
        &self,
        user_id: &str,
        integration_id: &str,
        kind: Option<ErrorKind>,
    ) -> Result<RecoveryReport, OAuthError> {
        let record = self
            .oauth
            .connections()
            .find(user_id, integration_id)
            .await?
            .ok_or_else(|| OAuthError::NotConnected(integration_id.to_string()))?;

        let kind = kind.unwrap_or_else(|| {
            record
                .last_error
                .as_deref()
                .and_then(stored_error_kind)
                .unwrap_or(match record.effective_status(Utc::now()) {
                    ConnectionStatus::Expired => ErrorKind::TokenExpired,
                    _ => ErrorKind::Unknown,
                })
        });
        // An expired access token with a refresh token still on file is
        // refreshable; the Reconnect prescription is for connections with
        // nothing left to renew.
        let action = if kind == ErrorKind::TokenExpired && record.refresh_token.is_some() {
            RecoveryAction::RefreshToken
        } else {
            kind.recovery_action()
        };

        self.oauth
            .audit()
            .append(
                AuditLogEntry::new(
                    Some(user_id.to_string()),
                    integration_id,
                    AuditEventType::RecoveryAttempted,
                    format!("Recovery attempted with action {:?}", action),
                )
                .with_metadata(serde_json::json!({ "kind": kind.code() })),
            )
            .await?;

        let report = match action {
            RecoveryAction::RefreshToken => {
                match self.oauth.refresh_tokens(user_id, integration_id).await {
                    Ok(_) => RecoveryReport {
                        integration_id: integration_id.to_string(),
                        kind,
                        action,
                        succeeded: true,
                        message: "token refreshed".to_string(),
                    },
                    Err(err) => RecoveryReport {
                        integration_id: integration_id.to_string(),
                        kind,
                        action,
                        succeeded: false,
                        message: format!("refresh failed: {}", err),
                    },
                }
            }
            RecoveryAction::Retry => {
                match self.oauth.test_connection(user_id, integration_id).await {
                    Ok(test) if test.healthy => RecoveryReport {
                        integration_id: integration_id.to_string(),
                        kind,
                        action,
                        succeeded: true,
                        message: "connection recovered on retry".to_string(),
                    },
                    Ok(test) => RecoveryReport {
                        integration_id: integration_id.to_string(),
                        kind,
                        action,
                        succeeded: false,
                        message: test.message,
                    },
                    Err(err) => RecoveryReport {
                        integration_id: integration_id.to_string(),
                        kind,
                        action,
                        succeeded: false,
                        message: format!("retry probe failed: {}", err),
                    },
                }
            }
            RecoveryAction::Reconnect => {
                // Nothing automated can fix a revoked grant; drop the dead
                // connection so the user can re-authorize from a clean slate.
                self.oauth
                    .disconnect(user_id, integration_id, RequestMetadata::default())
                    .await?;
                RecoveryReport {
                    integration_id: integration_id.to_string(),
                    kind,
                    action,
                    succeeded: false,
                    message: "connection removed; user must re-authorize the integration"
                        .to_string(),
                }
            }
            RecoveryAction::ManualIntervention => RecoveryReport {
                integration_id: integration_id.to_string(),
                kind,
                action,
                succeeded: false,
                message: "operator attention required".to_string(),
            },
        };

        self.record_attempt(kind, report.succeeded);
        let event = if report.succeeded {
            info!(integration_id, action = ?action, "Recovery succeeded");
            AuditEventType::RecoverySucceeded
        } else {
            warn!(integration_id, action = ?action, message = %report.message, "Recovery failed");
            AuditEventType::RecoveryFailed
        };
        self.oauth
            .audit()
            .append(
                AuditLogEntry::new(
                    Some(user_id.to_string()),
                    integration_id,
                    event,
                    report.message.clone(),
                )
                .with_metadata(serde_json::json!({
                    "kind": kind.code(),
                    "action": action,
                })),
            )
            .await?;

        Ok(report)
    }

    /// Attempt recovery on all of a user's broken connections. One failing
    /// item never aborts the rest.
    #[instrument(skip(self), fields(user_id))]
    pub async fn bulk_recovery(&self, user_id: &str) -> Result<Vec<RecoveryReport>, OAuthError> {
        let now = Utc::now();
        let records = self.oauth.connections().list_for_user(user_id).await?;

        let mut reports = Vec::new();
        for record in records {
            let status = record.effective_status(now);
            if !matches!(status, ConnectionStatus::Error | ConnectionStatus::Expired) {
                continue;
            }
            match self
                .attempt_recovery(user_id, &record.integration_id, None)
                .await
            {
                Ok(report) => reports.push(report),
                Err(err) => {
                    warn!(
                        integration_id = %record.integration_id,
                        error = %err,
                        "Bulk recovery item failed"
                    );
                    reports.push(RecoveryReport {
                        integration_id: record.integration_id.clone(),
                        kind: ErrorKind::Unknown,
                        action: RecoveryAction::ManualIntervention,
                        succeeded: false,
                        message: format!("recovery errored: {}", err),
                    });
                }
            }
        }
        Ok(reports)
    }
}

/// Recover the error kind from a stored `last_error` of the form
/// `"{kind_code}: {message}"`.
fn stored_error_kind(last_error: &str) -> Option<ErrorKind> {
    let code = last_error.split(':').next()?.trim();
    let kind = match code {
        "invalid_state" => ErrorKind::InvalidState,
        "expired_state" => ErrorKind::ExpiredState,
        "invalid_configuration" => ErrorKind::InvalidConfiguration,
        "oauth_not_configured" => ErrorKind::OAuthNotConfigured,
        "invalid_client" => ErrorKind::InvalidClient,
        "invalid_grant" => ErrorKind::InvalidGrant,
        "invalid_scope" => ErrorKind::InvalidScope,
        "access_denied" => ErrorKind::AccessDenied,
        "rate_limited" => ErrorKind::RateLimited,
        "provider_error" => ErrorKind::ProviderError,
        "network_error" => ErrorKind::NetworkError,
        "timeout" => ErrorKind::Timeout,
        "token_expired" => ErrorKind::TokenExpired,
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorClassifier;
    use crate::crypto::CryptoKey;
    use crate::registry::{CredentialRegistry, IntegrationRegistry, OAuthCredentials};
    use crate::security::{RateLimitSettings, SecurityManager};
    use crate::store::{ConnectionRecord, MemoryStore};

    fn service() -> (RecoveryService, Arc<MemoryStore>) {
        let store = MemoryStore::shared();
        let key = CryptoKey::new(vec![4u8; 32]).expect("valid test key");
        let mut credentials = CredentialRegistry::new();
        credentials.insert(
            "shopify",
            OAuthCredentials {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                webhook_secret: None,
            },
        );
        let oauth = Arc::new(OAuthManager::new(
            Arc::new(SecurityManager::new(key, RateLimitSettings::default())),
            Arc::new(IntegrationRegistry::builtin()),
            Arc::new(credentials),
            Arc::new(ErrorClassifier::new()),
            store.clone(),
            store.clone(),
            reqwest::Client::new(),
            "https://hub.crewflow.dev/callback".to_string(),
        ));
        (RecoveryService::new(oauth), store)
    }

    #[test]
    fn test_stored_error_kind_parsing() {
        assert_eq!(
            stored_error_kind("invalid_grant: refresh token revoked"),
            Some(ErrorKind::InvalidGrant)
        );
        assert_eq!(stored_error_kind("timeout"), Some(ErrorKind::Timeout));
        assert_eq!(stored_error_kind("something weird"), None);
    }

    #[tokio::test]
    async fn test_reconnect_action_reported_not_retried() {
        let (service, store) = service();

        let mut record = ConnectionRecord::new("user-1", "shopify");
        record.set_status(ConnectionStatus::Error);
        record.last_error = Some("invalid_grant: refresh token revoked".to_string());
        ConnectionStore::upsert(store.as_ref(), record).await.unwrap();

        let report = service
            .attempt_recovery("user-1", "shopify", None)
            .await
            .unwrap();
        assert_eq!(report.kind, ErrorKind::InvalidGrant);
        assert_eq!(report.action, RecoveryAction::Reconnect);
        assert!(!report.succeeded);
        assert!(report.message.contains("re-authorize"));

        // The dead connection is removed so a fresh flow starts clean.
        assert!(
            ConnectionStore::find(store.as_ref(), "user-1", "shopify")
                .await
                .unwrap()
                .is_none()
        );

        let stats = service.stats_snapshot();
        let grant_stats = stats[&ErrorKind::InvalidGrant];
        assert_eq!(grant_stats.attempts, 1);
        assert_eq!(grant_stats.failures, 1);
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_requires_reconnect() {
        let (service, store) = service();

        // Nothing to renew: reconnect, not another futile refresh
        let mut record = ConnectionRecord::new("user-1", "shopify");
        record.set_status(ConnectionStatus::Expired);
        ConnectionStore::upsert(store.as_ref(), record).await.unwrap();

        let report = service
            .attempt_recovery("user-1", "shopify", None)
            .await
            .unwrap();
        assert_eq!(report.kind, ErrorKind::TokenExpired);
        assert_eq!(report.action, RecoveryAction::Reconnect);
        assert!(!report.succeeded);
        assert!(
            ConnectionStore::find(store.as_ref(), "user-1", "shopify")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_expired_with_refresh_token_maps_to_refresh_action() {
        let (service, store) = service();

        let mut record = ConnectionRecord::new("user-1", "shopify");
        record.set_status(ConnectionStatus::Expired);
        // Undecryptable ciphertext keeps the refresh attempt off the network
        record.refresh_token = Some(vec![1, 2, 3]);
        ConnectionStore::upsert(store.as_ref(), record).await.unwrap();

        let report = service
            .attempt_recovery("user-1", "shopify", None)
            .await
            .unwrap();
        assert_eq!(report.kind, ErrorKind::TokenExpired);
        assert_eq!(report.action, RecoveryAction::RefreshToken);
        assert!(!report.succeeded);
        // The record survives a failed refresh attempt
        assert!(
            ConnectionStore::find(store.as_ref(), "user-1", "shopify")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_unknown_connection_errors() {
        let (service, _) = service();
        let err = service
            .attempt_recovery("user-1", "shopify", None)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_bulk_recovery_isolation_and_filtering() {
        let (service, store) = service();

        let mut healthy = ConnectionRecord::new("user-1", "slack");
        healthy.set_status(ConnectionStatus::Connected);
        healthy.expires_at = Some(Utc::now() + chrono::Duration::hours(3));
        ConnectionStore::upsert(store.as_ref(), healthy).await.unwrap();

        let mut broken = ConnectionRecord::new("user-1", "shopify");
        broken.set_status(ConnectionStatus::Error);
        broken.last_error = Some("invalid_grant: revoked".to_string());
        ConnectionStore::upsert(store.as_ref(), broken).await.unwrap();

        let mut expired = ConnectionRecord::new("user-1", "salesforce");
        expired.set_status(ConnectionStatus::Expired);
        ConnectionStore::upsert(store.as_ref(), expired).await.unwrap();

        let reports = service.bulk_recovery("user-1").await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| !r.succeeded));
        assert!(reports.iter().any(|r| r.integration_id == "shopify"));
        assert!(reports.iter().any(|r| r.integration_id == "salesforce"));
        // Healthy connection untouched
        assert!(!reports.iter().any(|r| r.integration_id == "slack"));
    }
}
