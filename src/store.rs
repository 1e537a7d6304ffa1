//! # Connection and Audit Stores
//!
//! Data model for connection records and audit entries, behind async store
//! traits. The bundled in-memory implementation backs tests and
//! single-process deployments; a relational store can implement the same
//! traits externally.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle status of a connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Error,
    Expired,
    Refreshing,
}

/// Coarse health assessment, updated by tests and refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionHealth {
    Healthy,
    Warning,
    Error,
    Unknown,
}

/// One OAuth connection per (user, integration) pair.
///
/// Token fields hold AES-256-GCM ciphertexts and never leave the process in
/// API responses; handlers project records into sanitized views.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub integration_id: String,
    pub status: ConnectionStatus,
    pub health: ConnectionHealth,
    pub access_token: Option<Vec<u8>>,
    pub refresh_token: Option<Vec<u8>>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: u32,
    pub provider_user_id: Option<String>,
    pub provider_username: Option<String>,
    pub provider_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When `status` last changed; drives the abandoned-refresh sweep.
    pub status_changed_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn new(user_id: impl Into<String>, integration_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            integration_id: integration_id.into(),
            status: ConnectionStatus::Disconnected,
            health: ConnectionHealth::Unknown,
            access_token: None,
            refresh_token: None,
            token_type: None,
            scope: None,
            expires_at: None,
            connected_at: None,
            last_used_at: None,
            last_refreshed_at: None,
            last_error: None,
            error_count: 0,
            provider_user_id: None,
            provider_username: None,
            provider_email: None,
            created_at: now,
            updated_at: now,
            status_changed_at: now,
        }
    }

    /// Status as observed at `now`. A `connected` record whose token expiry
    /// has passed reads as `expired` without a store write.
    pub fn effective_status(&self, now: DateTime<Utc>) -> ConnectionStatus {
        match (self.status, self.expires_at) {
            (ConnectionStatus::Connected, Some(expires_at)) if expires_at <= now => {
                ConnectionStatus::Expired
            }
            (status, _) => status,
        }
    }

    /// Transition to a new status, stamping the change time.
    pub fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status;
            self.status_changed_at = Utc::now();
        }
        self.updated_at = Utc::now();
    }

    /// True when a refresh cycle appears to have died without resolving.
    pub fn refresh_is_stale(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        self.status == ConnectionStatus::Refreshing && now - self.status_changed_at > staleness
    }
}

/// Audit event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ConnectionInitiated,
    ConnectionCompleted,
    ConnectionFailed,
    ConnectionRemoved,
    ConnectionTested,
    TokenRefreshed,
    TokenRefreshFailed,
    RecoveryAttempted,
    RecoverySucceeded,
    RecoveryFailed,
    SecurityViolation,
    MaintenanceRun,
}

/// Request provenance recorded alongside audit entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RequestMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub integration_id: String,
    pub event_type: AuditEventType,
    pub description: String,
    #[serde(flatten)]
    pub request: RequestMetadata,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        user_id: Option<String>,
        integration_id: impl Into<String>,
        event_type: AuditEventType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            integration_id: integration_id.into(),
            event_type,
            description: description.into(),
            request: RequestMetadata::default(),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_request(mut self, request: RequestMetadata) -> Self {
        self.request = request;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection not found for user {user_id} and integration {integration_id}")]
    NotFound {
        user_id: String,
        integration_id: String,
    },
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persistence seam for connection records.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Insert or replace the record for its (user, integration) pair.
    async fn upsert(&self, record: ConnectionRecord) -> Result<(), StoreError>;

    async fn find(
        &self,
        user_id: &str,
        integration_id: &str,
    ) -> Result<Option<ConnectionRecord>, StoreError>;

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ConnectionRecord>, StoreError>;

    /// Connected records whose expiry falls at or before `cutoff`, plus
    /// records already marked expired. Used by the maintenance sweep.
    async fn list_needing_refresh(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ConnectionRecord>, StoreError>;

    async fn list_with_status(
        &self,
        status: ConnectionStatus,
    ) -> Result<Vec<ConnectionRecord>, StoreError>;

    async fn list_all(&self) -> Result<Vec<ConnectionRecord>, StoreError>;

    /// Remove a record; returns whether one existed.
    async fn delete(&self, user_id: &str, integration_id: &str) -> Result<bool, StoreError>;
}

/// Persistence seam for audit entries.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: AuditLogEntry) -> Result<(), StoreError>;

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>, StoreError>;

    /// Newest entries across all users, including anonymous ones such as
    /// rejected webhook deliveries.
    async fn list_recent(&self, limit: usize) -> Result<Vec<AuditLogEntry>, StoreError>;

    /// Delete entries older than `cutoff`; returns the number removed.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// In-memory store, keyed by (user, integration).
#[derive(Default)]
pub struct MemoryStore {
    connections: RwLock<HashMap<(String, String), ConnectionRecord>>,
    audit: RwLock<Vec<AuditLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ConnectionStore for MemoryStore {
    async fn upsert(&self, record: ConnectionRecord) -> Result<(), StoreError> {
        let key = (record.user_id.clone(), record.integration_id.clone());
        self.connections.write().await.insert(key, record);
        Ok(())
    }

    async fn find(
        &self,
        user_id: &str,
        integration_id: &str,
    ) -> Result<Option<ConnectionRecord>, StoreError> {
        let key = (user_id.to_string(), integration_id.to_string());
        Ok(self.connections.read().await.get(&key).cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ConnectionRecord>, StoreError> {
        let mut records: Vec<_> = self
            .connections
            .read()
            .await
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.integration_id.cmp(&b.integration_id));
        Ok(records)
    }

    async fn list_needing_refresh(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ConnectionRecord>, StoreError> {
        Ok(self
            .connections
            .read()
            .await
            .values()
            .filter(|record| match record.status {
                ConnectionStatus::Expired => true,
                ConnectionStatus::Connected => {
                    matches!(record.expires_at, Some(expires_at) if expires_at <= cutoff)
                }
                _ => false,
            })
            .cloned()
            .collect())
    }

    async fn list_with_status(
        &self,
        status: ConnectionStatus,
    ) -> Result<Vec<ConnectionRecord>, StoreError> {
        Ok(self
            .connections
            .read()
            .await
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<ConnectionRecord>, StoreError> {
        Ok(self.connections.read().await.values().cloned().collect())
    }

    async fn delete(&self, user_id: &str, integration_id: &str) -> Result<bool, StoreError> {
        let key = (user_id.to_string(), integration_id.to_string());
        Ok(self.connections.write().await.remove(&key).is_some())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, entry: AuditLogEntry) -> Result<(), StoreError> {
        self.audit.write().await.push(entry);
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>, StoreError> {
        let audit = self.audit.read().await;
        let mut entries: Vec<_> = audit
            .iter()
            .filter(|entry| entry.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<AuditLogEntry>, StoreError> {
        let audit = self.audit.read().await;
        let mut entries: Vec<_> = audit.iter().cloned().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut audit = self.audit.write().await;
        let before = audit.len();
        audit.retain(|entry| entry.created_at >= cutoff);
        Ok((before - audit.len()) as u64)
    }
}
