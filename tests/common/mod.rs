#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use wiremock::MockServer;

use crewflow_integrations::classify::ErrorClassifier;
use crewflow_integrations::crypto::CryptoKey;
use crewflow_integrations::oauth::OAuthManager;
use crewflow_integrations::recovery::RecoveryService;
use crewflow_integrations::registry::{
    CredentialRegistry, IntegrationDefinition, IntegrationRegistry, OAuthCredentials,
};
use crewflow_integrations::security::{RateLimitSettings, SecurityManager};
use crewflow_integrations::store::{
    ConnectionHealth, ConnectionRecord, ConnectionStatus, ConnectionStore, MemoryStore,
};

pub const USER: &str = "user-1";
pub const INTEGRATION: &str = "acme";

/// Wires an [`OAuthManager`] to a wiremock provider so flows can be driven
/// end to end without touching a real OAuth server.
pub struct Harness {
    pub server: MockServer,
    pub oauth: Arc<OAuthManager>,
    pub security: Arc<SecurityManager>,
    pub recovery: Arc<RecoveryService>,
    pub store: Arc<MemoryStore>,
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(customize: impl FnOnce(&mut IntegrationDefinition)) -> Harness {
    let server = MockServer::start().await;

    let mut definition = IntegrationDefinition {
        id: INTEGRATION.to_string(),
        display_name: "Acme CRM".to_string(),
        authorize_url: format!("{}/oauth/authorize", server.uri()),
        token_url: format!("{}/oauth/token", server.uri()),
        scopes: vec!["read".to_string(), "write".to_string()],
        requires_pkce: false,
        extra_authorize_params: vec![],
        user_info_url: None,
        health_check_url: Some(format!("{}/me", server.uri())),
        webhook_signature_header: None,
    };
    customize(&mut definition);

    let mut integrations = IntegrationRegistry::new();
    integrations.register(definition);

    let mut credentials = CredentialRegistry::new();
    credentials.insert(
        INTEGRATION,
        OAuthCredentials {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            webhook_secret: None,
        },
    );

    let security = Arc::new(SecurityManager::new(
        CryptoKey::new(vec![7u8; 32]).expect("valid test key"),
        RateLimitSettings::default(),
    ));
    let store = MemoryStore::shared();
    let oauth = Arc::new(OAuthManager::new(
        Arc::clone(&security),
        Arc::new(integrations),
        Arc::new(credentials),
        Arc::new(ErrorClassifier::new()),
        store.clone(),
        store.clone(),
        reqwest::Client::new(),
        "https://hub.crewflow.test/callback".to_string(),
    ));
    let recovery = Arc::new(RecoveryService::new(Arc::clone(&oauth)));

    Harness {
        server,
        oauth,
        security,
        recovery,
        store,
    }
}

impl Harness {
    /// Seed a connected record with encrypted token material.
    pub async fn seed_connection(&self, expires_at: DateTime<Utc>) {
        let mut record = ConnectionRecord::new(USER, INTEGRATION);
        record.access_token = Some(
            self.security
                .encrypt_token(USER, INTEGRATION, "at-old")
                .expect("encrypt access token"),
        );
        record.refresh_token = Some(
            self.security
                .encrypt_token(USER, INTEGRATION, "rt-old")
                .expect("encrypt refresh token"),
        );
        record.token_type = Some("Bearer".to_string());
        record.scope = Some("read write".to_string());
        record.expires_at = Some(expires_at);
        record.connected_at = Some(Utc::now());
        record.health = ConnectionHealth::Healthy;
        record.set_status(ConnectionStatus::Connected);
        ConnectionStore::upsert(self.store.as_ref(), record)
            .await
            .expect("seed connection");
    }

    pub async fn find_connection(&self) -> ConnectionRecord {
        ConnectionStore::find(self.store.as_ref(), USER, INTEGRATION)
            .await
            .expect("store read")
            .expect("connection present")
    }
}
