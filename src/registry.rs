//! # Integration Registry
//!
//! Static catalog of supported integrations and the per-integration OAuth
//! client credentials loaded from configuration. Both registries are built
//! once at startup and injected explicitly; nothing here is a process-wide
//! singleton.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Static description of one OAuth provider integration.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IntegrationDefinition {
    /// Stable identifier, e.g. "shopify"
    pub id: String,
    pub display_name: String,
    pub authorize_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub requires_pkce: bool,
    /// Provider-specific query parameters appended to the authorize URL
    /// (e.g. Slack's `user_scope`, Salesforce's `prompt`).
    #[serde(default)]
    pub extra_authorize_params: Vec<(String, String)>,
    /// Endpoint for post-connect identity enrichment, when the provider has one.
    pub user_info_url: Option<String>,
    /// Lightweight authenticated endpoint for connection tests. Absent means
    /// tests assume the connection is healthy.
    pub health_check_url: Option<String>,
    /// Header carrying the webhook HMAC signature, when the provider pushes
    /// webhooks (e.g. `X-Shopify-Hmac-Sha256`).
    pub webhook_signature_header: Option<String>,
}

/// OAuth client credentials for one integration.
#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_secret: Option<String>,
}

/// Catalog of integration definitions.
#[derive(Debug, Clone, Default)]
pub struct IntegrationRegistry {
    definitions: HashMap<String, IntegrationDefinition>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in CrewFlow integrations.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for definition in builtin_definitions() {
            registry.register(definition);
        }
        registry
    }

    pub fn register(&mut self, definition: IntegrationDefinition) {
        self.definitions.insert(definition.id.clone(), definition);
    }

    pub fn get(&self, id: &str) -> Option<&IntegrationDefinition> {
        self.definitions.get(id)
    }

    pub fn list(&self) -> Vec<&IntegrationDefinition> {
        let mut definitions: Vec<_> = self.definitions.values().collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }
}

/// Per-integration client credentials loaded from the environment.
#[derive(Debug, Clone, Default)]
pub struct CredentialRegistry {
    credentials: HashMap<String, OAuthCredentials>,
}

impl CredentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(credentials: HashMap<String, OAuthCredentials>) -> Self {
        Self { credentials }
    }

    pub fn insert(&mut self, integration_id: impl Into<String>, credentials: OAuthCredentials) {
        self.credentials.insert(integration_id.into(), credentials);
    }

    pub fn get(&self, integration_id: &str) -> Option<&OAuthCredentials> {
        let credentials = self.credentials.get(integration_id);
        if credentials.is_none() {
            tracing::warn!(integration_id, "No OAuth credentials configured");
        }
        credentials
    }

    /// Whether the integration has a usable client id and secret.
    pub fn is_ready(&self, integration_id: &str) -> bool {
        self.credentials
            .get(integration_id)
            .map(|c| !c.client_id.is_empty() && !c.client_secret.is_empty())
            .unwrap_or(false)
    }

    /// Integration ids with credentials configured, sorted.
    pub fn list_ready(&self) -> Vec<&str> {
        let mut ready: Vec<_> = self
            .credentials
            .keys()
            .map(String::as_str)
            .filter(|id| self.is_ready(id))
            .collect();
        ready.sort();
        ready
    }

    pub fn webhook_secret(&self, integration_id: &str) -> Option<&str> {
        self.credentials
            .get(integration_id)
            .and_then(|c| c.webhook_secret.as_deref())
    }
}

fn builtin_definitions() -> Vec<IntegrationDefinition> {
    vec![
        IntegrationDefinition {
            id: "shopify".to_string(),
            display_name: "Shopify".to_string(),
            authorize_url: "https://accounts.shopify.com/oauth/authorize".to_string(),
            token_url: "https://accounts.shopify.com/oauth/token".to_string(),
            scopes: vec![
                "read_products".to_string(),
                "read_orders".to_string(),
                "read_customers".to_string(),
            ],
            requires_pkce: false,
            extra_authorize_params: vec![],
            user_info_url: Some("https://accounts.shopify.com/oauth/userinfo".to_string()),
            health_check_url: Some("https://accounts.shopify.com/oauth/userinfo".to_string()),
            webhook_signature_header: Some("X-Shopify-Hmac-Sha256".to_string()),
        },
        IntegrationDefinition {
            id: "salesforce".to_string(),
            display_name: "Salesforce".to_string(),
            authorize_url: "https://login.salesforce.com/services/oauth2/authorize".to_string(),
            token_url: "https://login.salesforce.com/services/oauth2/token".to_string(),
            scopes: vec!["api".to_string(), "refresh_token".to_string()],
            requires_pkce: true,
            extra_authorize_params: vec![("prompt".to_string(), "login consent".to_string())],
            user_info_url: Some(
                "https://login.salesforce.com/services/oauth2/userinfo".to_string(),
            ),
            health_check_url: Some(
                "https://login.salesforce.com/services/oauth2/userinfo".to_string(),
            ),
            webhook_signature_header: None,
        },
        IntegrationDefinition {
            id: "hubspot".to_string(),
            display_name: "HubSpot".to_string(),
            authorize_url: "https://app.hubspot.com/oauth/authorize".to_string(),
            token_url: "https://api.hubapi.com/oauth/v1/token".to_string(),
            scopes: vec!["crm.objects.contacts.read".to_string(), "oauth".to_string()],
            requires_pkce: false,
            extra_authorize_params: vec![(
                "optional_scope".to_string(),
                "crm.objects.deals.read".to_string(),
            )],
            user_info_url: None,
            health_check_url: Some(
                "https://api.hubapi.com/oauth/v1/access-tokens".to_string(),
            ),
            webhook_signature_header: Some("X-HubSpot-Signature".to_string()),
        },
        IntegrationDefinition {
            id: "slack".to_string(),
            display_name: "Slack".to_string(),
            authorize_url: "https://slack.com/oauth/v2/authorize".to_string(),
            token_url: "https://slack.com/api/oauth.v2.access".to_string(),
            scopes: vec!["channels:read".to_string(), "chat:write".to_string()],
            requires_pkce: false,
            extra_authorize_params: vec![(
                "user_scope".to_string(),
                "identity.basic".to_string(),
            )],
            user_info_url: Some("https://slack.com/api/users.identity".to_string()),
            health_check_url: Some("https://slack.com/api/auth.test".to_string()),
            webhook_signature_header: Some("X-Slack-Signature".to_string()),
        },
    ]
}
