//! Configuration loading for the Integration Hub.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `CREWFLOW_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{CredentialRegistry, OAuthCredentials};

/// Application configuration derived from `CREWFLOW_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    /// Public base URL used to build the OAuth redirect URI.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    /// Decoded 32-byte master key for token encryption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    /// Per-integration OAuth client credentials, keyed by integration id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub integration_credentials: BTreeMap<String, IntegrationCredentialConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// OAuth client credentials for one integration, as loaded from env.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct IntegrationCredentialConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
}

/// Fixed-window rate limiting applied to OAuth initiation and webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RateLimitConfig {
    /// Environment variable: `CREWFLOW_RATE_LIMIT_WINDOW_SECONDS`
    #[serde(default = "default_rate_limit_window_seconds")]
    pub window_seconds: u64,
    /// Environment variable: `CREWFLOW_RATE_LIMIT_MAX_REQUESTS`
    #[serde(default = "default_rate_limit_max_requests")]
    pub max_requests: u32,
}

/// Token maintenance scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct MaintenanceConfig {
    /// Cycle interval in seconds (default: 900)
    ///
    /// Environment variable: `CREWFLOW_MAINTENANCE_INTERVAL_SECONDS`
    #[serde(default = "default_maintenance_interval_seconds")]
    pub interval_seconds: u64,

    /// Lookahead window for proactive refresh in seconds (default: 3600)
    ///
    /// Connections whose tokens expire within this window are refreshed
    /// before they lapse.
    ///
    /// Environment variable: `CREWFLOW_MAINTENANCE_LOOKAHEAD_SECONDS`
    #[serde(default = "default_maintenance_lookahead_seconds")]
    pub lookahead_seconds: u64,

    /// Audit log retention in days (default: 30)
    ///
    /// Environment variable: `CREWFLOW_MAINTENANCE_AUDIT_RETENTION_DAYS`
    #[serde(default = "default_maintenance_audit_retention_days")]
    pub audit_retention_days: u32,

    /// How long a record may sit in `refreshing` before the sweep resets it,
    /// in seconds (default: 600)
    ///
    /// Environment variable: `CREWFLOW_MAINTENANCE_REFRESH_STALENESS_SECONDS`
    #[serde(default = "default_maintenance_refresh_staleness_seconds")]
    pub refresh_staleness_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            base_url: default_base_url(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            operator_tokens: Vec::new(),
            crypto_key: None,
            integration_credentials: BTreeMap::new(),
            rate_limit: RateLimitConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_rate_limit_window_seconds(),
            max_requests: default_rate_limit_max_requests(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_maintenance_interval_seconds(),
            lookahead_seconds: default_maintenance_lookahead_seconds(),
            audit_retention_days: default_maintenance_audit_retention_days(),
            refresh_staleness_seconds: default_maintenance_refresh_staleness_seconds(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_seconds == 0 {
            return Err(ConfigError::InvalidRateLimitWindow {
                value: self.window_seconds,
            });
        }
        if self.max_requests == 0 {
            return Err(ConfigError::InvalidRateLimitMaxRequests {
                value: self.max_requests,
            });
        }
        Ok(())
    }
}

impl MaintenanceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_seconds < 60 {
            return Err(ConfigError::InvalidMaintenanceInterval {
                value: self.interval_seconds,
            });
        }
        if self.lookahead_seconds < 60 || self.lookahead_seconds > 86400 {
            return Err(ConfigError::InvalidMaintenanceLookahead {
                value: self.lookahead_seconds,
            });
        }
        if self.audit_retention_days == 0 {
            return Err(ConfigError::InvalidAuditRetention {
                value: self.audit_retention_days,
            });
        }
        if self.refresh_staleness_seconds < 60 {
            return Err(ConfigError::InvalidRefreshStaleness {
                value: self.refresh_staleness_seconds,
            });
        }
        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// OAuth redirect URI shared by all integrations.
    pub fn redirect_uri(&self) -> String {
        format!("{}/callback", self.base_url.trim_end_matches('/'))
    }

    /// Build a [`CredentialRegistry`] from the configured credentials.
    pub fn credential_registry(&self) -> CredentialRegistry {
        let mut registry = CredentialRegistry::new();
        for (integration_id, creds) in &self.integration_credentials {
            registry.insert(
                integration_id.clone(),
                OAuthCredentials {
                    client_id: creds.client_id.clone(),
                    client_secret: creds.client_secret.clone(),
                    webhook_secret: creds.webhook_secret.clone(),
                },
            );
        }
        registry
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec!["[REDACTED]".to_string()];
        }
        if config.crypto_key.is_some() {
            config.crypto_key = Some(b"[REDACTED]".to_vec());
        }
        for creds in config.integration_credentials.values_mut() {
            creds.client_secret = "[REDACTED]".to_string();
            if creds.webhook_secret.is_some() {
                creds.webhook_secret = Some("[REDACTED]".to_string());
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref key) = self.crypto_key {
            if key.len() != 32 {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
        } else {
            return Err(ConfigError::MissingCryptoKey);
        }

        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        if self.base_url.is_empty()
            || !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidBaseUrl {
                value: self.base_url.clone(),
            });
        }

        for (integration_id, creds) in &self.integration_credentials {
            if creds.client_id.is_empty() || creds.client_secret.is_empty() {
                return Err(ConfigError::IncompleteIntegrationCredentials {
                    integration: integration_id.clone(),
                });
            }
        }

        self.rate_limit.validate()?;
        self.maintenance.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rate_limit_window_seconds() -> u64 {
    60
}

fn default_rate_limit_max_requests() -> u32 {
    30
}

fn default_maintenance_interval_seconds() -> u64 {
    900 // 15 minutes
}

fn default_maintenance_lookahead_seconds() -> u64 {
    3600 // 1 hour
}

fn default_maintenance_audit_retention_days() -> u32 {
    30
}

fn default_maintenance_refresh_staleness_seconds() -> u64 {
    600 // 10 minutes
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error(
        "no operator tokens configured; set CREWFLOW_OPERATOR_TOKEN or CREWFLOW_OPERATOR_TOKENS"
    )]
    MissingOperatorTokens,
    #[error("crypto key is missing; set CREWFLOW_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("base URL must be an absolute http(s) URL, got '{value}'")]
    InvalidBaseUrl { value: String },
    #[error("integration {integration} has an empty client id or secret")]
    IncompleteIntegrationCredentials { integration: String },
    #[error("rate limit window must be positive, got {value}")]
    InvalidRateLimitWindow { value: u64 },
    #[error("rate limit max requests must be positive, got {value}")]
    InvalidRateLimitMaxRequests { value: u32 },
    #[error("maintenance interval must be at least 60 seconds, got {value}")]
    InvalidMaintenanceInterval { value: u64 },
    #[error("maintenance lookahead must be between 60 and 86400 seconds, got {value}")]
    InvalidMaintenanceLookahead { value: u64 },
    #[error("audit retention must be at least 1 day, got {value}")]
    InvalidAuditRetention { value: u32 },
    #[error("refresh staleness bound must be at least 60 seconds, got {value}")]
    InvalidRefreshStaleness { value: u64 },
}

/// Loads configuration using layered `.env` files and `CREWFLOW_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration: `.env`, then `.env.{profile}`, then the process
    /// environment, later layers winning.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut layered = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("CREWFLOW_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        Self::from_layered(layered)
    }

    /// Builds an [`AppConfig`] from an already-collected key/value map
    /// (keys without the `CREWFLOW_` prefix).
    pub fn from_layered(mut layered: BTreeMap<String, String>) -> Result<AppConfig, ConfigError> {
        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_profile);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let base_url = layered
            .remove("BASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_base_url);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);

        // Operator tokens: single token or comma-separated list.
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            tokens
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else if let Some(token) = layered.remove("OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let crypto_key = if let Some(key_str) = layered.remove("CRYPTO_KEY") {
            use base64::{Engine as _, engine::general_purpose};
            Some(general_purpose::STANDARD.decode(&key_str).map_err(|e| {
                ConfigError::InvalidCryptoKeyBase64 {
                    error: e.to_string(),
                }
            })?)
        } else {
            None
        };

        let rate_limit = RateLimitConfig {
            window_seconds: layered
                .remove("RATE_LIMIT_WINDOW_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_rate_limit_window_seconds),
            max_requests: layered
                .remove("RATE_LIMIT_MAX_REQUESTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_rate_limit_max_requests),
        };

        let maintenance = MaintenanceConfig {
            interval_seconds: layered
                .remove("MAINTENANCE_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_maintenance_interval_seconds),
            lookahead_seconds: layered
                .remove("MAINTENANCE_LOOKAHEAD_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_maintenance_lookahead_seconds),
            audit_retention_days: layered
                .remove("MAINTENANCE_AUDIT_RETENTION_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_maintenance_audit_retention_days),
            refresh_staleness_seconds: layered
                .remove("MAINTENANCE_REFRESH_STALENESS_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_maintenance_refresh_staleness_seconds),
        };

        let integration_credentials = Self::collect_integration_credentials(&mut layered);

        Ok(AppConfig {
            profile,
            api_bind_addr,
            base_url,
            log_level,
            log_format,
            operator_tokens,
            crypto_key,
            integration_credentials,
            rate_limit,
            maintenance,
        })
    }

    /// Discover `{INTEGRATION}_CLIENT_ID` / `{INTEGRATION}_CLIENT_SECRET`
    /// pairs and optional `WEBHOOK_{INTEGRATION}_SECRET` values. Integrations
    /// with only one half of the pair are skipped; `validate()` catches empty
    /// values on complete pairs.
    fn collect_integration_credentials(
        layered: &mut BTreeMap<String, String>,
    ) -> BTreeMap<String, IntegrationCredentialConfig> {
        let ids: Vec<String> = layered
            .keys()
            .filter_map(|key| key.strip_suffix("_CLIENT_ID"))
            .map(|id| id.to_string())
            .collect();

        let mut credentials = BTreeMap::new();
        for id in ids {
            let client_id = layered.remove(&format!("{}_CLIENT_ID", id));
            let client_secret = layered.remove(&format!("{}_CLIENT_SECRET", id));
            let webhook_secret = layered.remove(&format!("WEBHOOK_{}_SECRET", id));

            if let (Some(client_id), Some(client_secret)) = (client_id, client_secret) {
                credentials.insert(
                    id.to_lowercase(),
                    IntegrationCredentialConfig {
                        client_id,
                        client_secret,
                        webhook_secret,
                    },
                );
            }
        }
        credentials
    }

    fn collect_layered_env(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let mut layered = BTreeMap::new();

        let base_env = self.base_dir.join(".env");
        Self::merge_env_file(&mut layered, &base_env)?;

        let profile = layered
            .get("PROFILE")
            .cloned()
            .or_else(|| env::var("CREWFLOW_PROFILE").ok())
            .unwrap_or_else(default_profile);
        let profile_env = self.base_dir.join(format!(".env.{}", profile));
        Self::merge_env_file(&mut layered, &profile_env)?;

        Ok(layered)
    }

    fn merge_env_file(
        layered: &mut BTreeMap<String, String>,
        path: &PathBuf,
    ) -> Result<(), ConfigError> {
        if !path.exists() {
            return Ok(());
        }
        for item in dotenvy::from_path_iter(path).map_err(|source| ConfigError::EnvFile {
            path: path.clone(),
            source,
        })? {
            let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                path: path.clone(),
                source,
            })?;
            if let Some(stripped) = key.strip_prefix("CREWFLOW_") {
                layered.insert(stripped.to_string(), value);
            }
        }
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
