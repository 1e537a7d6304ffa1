//! # Error Classification
//!
//! Maps raw OAuth provider failures (error bodies, HTTP statuses, transport
//! errors) into a closed taxonomy with retryability and a suggested recovery
//! action. Provider error codes resolve through an extensible lookup table so
//! new providers can register their vocabulary without touching the taxonomy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Closed taxonomy of integration error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidState,
    ExpiredState,
    InvalidConfiguration,
    OAuthNotConfigured,
    InvalidClient,
    InvalidGrant,
    InvalidScope,
    AccessDenied,
    RateLimited,
    ProviderError,
    NetworkError,
    Timeout,
    TokenExpired,
    Unknown,
}

/// What an automated recovery pass should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RefreshToken,
    Retry,
    Reconnect,
    ManualIntervention,
}

impl ErrorKind {
    /// Whether retrying the same operation can plausibly succeed without
    /// user or operator involvement.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::ProviderError
                | ErrorKind::NetworkError
                | ErrorKind::Timeout
        )
    }

    /// The recovery action the taxonomy prescribes for this kind.
    pub fn recovery_action(self) -> RecoveryAction {
        match self {
            ErrorKind::RateLimited
            | ErrorKind::ProviderError
            | ErrorKind::NetworkError
            | ErrorKind::Timeout => RecoveryAction::Retry,
            // TokenExpired means no refresh token is on file, so another
            // refresh cannot fix it.
            ErrorKind::InvalidGrant
            | ErrorKind::InvalidState
            | ErrorKind::ExpiredState
            | ErrorKind::AccessDenied
            | ErrorKind::TokenExpired => RecoveryAction::Reconnect,
            ErrorKind::InvalidClient
            | ErrorKind::InvalidScope
            | ErrorKind::InvalidConfiguration
            | ErrorKind::OAuthNotConfigured
            | ErrorKind::Unknown => RecoveryAction::ManualIntervention,
        }
    }

    /// Stable code used in audit entries and stored `last_error` fields.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::ExpiredState => "expired_state",
            ErrorKind::InvalidConfiguration => "invalid_configuration",
            ErrorKind::OAuthNotConfigured => "oauth_not_configured",
            ErrorKind::InvalidClient => "invalid_client",
            ErrorKind::InvalidGrant => "invalid_grant",
            ErrorKind::InvalidScope => "invalid_scope",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TokenExpired => "token_expired",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// A provider failure after classification.
#[derive(Debug, Clone, Error, Serialize, Deserialize, ToSchema)]
#[error("{kind:?}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    /// Sanitized description; never the raw provider body.
    pub message: String,
    /// The provider's own error code, when one was present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_code: Option<String>,
    /// Retry delay hint from a 429 response, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider_code: None,
            retry_after_secs: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn recovery_action(&self) -> RecoveryAction {
        self.kind.recovery_action()
    }
}

/// Shape of a standard OAuth token-endpoint error body.
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    error_description: Option<String>,
}

/// Classifier with an extensible provider-code table.
///
/// The defaults cover RFC 6749 codes; integrations with non-standard
/// vocabularies (e.g. Slack's `invalid_auth`) register theirs at startup.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    provider_codes: HashMap<String, ErrorKind>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        let mut provider_codes = HashMap::new();
        for (code, kind) in [
            ("invalid_request", ErrorKind::InvalidConfiguration),
            ("invalid_client", ErrorKind::InvalidClient),
            ("invalid_grant", ErrorKind::InvalidGrant),
            ("unauthorized_client", ErrorKind::InvalidClient),
            ("unsupported_grant_type", ErrorKind::InvalidConfiguration),
            ("invalid_scope", ErrorKind::InvalidScope),
            ("access_denied", ErrorKind::AccessDenied),
            ("temporarily_unavailable", ErrorKind::ProviderError),
            ("server_error", ErrorKind::ProviderError),
            ("rate_limited", ErrorKind::RateLimited),
            // Slack
            ("invalid_auth", ErrorKind::InvalidGrant),
            ("token_revoked", ErrorKind::InvalidGrant),
            ("token_expired", ErrorKind::TokenExpired),
            // Salesforce
            ("inactive_user", ErrorKind::AccessDenied),
            ("inactive_org", ErrorKind::AccessDenied),
        ] {
            provider_codes.insert(code.to_string(), kind);
        }
        Self { provider_codes }
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or override the mapping for a provider error code.
    pub fn register(&mut self, code: impl Into<String>, kind: ErrorKind) {
        self.provider_codes.insert(code.into(), kind);
    }

    /// Look up a bare provider code.
    pub fn kind_for_code(&self, code: &str) -> ErrorKind {
        self.provider_codes
            .get(code)
            .copied()
            .unwrap_or(ErrorKind::Unknown)
    }

    /// Classify a non-2xx token endpoint response.
    ///
    /// Prefers the error code in the body; falls back to the HTTP status
    /// (429 is rate limiting, 5xx is a provider fault) when the body is not
    /// a standard OAuth error document.
    pub fn classify_response(
        &self,
        status: u16,
        body: &str,
        retry_after_secs: Option<u64>,
    ) -> ClassifiedError {
        if let Ok(parsed) = serde_json::from_str::<OAuthErrorBody>(body) {
            let kind = match self.provider_codes.get(parsed.error.as_str()) {
                Some(kind) => *kind,
                None if status == 429 => ErrorKind::RateLimited,
                None if status >= 500 => ErrorKind::ProviderError,
                None => ErrorKind::Unknown,
            };
            let message = parsed
                .error_description
                .unwrap_or_else(|| format!("provider returned {}", parsed.error));
            return ClassifiedError {
                kind,
                message,
                provider_code: Some(parsed.error),
                retry_after_secs,
            };
        }

        let kind = match status {
            429 => ErrorKind::RateLimited,
            s if s >= 500 => ErrorKind::ProviderError,
            401 | 403 => ErrorKind::AccessDenied,
            _ => ErrorKind::Unknown,
        };
        ClassifiedError {
            kind,
            message: format!("provider returned HTTP {}", status),
            provider_code: None,
            retry_after_secs,
        }
    }

    /// Classify a transport-level failure from the HTTP client.
    pub fn classify_transport(&self, error: &reqwest::Error) -> ClassifiedError {
        if error.is_timeout() {
            ClassifiedError::new(ErrorKind::Timeout, "provider request timed out")
        } else if error.is_connect() {
            ClassifiedError::new(ErrorKind::NetworkError, "could not reach provider")
        } else {
            ClassifiedError::new(
                ErrorKind::NetworkError,
                format!("provider request failed: {}", error),
            )
        }
    }

    /// Classify a 2xx token response whose body is missing `access_token`.
    pub fn malformed_token_response(&self) -> ClassifiedError {
        ClassifiedError::new(
            ErrorKind::ProviderError,
            "provider returned a success response without an access token",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_oauth_codes() {
        let classifier = ErrorClassifier::new();

        let cases = [
            ("invalid_grant", ErrorKind::InvalidGrant),
            ("invalid_client", ErrorKind::InvalidClient),
            ("invalid_scope", ErrorKind::InvalidScope),
            ("access_denied", ErrorKind::AccessDenied),
            ("server_error", ErrorKind::ProviderError),
        ];
        for (code, expected) in cases {
            let body = format!(r#"{{"error":"{}"}}"#, code);
            let classified = classifier.classify_response(400, &body, None);
            assert_eq!(classified.kind, expected, "code {}", code);
            assert_eq!(classified.provider_code.as_deref(), Some(code));
        }
    }

    #[test]
    fn test_status_fallbacks() {
        let classifier = ErrorClassifier::new();

        assert_eq!(
            classifier.classify_response(429, "too many", Some(30)).kind,
            ErrorKind::RateLimited
        );
        assert_eq!(
            classifier.classify_response(503, "oops", None).kind,
            ErrorKind::ProviderError
        );
        assert_eq!(
            classifier.classify_response(401, "nope", None).kind,
            ErrorKind::AccessDenied
        );
        assert_eq!(
            classifier.classify_response(418, "teapot", None).kind,
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_unknown_body_code_defers_to_status() {
        let classifier = ErrorClassifier::new();

        let classified =
            classifier.classify_response(429, r#"{"error":"slow_down_please"}"#, Some(10));
        assert_eq!(classified.kind, ErrorKind::RateLimited);
        assert_eq!(classified.retry_after_secs, Some(10));

        let classified = classifier.classify_response(500, r#"{"error":"kaboom"}"#, None);
        assert_eq!(classified.kind, ErrorKind::ProviderError);

        let classified = classifier.classify_response(400, r#"{"error":"mystery"}"#, None);
        assert_eq!(classified.kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_error_description_preferred() {
        let classifier = ErrorClassifier::new();
        let body = r#"{"error":"invalid_grant","error_description":"refresh token revoked"}"#;
        let classified = classifier.classify_response(400, body, None);
        assert_eq!(classified.message, "refresh token revoked");
    }

    #[test]
    fn test_register_extends_lookup() {
        let mut classifier = ErrorClassifier::new();
        assert_eq!(classifier.kind_for_code("shop_frozen"), ErrorKind::Unknown);

        classifier.register("shop_frozen", ErrorKind::AccessDenied);
        assert_eq!(
            classifier.kind_for_code("shop_frozen"),
            ErrorKind::AccessDenied
        );

        let classified =
            classifier.classify_response(403, r#"{"error":"shop_frozen"}"#, None);
        assert_eq!(classified.kind, ErrorKind::AccessDenied);
    }

    #[test]
    fn test_retryability_and_recovery_actions() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::NetworkError.is_retryable());
        assert!(!ErrorKind::TokenExpired.is_retryable());
        assert!(!ErrorKind::InvalidGrant.is_retryable());
        assert!(!ErrorKind::InvalidClient.is_retryable());
        assert!(!ErrorKind::AccessDenied.is_retryable());

        assert_eq!(
            ErrorKind::TokenExpired.recovery_action(),
            RecoveryAction::Reconnect
        );
        assert_eq!(ErrorKind::Timeout.recovery_action(), RecoveryAction::Retry);
        assert_eq!(
            ErrorKind::InvalidGrant.recovery_action(),
            RecoveryAction::Reconnect
        );
        assert_eq!(
            ErrorKind::InvalidClient.recovery_action(),
            RecoveryAction::ManualIntervention
        );
        assert_eq!(
            ErrorKind::Unknown.recovery_action(),
            RecoveryAction::ManualIntervention
        );
    }

    #[test]
    fn test_malformed_success_response() {
        let classifier = ErrorClassifier::new();
        let classified = classifier.malformed_token_response();
        assert_eq!(classified.kind, ErrorKind::ProviderError);
        assert!(classified.is_retryable());
    }
}
