//! # Security Primitives
//!
//! State-token generation and validation for the OAuth redirect round-trip,
//! PKCE challenge/verifier pairs, token encryption wrappers, webhook HMAC
//! verification with constant-time comparison, and a fixed-window rate
//! limiter used to throttle OAuth initiation and webhook delivery.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::crypto::{self, CryptoError, CryptoKey};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a state token before the callback is rejected.
pub const STATE_MAX_AGE_MS: i64 = 10 * 60 * 1000;

/// Errors produced by security checks
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("invalid state token: {0}")]
    InvalidState(String),
    #[error("state token expired: {age_ms}ms old, max allowed {max_age_ms}ms")]
    ExpiredState { age_ms: i64, max_age_ms: i64 },
    #[error("signature verification failed")]
    SignatureVerificationFailed,
    #[error("invalid signature encoding")]
    InvalidSignatureFormat,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Self-describing OAuth state rode through the user's browser.
///
/// Never persisted server-side: possession of the token plus the embedded
/// nonce and issue timestamp are what tie the callback to the initiation.
/// Every field is attacker-influenceable input and is validated on parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthState {
    pub integration_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_url: Option<String>,
    pub nonce: String,
    pub issued_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkce_verifier: Option<String>,
}

/// PKCE verifier/challenge pair (S256 only)
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
    pub method: &'static str,
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: Option<u64>,
}

/// Fixed-window rate limiter configuration
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub window_seconds: u64,
    pub max_requests: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            max_requests: 30,
        }
    }
}

/// Security manager holding the master key and rate-limit state.
///
/// Constructed once per process and passed to consumers explicitly.
pub struct SecurityManager {
    crypto_key: CryptoKey,
    rate_limit: RateLimitSettings,
    // key -> (window bucket, count within window)
    rate_counters: Mutex<HashMap<String, (u64, u32)>>,
}

impl SecurityManager {
    pub fn new(crypto_key: CryptoKey, rate_limit: RateLimitSettings) -> Self {
        Self {
            crypto_key,
            rate_limit,
            rate_counters: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a cryptographically random base64url token.
    pub fn generate_nonce() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        base64_url::encode(&bytes)
    }

    /// Serialize an [`OAuthState`] into the opaque `state` query parameter.
    pub fn generate_state(
        &self,
        integration_id: &str,
        user_id: &str,
        return_url: Option<String>,
        pkce_verifier: Option<String>,
    ) -> Result<String, SecurityError> {
        let state = OAuthState {
            integration_id: integration_id.to_string(),
            user_id: user_id.to_string(),
            return_url,
            nonce: Self::generate_nonce(),
            issued_at_ms: Utc::now().timestamp_millis(),
            pkce_verifier,
        };

        let json = serde_json::to_vec(&state)
            .map_err(|e| SecurityError::InvalidState(format!("serialization failed: {}", e)))?;
        Ok(base64_url::encode(&json))
    }

    /// Decode and structurally validate a `state` parameter.
    pub fn parse_state(&self, token: &str) -> Result<OAuthState, SecurityError> {
        let bytes = base64_url::decode(token)
            .map_err(|_| SecurityError::InvalidState("not valid base64url".to_string()))?;
        let state: OAuthState = serde_json::from_slice(&bytes)
            .map_err(|_| SecurityError::InvalidState("malformed state payload".to_string()))?;

        if state.integration_id.is_empty() || state.user_id.is_empty() || state.nonce.is_empty() {
            return Err(SecurityError::InvalidState(
                "missing required state fields".to_string(),
            ));
        }
        if state.issued_at_ms <= 0 {
            return Err(SecurityError::InvalidState(
                "missing issue timestamp".to_string(),
            ));
        }

        Ok(state)
    }

    /// Reject states older than `max_age_ms`. A state exactly at the boundary
    /// is still accepted; timestamps from the future are not.
    pub fn validate_state_age(
        &self,
        state: &OAuthState,
        max_age_ms: i64,
    ) -> Result<(), SecurityError> {
        Self::validate_state_age_at(state, max_age_ms, Utc::now().timestamp_millis())
    }

    fn validate_state_age_at(
        state: &OAuthState,
        max_age_ms: i64,
        now_ms: i64,
    ) -> Result<(), SecurityError> {
        let age_ms = now_ms - state.issued_at_ms;
        if age_ms < 0 {
            return Err(SecurityError::InvalidState(
                "state issued in the future".to_string(),
            ));
        }
        if age_ms > max_age_ms {
            return Err(SecurityError::ExpiredState {
                age_ms,
                max_age_ms,
            });
        }
        Ok(())
    }

    /// Generate a PKCE verifier and its S256 challenge.
    pub fn generate_pkce(&self) -> PkcePair {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        let verifier = base64_url::encode(&bytes);
        let challenge = Self::pkce_challenge(&verifier);
        PkcePair {
            verifier,
            challenge,
            method: "S256",
        }
    }

    /// Compute the S256 challenge for a verifier.
    pub fn pkce_challenge(verifier: &str) -> String {
        let digest = Sha256::digest(verifier.as_bytes());
        base64_url::encode(&digest)
    }

    /// Recompute the challenge and compare in constant time.
    pub fn validate_pkce(&self, verifier: &str, challenge: &str) -> bool {
        let expected = Self::pkce_challenge(verifier);
        ConstantTimeEq::ct_eq(expected.as_bytes(), challenge.as_bytes()).into()
    }

    /// Encrypt a token for storage, bound to its owning record.
    pub fn encrypt_token(
        &self,
        user_id: &str,
        integration_id: &str,
        token: &str,
    ) -> Result<Vec<u8>, SecurityError> {
        Ok(crypto::encrypt_token(
            &self.crypto_key,
            user_id,
            integration_id,
            token,
        )?)
    }

    /// Decrypt a stored token ciphertext.
    pub fn decrypt_token(
        &self,
        user_id: &str,
        integration_id: &str,
        ciphertext: &[u8],
    ) -> Result<String, SecurityError> {
        Ok(crypto::decrypt_token(
            &self.crypto_key,
            user_id,
            integration_id,
            ciphertext,
        )?)
    }

    /// Fixed-window rate limit check for the given key (e.g. `ip:1.2.3.4`,
    /// `user:abc`, `webhook:shopify`).
    pub fn check_rate_limit(&self, key: &str) -> RateLimitDecision {
        let now = Utc::now();
        let now_secs = now.timestamp() as u64;
        let window = now_secs / self.rate_limit.window_seconds;
        let reset_secs = (window + 1) * self.rate_limit.window_seconds;
        let reset_at = DateTime::from_timestamp(reset_secs as i64, 0).unwrap_or(now);

        let mut counters = self.rate_counters.lock().expect("rate limiter poisoned");
        let entry = counters.entry(key.to_string()).or_insert((window, 0));
        if entry.0 != window {
            *entry = (window, 0);
        }

        if entry.1 >= self.rate_limit.max_requests {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
                retry_after_secs: Some(reset_secs.saturating_sub(now_secs).max(1)),
            };
        }

        entry.1 += 1;
        RateLimitDecision {
            allowed: true,
            remaining: self.rate_limit.max_requests - entry.1,
            reset_at,
            retry_after_secs: None,
        }
    }

    /// Verify an HMAC-SHA256 webhook signature over the raw payload bytes.
    ///
    /// Accepts base64 (Shopify-style header values) or hex encodings. The
    /// comparison is constant-time in both cases.
    pub fn verify_webhook_signature(
        &self,
        payload: &[u8],
        signature: &str,
        secret: &str,
    ) -> Result<(), SecurityError> {
        if signature.is_empty() {
            return Err(SecurityError::InvalidSignatureFormat);
        }

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| SecurityError::SignatureVerificationFailed)?;
        mac.update(payload);
        let expected = mac.finalize().into_bytes();

        let provided = decode_signature(signature)?;

        if ConstantTimeEq::ct_eq(expected.as_slice(), provided.as_slice()).into() {
            Ok(())
        } else {
            Err(SecurityError::SignatureVerificationFailed)
        }
    }
}

fn decode_signature(signature: &str) -> Result<Vec<u8>, SecurityError> {
    use base64::{Engine as _, engine::general_purpose};

    // A 64-char hex digest is also syntactically valid base64, so hex gets
    // first claim; a base64-encoded SHA-256 MAC is 44 chars and never matches.
    if signature.len() == 64 && signature.bytes().all(|b| b.is_ascii_hexdigit()) {
        return hex::decode(signature).map_err(|_| SecurityError::InvalidSignatureFormat);
    }
    if let Ok(bytes) = general_purpose::STANDARD.decode(signature) {
        return Ok(bytes);
    }
    hex::decode(signature).map_err(|_| SecurityError::InvalidSignatureFormat)
}
