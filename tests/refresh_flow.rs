//! Token refresh, single-flight protection, recovery, and maintenance
//! integration tests against a wiremock provider.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, ResponseTemplate};

use crewflow_integrations::classify::ErrorKind;
use crewflow_integrations::config::MaintenanceConfig;
use crewflow_integrations::maintenance::TokenMaintenanceScheduler;
use crewflow_integrations::oauth::OAuthError;
use crewflow_integrations::store::{ConnectionHealth, ConnectionStatus};

#[tokio::test]
async fn refresh_rotates_tokens_and_reconnects() {
    let h = common::harness().await;
    h.seed_connection(Utc::now() - Duration::minutes(5)).await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=rt-old"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "at-new",
            "refresh_token": "rt-new",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let record = h
        .oauth
        .refresh_tokens(common::USER, common::INTEGRATION)
        .await
        .unwrap();

    assert_eq!(record.status, ConnectionStatus::Connected);
    assert_eq!(record.health, ConnectionHealth::Healthy);
    assert_eq!(record.error_count, 0);
    assert!(record.last_refreshed_at.is_some());

    let refresh = h
        .security
        .decrypt_token(
            common::USER,
            common::INTEGRATION,
            record.refresh_token.as_deref().unwrap(),
        )
        .unwrap();
    assert_eq!(refresh, "rt-new");
}

#[tokio::test]
async fn concurrent_refreshes_collapse_into_one_provider_call() {
    let h = common::harness().await;
    h.seed_connection(Utc::now() - Duration::minutes(5)).await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "at-new",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let (first, second) = tokio::join!(
        h.oauth.refresh_tokens(common::USER, common::INTEGRATION),
        h.oauth.refresh_tokens(common::USER, common::INTEGRATION),
    );

    // The waiter reuses the in-flight result instead of a second exchange.
    assert_eq!(first.unwrap().status, ConnectionStatus::Connected);
    assert_eq!(second.unwrap().status, ConnectionStatus::Connected);
}

#[tokio::test]
async fn refresh_keeps_stored_refresh_token_when_provider_omits_it() {
    let h = common::harness().await;
    h.seed_connection(Utc::now() - Duration::minutes(5)).await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "at-new",
            "expires_in": 3600
        })))
        .mount(&h.server)
        .await;

    let record = h
        .oauth
        .refresh_tokens(common::USER, common::INTEGRATION)
        .await
        .unwrap();

    let refresh = h
        .security
        .decrypt_token(
            common::USER,
            common::INTEGRATION,
            record.refresh_token.as_deref().unwrap(),
        )
        .unwrap();
    assert_eq!(refresh, "rt-old");
}

#[tokio::test]
async fn revoked_grant_marks_the_connection_broken() {
    let h = common::harness().await;
    h.seed_connection(Utc::now() - Duration::minutes(5)).await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "refresh token revoked"
        })))
        .mount(&h.server)
        .await;

    let err = h
        .oauth
        .refresh_tokens(common::USER, common::INTEGRATION)
        .await
        .unwrap_err();
    match err {
        OAuthError::Provider(classified) => {
            assert_eq!(classified.kind, ErrorKind::InvalidGrant);
            assert!(!classified.is_retryable());
        }
        other => panic!("expected provider error, got {:?}", other),
    }

    let record = h.find_connection().await;
    assert_eq!(record.status, ConnectionStatus::Error);
    assert_eq!(record.health, ConnectionHealth::Error);
    assert_eq!(record.error_count, 1);
    assert!(record.last_error.unwrap().starts_with("invalid_grant"));
}

#[tokio::test]
async fn transient_provider_outage_leaves_the_connection_retryable() {
    let h = common::harness().await;
    h.seed_connection(Utc::now() - Duration::minutes(5)).await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .mount(&h.server)
        .await;

    let err = h
        .oauth
        .refresh_tokens(common::USER, common::INTEGRATION)
        .await
        .unwrap_err();
    match err {
        OAuthError::Provider(classified) => {
            assert_eq!(classified.kind, ErrorKind::ProviderError);
            assert!(classified.is_retryable());
        }
        other => panic!("expected provider error, got {:?}", other),
    }

    // Status restored so a later cycle retries; health flags the wobble.
    let record = h.find_connection().await;
    assert_eq!(record.status, ConnectionStatus::Expired);
    assert_eq!(record.health, ConnectionHealth::Warning);
}

#[tokio::test]
async fn recovery_refreshes_an_expired_connection() {
    let h = common::harness().await;
    h.seed_connection(Utc::now() - Duration::minutes(5)).await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "at-new",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let report = h
        .recovery
        .attempt_recovery(common::USER, common::INTEGRATION, None)
        .await
        .unwrap();

    assert!(report.succeeded);
    assert_eq!(h.find_connection().await.status, ConnectionStatus::Connected);
}

#[tokio::test]
async fn maintenance_cycle_refreshes_tokens_expiring_within_lookahead() {
    let h = common::harness().await;
    h.seed_connection(Utc::now() + Duration::minutes(30)).await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "at-new",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let scheduler = TokenMaintenanceScheduler::new(
        Arc::clone(&h.oauth),
        Arc::clone(&h.recovery),
        MaintenanceConfig::default(),
    );
    let report = scheduler.run_cycle().await.unwrap();

    assert_eq!(report.connections_due, 1);
    assert_eq!(report.refreshes_succeeded, 1);
    assert_eq!(report.refreshes_failed, 0);

    let record = h.find_connection().await;
    assert!(record.expires_at.unwrap() > Utc::now() + Duration::minutes(50));
}
