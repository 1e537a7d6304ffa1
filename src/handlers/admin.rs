//! Operator diagnostics endpoints.

use axum::{Json, extract::State};
use serde::Serialize;
use tracing::warn;
use utoipa::ToSchema;

use crate::auth::OperatorAuth;
use crate::error::ApiError;
use crate::oauth::ConnectionTestReport;
use crate::server::AppState;

/// Aggregate result of the bulk connection test suite.
#[derive(Debug, Serialize, ToSchema)]
pub struct TestSuiteReport {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub reports: Vec<TestSuiteItem>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TestSuiteItem {
    pub user_id: String,
    #[serde(flatten)]
    pub report: ConnectionTestReport,
}

/// Test every stored connection against its provider. One failing probe
/// never aborts the suite.
#[utoipa::path(
    post,
    path = "/admin/test-connections",
    responses(
        (status = 200, description = "Test suite results", body = TestSuiteReport),
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn run_connection_test_suite(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<TestSuiteReport>, ApiError> {
    let records = state
        .oauth
        .connections()
        .list_all()
        .await
        .map_err(crate::oauth::OAuthError::from)?;

    let mut reports = Vec::with_capacity(records.len());
    let mut healthy = 0usize;
    for record in &records {
        match state
            .oauth
            .test_connection(&record.user_id, &record.integration_id)
            .await
        {
            Ok(report) => {
                if report.healthy {
                    healthy += 1;
                }
                reports.push(TestSuiteItem {
                    user_id: record.user_id.clone(),
                    report,
                });
            }
            Err(err) => {
                warn!(
                    user_id = %record.user_id,
                    integration_id = %record.integration_id,
                    error = %err,
                    "Connection test suite item failed"
                );
                reports.push(TestSuiteItem {
                    user_id: record.user_id.clone(),
                    report: ConnectionTestReport {
                        integration_id: record.integration_id.clone(),
                        healthy: false,
                        status: record.status,
                        message: format!("test errored: {}", err),
                    },
                });
            }
        }
    }

    let total = reports.len();
    Ok(Json(TestSuiteReport {
        total,
        healthy,
        unhealthy: total - healthy,
        reports,
    }))
}
