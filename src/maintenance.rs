//! # Token Maintenance Scheduler
//!
//! Background loop that keeps connections serviceable: resets records
//! abandoned mid-refresh, refreshes expired and expiring-soon tokens
//! (expired first), hands unrecoverable failures to the recovery service,
//! and prunes old audit entries. Cycles can also be triggered manually.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;

use crate::classify::ErrorKind;
use crate::config::MaintenanceConfig;
use crate::oauth::{OAuthError, OAuthManager};
use crate::recovery::{RecoveryService, RecoveryStats};
use crate::store::{
    AuditEventType, AuditLogEntry, AuditStore, ConnectionStatus, ConnectionStore,
};

/// Report for one completed maintenance cycle.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub stale_refreshes_reset: u64,
    pub connections_due: u64,
    pub refreshes_succeeded: u64,
    pub refreshes_failed: u64,
    pub recoveries_attempted: u64,
    pub audit_entries_pruned: u64,
    pub duration_ms: u64,
}

/// Scheduler health snapshot served by the maintenance status endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MaintenanceStatus {
    pub running: bool,
    pub cycles_completed: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleReport>,
    /// Connection counts by stored status.
    pub connection_counts: HashMap<String, u64>,
    /// Records currently sitting in `refreshing`; more than a handful for
    /// longer than the staleness bound is an anomaly.
    pub refreshing_in_flight: u64,
    pub recovery_stats: HashMap<ErrorKind, RecoveryStats>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    running: bool,
    cycles_completed: u64,
    last_run_at: Option<DateTime<Utc>>,
    last_cycle: Option<CycleReport>,
}

pub struct TokenMaintenanceScheduler {
    oauth: Arc<OAuthManager>,
    recovery: Arc<RecoveryService>,
    config: MaintenanceConfig,
    state: Mutex<SchedulerState>,
}

impl TokenMaintenanceScheduler {
    pub fn new(
        oauth: Arc<OAuthManager>,
        recovery: Arc<RecoveryService>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            oauth,
            recovery,
            config,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Run the maintenance loop until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_seconds = self.config.interval_seconds,
            lookahead_seconds = self.config.lookahead_seconds,
            "Starting token maintenance scheduler"
        );
        {
            let mut state = self.state.lock().expect("scheduler state poisoned");
            state.running = true;
        }
        let interval = TokioDuration::from_secs(self.config.interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Token maintenance scheduler shutdown requested");
                    break;
                }
                _ = sleep(interval) => {
                    if let Err(err) = self.run_cycle().await {
                        error!(error = %err, "Maintenance cycle failed");
                    }
                }
            }
        }

        {
            let mut state = self.state.lock().expect("scheduler state poisoned");
            state.running = false;
        }
        info!("Token maintenance scheduler stopped");
    }

    /// Execute one maintenance cycle. Also serves the manual trigger.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self) -> Result<CycleReport, OAuthError> {
        let started = std::time::Instant::now();
        let now = Utc::now();
        let mut report = CycleReport {
            started_at: Some(now),
            ..Default::default()
        };

        report.stale_refreshes_reset = self.sweep_stale_refreshes(now).await?;
        self.refresh_due_connections(now, &mut report).await?;
        report.audit_entries_pruned = self.prune_audit(now).await?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        histogram!("maintenance_cycle_duration_ms").record(report.duration_ms as f64);
        counter!("maintenance_cycles_total").increment(1);

        self.oauth
            .audit()
            .append(
                AuditLogEntry::new(
                    None,
                    "maintenance",
                    AuditEventType::MaintenanceRun,
                    "Maintenance cycle completed",
                )
                .with_metadata(serde_json::json!({
                    "stale_refreshes_reset": report.stale_refreshes_reset,
                    "connections_due": report.connections_due,
                    "refreshes_succeeded": report.refreshes_succeeded,
                    "refreshes_failed": report.refreshes_failed,
                    "audit_entries_pruned": report.audit_entries_pruned,
                })),
            )
            .await?;

        {
            let mut state = self.state.lock().expect("scheduler state poisoned");
            state.cycles_completed += 1;
            state.last_run_at = Some(now);
            state.last_cycle = Some(report.clone());
        }

        debug!(
            stale_refreshes_reset = report.stale_refreshes_reset,
            connections_due = report.connections_due,
            refreshes_succeeded = report.refreshes_succeeded,
            refreshes_failed = report.refreshes_failed,
            audit_entries_pruned = report.audit_entries_pruned,
            duration_ms = report.duration_ms,
            "Maintenance cycle completed"
        );

        Ok(report)
    }

    /// Reset records abandoned in `refreshing` past the staleness bound to a
    /// terminal status derived from their expiry.
    async fn sweep_stale_refreshes(&self, now: DateTime<Utc>) -> Result<u64, OAuthError> {
        let staleness = Duration::seconds(self.config.refresh_staleness_seconds as i64);
        let refreshing = self
            .oauth
            .connections()
            .list_with_status(ConnectionStatus::Refreshing)
            .await?;

        let mut reset = 0u64;
        for mut record in refreshing {
            if !record.refresh_is_stale(now, staleness) {
                continue;
            }
            let terminal = match record.expires_at {
                Some(expires_at) if expires_at > now => ConnectionStatus::Connected,
                _ => ConnectionStatus::Expired,
            };
            warn!(
                integration_id = %record.integration_id,
                user_id = %record.user_id,
                ?terminal,
                "Resetting connection abandoned in refreshing status"
            );
            record.set_status(terminal);
            self.oauth.connections().upsert(record).await?;
            reset += 1;
            counter!("maintenance_stale_refreshes_reset_total").increment(1);
        }
        Ok(reset)
    }

    /// Refresh everything due within the lookahead window, already-expired
    /// connections first. A failing item never stops the sweep.
    async fn refresh_due_connections(
        &self,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), OAuthError> {
        let cutoff = now + Duration::seconds(self.config.lookahead_seconds as i64);
        let mut due = self.oauth.connections().list_needing_refresh(cutoff).await?;

        // Expired before expiring-soon; within each group, soonest expiry first.
        due.sort_by_key(|record| {
            let expired = record.effective_status(now) == ConnectionStatus::Expired;
            (!expired, record.expires_at)
        });
        report.connections_due = due.len() as u64;

        for record in due {
            match self
                .oauth
                .refresh_tokens_if_expiring_within(
                    &record.user_id,
                    &record.integration_id,
                    self.config.lookahead_seconds as i64,
                )
                .await
            {
                Ok(_) => report.refreshes_succeeded += 1,
                Err(OAuthError::Provider(classified)) => {
                    report.refreshes_failed += 1;
                    // refresh_tokens already persisted the failure; hand the
                    // non-retryable ones to recovery for triage.
                    if !classified.is_retryable() {
                        report.recoveries_attempted += 1;
                        if let Err(err) = self
                            .recovery
                            .attempt_recovery(
                                &record.user_id,
                                &record.integration_id,
                                Some(classified.kind),
                            )
                            .await
                        {
                            warn!(
                                integration_id = %record.integration_id,
                                error = %err,
                                "Recovery after failed refresh errored"
                            );
                        }
                    }
                }
                Err(err) => {
                    report.refreshes_failed += 1;
                    warn!(
                        integration_id = %record.integration_id,
                        user_id = %record.user_id,
                        error = %err,
                        "Scheduled refresh failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn prune_audit(&self, now: DateTime<Utc>) -> Result<u64, OAuthError> {
        let cutoff = now - Duration::days(self.config.audit_retention_days as i64);
        let pruned = self.oauth.audit().prune_older_than(cutoff).await?;
        if pruned > 0 {
            counter!("maintenance_audit_pruned_total").increment(pruned);
        }
        Ok(pruned)
    }

    /// Health and anomaly snapshot.
    pub async fn status(&self) -> Result<MaintenanceStatus, OAuthError> {
        let records = self.oauth.connections().list_all().await?;
        let mut connection_counts: HashMap<String, u64> = HashMap::new();
        let mut refreshing_in_flight = 0u64;
        for record in &records {
            let key = match record.status {
                ConnectionStatus::Disconnected => "disconnected",
                ConnectionStatus::Connected => "connected",
                ConnectionStatus::Error => "error",
                ConnectionStatus::Expired => "expired",
                ConnectionStatus::Refreshing => {
                    refreshing_in_flight += 1;
                    "refreshing"
                }
            };
            *connection_counts.entry(key.to_string()).or_default() += 1;
        }

        let state = self.state.lock().expect("scheduler state poisoned");
        Ok(MaintenanceStatus {
            running: state.running,
            cycles_completed: state.cycles_completed,
            last_run_at: state.last_run_at,
            last_cycle: state.last_cycle.clone(),
            connection_counts,
            refreshing_in_flight,
            recovery_stats: self.recovery.stats_snapshot(),
        })
    }
}
