// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker enforcing data retention.
//!
//! One pass:
//! 1. Deletes runtime events older than `execution_log_retention_days`
//! 2. Deletes audit logs older than `audit_log_retention_days`
//! 3. Deletes anonymous sessions older than `anonymous_session_retention_days`
//! 4. Purges soft-deleted workspaces whose `purge_after` has passed, dropping
//!    their tenant database when a tenant admin is attached
//!
//! A failing step is logged and the pass moves on to the next one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::env_parse;
use crate::error::{CoreError, Result};
use crate::persistence::Persistence;
use crate::tenant_db::{TenantDbAdmin, admin_user, database_name};

/// Retention windows and the worker cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Whether the worker runs at all.
    pub enabled: bool,
    /// Time between passes.
    pub interval: Duration,
    /// Runtime event lifetime.
    pub execution_log_retention_days: i64,
    /// Audit log lifetime.
    pub audit_log_retention_days: i64,
    /// Anonymous session lifetime.
    pub anonymous_session_retention_days: i64,
    /// Days a soft-deleted workspace stays restorable.
    pub workspace_deletion_grace_days: i64,
    /// Days in cold storage after the grace period, before purge.
    pub workspace_cold_storage_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),
            execution_log_retention_days: 30,
            audit_log_retention_days: 365,
            anonymous_session_retention_days: 7,
            workspace_deletion_grace_days: 7,
            workspace_cold_storage_days: 30,
        }
    }
}

impl RetentionConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `BACKPLANE_RETENTION_ENABLED`: "false" or "0" to disable (default: true)
    /// - `BACKPLANE_RETENTION_INTERVAL_SECS`: seconds between passes (default: 3600)
    /// - `BACKPLANE_RETENTION_EXECUTION_LOG_DAYS` (default: 30)
    /// - `BACKPLANE_RETENTION_AUDIT_LOG_DAYS` (default: 365)
    /// - `BACKPLANE_RETENTION_ANONYMOUS_SESSION_DAYS` (default: 7)
    /// - `BACKPLANE_RETENTION_WORKSPACE_GRACE_DAYS` (default: 7)
    /// - `BACKPLANE_RETENTION_WORKSPACE_COLD_STORAGE_DAYS` (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let enabled = std::env::var("BACKPLANE_RETENTION_ENABLED")
            .map(|v| !(v == "false" || v == "0"))
            .unwrap_or(defaults.enabled);
        let days = |key: &str, default: i64| {
            env_parse::<i64>(key).filter(|d| *d > 0).unwrap_or(default)
        };

        Self {
            enabled,
            interval: env_parse::<u64>("BACKPLANE_RETENTION_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            execution_log_retention_days: days(
                "BACKPLANE_RETENTION_EXECUTION_LOG_DAYS",
                defaults.execution_log_retention_days,
            ),
            audit_log_retention_days: days(
                "BACKPLANE_RETENTION_AUDIT_LOG_DAYS",
                defaults.audit_log_retention_days,
            ),
            anonymous_session_retention_days: days(
                "BACKPLANE_RETENTION_ANONYMOUS_SESSION_DAYS",
                defaults.anonymous_session_retention_days,
            ),
            workspace_deletion_grace_days: days(
                "BACKPLANE_RETENTION_WORKSPACE_GRACE_DAYS",
                defaults.workspace_deletion_grace_days,
            ),
            workspace_cold_storage_days: days(
                "BACKPLANE_RETENTION_WORKSPACE_COLD_STORAGE_DAYS",
                defaults.workspace_cold_storage_days,
            ),
        }
    }
}

/// Per-category outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    /// Runtime events deleted.
    pub events_deleted: u64,
    /// Audit logs deleted.
    pub audit_logs_deleted: u64,
    /// Anonymous sessions deleted.
    pub sessions_deleted: u64,
    /// Workspaces purged.
    pub workspaces_purged: u64,
    /// Steps that failed, as messages.
    pub errors: Vec<String>,
}

impl RetentionReport {
    /// Rows removed across every category.
    pub fn total(&self) -> u64 {
        self.events_deleted + self.audit_logs_deleted + self.sessions_deleted + self.workspaces_purged
    }
}

/// Background worker that enforces [`RetentionConfig`].
pub struct RetentionWorker {
    persistence: Arc<dyn Persistence>,
    tenant_admin: Option<Arc<dyn TenantDbAdmin>>,
    config: RetentionConfig,
    shutdown: CancellationToken,
}

impl RetentionWorker {
    /// Create a new retention worker.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        config: RetentionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            persistence,
            tenant_admin: None,
            config,
            shutdown,
        }
    }

    /// Drops tenant databases of purged workspaces.
    pub fn with_tenant_admin(mut self, admin: Arc<dyn TenantDbAdmin>) -> Self {
        self.tenant_admin = Some(admin);
        self
    }

    /// Run passes until shutdown.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Retention worker disabled");
            return;
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            execution_log_days = self.config.execution_log_retention_days,
            audit_log_days = self.config.audit_log_retention_days,
            anonymous_session_days = self.config.anonymous_session_retention_days,
            "Retention worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Retention worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    self.run_once(Utc::now()).await;
                }
            }
        }

        info!("Retention worker stopped");
    }

    /// One retention pass evaluated at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> RetentionReport {
        let mut report = RetentionReport::default();
        let cutoff = |days: i64| now - chrono::Duration::days(days);

        match self
            .persistence
            .delete_events_before(cutoff(self.config.execution_log_retention_days))
            .await
        {
            Ok(n) => report.events_deleted = n,
            Err(e) => fail(&mut report, "events", e.into()),
        }
        match self
            .persistence
            .delete_audit_logs_before(cutoff(self.config.audit_log_retention_days))
            .await
        {
            Ok(n) => report.audit_logs_deleted = n,
            Err(e) => fail(&mut report, "audit_logs", e.into()),
        }
        match self
            .persistence
            .delete_anonymous_sessions_before(cutoff(self.config.anonymous_session_retention_days))
            .await
        {
            Ok(n) => report.sessions_deleted = n,
            Err(e) => fail(&mut report, "sessions", e.into()),
        }
        match self.persistence.list_purgeable_workspaces(now).await {
            Ok(ids) => {
                for id in ids {
                    match self.purge(id).await {
                        Ok(()) => report.workspaces_purged += 1,
                        Err(e) => fail(&mut report, "workspaces", e),
                    }
                }
            }
            Err(e) => fail(&mut report, "workspaces", e.into()),
        }

        if report.total() > 0 {
            info!(
                events_deleted = report.events_deleted,
                audit_logs_deleted = report.audit_logs_deleted,
                sessions_deleted = report.sessions_deleted,
                workspaces_purged = report.workspaces_purged,
                "Retention pass completed"
            );
        } else {
            debug!("Retention pass completed, nothing to remove");
        }
        report
    }

    async fn purge(&self, workspace_id: Uuid) -> Result<()> {
        if let Some(admin) = &self.tenant_admin {
            let database = database_name(workspace_id);
            if admin.database_exists(&database).await? {
                admin.drop_database(&database).await?;
            }
            if let Err(e) = admin.drop_user(&admin_user(workspace_id)).await {
                warn!(workspace_id = %workspace_id, error = %e, "Failed to drop tenant admin user");
            }
        }
        self.persistence.purge_workspace(workspace_id).await?;
        info!(workspace_id = %workspace_id, "Workspace purged");
        Ok(())
    }
}

fn fail(report: &mut RetentionReport, step: &str, e: CoreError) {
    error!(step = step, error = %e, "Retention step failed");
    report.errors.push(format!("{step}: {e}"));
}
