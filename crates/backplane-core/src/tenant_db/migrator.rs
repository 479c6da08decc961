// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Governed tenant schema migrations.
//!
//! ```text
//! pending_review ──approve──▶ approved ──execute──▶ running ──▶ completed
//!       │                                              │
//!       └──reject──▶ rejected                          ├──▶ rolled_back (backup restored)
//!                                                      └──▶ failed
//! ```
//!
//! Execution holds the `GET_LOCK` advisory lock for the whole `running`
//! phase and always releases it, whatever the outcome.

use std::collections::BTreeSet;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::provisioner::DB_MANAGERS;
use super::{LOCK_TIMEOUT, TenantConnection, TenantDbService, TenantMigration};
use crate::error::{CoreError, Result};
use crate::events::types;
use crate::persistence::{ReviewItemRecord, ReviewerRecord, SchemaMigrationRecord};
use crate::workspace::WorkspaceAccess;

/// Migration lifecycle states.
pub mod migration_status {
    /// Waiting for a reviewer.
    pub const PENDING_REVIEW: &str = "pending_review";
    /// Approved, not yet executed.
    pub const APPROVED: &str = "approved";
    /// Holding the lock and applying.
    pub const RUNNING: &str = "running";
    /// Applied and verified.
    pub const COMPLETED: &str = "completed";
    /// Refused by a reviewer.
    pub const REJECTED: &str = "rejected";
    /// Failed with no usable backup.
    pub const FAILED: &str = "failed";
    /// Failed and restored from the pre-apply backup.
    pub const ROLLED_BACK: &str = "rolled_back";
}

/// Review queue item type for schema migrations.
pub const REVIEW_ITEM_TYPE: &str = "db_schema";

const BLOCKED_TOKENS: &[&str] = &[
    "drop database",
    "drop user",
    "alter user",
    "create user",
    "grant ",
    "revoke ",
];
const WARN_TOKENS: &[&str] = &["drop table", "truncate ", "delete from"];
const READ_ONLY_PREFIXES: &[&str] = &["select", "show", "describe", "explain"];

// ============================================================================
// Plan & precheck
// ============================================================================

/// One pending version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlanItem {
    /// Version string.
    pub version: String,
    /// Non-empty `;`-separated statements.
    pub statement_count: usize,
    /// Whether compensating SQL exists.
    pub has_down: bool,
    /// `blocked:<token>` / `warn:<token>` findings.
    pub risk_signals: Vec<String>,
}

/// What executing now would apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Highest applied version.
    pub current_version: Option<String>,
    /// Highest pending version.
    pub target_version: Option<String>,
    /// Pending versions, ascending.
    pub pending: Vec<MigrationPlanItem>,
    /// `pending.len()`.
    pub total_pending: usize,
    /// Sum of statement counts.
    pub total_statements: usize,
}

/// Overall risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// No signals.
    Low,
    /// Destructive data statements only.
    Medium,
    /// Account or database level statements.
    High,
}

/// Risk summary of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPrecheck {
    /// Any blocking signal present.
    pub blocked: bool,
    /// Overall level.
    pub risk_level: RiskLevel,
    /// Every signal, prefixed with its version.
    pub warnings: Vec<String>,
}

impl MigrationPrecheck {
    /// Summarizes the plan's signals.
    pub fn from_plan(plan: &MigrationPlan) -> Self {
        let warnings: Vec<String> = plan
            .pending
            .iter()
            .flat_map(|item| {
                item.risk_signals
                    .iter()
                    .map(move |s| format!("{}: {s}", item.version))
            })
            .collect();
        let blocked = plan
            .pending
            .iter()
            .any(|i| i.risk_signals.iter().any(|s| s.starts_with("blocked:")));
        let risk_level = if blocked {
            RiskLevel::High
        } else if warnings.is_empty() {
            RiskLevel::Low
        } else {
            RiskLevel::Medium
        };
        Self {
            blocked,
            risk_level,
            warnings,
        }
    }

    fn blocking(&self) -> Vec<String> {
        self.warnings
            .iter()
            .filter(|w| w.contains("blocked:"))
            .cloned()
            .collect()
    }
}

/// Plan plus precheck.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationPreview {
    /// Pending work.
    pub plan: MigrationPlan,
    /// Risk summary.
    pub precheck: MigrationPrecheck,
}

/// Submission parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitMigration {
    /// Single read-only statement run after apply.
    pub verify_sql: Option<String>,
    /// Note for the reviewer.
    pub note: Option<String>,
    /// Submit and execute despite blocking signals.
    #[serde(default)]
    pub force: bool,
}

/// Case-insensitive risk tokens found in `sql`.
pub fn scan_risk(sql: &str) -> Vec<String> {
    let lowered = sql.to_lowercase();
    let blocked = BLOCKED_TOKENS
        .iter()
        .filter(|t| lowered.contains(*t))
        .map(|t| format!("blocked:{}", t.trim_end()));
    let warned = WARN_TOKENS
        .iter()
        .filter(|t| lowered.contains(*t))
        .map(|t| format!("warn:{}", t.trim_end()));
    blocked.chain(warned).collect()
}

fn statement_count(sql: &str) -> usize {
    sql.split(';').filter(|s| !s.trim().is_empty()).count()
}

/// Plans every migration whose version is not in `applied`.
pub fn build_plan(migrations: &[TenantMigration], applied: &BTreeSet<String>) -> MigrationPlan {
    let pending: Vec<MigrationPlanItem> = migrations
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .map(|m| MigrationPlanItem {
            version: m.version.clone(),
            statement_count: statement_count(&m.up_sql),
            has_down: !m.down_sql.trim().is_empty(),
            risk_signals: scan_risk(&m.up_sql),
        })
        .collect();
    MigrationPlan {
        current_version: applied.iter().next_back().cloned(),
        target_version: pending.last().map(|p| p.version.clone()),
        total_pending: pending.len(),
        total_statements: pending.iter().map(|p| p.statement_count).sum(),
        pending,
    }
}

/// Trims and checks an optional verify statement.
///
/// Returns `None` for blank input. Rejects multiple statements and anything
/// that is not SELECT, SHOW, DESCRIBE or EXPLAIN.
pub fn validate_verify_sql(sql: Option<&str>) -> Result<Option<String>> {
    let Some(sql) = sql.map(|s| s.trim().trim_end_matches(';').trim()) else {
        return Ok(None);
    };
    if sql.is_empty() {
        return Ok(None);
    }
    if sql.contains(';') {
        return Err(CoreError::validation("verify_sql", "must be a single statement"));
    }
    let lowered = sql.to_lowercase();
    let read_only = READ_ONLY_PREFIXES.iter().any(|p| {
        lowered
            .strip_prefix(p)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
    });
    if !read_only {
        return Err(CoreError::validation("verify_sql", "must be a read-only statement"));
    }
    Ok(Some(sql.to_string()))
}

fn lock_key(workspace_id: Uuid) -> String {
    format!("workspace_db_migration_{}", workspace_id.simple())
}

// ============================================================================
// Service
// ============================================================================

impl TenantDbService {
    async fn current_plan(
        &self,
        conn: &mut Box<dyn TenantConnection>,
    ) -> Result<(MigrationPlan, MigrationPrecheck)> {
        let applied = conn.applied_versions().await?;
        let plan = build_plan(&self.migrations, &applied);
        let precheck = MigrationPrecheck::from_plan(&plan);
        Ok((plan, precheck))
    }

    /// What would be applied now, with its risk summary.
    pub async fn preview_migration(&self, workspace_id: Uuid, user_id: Uuid) -> Result<MigrationPreview> {
        WorkspaceAccess::load(self.persistence.as_ref(), workspace_id, user_id)
            .await?
            .require_any(DB_MANAGERS)?;
        let (_, mut conn) = self.connect_ready(workspace_id).await?;
        let (plan, precheck) = self.current_plan(&mut conn).await?;
        Ok(MigrationPreview { plan, precheck })
    }

    /// Queues the pending versions for review.
    pub async fn submit_migration(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        request: SubmitMigration,
    ) -> Result<SchemaMigrationRecord> {
        let access = WorkspaceAccess::load(self.persistence.as_ref(), workspace_id, user_id)
            .await?
            .require_any(DB_MANAGERS)?;
        if let Some(active) = self.persistence.get_active_schema_migration(workspace_id).await? {
            return Err(CoreError::Conflict(format!(
                "schema migration {} is {}",
                active.id, active.status
            )));
        }
        let verify_sql = validate_verify_sql(request.verify_sql.as_deref())?;

        let (_, mut conn) = self.connect_ready(workspace_id).await?;
        let (plan, precheck) = self.current_plan(&mut conn).await?;
        drop(conn);
        if plan.pending.is_empty() {
            return Err(CoreError::Conflict("no pending migrations".into()));
        }
        if precheck.blocked && !request.force {
            return Err(CoreError::BlockedByRisk(precheck.blocking()));
        }

        let mut precheck_json = serde_json::to_value(&precheck)?;
        precheck_json["forced"] = json!(request.force);
        let pending_versions: Vec<String> = plan.pending.iter().map(|p| p.version.clone()).collect();
        let now = Utc::now();
        let mut migration = SchemaMigrationRecord {
            id: Uuid::new_v4(),
            workspace_id,
            submitter_id: user_id,
            status: migration_status::PENDING_REVIEW.into(),
            from_version: plan.current_version.clone(),
            target_version: plan.target_version.clone(),
            pending_versions,
            plan: serde_json::to_value(&plan)?,
            precheck: precheck_json,
            result: json!({}),
            verify_sql,
            backup_id: None,
            review_queue_id: None,
            review_note: None,
            approved_by: None,
            approved_at: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.persistence.create_schema_migration(&migration).await?;

        let item = ReviewItemRecord {
            id: Uuid::new_v4(),
            item_type: REVIEW_ITEM_TYPE.into(),
            item_id: migration.id,
            submitter_id: user_id,
            status: "pending".into(),
            title: format!("{} DB Schema Migration", access.workspace.name),
            submission_note: request.note.clone(),
            snapshot: review_snapshot(&migration),
            reviewer_id: None,
            review_note: None,
            created_at: now,
            reviewed_at: None,
        };
        if let Err(e) = self.persistence.create_review_item(&item).await {
            let _ = self.persistence.delete_schema_migration(migration.id).await;
            return Err(e.into());
        }
        migration.review_queue_id = Some(item.id);
        self.persistence.update_schema_migration(&migration).await?;

        let _ = self
            .events
            .record_db_event(
                types::DB_MIGRATION_SUBMITTED,
                workspace_id,
                0,
                None,
                json!({
                    "migration_id": migration.id,
                    "target_version": migration.target_version,
                    "risk_level": precheck.risk_level,
                    "forced": request.force,
                }),
            )
            .await;
        info!(workspace_id = %workspace_id, migration_id = %migration.id, pending = plan.total_pending, "Schema migration submitted");
        Ok(migration)
    }

    /// Approves a pending migration.
    pub async fn approve_migration(
        &self,
        migration_id: Uuid,
        reviewer_id: Uuid,
        note: Option<String>,
    ) -> Result<SchemaMigrationRecord> {
        let note = note.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| "approved".into());
        self.decide(migration_id, reviewer_id, true, note).await
    }

    /// Rejects a pending migration.
    pub async fn reject_migration(
        &self,
        migration_id: Uuid,
        reviewer_id: Uuid,
        reason: Option<String>,
    ) -> Result<SchemaMigrationRecord> {
        let reason = reason.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| "rejected".into());
        self.decide(migration_id, reviewer_id, false, reason).await
    }

    async fn decide(
        &self,
        migration_id: Uuid,
        reviewer_id: Uuid,
        approve: bool,
        note: String,
    ) -> Result<SchemaMigrationRecord> {
        let reviewer = self
            .persistence
            .get_reviewer(reviewer_id)
            .await?
            .filter(|r| r.active)
            .ok_or_else(|| CoreError::Forbidden("not an active reviewer".into()))?;
        let mut migration = self.require_migration(migration_id).await?;
        if migration.status != migration_status::PENDING_REVIEW {
            return Err(CoreError::InvalidState {
                expected: migration_status::PENDING_REVIEW.into(),
                actual: migration.status,
            });
        }
        let now = Utc::now();

        if let Some(item_id) = migration.review_queue_id {
            if let Some(mut item) = self.persistence.get_review_item(item_id).await? {
                item.status = if approve { "approved" } else { "rejected" }.into();
                item.reviewer_id = Some(reviewer_id);
                item.review_note = Some(note.clone());
                item.reviewed_at = Some(now);
                self.persistence.update_review_item(&item).await?;
            }
        }
        self.persistence
            .upsert_reviewer(&ReviewerRecord {
                total_reviews: reviewer.total_reviews + 1,
                approved_count: reviewer.approved_count + i32::from(approve),
                rejected_count: reviewer.rejected_count + i32::from(!approve),
                ..reviewer
            })
            .await?;

        migration.review_note = Some(note);
        migration.approved_at = Some(now);
        migration.updated_at = now;
        let event_type = if approve {
            migration.status = migration_status::APPROVED.into();
            migration.approved_by = Some(reviewer_id);
            types::DB_MIGRATION_APPROVED
        } else {
            migration.status = migration_status::REJECTED.into();
            migration.completed_at = Some(now);
            types::DB_MIGRATION_REJECTED
        };
        self.persistence.update_schema_migration(&migration).await?;
        let _ = self
            .events
            .record_db_event(
                event_type,
                migration.workspace_id,
                0,
                None,
                json!({ "migration_id": migration.id, "reviewer_id": reviewer_id }),
            )
            .await;
        Ok(migration)
    }

    /// Applies an approved migration under the workspace lock.
    ///
    /// A failure after the backup was taken restores it and ends in
    /// `rolled_back`; otherwise the migration ends in `failed`. Either way the
    /// error is returned and the stored row carries `error_message`.
    pub async fn execute_migration(&self, migration_id: Uuid, user_id: Uuid) -> Result<SchemaMigrationRecord> {
        let migration = self.require_migration(migration_id).await?;
        WorkspaceAccess::load(self.persistence.as_ref(), migration.workspace_id, user_id)
            .await?
            .require_any(DB_MANAGERS)?;
        if migration.status != migration_status::APPROVED {
            return Err(CoreError::InvalidState {
                expected: migration_status::APPROVED.into(),
                actual: migration.status,
            });
        }
        if let Some(active) = self
            .persistence
            .get_active_schema_migration(migration.workspace_id)
            .await?
            .filter(|a| a.id != migration.id)
        {
            return Err(CoreError::Conflict(format!(
                "schema migration {} is {}",
                active.id, active.status
            )));
        }

        let (_, mut conn) = self.connect_ready(migration.workspace_id).await?;
        let key = lock_key(migration.workspace_id);
        if !conn.try_lock(&key, LOCK_TIMEOUT).await? {
            return Err(CoreError::MigrationLocked);
        }
        let outcome = self.run_locked(migration, &mut conn).await;
        if let Err(e) = conn.release_lock(&key).await {
            warn!(lock = %key, error = %e, "Failed to release migration lock");
        }
        outcome
    }

    async fn run_locked(
        &self,
        mut migration: SchemaMigrationRecord,
        conn: &mut Box<dyn TenantConnection>,
    ) -> Result<SchemaMigrationRecord> {
        let workspace_id = migration.workspace_id;
        let (plan, precheck) = self.current_plan(conn).await?;
        if plan.pending.is_empty() {
            return Err(CoreError::Conflict("no pending migrations".into()));
        }
        let forced = migration.precheck["forced"].as_bool().unwrap_or(false);
        if precheck.blocked && !forced {
            return Err(CoreError::BlockedByRisk(precheck.blocking()));
        }

        let started = Instant::now();
        let now = Utc::now();
        let mut precheck_json = serde_json::to_value(&precheck)?;
        precheck_json["forced"] = json!(forced);
        migration.status = migration_status::RUNNING.into();
        migration.started_at = Some(now);
        migration.plan = serde_json::to_value(&plan)?;
        migration.precheck = precheck_json;
        migration.pending_versions = plan.pending.iter().map(|p| p.version.clone()).collect();
        migration.from_version = plan.current_version.clone();
        migration.target_version = plan.target_version.clone();
        migration.updated_at = now;
        self.persistence.update_schema_migration(&migration).await?;

        let backup = match self.backup(workspace_id).await {
            Ok(b) => b,
            Err(e) => {
                let message = format!("backup failed: {e}");
                return Err(self
                    .finish_failed(migration, migration_status::FAILED, message, started)
                    .await);
            }
        };
        migration.backup_id = Some(backup.backup_id.clone());
        migration.updated_at = Utc::now();

        // From here on every failure, ledger writes included, restores the backup.
        match self.apply_recorded(&migration, &plan, conn).await {
            Ok(done) => {
                let _ = self
                    .events
                    .record_db_event(
                        types::DB_MIGRATION_COMPLETED,
                        workspace_id,
                        started.elapsed().as_millis() as i64,
                        None,
                        json!({
                            "migration_id": done.id,
                            "applied": done.result["applied"],
                            "backup_id": backup.backup_id,
                        }),
                    )
                    .await;
                info!(workspace_id = %workspace_id, migration_id = %done.id, "Schema migration completed");
                Ok(done)
            }
            Err(e) => {
                let (status, message) = match self.restore(workspace_id, &backup.backup_id).await {
                    Ok(_) => (migration_status::ROLLED_BACK, e.to_string()),
                    Err(restore_err) => (
                        migration_status::FAILED,
                        format!("migration failed: {e}; rollback failed: {restore_err}"),
                    ),
                };
                Err(self.finish_failed(migration, status, message, started).await)
            }
        }
    }

    /// Stores the backup id, applies the plan and stores the completed row.
    async fn apply_recorded(
        &self,
        migration: &SchemaMigrationRecord,
        plan: &MigrationPlan,
        conn: &mut Box<dyn TenantConnection>,
    ) -> Result<SchemaMigrationRecord> {
        self.persistence.update_schema_migration(migration).await?;
        let (applied, current_version) = self
            .apply_and_verify(plan, migration.verify_sql.as_deref(), conn)
            .await?;
        let now = Utc::now();
        let mut done = migration.clone();
        done.status = migration_status::COMPLETED.into();
        done.completed_at = Some(now);
        done.updated_at = now;
        done.result = json!({
            "total_applied": applied.len(),
            "applied": applied,
            "current_version": current_version,
        });
        self.persistence.update_schema_migration(&done).await?;
        Ok(done)
    }

    async fn apply_and_verify(
        &self,
        plan: &MigrationPlan,
        verify_sql: Option<&str>,
        conn: &mut Box<dyn TenantConnection>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let mut applied = Vec::with_capacity(plan.pending.len());
        for item in &plan.pending {
            let migration = self
                .migrations
                .iter()
                .find(|m| m.version == item.version)
                .ok_or_else(|| CoreError::NotFound(format!("migration {}", item.version)))?;
            conn.apply(migration).await?;
            applied.push(item.version.clone());
        }
        let current_version = conn.applied_versions().await?.into_iter().next_back();
        match verify_sql {
            Some(sql) => conn.verify(sql).await?,
            None if current_version != plan.target_version => {
                return Err(CoreError::TenantDb(format!(
                    "version mismatch after apply: expected {:?}, found {current_version:?}",
                    plan.target_version
                )));
            }
            None => {}
        }
        Ok((applied, current_version))
    }

    async fn finish_failed(
        &self,
        mut migration: SchemaMigrationRecord,
        status: &str,
        message: String,
        started: Instant,
    ) -> CoreError {
        let now = Utc::now();
        migration.status = status.into();
        migration.error_message = Some(message.clone());
        migration.completed_at = Some(now);
        migration.updated_at = now;
        if let Err(e) = self.persistence.update_schema_migration(&migration).await {
            error!(migration_id = %migration.id, error = %e, "Failed to persist migration failure");
        }
        let _ = self
            .events
            .record_db_event(
                types::DB_MIGRATION_FAILED,
                migration.workspace_id,
                started.elapsed().as_millis() as i64,
                Some(&message),
                json!({
                    "migration_id": migration.id,
                    "status": status,
                    "backup_id": migration.backup_id,
                }),
            )
            .await;
        error!(migration_id = %migration.id, status, error = %message, "Schema migration failed");
        CoreError::TenantDb(message)
    }

    /// One migration, visible to the workspace's database managers.
    pub async fn get_migration(&self, migration_id: Uuid, user_id: Uuid) -> Result<SchemaMigrationRecord> {
        let migration = self.require_migration(migration_id).await?;
        WorkspaceAccess::load(self.persistence.as_ref(), migration.workspace_id, user_id)
            .await?
            .require_any(DB_MANAGERS)?;
        Ok(migration)
    }

    async fn require_migration(&self, migration_id: Uuid) -> Result<SchemaMigrationRecord> {
        self.persistence
            .get_schema_migration(migration_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("schema migration".into()))
    }
}

/// JSON view used by the review queue.
pub fn review_snapshot(migration: &SchemaMigrationRecord) -> Value {
    json!({
        "workspace_id": migration.workspace_id,
        "migration_id": migration.id,
        "pending_versions": migration.pending_versions,
        "plan": migration.plan,
        "precheck": migration.precheck,
    })
}
