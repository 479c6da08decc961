// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for backplane-core.
//!
//! Services depend on the [`Persistence`] port only. Backends map their native
//! failures into [`StoreError`] so no database error type leaks upward.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`PostgresPersistence`] | Production, `BACKPLANE_DATABASE_URL` |
//! | [`MemoryPersistence`] | Tests and `BACKPLANE_STORAGE=memory` |

pub mod memory;
pub mod postgres;
mod records;

pub use self::memory::MemoryPersistence;
pub use self::postgres::PostgresPersistence;
pub use self::records::*;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Repository-level failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The addressed row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A uniqueness rule rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Connectivity, timeout or other retryable backend failure.
    #[error("transient: {0}")]
    Transient(String),
    /// Stored JSON could not be decoded.
    #[error("serialization: {0}")]
    Serialization(String),
}

/// Result alias for repository calls.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Serialization(err.to_string())
            }
            other => StoreError::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Window count used by the anti-abuse engine.
#[derive(Debug, Clone, Default)]
pub struct EventCountFilter {
    /// Workspace the events belong to.
    pub workspace_id: Uuid,
    /// Event types to count (empty counts every type).
    pub event_types: Vec<String>,
    /// Count events at or after this instant.
    pub since: DateTime<Utc>,
    /// Restrict to one hashed IP.
    pub ip_hash: Option<String>,
    /// Restrict to one session.
    pub session_id: Option<Uuid>,
}

/// Event listing filter.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Workspace correlator.
    pub workspace_id: Option<Uuid>,
    /// Execution correlator.
    pub execution_id: Option<Uuid>,
    /// Trace correlator.
    pub trace_id: Option<String>,
    /// Allowed event types (empty = any).
    pub event_types: Vec<String>,
    /// Allowed severities (empty = any).
    pub severities: Vec<String>,
    /// Lower bound, inclusive.
    pub since: Option<DateTime<Utc>>,
    /// Upper bound, exclusive.
    pub until: Option<DateTime<Utc>>,
    /// Maximum rows; 0 means the backend default of 100.
    pub limit: i64,
}

impl EventQuery {
    /// Effective row limit.
    pub fn effective_limit(&self) -> i64 {
        if self.limit <= 0 { 100 } else { self.limit.min(1000) }
    }
}

/// Aggregated event count per type and severity.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct EventStat {
    /// Event type.
    pub event_type: String,
    /// Severity.
    pub severity: String,
    /// Number of events.
    pub count: i64,
}

/// Adds `delta` into a usage object, treating missing or non-numeric entries as 0.
pub(crate) fn merge_usage(usage: &serde_json::Value, delta: &BTreeMap<String, f64>) -> serde_json::Value {
    let mut merged = usage.as_object().cloned().unwrap_or_default();
    for (key, value) in delta {
        let current = merged.get(key).and_then(serde_json::Value::as_f64).unwrap_or(0.0);
        merged.insert(key.clone(), serde_json::json!(current + value));
    }
    serde_json::Value::Object(merged)
}

/// Persistence interface used by every backplane service.
///
/// Quota usage merges are the only multi-statement write; backends run them in
/// a transaction that locks the quota row so concurrent consumers serialize.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // Workspaces -------------------------------------------------------------
    async fn create_workspace(&self, workspace: &WorkspaceRecord) -> StoreResult<()>;
    async fn get_workspace(&self, id: Uuid) -> StoreResult<Option<WorkspaceRecord>>;
    async fn get_workspace_by_slug(&self, slug: &str) -> StoreResult<Option<WorkspaceRecord>>;
    async fn update_workspace(&self, workspace: &WorkspaceRecord) -> StoreResult<()>;
    async fn list_purgeable_workspaces(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>>;
    /// Deletes the workspace and every row it owns.
    async fn purge_workspace(&self, id: Uuid) -> StoreResult<()>;

    async fn create_slug_alias(&self, alias: &SlugAliasRecord) -> StoreResult<()>;
    async fn get_slug_alias(&self, slug: &str) -> StoreResult<Option<SlugAliasRecord>>;

    async fn create_role(&self, role: &RoleRecord) -> StoreResult<()>;
    async fn get_role(&self, id: Uuid) -> StoreResult<Option<RoleRecord>>;
    async fn upsert_member(&self, member: &MemberRecord) -> StoreResult<()>;
    async fn get_member(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<MemberRecord>>;

    async fn upsert_user(&self, user: &UserRecord) -> StoreResult<()>;
    async fn get_user(&self, id: Uuid) -> StoreResult<Option<UserRecord>>;

    // Versions & domains -----------------------------------------------------
    async fn create_version(&self, version: &VersionRecord) -> StoreResult<()>;
    async fn get_version(&self, id: Uuid) -> StoreResult<Option<VersionRecord>>;

    async fn create_domain(&self, domain: &DomainRecord) -> StoreResult<()>;
    async fn get_domain_by_host(&self, host: &str) -> StoreResult<Option<DomainRecord>>;
    async fn update_domain(&self, domain: &DomainRecord) -> StoreResult<()>;

    // Sessions ---------------------------------------------------------------
    async fn create_session(&self, session: &SessionRecord) -> StoreResult<()>;
    async fn get_session(&self, id: Uuid) -> StoreResult<Option<SessionRecord>>;
    async fn get_session_by_token_hash(
        &self,
        token_hash: &str,
    ) -> StoreResult<Option<SessionRecord>>;
    async fn update_session(&self, session: &SessionRecord) -> StoreResult<()>;
    async fn delete_anonymous_sessions_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    // Events -----------------------------------------------------------------
    async fn insert_event(&self, event: &EventRecord) -> StoreResult<()>;
    async fn max_event_sequence(&self) -> StoreResult<i64>;
    async fn count_events(&self, filter: &EventCountFilter) -> StoreResult<i64>;
    async fn list_events(&self, query: &EventQuery) -> StoreResult<Vec<EventRecord>>;
    async fn events_after(&self, sequence_num: i64, limit: i64) -> StoreResult<Vec<EventRecord>>;
    async fn event_stats(
        &self,
        workspace_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EventStat>>;
    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn insert_audit_log(&self, entry: &AuditLogRecord) -> StoreResult<()>;
    async fn list_audit_logs(&self, workspace_id: Uuid) -> StoreResult<Vec<AuditLogRecord>>;
    async fn delete_audit_logs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn insert_notification(&self, notification: &NotificationRecord) -> StoreResult<()>;
    async fn list_notifications(&self, user_id: Uuid) -> StoreResult<Vec<NotificationRecord>>;

    // Billing ----------------------------------------------------------------
    async fn upsert_plan(&self, plan: &PlanRecord) -> StoreResult<()>;
    async fn get_plan_by_code(&self, code: &str) -> StoreResult<Option<PlanRecord>>;
    async fn get_plan(&self, id: Uuid) -> StoreResult<Option<PlanRecord>>;
    async fn list_plans(&self) -> StoreResult<Vec<PlanRecord>>;

    async fn get_active_quota(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QuotaRecord>>;
    async fn create_quota(&self, quota: &QuotaRecord) -> StoreResult<()>;
    /// Atomically adds `delta` to the quota usage and returns the updated row.
    async fn add_quota_usage(
        &self,
        quota_id: Uuid,
        delta: &BTreeMap<String, f64>,
    ) -> StoreResult<QuotaRecord>;
    async fn set_quota_status(&self, quota_id: Uuid, status: &str) -> StoreResult<()>;
    async fn list_quotas(&self, workspace_id: Uuid) -> StoreResult<Vec<QuotaRecord>>;

    async fn insert_usage_event(&self, event: &UsageEventRecord) -> StoreResult<()>;
    async fn sum_usage_cost(
        &self,
        workspace_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<f64>;
    async fn list_usage_events(
        &self,
        workspace_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageEventRecord>>;

    async fn upsert_invoice_payment(&self, payment: &InvoicePaymentRecord) -> StoreResult<()>;
    async fn get_invoice_payment(
        &self,
        workspace_id: Uuid,
        invoice_number: &str,
    ) -> StoreResult<Option<InvoicePaymentRecord>>;

    // Secrets & app users ----------------------------------------------------
    async fn create_secret(&self, secret: &SecretRecord) -> StoreResult<()>;
    async fn get_secret(&self, id: Uuid) -> StoreResult<Option<SecretRecord>>;
    async fn update_secret(&self, secret: &SecretRecord) -> StoreResult<()>;
    async fn list_active_secrets_by_type(
        &self,
        secret_types: &[String],
    ) -> StoreResult<Vec<SecretRecord>>;

    async fn create_app_user(&self, user: &AppUserRecord) -> StoreResult<()>;
    async fn get_app_user(&self, id: Uuid) -> StoreResult<Option<AppUserRecord>>;
    async fn get_app_user_by_email(
        &self,
        workspace_id: Uuid,
        email: &str,
    ) -> StoreResult<Option<AppUserRecord>>;
    async fn update_app_user(&self, user: &AppUserRecord) -> StoreResult<()>;

    // Tenant databases -------------------------------------------------------
    async fn upsert_workspace_database(&self, db: &WorkspaceDatabaseRecord) -> StoreResult<()>;
    async fn get_workspace_database(
        &self,
        workspace_id: Uuid,
    ) -> StoreResult<Option<WorkspaceDatabaseRecord>>;

    /// Fails with `Conflict` when an active role of the same type exists.
    async fn create_db_role(&self, role: &DbRoleRecord) -> StoreResult<()>;
    async fn get_db_role(&self, id: Uuid) -> StoreResult<Option<DbRoleRecord>>;
    async fn update_db_role(&self, role: &DbRoleRecord) -> StoreResult<()>;
    async fn list_db_roles(&self, workspace_id: Uuid) -> StoreResult<Vec<DbRoleRecord>>;

    async fn create_schema_migration(&self, migration: &SchemaMigrationRecord) -> StoreResult<()>;
    async fn get_schema_migration(&self, id: Uuid) -> StoreResult<Option<SchemaMigrationRecord>>;
    async fn update_schema_migration(&self, migration: &SchemaMigrationRecord) -> StoreResult<()>;
    async fn delete_schema_migration(&self, id: Uuid) -> StoreResult<()>;
    /// Non-terminal migration for the workspace, if any.
    async fn get_active_schema_migration(
        &self,
        workspace_id: Uuid,
    ) -> StoreResult<Option<SchemaMigrationRecord>>;

    async fn create_review_item(&self, item: &ReviewItemRecord) -> StoreResult<()>;
    async fn get_review_item(&self, id: Uuid) -> StoreResult<Option<ReviewItemRecord>>;
    async fn update_review_item(&self, item: &ReviewItemRecord) -> StoreResult<()>;
    async fn upsert_reviewer(&self, reviewer: &ReviewerRecord) -> StoreResult<()>;
    async fn get_reviewer(&self, user_id: Uuid) -> StoreResult<Option<ReviewerRecord>>;

    // Webhooks ---------------------------------------------------------------
    async fn create_webhook_endpoint(&self, endpoint: &WebhookEndpointRecord) -> StoreResult<()>;
    async fn get_webhook_endpoint(&self, id: Uuid) -> StoreResult<Option<WebhookEndpointRecord>>;
    async fn update_webhook_endpoint(&self, endpoint: &WebhookEndpointRecord) -> StoreResult<()>;
    async fn list_webhook_endpoints(
        &self,
        workspace_id: Uuid,
    ) -> StoreResult<Vec<WebhookEndpointRecord>>;

    async fn create_webhook_delivery(&self, delivery: &WebhookDeliveryRecord) -> StoreResult<()>;
    async fn get_webhook_delivery(&self, id: Uuid) -> StoreResult<Option<WebhookDeliveryRecord>>;
    async fn update_webhook_delivery(&self, delivery: &WebhookDeliveryRecord) -> StoreResult<()>;
    async fn list_webhook_deliveries(
        &self,
        endpoint_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<WebhookDeliveryRecord>>;

    // Executions -------------------------------------------------------------
    async fn create_execution(&self, execution: &ExecutionRecord) -> StoreResult<()>;
    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<ExecutionRecord>>;
    async fn update_execution(&self, execution: &ExecutionRecord) -> StoreResult<()>;
    async fn insert_node_logs(&self, logs: &[NodeLogRecord]) -> StoreResult<()>;
    async fn list_node_logs(&self, execution_id: Uuid) -> StoreResult<Vec<NodeLogRecord>>;
}
