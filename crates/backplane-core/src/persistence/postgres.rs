// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for backplane-core.
//!
//! Every operation is a free function over a [`PgPool`] so handlers and tests can
//! call them directly; [`PostgresPersistence`] implements the port by delegating.
//! Column names match the record field names, which lets `query_as` map rows
//! with `SELECT *`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgQueryResult;
use uuid::Uuid;

use super::{
    AppUserRecord, AuditLogRecord, DbRoleRecord, DomainRecord, EventCountFilter, EventQuery,
    EventRecord, EventStat, ExecutionRecord, InvoicePaymentRecord, MemberRecord, NodeLogRecord,
    NotificationRecord, Persistence, PlanRecord, QuotaRecord, ReviewItemRecord, ReviewerRecord,
    RoleRecord, SchemaMigrationRecord, SecretRecord, SessionRecord, SlugAliasRecord, StoreError,
    StoreResult, UsageEventRecord, UserRecord, VersionRecord, WebhookDeliveryRecord,
    WebhookEndpointRecord, WorkspaceDatabaseRecord, WorkspaceRecord, merge_usage,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn require_row(result: PgQueryResult, what: &str) -> StoreResult<()> {
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(what.to_string()));
    }
    Ok(())
}

// ============================================================================
// Workspace Operations
// ============================================================================

/// Insert a workspace.
pub async fn create_workspace(pool: &PgPool, w: &WorkspaceRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_workspaces (id, slug, name, description, owner_user_id, app_status,
            access_mode, data_classification, rate_limit, require_captcha, allowed_origins,
            current_version_id, plan_code, settings, deleted_at, purge_after, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        "#,
    )
    .bind(w.id)
    .bind(&w.slug)
    .bind(&w.name)
    .bind(&w.description)
    .bind(w.owner_user_id)
    .bind(&w.app_status)
    .bind(&w.access_mode)
    .bind(&w.data_classification)
    .bind(&w.rate_limit)
    .bind(w.require_captcha)
    .bind(&w.allowed_origins)
    .bind(w.current_version_id)
    .bind(&w.plan_code)
    .bind(&w.settings)
    .bind(w.deleted_at)
    .bind(w.purge_after)
    .bind(w.created_at)
    .bind(w.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a workspace by id, including soft-deleted rows.
pub async fn get_workspace(pool: &PgPool, id: Uuid) -> StoreResult<Option<WorkspaceRecord>> {
    let record = sqlx::query_as::<_, WorkspaceRecord>("SELECT * FROM bp_workspaces WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Get a live workspace by slug.
pub async fn get_workspace_by_slug(
    pool: &PgPool,
    slug: &str,
) -> StoreResult<Option<WorkspaceRecord>> {
    let record = sqlx::query_as::<_, WorkspaceRecord>(
        "SELECT * FROM bp_workspaces WHERE slug = $1 AND deleted_at IS NULL",
    )
    .bind(slug)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Overwrite every mutable workspace column.
pub async fn update_workspace(pool: &PgPool, w: &WorkspaceRecord) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE bp_workspaces
        SET slug = $2, name = $3, description = $4, app_status = $5, access_mode = $6,
            data_classification = $7, rate_limit = $8, require_captcha = $9,
            allowed_origins = $10, current_version_id = $11, plan_code = $12, settings = $13,
            deleted_at = $14, purge_after = $15, updated_at = $16
        WHERE id = $1
        "#,
    )
    .bind(w.id)
    .bind(&w.slug)
    .bind(&w.name)
    .bind(&w.description)
    .bind(&w.app_status)
    .bind(&w.access_mode)
    .bind(&w.data_classification)
    .bind(&w.rate_limit)
    .bind(w.require_captcha)
    .bind(&w.allowed_origins)
    .bind(w.current_version_id)
    .bind(&w.plan_code)
    .bind(&w.settings)
    .bind(w.deleted_at)
    .bind(w.purge_after)
    .bind(w.updated_at)
    .execute(pool)
    .await?;

    require_row(result, "workspace")
}

/// Soft-deleted workspaces whose purge deadline has passed.
pub async fn list_purgeable_workspaces(pool: &PgPool, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
    let ids: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id FROM bp_workspaces
        WHERE deleted_at IS NOT NULL AND purge_after IS NOT NULL AND purge_after <= $1
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    Ok(ids.into_iter().map(|(id,)| id).collect())
}

/// Hard-delete a workspace. Owned rows go with it via `ON DELETE CASCADE`.
pub async fn purge_workspace(pool: &PgPool, id: Uuid) -> StoreResult<()> {
    let result = sqlx::query("DELETE FROM bp_workspaces WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    require_row(result, "workspace")
}

/// Insert a slug alias.
pub async fn create_slug_alias(pool: &PgPool, a: &SlugAliasRecord) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO bp_slug_aliases (slug, workspace_id, status, created_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(&a.slug)
    .bind(a.workspace_id)
    .bind(&a.status)
    .bind(a.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a slug alias.
pub async fn get_slug_alias(pool: &PgPool, slug: &str) -> StoreResult<Option<SlugAliasRecord>> {
    let record =
        sqlx::query_as::<_, SlugAliasRecord>("SELECT * FROM bp_slug_aliases WHERE slug = $1")
            .bind(slug)
            .fetch_optional(pool)
            .await?;

    Ok(record)
}

/// Insert a workspace role.
pub async fn create_role(pool: &PgPool, r: &RoleRecord) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO bp_roles (id, workspace_id, name, permissions, created_at) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(r.id)
    .bind(r.workspace_id)
    .bind(&r.name)
    .bind(&r.permissions)
    .bind(r.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a role by id.
pub async fn get_role(pool: &PgPool, id: Uuid) -> StoreResult<Option<RoleRecord>> {
    let record = sqlx::query_as::<_, RoleRecord>("SELECT * FROM bp_roles WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Insert or re-role a workspace member.
pub async fn upsert_member(pool: &PgPool, m: &MemberRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_members (workspace_id, user_id, role_id, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (workspace_id, user_id) DO UPDATE SET role_id = EXCLUDED.role_id
        "#,
    )
    .bind(m.workspace_id)
    .bind(m.user_id)
    .bind(m.role_id)
    .bind(m.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a membership row.
pub async fn get_member(
    pool: &PgPool,
    workspace_id: Uuid,
    user_id: Uuid,
) -> StoreResult<Option<MemberRecord>> {
    let record = sqlx::query_as::<_, MemberRecord>(
        "SELECT * FROM bp_members WHERE workspace_id = $1 AND user_id = $2",
    )
    .bind(workspace_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Insert or refresh a platform user.
pub async fn upsert_user(pool: &PgPool, u: &UserRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_users (id, email, phone, display_name, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE
        SET email = EXCLUDED.email, phone = EXCLUDED.phone, display_name = EXCLUDED.display_name
        "#,
    )
    .bind(u.id)
    .bind(&u.email)
    .bind(&u.phone)
    .bind(&u.display_name)
    .bind(u.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a platform user.
pub async fn get_user(pool: &PgPool, id: Uuid) -> StoreResult<Option<UserRecord>> {
    let record = sqlx::query_as::<_, UserRecord>("SELECT * FROM bp_users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

// ============================================================================
// Version & Domain Operations
// ============================================================================

/// Insert a version snapshot.
pub async fn create_version(pool: &PgPool, v: &VersionRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_versions (id, workspace_id, version, workflow_definition, ui_schema,
            db_schema, config, changelog, created_by, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(v.id)
    .bind(v.workspace_id)
    .bind(&v.version)
    .bind(&v.workflow_definition)
    .bind(&v.ui_schema)
    .bind(&v.db_schema)
    .bind(&v.config)
    .bind(&v.changelog)
    .bind(v.created_by)
    .bind(v.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a version snapshot.
pub async fn get_version(pool: &PgPool, id: Uuid) -> StoreResult<Option<VersionRecord>> {
    let record = sqlx::query_as::<_, VersionRecord>("SELECT * FROM bp_versions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Insert a custom domain binding.
pub async fn create_domain(pool: &PgPool, d: &DomainRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_domains (id, workspace_id, domain, status, ssl_status,
            verification_attempts, last_verified_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(d.id)
    .bind(d.workspace_id)
    .bind(&d.domain)
    .bind(&d.status)
    .bind(&d.ssl_status)
    .bind(d.verification_attempts)
    .bind(d.last_verified_at)
    .bind(d.created_at)
    .bind(d.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a domain binding by normalized host.
pub async fn get_domain_by_host(pool: &PgPool, host: &str) -> StoreResult<Option<DomainRecord>> {
    let record = sqlx::query_as::<_, DomainRecord>("SELECT * FROM bp_domains WHERE domain = $1")
        .bind(host)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Update a domain binding's lifecycle columns.
pub async fn update_domain(pool: &PgPool, d: &DomainRecord) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE bp_domains
        SET status = $2, ssl_status = $3, verification_attempts = $4,
            last_verified_at = $5, updated_at = $6
        WHERE id = $1
        "#,
    )
    .bind(d.id)
    .bind(&d.status)
    .bind(&d.ssl_status)
    .bind(d.verification_attempts)
    .bind(d.last_verified_at)
    .bind(d.updated_at)
    .execute(pool)
    .await?;

    require_row(result, "domain")
}

// ============================================================================
// Session Operations
// ============================================================================

/// Insert a runtime session.
pub async fn create_session(pool: &PgPool, s: &SessionRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_sessions (id, workspace_id, session_type, user_id, ip_hash,
            user_agent_hash, token_hash, expired_at, blocked_at, blocked_reason,
            created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(s.id)
    .bind(s.workspace_id)
    .bind(&s.session_type)
    .bind(s.user_id)
    .bind(&s.ip_hash)
    .bind(&s.user_agent_hash)
    .bind(&s.token_hash)
    .bind(s.expired_at)
    .bind(s.blocked_at)
    .bind(&s.blocked_reason)
    .bind(s.created_at)
    .bind(s.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a session by id.
pub async fn get_session(pool: &PgPool, id: Uuid) -> StoreResult<Option<SessionRecord>> {
    let record = sqlx::query_as::<_, SessionRecord>("SELECT * FROM bp_sessions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Get a session by the hash of its bearer token.
pub async fn get_session_by_token_hash(
    pool: &PgPool,
    token_hash: &str,
) -> StoreResult<Option<SessionRecord>> {
    let record =
        sqlx::query_as::<_, SessionRecord>("SELECT * FROM bp_sessions WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(pool)
            .await?;

    Ok(record)
}

/// Update a session's mutable columns.
pub async fn update_session(pool: &PgPool, s: &SessionRecord) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE bp_sessions
        SET user_id = $2, ip_hash = $3, user_agent_hash = $4, token_hash = $5,
            expired_at = $6, blocked_at = $7, blocked_reason = $8, updated_at = $9
        WHERE id = $1
        "#,
    )
    .bind(s.id)
    .bind(s.user_id)
    .bind(&s.ip_hash)
    .bind(&s.user_agent_hash)
    .bind(&s.token_hash)
    .bind(s.expired_at)
    .bind(s.blocked_at)
    .bind(&s.blocked_reason)
    .bind(s.updated_at)
    .execute(pool)
    .await?;

    require_row(result, "session")
}

/// Delete anonymous sessions created before `cutoff`.
pub async fn delete_anonymous_sessions_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> StoreResult<u64> {
    let result =
        sqlx::query("DELETE FROM bp_sessions WHERE session_type = 'anon' AND created_at < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Event Operations
// ============================================================================

/// Append an event.
pub async fn insert_event(pool: &PgPool, e: &EventRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_events (id, sequence_num, event_type, severity, workspace_id,
            execution_id, user_id, session_id, ip_hash, trace_id, request_id, node_id,
            node_type, http_method, http_path, http_status, duration_ms, error_code,
            error_message, message, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
            $17, $18, $19, $20, $21, $22)
        "#,
    )
    .bind(e.id)
    .bind(e.sequence_num)
    .bind(&e.event_type)
    .bind(&e.severity)
    .bind(e.workspace_id)
    .bind(e.execution_id)
    .bind(e.user_id)
    .bind(e.session_id)
    .bind(&e.ip_hash)
    .bind(&e.trace_id)
    .bind(&e.request_id)
    .bind(&e.node_id)
    .bind(&e.node_type)
    .bind(&e.http_method)
    .bind(&e.http_path)
    .bind(e.http_status)
    .bind(e.duration_ms)
    .bind(&e.error_code)
    .bind(&e.error_message)
    .bind(&e.message)
    .bind(&e.metadata)
    .bind(e.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Highest sequence number persisted so far, 0 when empty.
pub async fn max_event_sequence(pool: &PgPool) -> StoreResult<i64> {
    let (max,): (Option<i64>,) = sqlx::query_as("SELECT MAX(sequence_num) FROM bp_events")
        .fetch_one(pool)
        .await?;

    Ok(max.unwrap_or(0))
}

/// Count events inside an anti-abuse window.
pub async fn count_events(pool: &PgPool, f: &EventCountFilter) -> StoreResult<i64> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM bp_events
        WHERE workspace_id = $1
          AND created_at >= $2
          AND (cardinality($3::text[]) = 0 OR event_type = ANY($3))
          AND ($4::text IS NULL OR ip_hash = $4)
          AND ($5::uuid IS NULL OR session_id = $5)
        "#,
    )
    .bind(f.workspace_id)
    .bind(f.since)
    .bind(&f.event_types)
    .bind(&f.ip_hash)
    .bind(f.session_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// List events matching a query, oldest first.
pub async fn list_events(pool: &PgPool, q: &EventQuery) -> StoreResult<Vec<EventRecord>> {
    let records = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT * FROM bp_events
        WHERE ($1::uuid IS NULL OR workspace_id = $1)
          AND ($2::uuid IS NULL OR execution_id = $2)
          AND ($3::text IS NULL OR trace_id = $3)
          AND (cardinality($4::text[]) = 0 OR event_type = ANY($4))
          AND (cardinality($5::text[]) = 0 OR severity = ANY($5))
          AND ($6::timestamptz IS NULL OR created_at >= $6)
          AND ($7::timestamptz IS NULL OR created_at < $7)
        ORDER BY sequence_num ASC
        LIMIT $8
        "#,
    )
    .bind(q.workspace_id)
    .bind(q.execution_id)
    .bind(&q.trace_id)
    .bind(&q.event_types)
    .bind(&q.severities)
    .bind(q.since)
    .bind(q.until)
    .bind(q.effective_limit())
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Events with a sequence number above `sequence_num`, used for stream replay.
pub async fn events_after(
    pool: &PgPool,
    sequence_num: i64,
    limit: i64,
) -> StoreResult<Vec<EventRecord>> {
    let records = sqlx::query_as::<_, EventRecord>(
        "SELECT * FROM bp_events WHERE sequence_num > $1 ORDER BY sequence_num ASC LIMIT $2",
    )
    .bind(sequence_num)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Event counts grouped by type and severity.
pub async fn event_stats(
    pool: &PgPool,
    workspace_id: Uuid,
    since: DateTime<Utc>,
) -> StoreResult<Vec<EventStat>> {
    let records = sqlx::query_as::<_, EventStat>(
        r#"
        SELECT event_type, severity, COUNT(*) AS count
        FROM bp_events
        WHERE workspace_id = $1 AND created_at >= $2
        GROUP BY event_type, severity
        ORDER BY event_type, severity
        "#,
    )
    .bind(workspace_id)
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Delete events older than `cutoff`.
pub async fn delete_events_before(pool: &PgPool, cutoff: DateTime<Utc>) -> StoreResult<u64> {
    let result = sqlx::query("DELETE FROM bp_events WHERE created_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Append an audit log entry.
pub async fn insert_audit_log(pool: &PgPool, a: &AuditLogRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_audit_logs (id, workspace_id, actor_id, action, resource_type,
            resource_id, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(a.id)
    .bind(a.workspace_id)
    .bind(a.actor_id)
    .bind(&a.action)
    .bind(&a.resource_type)
    .bind(&a.resource_id)
    .bind(&a.metadata)
    .bind(a.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Audit log entries for a workspace, newest first.
pub async fn list_audit_logs(pool: &PgPool, workspace_id: Uuid) -> StoreResult<Vec<AuditLogRecord>> {
    let records = sqlx::query_as::<_, AuditLogRecord>(
        "SELECT * FROM bp_audit_logs WHERE workspace_id = $1 ORDER BY created_at DESC",
    )
    .bind(workspace_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Delete audit log entries older than `cutoff`.
pub async fn delete_audit_logs_before(pool: &PgPool, cutoff: DateTime<Utc>) -> StoreResult<u64> {
    let result = sqlx::query("DELETE FROM bp_audit_logs WHERE created_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Append an in-app notification.
pub async fn insert_notification(pool: &PgPool, n: &NotificationRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_notifications (id, user_id, workspace_id, event_type, severity,
            title, body, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(n.id)
    .bind(n.user_id)
    .bind(n.workspace_id)
    .bind(&n.event_type)
    .bind(&n.severity)
    .bind(&n.title)
    .bind(&n.body)
    .bind(n.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Notifications addressed to a user, newest first.
pub async fn list_notifications(pool: &PgPool, user_id: Uuid) -> StoreResult<Vec<NotificationRecord>> {
    let records = sqlx::query_as::<_, NotificationRecord>(
        "SELECT * FROM bp_notifications WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Billing Operations
// ============================================================================

/// Insert or update a plan by code.
pub async fn upsert_plan(pool: &PgPool, p: &PlanRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_plans (id, code, name, price_monthly, price_yearly, currency,
            quota_limits, rate_rules, policy, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (code) DO UPDATE
        SET name = EXCLUDED.name, price_monthly = EXCLUDED.price_monthly,
            price_yearly = EXCLUDED.price_yearly, currency = EXCLUDED.currency,
            quota_limits = EXCLUDED.quota_limits, rate_rules = EXCLUDED.rate_rules,
            policy = EXCLUDED.policy, status = EXCLUDED.status, updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(p.id)
    .bind(&p.code)
    .bind(&p.name)
    .bind(p.price_monthly)
    .bind(p.price_yearly)
    .bind(&p.currency)
    .bind(&p.quota_limits)
    .bind(&p.rate_rules)
    .bind(&p.policy)
    .bind(&p.status)
    .bind(p.created_at)
    .bind(p.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a plan by code.
pub async fn get_plan_by_code(pool: &PgPool, code: &str) -> StoreResult<Option<PlanRecord>> {
    let record = sqlx::query_as::<_, PlanRecord>("SELECT * FROM bp_plans WHERE code = $1")
        .bind(code)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Get a plan by id.
pub async fn get_plan(pool: &PgPool, id: Uuid) -> StoreResult<Option<PlanRecord>> {
    let record = sqlx::query_as::<_, PlanRecord>("SELECT * FROM bp_plans WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// All plans, cheapest first.
pub async fn list_plans(pool: &PgPool) -> StoreResult<Vec<PlanRecord>> {
    let records =
        sqlx::query_as::<_, PlanRecord>("SELECT * FROM bp_plans ORDER BY price_monthly ASC")
            .fetch_all(pool)
            .await?;

    Ok(records)
}

/// Quota whose period contains `now`.
pub async fn get_active_quota(
    pool: &PgPool,
    workspace_id: Uuid,
    now: DateTime<Utc>,
) -> StoreResult<Option<QuotaRecord>> {
    let record = sqlx::query_as::<_, QuotaRecord>(
        r#"
        SELECT * FROM bp_quotas
        WHERE workspace_id = $1 AND period_start <= $2 AND period_end > $2
        ORDER BY period_start DESC
        LIMIT 1
        "#,
    )
    .bind(workspace_id)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Insert a quota period. `(workspace_id, period_start)` is unique.
pub async fn create_quota(pool: &PgPool, q: &QuotaRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_quotas (id, workspace_id, plan_id, period_start, period_end,
            limits, usage, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(q.id)
    .bind(q.workspace_id)
    .bind(q.plan_id)
    .bind(q.period_start)
    .bind(q.period_end)
    .bind(&q.limits)
    .bind(&q.usage)
    .bind(&q.status)
    .bind(q.created_at)
    .bind(q.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Merge a usage delta into a quota row under `FOR UPDATE`.
pub async fn add_quota_usage(
    pool: &PgPool,
    quota_id: Uuid,
    delta: &BTreeMap<String, f64>,
) -> StoreResult<QuotaRecord> {
    let mut tx = pool.begin().await?;

    let mut quota =
        sqlx::query_as::<_, QuotaRecord>("SELECT * FROM bp_quotas WHERE id = $1 FOR UPDATE")
            .bind(quota_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound("quota".to_string()))?;

    quota.usage = merge_usage(&quota.usage, delta);
    quota.updated_at = Utc::now();

    sqlx::query("UPDATE bp_quotas SET usage = $2, updated_at = $3 WHERE id = $1")
        .bind(quota_id)
        .bind(&quota.usage)
        .bind(quota.updated_at)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(quota)
}

/// Set a quota's status.
pub async fn set_quota_status(pool: &PgPool, quota_id: Uuid, status: &str) -> StoreResult<()> {
    let result = sqlx::query("UPDATE bp_quotas SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(quota_id)
        .bind(status)
        .execute(pool)
        .await?;

    require_row(result, "quota")
}

/// Quota periods of a workspace, newest first.
pub async fn list_quotas(pool: &PgPool, workspace_id: Uuid) -> StoreResult<Vec<QuotaRecord>> {
    let records = sqlx::query_as::<_, QuotaRecord>(
        "SELECT * FROM bp_quotas WHERE workspace_id = $1 ORDER BY period_start DESC",
    )
    .bind(workspace_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Append a usage event.
pub async fn insert_usage_event(pool: &PgPool, u: &UsageEventRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_usage_events (id, workspace_id, quota_id, usage, cost, currency,
            allowed, recorded_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(u.id)
    .bind(u.workspace_id)
    .bind(u.quota_id)
    .bind(&u.usage)
    .bind(u.cost)
    .bind(&u.currency)
    .bind(u.allowed)
    .bind(u.recorded_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Total recorded cost in `[from, to)`.
pub async fn sum_usage_cost(
    pool: &PgPool,
    workspace_id: Uuid,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> StoreResult<f64> {
    let (sum,): (Option<f64>,) = sqlx::query_as(
        r#"
        SELECT SUM(cost) FROM bp_usage_events
        WHERE workspace_id = $1 AND recorded_at >= $2 AND recorded_at < $3
        "#,
    )
    .bind(workspace_id)
    .bind(from)
    .bind(to)
    .fetch_one(pool)
    .await?;

    Ok(sum.unwrap_or(0.0))
}

/// Usage events in `[from, to)`, oldest first.
pub async fn list_usage_events(
    pool: &PgPool,
    workspace_id: Uuid,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> StoreResult<Vec<UsageEventRecord>> {
    let records = sqlx::query_as::<_, UsageEventRecord>(
        r#"
        SELECT * FROM bp_usage_events
        WHERE workspace_id = $1 AND recorded_at >= $2 AND recorded_at < $3
        ORDER BY recorded_at ASC
        "#,
    )
    .bind(workspace_id)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Insert or update an invoice payment keyed by `(workspace_id, invoice_number)`.
pub async fn upsert_invoice_payment(pool: &PgPool, p: &InvoicePaymentRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_invoice_payments (id, workspace_id, invoice_number, period_start,
            period_end, status, amount, currency, provider, reference, paid_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (workspace_id, invoice_number) DO UPDATE
        SET status = EXCLUDED.status, amount = EXCLUDED.amount, currency = EXCLUDED.currency,
            provider = EXCLUDED.provider, reference = EXCLUDED.reference,
            paid_at = EXCLUDED.paid_at, updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(p.id)
    .bind(p.workspace_id)
    .bind(&p.invoice_number)
    .bind(p.period_start)
    .bind(p.period_end)
    .bind(&p.status)
    .bind(p.amount)
    .bind(&p.currency)
    .bind(&p.provider)
    .bind(&p.reference)
    .bind(p.paid_at)
    .bind(p.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get an invoice payment.
pub async fn get_invoice_payment(
    pool: &PgPool,
    workspace_id: Uuid,
    invoice_number: &str,
) -> StoreResult<Option<InvoicePaymentRecord>> {
    let record = sqlx::query_as::<_, InvoicePaymentRecord>(
        "SELECT * FROM bp_invoice_payments WHERE workspace_id = $1 AND invoice_number = $2",
    )
    .bind(workspace_id)
    .bind(invoice_number)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

// ============================================================================
// Secret & App User Operations
// ============================================================================

/// Insert a secret.
pub async fn create_secret(pool: &PgPool, s: &SecretRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_secrets (id, owner_type, owner_id, secret_type, name, encrypted_value,
            preview, status, expires_at, last_rotated_at, last_used_at, metadata,
            created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(s.id)
    .bind(&s.owner_type)
    .bind(s.owner_id)
    .bind(&s.secret_type)
    .bind(&s.name)
    .bind(&s.encrypted_value)
    .bind(&s.preview)
    .bind(&s.status)
    .bind(s.expires_at)
    .bind(s.last_rotated_at)
    .bind(s.last_used_at)
    .bind(&s.metadata)
    .bind(s.created_at)
    .bind(s.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a secret.
pub async fn get_secret(pool: &PgPool, id: Uuid) -> StoreResult<Option<SecretRecord>> {
    let record = sqlx::query_as::<_, SecretRecord>("SELECT * FROM bp_secrets WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Update a secret's mutable columns.
pub async fn update_secret(pool: &PgPool, s: &SecretRecord) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE bp_secrets
        SET name = $2, encrypted_value = $3, preview = $4, status = $5, expires_at = $6,
            last_rotated_at = $7, last_used_at = $8, metadata = $9, updated_at = $10
        WHERE id = $1
        "#,
    )
    .bind(s.id)
    .bind(&s.name)
    .bind(&s.encrypted_value)
    .bind(&s.preview)
    .bind(&s.status)
    .bind(s.expires_at)
    .bind(s.last_rotated_at)
    .bind(s.last_used_at)
    .bind(&s.metadata)
    .bind(s.updated_at)
    .execute(pool)
    .await?;

    require_row(result, "secret")
}

/// Active secrets of the given types.
pub async fn list_active_secrets_by_type(
    pool: &PgPool,
    secret_types: &[String],
) -> StoreResult<Vec<SecretRecord>> {
    let records = sqlx::query_as::<_, SecretRecord>(
        "SELECT * FROM bp_secrets WHERE status = 'active' AND secret_type = ANY($1)",
    )
    .bind(secret_types)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Insert an app user. `(workspace_id, email)` is unique.
pub async fn create_app_user(pool: &PgPool, u: &AppUserRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_app_users (id, workspace_id, email, password_hash, display_name,
            role, status, last_login_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(u.id)
    .bind(u.workspace_id)
    .bind(&u.email)
    .bind(&u.password_hash)
    .bind(&u.display_name)
    .bind(&u.role)
    .bind(&u.status)
    .bind(u.last_login_at)
    .bind(u.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get an app user.
pub async fn get_app_user(pool: &PgPool, id: Uuid) -> StoreResult<Option<AppUserRecord>> {
    let record = sqlx::query_as::<_, AppUserRecord>("SELECT * FROM bp_app_users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Get an app user by workspace and email.
pub async fn get_app_user_by_email(
    pool: &PgPool,
    workspace_id: Uuid,
    email: &str,
) -> StoreResult<Option<AppUserRecord>> {
    let record = sqlx::query_as::<_, AppUserRecord>(
        "SELECT * FROM bp_app_users WHERE workspace_id = $1 AND email = $2",
    )
    .bind(workspace_id)
    .bind(email)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Update an app user's mutable columns.
pub async fn update_app_user(pool: &PgPool, u: &AppUserRecord) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE bp_app_users
        SET password_hash = $2, display_name = $3, role = $4, status = $5, last_login_at = $6
        WHERE id = $1
        "#,
    )
    .bind(u.id)
    .bind(&u.password_hash)
    .bind(&u.display_name)
    .bind(&u.role)
    .bind(&u.status)
    .bind(u.last_login_at)
    .execute(pool)
    .await?;

    require_row(result, "app user")
}

// ============================================================================
// Tenant Database Operations
// ============================================================================

/// Insert or update the single tenant database row of a workspace.
pub async fn upsert_workspace_database(
    pool: &PgPool,
    d: &WorkspaceDatabaseRecord,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_workspace_databases (id, workspace_id, db_name, db_user, db_host,
            db_port, secret_ref, status, error_message, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (workspace_id) DO UPDATE
        SET db_name = EXCLUDED.db_name, db_user = EXCLUDED.db_user, db_host = EXCLUDED.db_host,
            db_port = EXCLUDED.db_port, secret_ref = EXCLUDED.secret_ref,
            status = EXCLUDED.status, error_message = EXCLUDED.error_message,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(d.id)
    .bind(d.workspace_id)
    .bind(&d.db_name)
    .bind(&d.db_user)
    .bind(&d.db_host)
    .bind(d.db_port)
    .bind(&d.secret_ref)
    .bind(&d.status)
    .bind(&d.error_message)
    .bind(d.created_at)
    .bind(d.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a workspace's tenant database row.
pub async fn get_workspace_database(
    pool: &PgPool,
    workspace_id: Uuid,
) -> StoreResult<Option<WorkspaceDatabaseRecord>> {
    let record = sqlx::query_as::<_, WorkspaceDatabaseRecord>(
        "SELECT * FROM bp_workspace_databases WHERE workspace_id = $1",
    )
    .bind(workspace_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Insert a DB role. A partial unique index allows one active role per type.
pub async fn create_db_role(pool: &PgPool, r: &DbRoleRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_db_roles (id, workspace_id, role_type, db_user, secret_ref, status,
            expires_at, last_rotated_at, revoked_at, revoked_reason, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(r.id)
    .bind(r.workspace_id)
    .bind(&r.role_type)
    .bind(&r.db_user)
    .bind(&r.secret_ref)
    .bind(&r.status)
    .bind(r.expires_at)
    .bind(r.last_rotated_at)
    .bind(r.revoked_at)
    .bind(&r.revoked_reason)
    .bind(r.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a DB role.
pub async fn get_db_role(pool: &PgPool, id: Uuid) -> StoreResult<Option<DbRoleRecord>> {
    let record = sqlx::query_as::<_, DbRoleRecord>("SELECT * FROM bp_db_roles WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Update a DB role's mutable columns.
pub async fn update_db_role(pool: &PgPool, r: &DbRoleRecord) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE bp_db_roles
        SET secret_ref = $2, status = $3, expires_at = $4, last_rotated_at = $5,
            revoked_at = $6, revoked_reason = $7
        WHERE id = $1
        "#,
    )
    .bind(r.id)
    .bind(&r.secret_ref)
    .bind(&r.status)
    .bind(r.expires_at)
    .bind(r.last_rotated_at)
    .bind(r.revoked_at)
    .bind(&r.revoked_reason)
    .execute(pool)
    .await?;

    require_row(result, "db role")
}

/// DB roles of a workspace, oldest first.
pub async fn list_db_roles(pool: &PgPool, workspace_id: Uuid) -> StoreResult<Vec<DbRoleRecord>> {
    let records = sqlx::query_as::<_, DbRoleRecord>(
        "SELECT * FROM bp_db_roles WHERE workspace_id = $1 ORDER BY created_at ASC",
    )
    .bind(workspace_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Insert a schema migration.
pub async fn create_schema_migration(pool: &PgPool, m: &SchemaMigrationRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_schema_migrations (id, workspace_id, submitter_id, status,
            from_version, target_version, pending_versions, plan, precheck, result,
            verify_sql, backup_id, review_queue_id, review_note, approved_by, approved_at,
            started_at, completed_at, error_message, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
            $17, $18, $19, $20, $21)
        "#,
    )
    .bind(m.id)
    .bind(m.workspace_id)
    .bind(m.submitter_id)
    .bind(&m.status)
    .bind(&m.from_version)
    .bind(&m.target_version)
    .bind(&m.pending_versions)
    .bind(&m.plan)
    .bind(&m.precheck)
    .bind(&m.result)
    .bind(&m.verify_sql)
    .bind(&m.backup_id)
    .bind(m.review_queue_id)
    .bind(&m.review_note)
    .bind(m.approved_by)
    .bind(m.approved_at)
    .bind(m.started_at)
    .bind(m.completed_at)
    .bind(&m.error_message)
    .bind(m.created_at)
    .bind(m.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a schema migration.
pub async fn get_schema_migration(
    pool: &PgPool,
    id: Uuid,
) -> StoreResult<Option<SchemaMigrationRecord>> {
    let record = sqlx::query_as::<_, SchemaMigrationRecord>(
        "SELECT * FROM bp_schema_migrations WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Overwrite a schema migration's mutable columns.
pub async fn update_schema_migration(pool: &PgPool, m: &SchemaMigrationRecord) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE bp_schema_migrations
        SET status = $2, from_version = $3, target_version = $4, pending_versions = $5,
            plan = $6, precheck = $7, result = $8, verify_sql = $9, backup_id = $10,
            review_queue_id = $11, review_note = $12, approved_by = $13, approved_at = $14,
            started_at = $15, completed_at = $16, error_message = $17, updated_at = $18
        WHERE id = $1
        "#,
    )
    .bind(m.id)
    .bind(&m.status)
    .bind(&m.from_version)
    .bind(&m.target_version)
    .bind(&m.pending_versions)
    .bind(&m.plan)
    .bind(&m.precheck)
    .bind(&m.result)
    .bind(&m.verify_sql)
    .bind(&m.backup_id)
    .bind(m.review_queue_id)
    .bind(&m.review_note)
    .bind(m.approved_by)
    .bind(m.approved_at)
    .bind(m.started_at)
    .bind(m.completed_at)
    .bind(&m.error_message)
    .bind(m.updated_at)
    .execute(pool)
    .await?;

    require_row(result, "schema migration")
}

/// Delete a schema migration.
pub async fn delete_schema_migration(pool: &PgPool, id: Uuid) -> StoreResult<()> {
    sqlx::query("DELETE FROM bp_schema_migrations WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Latest non-terminal schema migration of a workspace.
pub async fn get_active_schema_migration(
    pool: &PgPool,
    workspace_id: Uuid,
) -> StoreResult<Option<SchemaMigrationRecord>> {
    let record = sqlx::query_as::<_, SchemaMigrationRecord>(
        r#"
        SELECT * FROM bp_schema_migrations
        WHERE workspace_id = $1
          AND status NOT IN ('rejected', 'completed', 'failed', 'rolled_back')
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(workspace_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Insert a review queue item.
pub async fn create_review_item(pool: &PgPool, r: &ReviewItemRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_review_items (id, item_type, item_id, submitter_id, status, title,
            submission_note, snapshot, reviewer_id, review_note, created_at, reviewed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(r.id)
    .bind(&r.item_type)
    .bind(r.item_id)
    .bind(r.submitter_id)
    .bind(&r.status)
    .bind(&r.title)
    .bind(&r.submission_note)
    .bind(&r.snapshot)
    .bind(r.reviewer_id)
    .bind(&r.review_note)
    .bind(r.created_at)
    .bind(r.reviewed_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a review queue item.
pub async fn get_review_item(pool: &PgPool, id: Uuid) -> StoreResult<Option<ReviewItemRecord>> {
    let record =
        sqlx::query_as::<_, ReviewItemRecord>("SELECT * FROM bp_review_items WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    Ok(record)
}

/// Record a review decision on a queue item.
pub async fn update_review_item(pool: &PgPool, r: &ReviewItemRecord) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE bp_review_items
        SET status = $2, reviewer_id = $3, review_note = $4, reviewed_at = $5
        WHERE id = $1
        "#,
    )
    .bind(r.id)
    .bind(&r.status)
    .bind(r.reviewer_id)
    .bind(&r.review_note)
    .bind(r.reviewed_at)
    .execute(pool)
    .await?;

    require_row(result, "review item")
}

/// Insert or update reviewer counters.
pub async fn upsert_reviewer(pool: &PgPool, r: &ReviewerRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_reviewers (user_id, active, total_reviews, approved_count, rejected_count)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (user_id) DO UPDATE
        SET active = EXCLUDED.active, total_reviews = EXCLUDED.total_reviews,
            approved_count = EXCLUDED.approved_count, rejected_count = EXCLUDED.rejected_count
        "#,
    )
    .bind(r.user_id)
    .bind(r.active)
    .bind(r.total_reviews)
    .bind(r.approved_count)
    .bind(r.rejected_count)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a reviewer.
pub async fn get_reviewer(pool: &PgPool, user_id: Uuid) -> StoreResult<Option<ReviewerRecord>> {
    let record =
        sqlx::query_as::<_, ReviewerRecord>("SELECT * FROM bp_reviewers WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;

    Ok(record)
}

// ============================================================================
// Webhook Operations
// ============================================================================

/// Insert a webhook endpoint.
pub async fn create_webhook_endpoint(pool: &PgPool, e: &WebhookEndpointRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_webhook_endpoints (id, workspace_id, url, events, signing_enabled,
            secret_encrypted, active, last_triggered_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(e.id)
    .bind(e.workspace_id)
    .bind(&e.url)
    .bind(&e.events)
    .bind(e.signing_enabled)
    .bind(&e.secret_encrypted)
    .bind(e.active)
    .bind(e.last_triggered_at)
    .bind(e.created_at)
    .bind(e.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a webhook endpoint.
pub async fn get_webhook_endpoint(
    pool: &PgPool,
    id: Uuid,
) -> StoreResult<Option<WebhookEndpointRecord>> {
    let record = sqlx::query_as::<_, WebhookEndpointRecord>(
        "SELECT * FROM bp_webhook_endpoints WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Update a webhook endpoint's mutable columns.
pub async fn update_webhook_endpoint(pool: &PgPool, e: &WebhookEndpointRecord) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE bp_webhook_endpoints
        SET url = $2, events = $3, signing_enabled = $4, secret_encrypted = $5, active = $6,
            last_triggered_at = $7, updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(e.id)
    .bind(&e.url)
    .bind(&e.events)
    .bind(e.signing_enabled)
    .bind(&e.secret_encrypted)
    .bind(e.active)
    .bind(e.last_triggered_at)
    .bind(e.updated_at)
    .execute(pool)
    .await?;

    require_row(result, "webhook endpoint")
}

/// Webhook endpoints of a workspace, oldest first.
pub async fn list_webhook_endpoints(
    pool: &PgPool,
    workspace_id: Uuid,
) -> StoreResult<Vec<WebhookEndpointRecord>> {
    let records = sqlx::query_as::<_, WebhookEndpointRecord>(
        "SELECT * FROM bp_webhook_endpoints WHERE workspace_id = $1 ORDER BY created_at ASC",
    )
    .bind(workspace_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Insert a webhook delivery.
pub async fn create_webhook_delivery(pool: &PgPool, d: &WebhookDeliveryRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_webhook_deliveries (id, endpoint_id, workspace_id, event_type, payload,
            status, attempt_count, max_attempts, next_retry_at, last_status_code,
            response_body, last_error, delivered_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(d.id)
    .bind(d.endpoint_id)
    .bind(d.workspace_id)
    .bind(&d.event_type)
    .bind(&d.payload)
    .bind(&d.status)
    .bind(d.attempt_count)
    .bind(d.max_attempts)
    .bind(d.next_retry_at)
    .bind(d.last_status_code)
    .bind(&d.response_body)
    .bind(&d.last_error)
    .bind(d.delivered_at)
    .bind(d.created_at)
    .bind(d.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a webhook delivery.
pub async fn get_webhook_delivery(
    pool: &PgPool,
    id: Uuid,
) -> StoreResult<Option<WebhookDeliveryRecord>> {
    let record = sqlx::query_as::<_, WebhookDeliveryRecord>(
        "SELECT * FROM bp_webhook_deliveries WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Update a webhook delivery after an attempt.
pub async fn update_webhook_delivery(pool: &PgPool, d: &WebhookDeliveryRecord) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE bp_webhook_deliveries
        SET status = $2, attempt_count = $3, next_retry_at = $4, last_status_code = $5,
            response_body = $6, last_error = $7, delivered_at = $8, updated_at = $9
        WHERE id = $1
        "#,
    )
    .bind(d.id)
    .bind(&d.status)
    .bind(d.attempt_count)
    .bind(d.next_retry_at)
    .bind(d.last_status_code)
    .bind(&d.response_body)
    .bind(&d.last_error)
    .bind(d.delivered_at)
    .bind(d.updated_at)
    .execute(pool)
    .await?;

    require_row(result, "webhook delivery")
}

/// Recent deliveries of an endpoint, newest first.
pub async fn list_webhook_deliveries(
    pool: &PgPool,
    endpoint_id: Uuid,
    limit: i64,
) -> StoreResult<Vec<WebhookDeliveryRecord>> {
    let records = sqlx::query_as::<_, WebhookDeliveryRecord>(
        r#"
        SELECT * FROM bp_webhook_deliveries
        WHERE endpoint_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(endpoint_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Execution Operations
// ============================================================================

/// Insert an execution row.
pub async fn create_execution(pool: &PgPool, x: &ExecutionRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bp_executions (id, workspace_id, version_id, status, trigger_type,
            trigger_data, inputs, outputs, error_message, duration_ms, token_usage,
            session_id, user_id, retry_of, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(x.id)
    .bind(x.workspace_id)
    .bind(x.version_id)
    .bind(&x.status)
    .bind(&x.trigger_type)
    .bind(&x.trigger_data)
    .bind(&x.inputs)
    .bind(&x.outputs)
    .bind(&x.error_message)
    .bind(x.duration_ms)
    .bind(&x.token_usage)
    .bind(x.session_id)
    .bind(x.user_id)
    .bind(x.retry_of)
    .bind(x.started_at)
    .bind(x.finished_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get an execution.
pub async fn get_execution(pool: &PgPool, id: Uuid) -> StoreResult<Option<ExecutionRecord>> {
    let record =
        sqlx::query_as::<_, ExecutionRecord>("SELECT * FROM bp_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    Ok(record)
}

/// Record an execution's terminal state.
pub async fn update_execution(pool: &PgPool, x: &ExecutionRecord) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE bp_executions
        SET status = $2, outputs = $3, error_message = $4, duration_ms = $5,
            token_usage = $6, finished_at = $7
        WHERE id = $1
        "#,
    )
    .bind(x.id)
    .bind(&x.status)
    .bind(&x.outputs)
    .bind(&x.error_message)
    .bind(x.duration_ms)
    .bind(&x.token_usage)
    .bind(x.finished_at)
    .execute(pool)
    .await?;

    require_row(result, "execution")
}

/// Insert node logs in one transaction.
pub async fn insert_node_logs(pool: &PgPool, logs: &[NodeLogRecord]) -> StoreResult<()> {
    let mut tx = pool.begin().await?;
    for l in logs {
        sqlx::query(
            r#"
            INSERT INTO bp_node_logs (id, execution_id, node_id, node_type, status, inputs,
                outputs, error, attempts, started_at, finished_at, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(l.id)
        .bind(l.execution_id)
        .bind(&l.node_id)
        .bind(&l.node_type)
        .bind(&l.status)
        .bind(&l.inputs)
        .bind(&l.outputs)
        .bind(&l.error)
        .bind(l.attempts)
        .bind(l.started_at)
        .bind(l.finished_at)
        .bind(l.duration_ms)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    Ok(())
}

/// Node logs of an execution in start order.
pub async fn list_node_logs(pool: &PgPool, execution_id: Uuid) -> StoreResult<Vec<NodeLogRecord>> {
    let records = sqlx::query_as::<_, NodeLogRecord>(
        "SELECT * FROM bp_node_logs WHERE execution_id = $1 ORDER BY started_at ASC",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Persistence Implementation
// ============================================================================

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn create_workspace(&self, workspace: &WorkspaceRecord) -> StoreResult<()> {
        create_workspace(&self.pool, workspace).await
    }

    async fn get_workspace(&self, id: Uuid) -> StoreResult<Option<WorkspaceRecord>> {
        get_workspace(&self.pool, id).await
    }

    async fn get_workspace_by_slug(&self, slug: &str) -> StoreResult<Option<WorkspaceRecord>> {
        get_workspace_by_slug(&self.pool, slug).await
    }

    async fn update_workspace(&self, workspace: &WorkspaceRecord) -> StoreResult<()> {
        update_workspace(&self.pool, workspace).await
    }

    async fn list_purgeable_workspaces(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        list_purgeable_workspaces(&self.pool, now).await
    }

    async fn purge_workspace(&self, id: Uuid) -> StoreResult<()> {
        purge_workspace(&self.pool, id).await
    }

    async fn create_slug_alias(&self, alias: &SlugAliasRecord) -> StoreResult<()> {
        create_slug_alias(&self.pool, alias).await
    }

    async fn get_slug_alias(&self, slug: &str) -> StoreResult<Option<SlugAliasRecord>> {
        get_slug_alias(&self.pool, slug).await
    }

    async fn create_role(&self, role: &RoleRecord) -> StoreResult<()> {
        create_role(&self.pool, role).await
    }

    async fn get_role(&self, id: Uuid) -> StoreResult<Option<RoleRecord>> {
        get_role(&self.pool, id).await
    }

    async fn upsert_member(&self, member: &MemberRecord) -> StoreResult<()> {
        upsert_member(&self.pool, member).await
    }

    async fn get_member(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<MemberRecord>> {
        get_member(&self.pool, workspace_id, user_id).await
    }

    async fn upsert_user(&self, user: &UserRecord) -> StoreResult<()> {
        upsert_user(&self.pool, user).await
    }

    async fn get_user(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        get_user(&self.pool, id).await
    }

    async fn create_version(&self, version: &VersionRecord) -> StoreResult<()> {
        create_version(&self.pool, version).await
    }

    async fn get_version(&self, id: Uuid) -> StoreResult<Option<VersionRecord>> {
        get_version(&self.pool, id).await
    }

    async fn create_domain(&self, domain: &DomainRecord) -> StoreResult<()> {
        create_domain(&self.pool, domain).await
    }

    async fn get_domain_by_host(&self, host: &str) -> StoreResult<Option<DomainRecord>> {
        get_domain_by_host(&self.pool, host).await
    }

    async fn update_domain(&self, domain: &DomainRecord) -> StoreResult<()> {
        update_domain(&self.pool, domain).await
    }

    async fn create_session(&self, session: &SessionRecord) -> StoreResult<()> {
        create_session(&self.pool, session).await
    }

    async fn get_session(&self, id: Uuid) -> StoreResult<Option<SessionRecord>> {
        get_session(&self.pool, id).await
    }

    async fn get_session_by_token_hash(
        &self,
        token_hash: &str,
    ) -> StoreResult<Option<SessionRecord>> {
        get_session_by_token_hash(&self.pool, token_hash).await
    }

    async fn update_session(&self, session: &SessionRecord) -> StoreResult<()> {
        update_session(&self.pool, session).await
    }

    async fn delete_anonymous_sessions_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        delete_anonymous_sessions_before(&self.pool, cutoff).await
    }

    async fn insert_event(&self, event: &EventRecord) -> StoreResult<()> {
        insert_event(&self.pool, event).await
    }

    async fn max_event_sequence(&self) -> StoreResult<i64> {
        max_event_sequence(&self.pool).await
    }

    async fn count_events(&self, filter: &EventCountFilter) -> StoreResult<i64> {
        count_events(&self.pool, filter).await
    }

    async fn list_events(&self, query: &EventQuery) -> StoreResult<Vec<EventRecord>> {
        list_events(&self.pool, query).await
    }

    async fn events_after(&self, sequence_num: i64, limit: i64) -> StoreResult<Vec<EventRecord>> {
        events_after(&self.pool, sequence_num, limit).await
    }

    async fn event_stats(
        &self,
        workspace_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EventStat>> {
        event_stats(&self.pool, workspace_id, since).await
    }

    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        delete_events_before(&self.pool, cutoff).await
    }

    async fn insert_audit_log(&self, entry: &AuditLogRecord) -> StoreResult<()> {
        insert_audit_log(&self.pool, entry).await
    }

    async fn list_audit_logs(&self, workspace_id: Uuid) -> StoreResult<Vec<AuditLogRecord>> {
        list_audit_logs(&self.pool, workspace_id).await
    }

    async fn delete_audit_logs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        delete_audit_logs_before(&self.pool, cutoff).await
    }

    async fn insert_notification(&self, notification: &NotificationRecord) -> StoreResult<()> {
        insert_notification(&self.pool, notification).await
    }

    async fn list_notifications(&self, user_id: Uuid) -> StoreResult<Vec<NotificationRecord>> {
        list_notifications(&self.pool, user_id).await
    }

    async fn upsert_plan(&self, plan: &PlanRecord) -> StoreResult<()> {
        upsert_plan(&self.pool, plan).await
    }

    async fn get_plan_by_code(&self, code: &str) -> StoreResult<Option<PlanRecord>> {
        get_plan_by_code(&self.pool, code).await
    }

    async fn get_plan(&self, id: Uuid) -> StoreResult<Option<PlanRecord>> {
        get_plan(&self.pool, id).await
    }

    async fn list_plans(&self) -> StoreResult<Vec<PlanRecord>> {
        list_plans(&self.pool).await
    }

    async fn get_active_quota(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QuotaRecord>> {
        get_active_quota(&self.pool, workspace_id, now).await
    }

    async fn create_quota(&self, quota: &QuotaRecord) -> StoreResult<()> {
        create_quota(&self.pool, quota).await
    }

    async fn add_quota_usage(
        &self,
        quota_id: Uuid,
        delta: &BTreeMap<String, f64>,
    ) -> StoreResult<QuotaRecord> {
        add_quota_usage(&self.pool, quota_id, delta).await
    }

    async fn set_quota_status(&self, quota_id: Uuid, status: &str) -> StoreResult<()> {
        set_quota_status(&self.pool, quota_id, status).await
    }

    async fn list_quotas(&self, workspace_id: Uuid) -> StoreResult<Vec<QuotaRecord>> {
        list_quotas(&self.pool, workspace_id).await
    }

    async fn insert_usage_event(&self, event: &UsageEventRecord) -> StoreResult<()> {
        insert_usage_event(&self.pool, event).await
    }

    async fn sum_usage_cost(
        &self,
        workspace_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<f64> {
        sum_usage_cost(&self.pool, workspace_id, from, to).await
    }

    async fn list_usage_events(
        &self,
        workspace_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageEventRecord>> {
        list_usage_events(&self.pool, workspace_id, from, to).await
    }

    async fn upsert_invoice_payment(&self, payment: &InvoicePaymentRecord) -> StoreResult<()> {
        upsert_invoice_payment(&self.pool, payment).await
    }

    async fn get_invoice_payment(
        &self,
        workspace_id: Uuid,
        invoice_number: &str,
    ) -> StoreResult<Option<InvoicePaymentRecord>> {
        get_invoice_payment(&self.pool, workspace_id, invoice_number).await
    }

    async fn create_secret(&self, secret: &SecretRecord) -> StoreResult<()> {
        create_secret(&self.pool, secret).await
    }

    async fn get_secret(&self, id: Uuid) -> StoreResult<Option<SecretRecord>> {
        get_secret(&self.pool, id).await
    }

    async fn update_secret(&self, secret: &SecretRecord) -> StoreResult<()> {
        update_secret(&self.pool, secret).await
    }

    async fn list_active_secrets_by_type(
        &self,
        secret_types: &[String],
    ) -> StoreResult<Vec<SecretRecord>> {
        list_active_secrets_by_type(&self.pool, secret_types).await
    }

    async fn create_app_user(&self, user: &AppUserRecord) -> StoreResult<()> {
        create_app_user(&self.pool, user).await
    }

    async fn get_app_user(&self, id: Uuid) -> StoreResult<Option<AppUserRecord>> {
        get_app_user(&self.pool, id).await
    }

    async fn get_app_user_by_email(
        &self,
        workspace_id: Uuid,
        email: &str,
    ) -> StoreResult<Option<AppUserRecord>> {
        get_app_user_by_email(&self.pool, workspace_id, email).await
    }

    async fn update_app_user(&self, user: &AppUserRecord) -> StoreResult<()> {
        update_app_user(&self.pool, user).await
    }

    async fn upsert_workspace_database(&self, db: &WorkspaceDatabaseRecord) -> StoreResult<()> {
        upsert_workspace_database(&self.pool, db).await
    }

    async fn get_workspace_database(
        &self,
        workspace_id: Uuid,
    ) -> StoreResult<Option<WorkspaceDatabaseRecord>> {
        get_workspace_database(&self.pool, workspace_id).await
    }

    async fn create_db_role(&self, role: &DbRoleRecord) -> StoreResult<()> {
        create_db_role(&self.pool, role).await
    }

    async fn get_db_role(&self, id: Uuid) -> StoreResult<Option<DbRoleRecord>> {
        get_db_role(&self.pool, id).await
    }

    async fn update_db_role(&self, role: &DbRoleRecord) -> StoreResult<()> {
        update_db_role(&self.pool, role).await
    }

    async fn list_db_roles(&self, workspace_id: Uuid) -> StoreResult<Vec<DbRoleRecord>> {
        list_db_roles(&self.pool, workspace_id).await
    }

    async fn create_schema_migration(&self, migration: &SchemaMigrationRecord) -> StoreResult<()> {
        create_schema_migration(&self.pool, migration).await
    }

    async fn get_schema_migration(&self, id: Uuid) -> StoreResult<Option<SchemaMigrationRecord>> {
        get_schema_migration(&self.pool, id).await
    }

    async fn update_schema_migration(&self, migration: &SchemaMigrationRecord) -> StoreResult<()> {
        update_schema_migration(&self.pool, migration).await
    }

    async fn delete_schema_migration(&self, id: Uuid) -> StoreResult<()> {
        delete_schema_migration(&self.pool, id).await
    }

    async fn get_active_schema_migration(
        &self,
        workspace_id: Uuid,
    ) -> StoreResult<Option<SchemaMigrationRecord>> {
        get_active_schema_migration(&self.pool, workspace_id).await
    }

    async fn create_review_item(&self, item: &ReviewItemRecord) -> StoreResult<()> {
        create_review_item(&self.pool, item).await
    }

    async fn get_review_item(&self, id: Uuid) -> StoreResult<Option<ReviewItemRecord>> {
        get_review_item(&self.pool, id).await
    }

    async fn update_review_item(&self, item: &ReviewItemRecord) -> StoreResult<()> {
        update_review_item(&self.pool, item).await
    }

    async fn upsert_reviewer(&self, reviewer: &ReviewerRecord) -> StoreResult<()> {
        upsert_reviewer(&self.pool, reviewer).await
    }

    async fn get_reviewer(&self, user_id: Uuid) -> StoreResult<Option<ReviewerRecord>> {
        get_reviewer(&self.pool, user_id).await
    }

    async fn create_webhook_endpoint(&self, endpoint: &WebhookEndpointRecord) -> StoreResult<()> {
        create_webhook_endpoint(&self.pool, endpoint).await
    }

    async fn get_webhook_endpoint(&self, id: Uuid) -> StoreResult<Option<WebhookEndpointRecord>> {
        get_webhook_endpoint(&self.pool, id).await
    }

    async fn update_webhook_endpoint(&self, endpoint: &WebhookEndpointRecord) -> StoreResult<()> {
        update_webhook_endpoint(&self.pool, endpoint).await
    }

    async fn list_webhook_endpoints(
        &self,
        workspace_id: Uuid,
    ) -> StoreResult<Vec<WebhookEndpointRecord>> {
        list_webhook_endpoints(&self.pool, workspace_id).await
    }

    async fn create_webhook_delivery(&self, delivery: &WebhookDeliveryRecord) -> StoreResult<()> {
        create_webhook_delivery(&self.pool, delivery).await
    }

    async fn get_webhook_delivery(&self, id: Uuid) -> StoreResult<Option<WebhookDeliveryRecord>> {
        get_webhook_delivery(&self.pool, id).await
    }

    async fn update_webhook_delivery(&self, delivery: &WebhookDeliveryRecord) -> StoreResult<()> {
        update_webhook_delivery(&self.pool, delivery).await
    }

    async fn list_webhook_deliveries(
        &self,
        endpoint_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<WebhookDeliveryRecord>> {
        list_webhook_deliveries(&self.pool, endpoint_id, limit).await
    }

    async fn create_execution(&self, execution: &ExecutionRecord) -> StoreResult<()> {
        create_execution(&self.pool, execution).await
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<ExecutionRecord>> {
        get_execution(&self.pool, id).await
    }

    async fn update_execution(&self, execution: &ExecutionRecord) -> StoreResult<()> {
        update_execution(&self.pool, execution).await
    }

    async fn insert_node_logs(&self, logs: &[NodeLogRecord]) -> StoreResult<()> {
        insert_node_logs(&self.pool, logs).await
    }

    async fn list_node_logs(&self, execution_id: Uuid) -> StoreResult<Vec<NodeLogRecord>> {
        list_node_logs(&self.pool, execution_id).await
    }
}
