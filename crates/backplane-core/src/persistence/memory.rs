// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory implementation of the persistence port.
//!
//! All state lives in one struct behind a `tokio::sync::RwLock`. Writes take the
//! write lock, so every mutation (including quota usage merges) is serialized.
//! Uniqueness rules match the PostgreSQL schema: workspace slug, domain host,
//! `(workspace_id, email)` for app users, `(workspace_id, period_start)` for
//! quotas and one active DB role per `(workspace_id, role_type)`.
//!
//! Not durable: state is lost on restart.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::*;

#[derive(Default)]
struct State {
    workspaces: HashMap<Uuid, WorkspaceRecord>,
    aliases: HashMap<String, SlugAliasRecord>,
    roles: HashMap<Uuid, RoleRecord>,
    members: HashMap<(Uuid, Uuid), MemberRecord>,
    users: HashMap<Uuid, UserRecord>,
    versions: HashMap<Uuid, VersionRecord>,
    domains: HashMap<Uuid, DomainRecord>,
    sessions: HashMap<Uuid, SessionRecord>,
    events: Vec<EventRecord>,
    audit_logs: Vec<AuditLogRecord>,
    notifications: Vec<NotificationRecord>,
    plans: HashMap<String, PlanRecord>,
    quotas: HashMap<Uuid, QuotaRecord>,
    usage_events: Vec<UsageEventRecord>,
    payments: HashMap<(Uuid, String), InvoicePaymentRecord>,
    secrets: HashMap<Uuid, SecretRecord>,
    app_users: HashMap<Uuid, AppUserRecord>,
    databases: HashMap<Uuid, WorkspaceDatabaseRecord>,
    db_roles: HashMap<Uuid, DbRoleRecord>,
    migrations: HashMap<Uuid, SchemaMigrationRecord>,
    review_items: HashMap<Uuid, ReviewItemRecord>,
    reviewers: HashMap<Uuid, ReviewerRecord>,
    endpoints: HashMap<Uuid, WebhookEndpointRecord>,
    deliveries: HashMap<Uuid, WebhookDeliveryRecord>,
    executions: HashMap<Uuid, ExecutionRecord>,
    node_logs: Vec<NodeLogRecord>,
}

const TERMINAL_MIGRATION_STATES: &[&str] = &["rejected", "completed", "failed", "rolled_back"];

/// Process-local persistence backend.
#[derive(Default)]
pub struct MemoryPersistence {
    state: RwLock<State>,
    #[cfg(test)]
    migration_update_fault: std::sync::Mutex<Option<usize>>,
}

impl MemoryPersistence {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the `nth` upcoming `update_schema_migration` call (0 is the next
    /// one) with a transient error.
    #[cfg(test)]
    pub(crate) fn fail_migration_update(&self, nth: usize) {
        if let Ok(mut fault) = self.migration_update_fault.lock() {
            *fault = Some(nth);
        }
    }

    #[cfg(test)]
    fn migration_update_faulted(&self) -> bool {
        let Ok(mut fault) = self.migration_update_fault.lock() else {
            return false;
        };
        match *fault {
            Some(0) => {
                *fault = None;
                true
            }
            Some(n) => {
                *fault = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

fn event_matches_count(e: &EventRecord, f: &EventCountFilter) -> bool {
    e.workspace_id == Some(f.workspace_id)
        && e.created_at >= f.since
        && (f.event_types.is_empty() || f.event_types.iter().any(|t| t == &e.event_type))
        && f.ip_hash.as_ref().is_none_or(|h| e.ip_hash.as_ref() == Some(h))
        && f.session_id.is_none_or(|s| e.session_id == Some(s))
}

fn event_matches_query(e: &EventRecord, q: &EventQuery) -> bool {
    q.workspace_id.is_none_or(|w| e.workspace_id == Some(w))
        && q.execution_id.is_none_or(|x| e.execution_id == Some(x))
        && q.trace_id.as_ref().is_none_or(|t| e.trace_id.as_ref() == Some(t))
        && (q.event_types.is_empty() || q.event_types.iter().any(|t| t == &e.event_type))
        && (q.severities.is_empty() || q.severities.iter().any(|s| s == &e.severity))
        && q.since.is_none_or(|s| e.created_at >= s)
        && q.until.is_none_or(|u| e.created_at < u)
}

fn not_found(what: &str) -> StoreError {
    StoreError::NotFound(what.to_string())
}

#[async_trait]
impl Persistence for MemoryPersistence {
    // ========================================================================
    // Workspace Operations
    // ========================================================================

    async fn create_workspace(&self, workspace: &WorkspaceRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        if s.workspaces.values().any(|w| w.slug == workspace.slug) {
            return Err(StoreError::Conflict(format!("slug '{}'", workspace.slug)));
        }
        s.workspaces.insert(workspace.id, workspace.clone());
        Ok(())
    }

    async fn get_workspace(&self, id: Uuid) -> StoreResult<Option<WorkspaceRecord>> {
        Ok(self.state.read().await.workspaces.get(&id).cloned())
    }

    async fn get_workspace_by_slug(&self, slug: &str) -> StoreResult<Option<WorkspaceRecord>> {
        Ok(self
            .state
            .read()
            .await
            .workspaces
            .values()
            .find(|w| w.slug == slug && w.deleted_at.is_none())
            .cloned())
    }

    async fn update_workspace(&self, workspace: &WorkspaceRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        if s
            .workspaces
            .values()
            .any(|w| w.slug == workspace.slug && w.id != workspace.id)
        {
            return Err(StoreError::Conflict(format!("slug '{}'", workspace.slug)));
        }
        match s.workspaces.get_mut(&workspace.id) {
            Some(existing) => {
                *existing = workspace.clone();
                Ok(())
            }
            None => Err(not_found("workspace")),
        }
    }

    async fn list_purgeable_workspaces(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        Ok(self
            .state
            .read()
            .await
            .workspaces
            .values()
            .filter(|w| w.deleted_at.is_some() && w.purge_after.is_some_and(|p| p <= now))
            .map(|w| w.id)
            .collect())
    }

    async fn purge_workspace(&self, id: Uuid) -> StoreResult<()> {
        let mut s = self.state.write().await;
        if s.workspaces.remove(&id).is_none() {
            return Err(not_found("workspace"));
        }
        s.aliases.retain(|_, a| a.workspace_id != id);
        s.roles.retain(|_, r| r.workspace_id != id);
        s.members.retain(|(ws, _), _| *ws != id);
        s.versions.retain(|_, v| v.workspace_id != id);
        s.domains.retain(|_, d| d.workspace_id != id);
        s.sessions.retain(|_, x| x.workspace_id != id);
        s.events.retain(|e| e.workspace_id != Some(id));
        s.quotas.retain(|_, q| q.workspace_id != id);
        s.usage_events.retain(|u| u.workspace_id != id);
        s.payments.retain(|(ws, _), _| *ws != id);
        s.app_users.retain(|_, u| u.workspace_id != id);
        s.databases.remove(&id);
        s.db_roles.retain(|_, r| r.workspace_id != id);
        s.migrations.retain(|_, m| m.workspace_id != id);
        s.endpoints.retain(|_, e| e.workspace_id != id);
        s.deliveries.retain(|_, d| d.workspace_id != id);
        let executions: Vec<Uuid> = s
            .executions
            .values()
            .filter(|x| x.workspace_id == id)
            .map(|x| x.id)
            .collect();
        s.executions.retain(|_, x| x.workspace_id != id);
        s.node_logs.retain(|l| !executions.contains(&l.execution_id));
        Ok(())
    }

    async fn create_slug_alias(&self, alias: &SlugAliasRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        if s.aliases.contains_key(&alias.slug) {
            return Err(StoreError::Conflict(format!("alias '{}'", alias.slug)));
        }
        s.aliases.insert(alias.slug.clone(), alias.clone());
        Ok(())
    }

    async fn get_slug_alias(&self, slug: &str) -> StoreResult<Option<SlugAliasRecord>> {
        Ok(self.state.read().await.aliases.get(slug).cloned())
    }

    async fn create_role(&self, role: &RoleRecord) -> StoreResult<()> {
        self.state.write().await.roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn get_role(&self, id: Uuid) -> StoreResult<Option<RoleRecord>> {
        Ok(self.state.read().await.roles.get(&id).cloned())
    }

    async fn upsert_member(&self, member: &MemberRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .members
            .insert((member.workspace_id, member.user_id), member.clone());
        Ok(())
    }

    async fn get_member(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<MemberRecord>> {
        Ok(self
            .state
            .read()
            .await
            .members
            .get(&(workspace_id, user_id))
            .cloned())
    }

    async fn upsert_user(&self, user: &UserRecord) -> StoreResult<()> {
        self.state.write().await.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    // ========================================================================
    // Version & Domain Operations
    // ========================================================================

    async fn create_version(&self, version: &VersionRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .versions
            .insert(version.id, version.clone());
        Ok(())
    }

    async fn get_version(&self, id: Uuid) -> StoreResult<Option<VersionRecord>> {
        Ok(self.state.read().await.versions.get(&id).cloned())
    }

    async fn create_domain(&self, domain: &DomainRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        if s.domains.values().any(|d| d.domain == domain.domain) {
            return Err(StoreError::Conflict(format!("domain '{}'", domain.domain)));
        }
        s.domains.insert(domain.id, domain.clone());
        Ok(())
    }

    async fn get_domain_by_host(&self, host: &str) -> StoreResult<Option<DomainRecord>> {
        Ok(self
            .state
            .read()
            .await
            .domains
            .values()
            .find(|d| d.domain == host)
            .cloned())
    }

    async fn update_domain(&self, domain: &DomainRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        match s.domains.get_mut(&domain.id) {
            Some(existing) => {
                *existing = domain.clone();
                Ok(())
            }
            None => Err(not_found("domain")),
        }
    }

    // ========================================================================
    // Session Operations
    // ========================================================================

    async fn create_session(&self, session: &SessionRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .sessions
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> StoreResult<Option<SessionRecord>> {
        Ok(self.state.read().await.sessions.get(&id).cloned())
    }

    async fn get_session_by_token_hash(
        &self,
        token_hash: &str,
    ) -> StoreResult<Option<SessionRecord>> {
        Ok(self
            .state
            .read()
            .await
            .sessions
            .values()
            .find(|x| x.token_hash.as_deref() == Some(token_hash))
            .cloned())
    }

    async fn update_session(&self, session: &SessionRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        match s.sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(not_found("session")),
        }
    }

    async fn delete_anonymous_sessions_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut s = self.state.write().await;
        let before = s.sessions.len();
        s.sessions
            .retain(|_, x| !(x.session_type == "anon" && x.created_at < cutoff));
        Ok((before - s.sessions.len()) as u64)
    }

    // ========================================================================
    // Event Operations
    // ========================================================================

    async fn insert_event(&self, event: &EventRecord) -> StoreResult<()> {
        self.state.write().await.events.push(event.clone());
        Ok(())
    }

    async fn max_event_sequence(&self) -> StoreResult<i64> {
        Ok(self
            .state
            .read()
            .await
            .events
            .iter()
            .map(|e| e.sequence_num)
            .max()
            .unwrap_or(0))
    }

    async fn count_events(&self, filter: &EventCountFilter) -> StoreResult<i64> {
        Ok(self
            .state
            .read()
            .await
            .events
            .iter()
            .filter(|e| event_matches_count(e, filter))
            .count() as i64)
    }

    async fn list_events(&self, query: &EventQuery) -> StoreResult<Vec<EventRecord>> {
        let s = self.state.read().await;
        let mut out: Vec<EventRecord> = s
            .events
            .iter()
            .filter(|e| event_matches_query(e, query))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.sequence_num);
        out.truncate(query.effective_limit() as usize);
        Ok(out)
    }

    async fn events_after(&self, sequence_num: i64, limit: i64) -> StoreResult<Vec<EventRecord>> {
        let s = self.state.read().await;
        let mut out: Vec<EventRecord> = s
            .events
            .iter()
            .filter(|e| e.sequence_num > sequence_num)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.sequence_num);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn event_stats(
        &self,
        workspace_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EventStat>> {
        let s = self.state.read().await;
        let mut counts: BTreeMap<(String, String), i64> = BTreeMap::new();
        for e in s
            .events
            .iter()
            .filter(|e| e.workspace_id == Some(workspace_id) && e.created_at >= since)
        {
            *counts
                .entry((e.event_type.clone(), e.severity.clone()))
                .or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((event_type, severity), count)| EventStat {
                event_type,
                severity,
                count,
            })
            .collect())
    }

    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut s = self.state.write().await;
        let before = s.events.len();
        s.events.retain(|e| e.created_at >= cutoff);
        Ok((before - s.events.len()) as u64)
    }

    async fn insert_audit_log(&self, entry: &AuditLogRecord) -> StoreResult<()> {
        self.state.write().await.audit_logs.push(entry.clone());
        Ok(())
    }

    async fn list_audit_logs(&self, workspace_id: Uuid) -> StoreResult<Vec<AuditLogRecord>> {
        Ok(self
            .state
            .read()
            .await
            .audit_logs
            .iter()
            .filter(|a| a.workspace_id == Some(workspace_id))
            .cloned()
            .collect())
    }

    async fn delete_audit_logs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut s = self.state.write().await;
        let before = s.audit_logs.len();
        s.audit_logs.retain(|a| a.created_at >= cutoff);
        Ok((before - s.audit_logs.len()) as u64)
    }

    async fn insert_notification(&self, notification: &NotificationRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .notifications
            .push(notification.clone());
        Ok(())
    }

    async fn list_notifications(&self, user_id: Uuid) -> StoreResult<Vec<NotificationRecord>> {
        Ok(self
            .state
            .read()
            .await
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect())
    }

    // ========================================================================
    // Billing Operations
    // ========================================================================

    async fn upsert_plan(&self, plan: &PlanRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        let mut plan = plan.clone();
        if let Some(existing) = s.plans.get(&plan.code) {
            plan.id = existing.id;
            plan.created_at = existing.created_at;
        }
        s.plans.insert(plan.code.clone(), plan);
        Ok(())
    }

    async fn get_plan_by_code(&self, code: &str) -> StoreResult<Option<PlanRecord>> {
        Ok(self.state.read().await.plans.get(code).cloned())
    }

    async fn get_plan(&self, id: Uuid) -> StoreResult<Option<PlanRecord>> {
        Ok(self
            .state
            .read()
            .await
            .plans
            .values()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn list_plans(&self) -> StoreResult<Vec<PlanRecord>> {
        let mut plans: Vec<PlanRecord> = self.state.read().await.plans.values().cloned().collect();
        plans.sort_by(|a, b| a.price_monthly.total_cmp(&b.price_monthly));
        Ok(plans)
    }

    async fn get_active_quota(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QuotaRecord>> {
        Ok(self
            .state
            .read()
            .await
            .quotas
            .values()
            .find(|q| q.workspace_id == workspace_id && q.period_start <= now && now < q.period_end)
            .cloned())
    }

    async fn create_quota(&self, quota: &QuotaRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        if s
            .quotas
            .values()
            .any(|q| q.workspace_id == quota.workspace_id && q.period_start == quota.period_start)
        {
            return Err(StoreError::Conflict("quota period".to_string()));
        }
        s.quotas.insert(quota.id, quota.clone());
        Ok(())
    }

    async fn add_quota_usage(
        &self,
        quota_id: Uuid,
        delta: &BTreeMap<String, f64>,
    ) -> StoreResult<QuotaRecord> {
        let mut s = self.state.write().await;
        let quota = s.quotas.get_mut(&quota_id).ok_or_else(|| not_found("quota"))?;
        quota.usage = merge_usage(&quota.usage, delta);
        quota.updated_at = Utc::now();
        Ok(quota.clone())
    }

    async fn set_quota_status(&self, quota_id: Uuid, status: &str) -> StoreResult<()> {
        let mut s = self.state.write().await;
        let quota = s.quotas.get_mut(&quota_id).ok_or_else(|| not_found("quota"))?;
        quota.status = status.to_string();
        quota.updated_at = Utc::now();
        Ok(())
    }

    async fn list_quotas(&self, workspace_id: Uuid) -> StoreResult<Vec<QuotaRecord>> {
        let mut out: Vec<QuotaRecord> = self
            .state
            .read()
            .await
            .quotas
            .values()
            .filter(|q| q.workspace_id == workspace_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.period_start.cmp(&a.period_start));
        Ok(out)
    }

    async fn insert_usage_event(&self, event: &UsageEventRecord) -> StoreResult<()> {
        self.state.write().await.usage_events.push(event.clone());
        Ok(())
    }

    async fn sum_usage_cost(
        &self,
        workspace_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<f64> {
        Ok(self
            .state
            .read()
            .await
            .usage_events
            .iter()
            .filter(|u| u.workspace_id == workspace_id && u.recorded_at >= from && u.recorded_at < to)
            .map(|u| u.cost)
            .sum())
    }

    async fn list_usage_events(
        &self,
        workspace_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageEventRecord>> {
        Ok(self
            .state
            .read()
            .await
            .usage_events
            .iter()
            .filter(|u| u.workspace_id == workspace_id && u.recorded_at >= from && u.recorded_at < to)
            .cloned()
            .collect())
    }

    async fn upsert_invoice_payment(&self, payment: &InvoicePaymentRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        let key = (payment.workspace_id, payment.invoice_number.clone());
        let mut payment = payment.clone();
        if let Some(existing) = s.payments.get(&key) {
            payment.id = existing.id;
        }
        s.payments.insert(key, payment);
        Ok(())
    }

    async fn get_invoice_payment(
        &self,
        workspace_id: Uuid,
        invoice_number: &str,
    ) -> StoreResult<Option<InvoicePaymentRecord>> {
        Ok(self
            .state
            .read()
            .await
            .payments
            .get(&(workspace_id, invoice_number.to_string()))
            .cloned())
    }

    // ========================================================================
    // Secret & App User Operations
    // ========================================================================

    async fn create_secret(&self, secret: &SecretRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .secrets
            .insert(secret.id, secret.clone());
        Ok(())
    }

    async fn get_secret(&self, id: Uuid) -> StoreResult<Option<SecretRecord>> {
        Ok(self.state.read().await.secrets.get(&id).cloned())
    }

    async fn update_secret(&self, secret: &SecretRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        match s.secrets.get_mut(&secret.id) {
            Some(existing) => {
                *existing = secret.clone();
                Ok(())
            }
            None => Err(not_found("secret")),
        }
    }

    async fn list_active_secrets_by_type(
        &self,
        secret_types: &[String],
    ) -> StoreResult<Vec<SecretRecord>> {
        Ok(self
            .state
            .read()
            .await
            .secrets
            .values()
            .filter(|x| x.status == "active" && secret_types.contains(&x.secret_type))
            .cloned()
            .collect())
    }

    async fn create_app_user(&self, user: &AppUserRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        if s
            .app_users
            .values()
            .any(|u| u.workspace_id == user.workspace_id && u.email == user.email)
        {
            return Err(StoreError::Conflict(format!("app user '{}'", user.email)));
        }
        s.app_users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_app_user(&self, id: Uuid) -> StoreResult<Option<AppUserRecord>> {
        Ok(self.state.read().await.app_users.get(&id).cloned())
    }

    async fn get_app_user_by_email(
        &self,
        workspace_id: Uuid,
        email: &str,
    ) -> StoreResult<Option<AppUserRecord>> {
        Ok(self
            .state
            .read()
            .await
            .app_users
            .values()
            .find(|u| u.workspace_id == workspace_id && u.email == email)
            .cloned())
    }

    async fn update_app_user(&self, user: &AppUserRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        match s.app_users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(not_found("app user")),
        }
    }

    // ========================================================================
    // Tenant Database Operations
    // ========================================================================

    async fn upsert_workspace_database(&self, db: &WorkspaceDatabaseRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .databases
            .insert(db.workspace_id, db.clone());
        Ok(())
    }

    async fn get_workspace_database(
        &self,
        workspace_id: Uuid,
    ) -> StoreResult<Option<WorkspaceDatabaseRecord>> {
        Ok(self.state.read().await.databases.get(&workspace_id).cloned())
    }

    async fn create_db_role(&self, role: &DbRoleRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        if role.status == "active"
            && s.db_roles.values().any(|r| {
                r.workspace_id == role.workspace_id
                    && r.role_type == role.role_type
                    && r.status == "active"
            })
        {
            return Err(StoreError::Conflict(format!(
                "active {} role",
                role.role_type
            )));
        }
        s.db_roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn get_db_role(&self, id: Uuid) -> StoreResult<Option<DbRoleRecord>> {
        Ok(self.state.read().await.db_roles.get(&id).cloned())
    }

    async fn update_db_role(&self, role: &DbRoleRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        match s.db_roles.get_mut(&role.id) {
            Some(existing) => {
                *existing = role.clone();
                Ok(())
            }
            None => Err(not_found("db role")),
        }
    }

    async fn list_db_roles(&self, workspace_id: Uuid) -> StoreResult<Vec<DbRoleRecord>> {
        let mut out: Vec<DbRoleRecord> = self
            .state
            .read()
            .await
            .db_roles
            .values()
            .filter(|r| r.workspace_id == workspace_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn create_schema_migration(&self, migration: &SchemaMigrationRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .migrations
            .insert(migration.id, migration.clone());
        Ok(())
    }

    async fn get_schema_migration(&self, id: Uuid) -> StoreResult<Option<SchemaMigrationRecord>> {
        Ok(self.state.read().await.migrations.get(&id).cloned())
    }

    async fn update_schema_migration(&self, migration: &SchemaMigrationRecord) -> StoreResult<()> {
        #[cfg(test)]
        if self.migration_update_faulted() {
            return Err(StoreError::Transient("injected migration write failure".into()));
        }
        let mut s = self.state.write().await;
        match s.migrations.get_mut(&migration.id) {
            Some(existing) => {
                *existing = migration.clone();
                Ok(())
            }
            None => Err(not_found("schema migration")),
        }
    }

    async fn delete_schema_migration(&self, id: Uuid) -> StoreResult<()> {
        self.state.write().await.migrations.remove(&id);
        Ok(())
    }

    async fn get_active_schema_migration(
        &self,
        workspace_id: Uuid,
    ) -> StoreResult<Option<SchemaMigrationRecord>> {
        Ok(self
            .state
            .read()
            .await
            .migrations
            .values()
            .filter(|m| {
                m.workspace_id == workspace_id
                    && !TERMINAL_MIGRATION_STATES.contains(&m.status.as_str())
            })
            .max_by_key(|m| m.created_at)
            .cloned())
    }

    async fn create_review_item(&self, item: &ReviewItemRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .review_items
            .insert(item.id, item.clone());
        Ok(())
    }

    async fn get_review_item(&self, id: Uuid) -> StoreResult<Option<ReviewItemRecord>> {
        Ok(self.state.read().await.review_items.get(&id).cloned())
    }

    async fn update_review_item(&self, item: &ReviewItemRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        match s.review_items.get_mut(&item.id) {
            Some(existing) => {
                *existing = item.clone();
                Ok(())
            }
            None => Err(not_found("review item")),
        }
    }

    async fn upsert_reviewer(&self, reviewer: &ReviewerRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .reviewers
            .insert(reviewer.user_id, reviewer.clone());
        Ok(())
    }

    async fn get_reviewer(&self, user_id: Uuid) -> StoreResult<Option<ReviewerRecord>> {
        Ok(self.state.read().await.reviewers.get(&user_id).cloned())
    }

    // ========================================================================
    // Webhook Operations
    // ========================================================================

    async fn create_webhook_endpoint(&self, endpoint: &WebhookEndpointRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .endpoints
            .insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn get_webhook_endpoint(&self, id: Uuid) -> StoreResult<Option<WebhookEndpointRecord>> {
        Ok(self.state.read().await.endpoints.get(&id).cloned())
    }

    async fn update_webhook_endpoint(&self, endpoint: &WebhookEndpointRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        match s.endpoints.get_mut(&endpoint.id) {
            Some(existing) => {
                *existing = endpoint.clone();
                Ok(())
            }
            None => Err(not_found("webhook endpoint")),
        }
    }

    async fn list_webhook_endpoints(
        &self,
        workspace_id: Uuid,
    ) -> StoreResult<Vec<WebhookEndpointRecord>> {
        let mut out: Vec<WebhookEndpointRecord> = self
            .state
            .read()
            .await
            .endpoints
            .values()
            .filter(|e| e.workspace_id == workspace_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }

    async fn create_webhook_delivery(&self, delivery: &WebhookDeliveryRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .deliveries
            .insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn get_webhook_delivery(&self, id: Uuid) -> StoreResult<Option<WebhookDeliveryRecord>> {
        Ok(self.state.read().await.deliveries.get(&id).cloned())
    }

    async fn update_webhook_delivery(&self, delivery: &WebhookDeliveryRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        match s.deliveries.get_mut(&delivery.id) {
            Some(existing) => {
                *existing = delivery.clone();
                Ok(())
            }
            None => Err(not_found("webhook delivery")),
        }
    }

    async fn list_webhook_deliveries(
        &self,
        endpoint_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<WebhookDeliveryRecord>> {
        let mut out: Vec<WebhookDeliveryRecord> = self
            .state
            .read()
            .await
            .deliveries
            .values()
            .filter(|d| d.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    // ========================================================================
    // Execution Operations
    // ========================================================================

    async fn create_execution(&self, execution: &ExecutionRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .executions
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<ExecutionRecord>> {
        Ok(self.state.read().await.executions.get(&id).cloned())
    }

    async fn update_execution(&self, execution: &ExecutionRecord) -> StoreResult<()> {
        let mut s = self.state.write().await;
        match s.executions.get_mut(&execution.id) {
            Some(existing) => {
                *existing = execution.clone();
                Ok(())
            }
            None => Err(not_found("execution")),
        }
    }

    async fn insert_node_logs(&self, logs: &[NodeLogRecord]) -> StoreResult<()> {
        self.state.write().await.node_logs.extend_from_slice(logs);
        Ok(())
    }

    async fn list_node_logs(&self, execution_id: Uuid) -> StoreResult<Vec<NodeLogRecord>> {
        let mut out: Vec<NodeLogRecord> = self
            .state
            .read()
            .await
            .node_logs
            .iter()
            .filter(|l| l.execution_id == execution_id)
            .cloned()
            .collect();
        out.sort_by_key(|l| l.started_at);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workspace(slug: &str) -> WorkspaceRecord {
        let now = Utc::now();
        WorkspaceRecord {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: slug.to_string(),
            description: None,
            owner_user_id: Uuid::new_v4(),
            app_status: "published".into(),
            access_mode: "public_anonymous".into(),
            data_classification: "public".into(),
            rate_limit: json!({}),
            require_captcha: false,
            allowed_origins: vec![],
            current_version_id: None,
            plan_code: "free".into(),
            settings: json!({}),
            deleted_at: None,
            purge_after: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_slug_uniqueness() {
        let store = MemoryPersistence::new();
        store.create_workspace(&workspace("demo")).await.unwrap();
        let err = store.create_workspace(&workspace("demo")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_one_active_db_role_per_type() {
        let store = MemoryPersistence::new();
        let ws = Uuid::new_v4();
        let role = |status: &str| DbRoleRecord {
            id: Uuid::new_v4(),
            workspace_id: ws,
            role_type: "read".into(),
            db_user: "wsr_00000000_r".into(),
            secret_ref: "enc:x".into(),
            status: status.into(),
            expires_at: None,
            last_rotated_at: None,
            revoked_at: None,
            revoked_reason: None,
            created_at: Utc::now(),
        };
        store.create_db_role(&role("active")).await.unwrap();
        store.create_db_role(&role("revoked")).await.unwrap();
        assert!(matches!(
            store.create_db_role(&role("active")).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_cascades() {
        let store = MemoryPersistence::new();
        let ws = workspace("gone");
        store.create_workspace(&ws).await.unwrap();
        store
            .create_session(&SessionRecord {
                id: Uuid::new_v4(),
                workspace_id: ws.id,
                session_type: "anon".into(),
                user_id: None,
                ip_hash: None,
                user_agent_hash: None,
                token_hash: None,
                expired_at: Utc::now(),
                blocked_at: None,
                blocked_reason: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        store.purge_workspace(ws.id).await.unwrap();
        assert!(store.get_workspace(ws.id).await.unwrap().is_none());
        assert_eq!(
            store
                .delete_anonymous_sessions_before(Utc::now() + chrono::Duration::days(1))
                .await
                .unwrap(),
            0
        );
    }
}
