// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Billing controller.
//!
//! Plans, monthly quotas, usage metering, budgets and invoices. Usage is
//! merged into the quota and a usage event is written for every accepted
//! usage map, including ones the quota or spend cap denies, so quota usage
//! and summed event cost always agree.

pub mod budget;
pub mod invoice;
pub mod plans;

pub use budget::{BudgetSettings, BudgetSettingsUpdate, BudgetStatus};
pub use invoice::{Invoice, InvoiceSettings, InvoiceSettingsUpdate, PaymentSync};
pub use plans::{DIMENSIONS, Dimension, default_plans};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::RuntimeCache;
use crate::error::{CoreError, Result};
use crate::events::{EventRecorder, RuntimeEvent, Severity, types};
use crate::persistence::{
    InvoicePaymentRecord, Persistence, PlanRecord, QuotaRecord, StoreError, UsageEventRecord,
    WorkspaceRecord,
};
use plans::{DEFAULT_CURRENCY, FALLBACK_PLAN, float_map, overage, round_currency};

/// Quota status values.
pub mod quota_status {
    /// Usage within every limit.
    pub const ACTIVE: &str = "active";
    /// At least one dimension over its limit.
    pub const EXCEEDED: &str = "exceeded";
}

/// Plan status that may be assigned.
pub const PLAN_ACTIVE: &str = "active";

/// First instant of the UTC month containing `now`, and of the next month.
pub fn month_bounds(now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (year, month) = (now.year(), now.month());
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single();
    let end = Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0).single();
    match (start, end) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => Err(CoreError::Internal(format!("no month boundary for {now}"))),
    }
}

// ============================================================================
// Results
// ============================================================================

/// Result of [`BillingService::consume_usage`].
#[derive(Debug, Clone, Serialize)]
pub struct UsageOutcome {
    /// Quota after the usage was merged.
    pub quota: QuotaRecord,
    /// Plan code the usage was priced with.
    pub plan_code: String,
    /// Whether the call may proceed.
    pub allowed: bool,
    /// Dimensions over their limit.
    pub exceeded: Vec<String>,
    /// Cost of this usage delta.
    pub cost: f64,
    pub currency: String,
    pub budget: BudgetStatus,
}

/// One dimension of a quota summary.
#[derive(Debug, Clone, Serialize)]
pub struct DimensionUsage {
    pub key: &'static str,
    pub name: &'static str,
    pub unit: &'static str,
    pub category: &'static str,
    /// `-1` is unlimited.
    pub limit: f64,
    pub used: f64,
    /// `None` when unlimited.
    pub remaining: Option<f64>,
    /// Share of the limit used, 0 when unlimited.
    pub percent: f64,
}

/// Current period view of a workspace's quota.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaSummary {
    pub quota_id: Uuid,
    pub plan_code: String,
    pub plan_name: String,
    pub status: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub dimensions: Vec<DimensionUsage>,
    pub cost_by_category: BTreeMap<&'static str, f64>,
    pub usage_cost: f64,
    pub currency: String,
}

/// Priced usage map.
#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub plan_code: String,
    pub total: f64,
    pub currency: String,
    pub by_category: BTreeMap<&'static str, f64>,
}

// ============================================================================
// Service
// ============================================================================

/// Billing service over the persistence port.
pub struct BillingService {
    persistence: Arc<dyn Persistence>,
    recorder: Arc<EventRecorder>,
    cache: Option<Arc<RuntimeCache>>,
}

impl BillingService {
    /// Creates the service.
    pub fn new(persistence: Arc<dyn Persistence>, recorder: Arc<EventRecorder>) -> Self {
        Self {
            persistence,
            recorder,
            cache: None,
        }
    }

    /// Invalidates cached workspaces when billing settings change.
    pub fn with_cache(mut self, cache: Arc<RuntimeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    // ------------------------------------------------------------------------
    // Plans
    // ------------------------------------------------------------------------

    /// Creates missing default plans and reactivates disabled ones.
    pub async fn ensure_default_plans(&self) -> Result<()> {
        let now = Utc::now();
        for seed in default_plans() {
            let existing = self.persistence.get_plan_by_code(seed.code).await?;
            let record = match existing {
                Some(plan) if plan.status == PLAN_ACTIVE => continue,
                Some(mut plan) => {
                    info!(plan = seed.code, "Reactivating billing plan");
                    plan.status = PLAN_ACTIVE.to_string();
                    plan.updated_at = now;
                    plan
                }
                None => {
                    info!(plan = seed.code, "Seeding billing plan");
                    PlanRecord {
                        id: Uuid::new_v4(),
                        code: seed.code.to_string(),
                        name: seed.name.to_string(),
                        price_monthly: seed.price_monthly,
                        price_yearly: seed.price_yearly,
                        currency: DEFAULT_CURRENCY.to_string(),
                        quota_limits: seed.limits_value(),
                        rate_rules: seed.rates_value(),
                        policy: seed.policy_value(),
                        status: PLAN_ACTIVE.to_string(),
                        created_at: now,
                        updated_at: now,
                    }
                }
            };
            self.persistence.upsert_plan(&record).await?;
        }
        Ok(())
    }

    /// Active plans.
    pub async fn list_plans(&self) -> Result<Vec<PlanRecord>> {
        self.ensure_default_plans().await?;
        let mut plans: Vec<_> = self
            .persistence
            .list_plans()
            .await?
            .into_iter()
            .filter(|p| p.status == PLAN_ACTIVE)
            .collect();
        plans.sort_by(|a, b| a.price_monthly.total_cmp(&b.price_monthly));
        Ok(plans)
    }

    /// Plan for a code. Empty, unknown or inactive codes fall back to `free`.
    pub async fn plan_for(&self, code: &str) -> Result<PlanRecord> {
        let code = match code.trim() {
            "" => FALLBACK_PLAN,
            c => c,
        };
        if let Some(plan) = self.active_plan(code).await? {
            return Ok(plan);
        }
        self.ensure_default_plans().await?;
        if let Some(plan) = self.active_plan(code).await? {
            return Ok(plan);
        }
        if code != FALLBACK_PLAN {
            debug!(plan = code, "Unknown plan, using fallback");
        }
        self.active_plan(FALLBACK_PLAN)
            .await?
            .ok_or_else(|| CoreError::BillingFailed("fallback plan missing".into()))
    }

    async fn active_plan(&self, code: &str) -> Result<Option<PlanRecord>> {
        Ok(self
            .persistence
            .get_plan_by_code(code)
            .await?
            .filter(|p| p.status == PLAN_ACTIVE))
    }

    async fn plan_of_quota(&self, quota: &QuotaRecord, workspace: &WorkspaceRecord) -> Result<PlanRecord> {
        match self.persistence.get_plan(quota.plan_id).await? {
            Some(plan) => Ok(plan),
            None => self.plan_for(&workspace.plan_code).await,
        }
    }

    // ------------------------------------------------------------------------
    // Quotas
    // ------------------------------------------------------------------------

    /// Quota covering `now`, created from the workspace's plan if missing.
    pub async fn ensure_active_quota(
        &self,
        workspace: &WorkspaceRecord,
        now: DateTime<Utc>,
    ) -> Result<QuotaRecord> {
        if let Some(quota) = self.persistence.get_active_quota(workspace.id, now).await? {
            return Ok(quota);
        }
        let plan = self.plan_for(&workspace.plan_code).await?;
        let (period_start, period_end) = month_bounds(now)?;
        let limits = plan.quota_limits.clone();
        let usage: serde_json::Map<String, Value> = float_map(&limits)
            .into_keys()
            .map(|k| (k, json!(0.0)))
            .collect();
        let quota = QuotaRecord {
            id: Uuid::new_v4(),
            workspace_id: workspace.id,
            plan_id: plan.id,
            period_start,
            period_end,
            limits,
            usage: Value::Object(usage),
            status: quota_status::ACTIVE.to_string(),
            created_at: now,
            updated_at: now,
        };
        match self.persistence.create_quota(&quota).await {
            Ok(()) => {
                info!(
                    workspace_id = %workspace.id,
                    plan = %plan.code,
                    period_start = %period_start,
                    "Opened quota period"
                );
                Ok(quota)
            }
            // Another consumer opened the period first.
            Err(StoreError::Conflict(_)) => self
                .persistence
                .get_active_quota(workspace.id, now)
                .await?
                .ok_or_else(|| CoreError::BillingFailed("quota period conflict".into())),
            Err(e) => Err(e.into()),
        }
    }

    /// Meters a usage map against the workspace's quota and budget.
    ///
    /// Usage is recorded whether or not it is allowed. A denied call is
    /// reported through [`UsageOutcome::allowed`]; callers turn it into
    /// `QuotaExceeded`.
    pub async fn consume_usage(
        &self,
        workspace: &WorkspaceRecord,
        usage: &BTreeMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Result<UsageOutcome> {
        plans::validate_usage(usage)?;

        let quota = self.ensure_active_quota(workspace, now).await?;
        let plan = self.plan_of_quota(&quota, workspace).await?;
        let previous_status = quota.status.clone();

        let mut quota = self.persistence.add_quota_usage(quota.id, usage).await?;
        let limits = float_map(&quota.limits);
        let exceeded = plans::exceeded_dimensions(&float_map(&quota.usage), &limits);
        let status = if exceeded.is_empty() {
            quota_status::ACTIVE
        } else {
            quota_status::EXCEEDED
        };
        if quota.status != status {
            self.persistence.set_quota_status(quota.id, status).await?;
            quota.status = status.to_string();
        }

        let rates = float_map(&plan.rate_rules);
        let cost = round_currency(plans::compute_cost(usage, &rates));
        let currency = if plan.currency.is_empty() {
            DEFAULT_CURRENCY.to_string()
        } else {
            plan.currency.clone()
        };

        let spent_before = self
            .persistence
            .sum_usage_cost(workspace.id, quota.period_start, quota.period_end)
            .await?;
        let budget = BudgetSettings::from_settings(&workspace.settings).evaluate(spent_before, cost);

        let over_quota_allowed =
            exceeded.is_empty() || plans::overage_policy(&plan.policy) == overage::ALLOW;
        let allowed = over_quota_allowed && !budget.spend_cap_exceeded;

        self.persistence
            .insert_usage_event(&UsageEventRecord {
                id: Uuid::new_v4(),
                workspace_id: workspace.id,
                quota_id: Some(quota.id),
                usage: json!(usage),
                cost,
                currency: currency.clone(),
                allowed,
                recorded_at: now,
            })
            .await?;

        debug!(
            workspace_id = %workspace.id,
            cost,
            allowed,
            exceeded = ?exceeded,
            "Usage recorded"
        );
        self.emit_usage_events(
            workspace.id,
            usage,
            &quota,
            &previous_status,
            &exceeded,
            cost,
            allowed,
            &budget,
        );

        Ok(UsageOutcome {
            quota,
            plan_code: plan.code,
            allowed,
            exceeded,
            cost,
            currency,
            budget,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_usage_events(
        &self,
        workspace_id: Uuid,
        usage: &BTreeMap<String, f64>,
        quota: &QuotaRecord,
        previous_status: &str,
        exceeded: &[String],
        cost: f64,
        allowed: bool,
        budget: &BudgetStatus,
    ) {
        self.recorder.record_async(
            RuntimeEvent::new(types::USAGE_RECORDED)
                .workspace(workspace_id)
                .meta("usage", json!(usage))
                .meta("cost", cost)
                .meta("allowed", allowed)
                .meta("quota_id", quota.id.to_string()),
        );
        if !exceeded.is_empty() && previous_status != quota_status::EXCEEDED {
            warn!(workspace_id = %workspace_id, exceeded = ?exceeded, "Quota exceeded");
            self.recorder.record_async(
                RuntimeEvent::new(types::QUOTA_EXCEEDED)
                    .workspace(workspace_id)
                    .message("workspace quota exceeded")
                    .meta("exceeded", json!(exceeded))
                    .meta("period_end", quota.period_end.to_rfc3339()),
            );
        }
        for threshold in &budget.triggered_thresholds {
            self.recorder.record_async(
                RuntimeEvent::new(types::BUDGET_THRESHOLD_REACHED)
                    .workspace(workspace_id)
                    .severity(Severity::Warn)
                    .message(format!("budget {:.0}% reached", threshold * 100.0))
                    .meta("threshold", *threshold)
                    .meta("monthly_budget", budget.monthly_budget)
                    .meta("spent", budget.spent_after)
                    .meta("currency", budget.currency.clone()),
            );
        }
        if budget.spend_cap_exceeded {
            self.recorder.record_async(
                RuntimeEvent::new(types::SPEND_LIMIT_EXCEEDED)
                    .workspace(workspace_id)
                    .message("spend limit exceeded")
                    .meta("spent", budget.spent_after)
                    .meta("currency", budget.currency.clone()),
            );
        }
    }

    /// Current period summary for a workspace.
    pub async fn workspace_quota(&self, workspace: &WorkspaceRecord) -> Result<QuotaSummary> {
        let quota = self.ensure_active_quota(workspace, Utc::now()).await?;
        let plan = self.plan_of_quota(&quota, workspace).await?;
        let limits = float_map(&quota.limits);
        let usage = float_map(&quota.usage);
        let rates = float_map(&plan.rate_rules);

        let dimensions = DIMENSIONS
            .iter()
            .map(|d| {
                let limit = limits.get(d.key).copied().unwrap_or(-1.0);
                let used = usage.get(d.key).copied().unwrap_or(0.0);
                let unlimited = limit < 0.0;
                DimensionUsage {
                    key: d.key,
                    name: d.name,
                    unit: d.unit,
                    category: d.category,
                    limit,
                    used,
                    remaining: (!unlimited).then(|| (limit - used).max(0.0)),
                    percent: if unlimited || limit == 0.0 {
                        0.0
                    } else {
                        round_currency(used / limit * 100.0)
                    },
                }
            })
            .collect();

        Ok(QuotaSummary {
            quota_id: quota.id,
            plan_code: plan.code,
            plan_name: plan.name,
            status: quota.status,
            period_start: quota.period_start,
            period_end: quota.period_end,
            dimensions,
            cost_by_category: plans::cost_by_category(&usage, &rates),
            usage_cost: round_currency(plans::compute_cost(&usage, &rates)),
            currency: plan.currency,
        })
    }

    /// Prices a usage map under a plan without recording anything.
    pub async fn estimate_cost(
        &self,
        plan_code: &str,
        usage: &BTreeMap<String, f64>,
    ) -> Result<CostEstimate> {
        plans::validate_usage(usage)?;
        let plan = self.plan_for(plan_code).await?;
        let rates = float_map(&plan.rate_rules);
        Ok(CostEstimate {
            plan_code: plan.code,
            total: round_currency(plans::compute_cost(usage, &rates)),
            currency: plan.currency,
            by_category: plans::cost_by_category(usage, &rates),
        })
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    /// Budget stored on the workspace.
    pub async fn budget(&self, workspace_id: Uuid) -> Result<BudgetSettings> {
        let ws = self.load_workspace(workspace_id).await?;
        Ok(BudgetSettings::from_settings(&ws.settings))
    }

    /// Validates and stores a budget update.
    pub async fn update_budget(
        &self,
        workspace_id: Uuid,
        update: BudgetSettingsUpdate,
    ) -> Result<BudgetSettings> {
        let mut ws = self.load_workspace(workspace_id).await?;
        let budget = BudgetSettings::from_settings(&ws.settings).merge(update)?;
        budget.apply_to(&mut ws.settings);
        self.save_workspace(ws).await?;
        Ok(budget)
    }

    /// Invoice adjustments stored on the workspace.
    pub async fn invoice_settings(&self, workspace_id: Uuid) -> Result<InvoiceSettings> {
        let ws = self.load_workspace(workspace_id).await?;
        Ok(InvoiceSettings::from_settings(&ws.settings))
    }

    /// Stores invoice adjustments, clamping out-of-range values.
    pub async fn update_invoice_settings(
        &self,
        workspace_id: Uuid,
        update: InvoiceSettingsUpdate,
    ) -> Result<InvoiceSettings> {
        let mut ws = self.load_workspace(workspace_id).await?;
        let settings = InvoiceSettings::from_settings(&ws.settings).merge(update);
        settings.apply_to(&mut ws.settings);
        self.save_workspace(ws).await?;
        Ok(settings)
    }

    async fn load_workspace(&self, workspace_id: Uuid) -> Result<WorkspaceRecord> {
        self.persistence
            .get_workspace(workspace_id)
            .await?
            .filter(|ws| ws.deleted_at.is_none())
            .ok_or(CoreError::WorkspaceNotFound)
    }

    async fn save_workspace(&self, mut ws: WorkspaceRecord) -> Result<()> {
        ws.updated_at = Utc::now();
        self.persistence.update_workspace(&ws).await?;
        if let Some(cache) = &self.cache {
            cache.invalidate_workspace(&ws);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Invoices
    // ------------------------------------------------------------------------

    /// Most recent invoices, newest first.
    pub async fn list_invoices(&self, workspace_id: Uuid, limit: Option<usize>) -> Result<Vec<Invoice>> {
        let ws = self.load_workspace(workspace_id).await?;
        let quotas = self.persistence.list_quotas(workspace_id).await?;
        let mut out = Vec::new();
        for quota in quotas.into_iter().take(invoice::effective_limit(limit)) {
            out.push(self.build_invoice(&ws, &quota, Utc::now()).await?);
        }
        Ok(out)
    }

    /// Invoice for the period containing `now`.
    pub async fn preview_invoice(&self, workspace_id: Uuid, now: DateTime<Utc>) -> Result<Invoice> {
        let ws = self.load_workspace(workspace_id).await?;
        let quota = self.ensure_active_quota(&ws, now).await?;
        self.build_invoice(&ws, &quota, now).await
    }

    /// Invoice built from one quota period.
    pub async fn invoice_detail(&self, workspace_id: Uuid, quota_id: Uuid) -> Result<Invoice> {
        let ws = self.load_workspace(workspace_id).await?;
        let quota = self
            .persistence
            .list_quotas(workspace_id)
            .await?
            .into_iter()
            .find(|q| q.id == quota_id)
            .ok_or_else(|| CoreError::NotFound("invoice".into()))?;
        self.build_invoice(&ws, &quota, Utc::now()).await
    }

    /// Records a payment state reported for an invoice.
    pub async fn sync_invoice_payment(&self, workspace_id: Uuid, sync: PaymentSync) -> Result<Invoice> {
        let status = invoice::normalize_payment_status(&sync.status)?;
        let ws = self.load_workspace(workspace_id).await?;
        let quota = self
            .persistence
            .list_quotas(workspace_id)
            .await?
            .into_iter()
            .find(|q| invoice::invoice_number(workspace_id, q.period_start) == sync.invoice_number)
            .ok_or_else(|| CoreError::NotFound("invoice".into()))?;

        let now = Utc::now();
        let current = self.build_invoice(&ws, &quota, now).await?;
        let paid_at = match (status, sync.paid_at) {
            (invoice::invoice_status::PAID, None) => Some(now),
            (_, at) => at,
        };
        let payment = InvoicePaymentRecord {
            id: Uuid::new_v4(),
            workspace_id,
            invoice_number: current.invoice_number.clone(),
            period_start: quota.period_start,
            period_end: quota.period_end,
            status: status.to_string(),
            amount: sync.amount.unwrap_or(current.totals.total),
            currency: sync.currency.unwrap_or_else(|| current.currency.clone()),
            provider: sync.provider,
            reference: sync.reference,
            paid_at,
            updated_at: now,
        };
        self.persistence.upsert_invoice_payment(&payment).await?;
        info!(
            workspace_id = %workspace_id,
            invoice = %payment.invoice_number,
            status,
            "Invoice payment synced"
        );
        if status == invoice::invoice_status::PAID {
            self.recorder.record_async(
                RuntimeEvent::new(types::INVOICE_PAID)
                    .workspace(workspace_id)
                    .meta("invoice_number", payment.invoice_number.clone())
                    .meta("amount", payment.amount),
            );
        }
        self.build_invoice(&ws, &quota, now).await
    }

    async fn build_invoice(
        &self,
        ws: &WorkspaceRecord,
        quota: &QuotaRecord,
        now: DateTime<Utc>,
    ) -> Result<Invoice> {
        let plan = self.plan_of_quota(quota, ws).await?;
        let usage_cost = self
            .persistence
            .sum_usage_cost(ws.id, quota.period_start, quota.period_end)
            .await?;
        let settings = InvoiceSettings::from_settings(&ws.settings);
        let totals = invoice::compute_totals(plan.price_monthly, usage_cost, &settings);
        let number = invoice::invoice_number(ws.id, quota.period_start);
        let payment = self.persistence.get_invoice_payment(ws.id, &number).await?;

        let (status, paid_at, provider, reference) = match payment {
            Some(p) => (p.status, p.paid_at, p.provider, p.reference),
            // Closed periods without a payment record settle automatically.
            None if quota.period_end <= now => (
                invoice::invoice_status::PAID.to_string(),
                Some(quota.period_end),
                None,
                None,
            ),
            None => (invoice::invoice_status::PENDING.to_string(), None, None, None),
        };

        Ok(Invoice {
            id: quota.id,
            invoice_number: number,
            workspace_id: ws.id,
            description: invoice::invoice_description(&plan.name, quota.period_start),
            line_items: invoice::line_items(&plan.name, &totals),
            plan_code: plan.code,
            plan_name: plan.name,
            currency: plan.currency,
            period_start: quota.period_start,
            period_end: quota.period_end,
            totals,
            status,
            paid_at,
            payment_provider: provider,
            payment_reference: reference,
            usage: quota.usage.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::runtime::test_support::published_workspace;

    async fn setup(plan: &str) -> (Arc<MemoryPersistence>, BillingService, WorkspaceRecord) {
        let store = Arc::new(MemoryPersistence::new());
        let recorder = Arc::new(EventRecorder::new(store.clone(), false));
        let service = BillingService::new(store.clone(), recorder);
        let mut ws = published_workspace("billing-demo");
        ws.plan_code = plan.into();
        store.create_workspace(&ws).await.unwrap();
        (store, service, ws)
    }

    fn usage(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[test]
    fn test_month_bounds() {
        let now = Utc.with_ymd_and_hms(2025, 12, 17, 8, 30, 0).unwrap();
        let (start, end) = month_bounds(now).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_unknown_plan_falls_back_to_free() {
        let (_, service, _) = setup("free").await;
        assert_eq!(service.plan_for("").await.unwrap().code, "free");
        assert_eq!(service.plan_for("platinum").await.unwrap().code, "free");
        assert_eq!(service.plan_for("pro").await.unwrap().price_monthly, 99.0);
        assert_eq!(service.list_plans().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_free_plan_blocks_over_limit_but_records_usage() {
        let (store, service, ws) = setup("free").await;
        let now = Utc::now();

        let first = service
            .consume_usage(&ws, &usage(&[("requests", 9999.0)]), now)
            .await
            .unwrap();
        assert!(first.allowed);
        assert_eq!(first.quota.status, quota_status::ACTIVE);

        let second = service
            .consume_usage(&ws, &usage(&[("requests", 2.0)]), now)
            .await
            .unwrap();
        assert!(!second.allowed);
        assert_eq!(second.exceeded, vec!["requests".to_string()]);
        assert_eq!(second.quota.usage["requests"], json!(10001.0));

        let stored = store.get_active_quota(ws.id, now).await.unwrap().unwrap();
        assert_eq!(stored.status, quota_status::EXCEEDED);
        let events = store
            .list_usage_events(ws.id, stored.period_start, stored.period_end)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| !e.allowed));
    }

    #[tokio::test]
    async fn test_paid_plan_allows_overage_and_prices_it() {
        let (_, service, ws) = setup("pro").await;
        let outcome = service
            .consume_usage(&ws, &usage(&[("requests", 200_001.0), ("egress_gb", 1.5)]), Utc::now())
            .await
            .unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.exceeded, vec!["requests".to_string()]);
        assert_eq!(outcome.cost, 40.3);
        assert_eq!(outcome.currency, "CNY");
    }

    #[tokio::test]
    async fn test_invalid_usage_is_rejected_before_quota() {
        let (store, service, ws) = setup("free").await;
        let err = service
            .consume_usage(&ws, &usage(&[("gpu_hours", 1.0)]), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_USAGE");
        assert!(store.list_quotas(ws.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spend_cap_denies() {
        let (_, service, ws) = setup("pro").await;
        service
            .update_budget(
                ws.id,
                BudgetSettingsUpdate {
                    monthly_budget: Some(10.0),
                    spend_limit: Some(1.0),
                    spend_limit_enabled: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let ws = service.load_workspace(ws.id).await.unwrap();
        let outcome = service
            .consume_usage(&ws, &usage(&[("egress_gb", 10.0)]), Utc::now())
            .await
            .unwrap();
        assert!(outcome.exceeded.is_empty());
        assert!(outcome.budget.spend_cap_exceeded);
        assert_eq!(outcome.budget.triggered_thresholds, Vec::<f64>::new());
        assert!(!outcome.allowed);
    }

    #[tokio::test]
    async fn test_invoice_preview_and_payment_sync() {
        let (_, service, ws) = setup("pro").await;
        service
            .update_invoice_settings(
                ws.id,
                InvoiceSettingsUpdate {
                    tax_rate: Some(0.06),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let now = Utc::now();
        service
            .consume_usage(&ws, &usage(&[("egress_gb", 5.0)]), now)
            .await
            .unwrap();

        let preview = service.preview_invoice(ws.id, now).await.unwrap();
        assert_eq!(preview.totals.subtotal, 100.0);
        assert_eq!(preview.totals.tax, 6.0);
        assert_eq!(preview.totals.total, 106.0);
        assert_eq!(preview.status, "pending");
        assert!(preview.invoice_number.starts_with("INV-"));

        let paid = service
            .sync_invoice_payment(
                ws.id,
                PaymentSync {
                    invoice_number: preview.invoice_number.clone(),
                    status: "Paid".into(),
                    amount: None,
                    currency: None,
                    provider: Some("alipay".into()),
                    reference: Some("TX-1".into()),
                    paid_at: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(paid.status, "paid");
        assert!(paid.paid_at.is_some());
        assert_eq!(paid.payment_provider.as_deref(), Some("alipay"));

        let listed = service.list_invoices(ws.id, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(service.invoice_detail(ws.id, preview.id).await.unwrap().status, "paid");

        let missing = service
            .sync_invoice_payment(
                ws.id,
                PaymentSync {
                    invoice_number: "INV-000000-FFFFFF".into(),
                    status: "paid".into(),
                    amount: None,
                    currency: None,
                    provider: None,
                    reference: None,
                    paid_at: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(missing, CoreError::NotFound("invoice".into()));
    }

    #[tokio::test]
    async fn test_closed_period_without_payment_is_paid() {
        let (_, service, ws) = setup("free").await;
        let last_month = Utc::now() - Duration::days(40);
        let quota = service.ensure_active_quota(&ws, last_month).await.unwrap();
        let invoice = service.invoice_detail(ws.id, quota.id).await.unwrap();
        assert_eq!(invoice.status, "paid");
        assert_eq!(invoice.paid_at, Some(quota.period_end));
    }
}
