// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monthly budget alerts and the spend cap.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::plans::{DEFAULT_CURRENCY, round_currency};
use crate::error::{CoreError, Result};

/// Workspace settings key holding the budget.
pub const BUDGET_SETTINGS_KEY: &str = "billing_budget";

/// Alert thresholds used when none are configured.
pub const DEFAULT_THRESHOLDS: [f64; 2] = [0.8, 1.0];

/// Per-workspace budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSettings {
    /// Monthly budget; `0` disables alerts.
    pub monthly_budget: f64,
    /// Budget currency.
    pub currency: String,
    /// Alert fractions in (0, 1], sorted and deduplicated.
    pub thresholds: Vec<f64>,
    /// Hard cap on monthly spend.
    pub spend_limit: f64,
    /// Whether the cap denies calls.
    pub spend_limit_enabled: bool,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            monthly_budget: 0.0,
            currency: DEFAULT_CURRENCY.to_string(),
            thresholds: DEFAULT_THRESHOLDS.to_vec(),
            spend_limit: 0.0,
            spend_limit_enabled: false,
        }
    }
}

/// Partial update; `None` keeps the current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BudgetSettingsUpdate {
    pub monthly_budget: Option<f64>,
    pub currency: Option<String>,
    pub thresholds: Option<Vec<f64>>,
    pub spend_limit: Option<f64>,
    pub spend_limit_enabled: Option<bool>,
}

/// Keeps thresholds in (0, 1], sorted, without duplicates.
pub fn normalize_thresholds(raw: &[f64]) -> Vec<f64> {
    let mut out: Vec<f64> = raw
        .iter()
        .copied()
        .filter(|t| t.is_finite() && *t > 0.0 && *t <= 1.0)
        .collect();
    out.sort_by(f64::total_cmp);
    out.dedup();
    out
}

impl BudgetSettings {
    /// Reads the budget from a workspace settings object.
    pub fn from_settings(settings: &Value) -> Self {
        let mut budget = Self::default();
        let Some(raw) = settings.get(BUDGET_SETTINGS_KEY).filter(|v| v.is_object()) else {
            return budget;
        };
        if let Some(v) = raw.get("monthly_budget").and_then(Value::as_f64) {
            budget.monthly_budget = v.max(0.0);
        }
        if let Some(c) = raw.get("currency").and_then(Value::as_str).filter(|c| !c.trim().is_empty()) {
            budget.currency = c.trim().to_uppercase();
        }
        if let Some(list) = raw.get("thresholds").and_then(Value::as_array) {
            let parsed: Vec<f64> = list.iter().filter_map(Value::as_f64).collect();
            let normalized = normalize_thresholds(&parsed);
            if !normalized.is_empty() {
                budget.thresholds = normalized;
            }
        }
        if let Some(v) = raw.get("spend_limit").and_then(Value::as_f64) {
            budget.spend_limit = v.max(0.0);
        }
        if let Some(v) = raw.get("spend_limit_enabled").and_then(Value::as_bool) {
            budget.spend_limit_enabled = v;
        }
        budget
    }

    /// Applies an update, validating it.
    pub fn merge(mut self, update: BudgetSettingsUpdate) -> Result<Self> {
        let invalid = |m: &str| CoreError::Validation {
            field: "budget".into(),
            message: m.into(),
        };
        if let Some(v) = update.monthly_budget {
            if !v.is_finite() || v < 0.0 {
                return Err(invalid("monthly_budget must be >= 0"));
            }
            self.monthly_budget = v;
        }
        if let Some(c) = update.currency.filter(|c| !c.trim().is_empty()) {
            self.currency = c.trim().to_uppercase();
        }
        if let Some(list) = update.thresholds {
            let normalized = normalize_thresholds(&list);
            if normalized.is_empty() {
                return Err(invalid("thresholds must lie in (0, 1]"));
            }
            self.thresholds = normalized;
        }
        if let Some(v) = update.spend_limit {
            if !v.is_finite() || v < 0.0 {
                return Err(invalid("spend_limit must be >= 0"));
            }
            self.spend_limit = v;
        }
        if let Some(v) = update.spend_limit_enabled {
            self.spend_limit_enabled = v;
        }
        Ok(self)
    }

    /// Writes the budget into a workspace settings object.
    pub fn apply_to(&self, settings: &mut Value) {
        if !settings.is_object() {
            *settings = json!({});
        }
        if let Some(obj) = settings.as_object_mut() {
            obj.insert(
                BUDGET_SETTINGS_KEY.into(),
                serde_json::to_value(self).unwrap_or(Value::Null),
            );
        }
    }

    /// Evaluates a spend delta against the budget.
    pub fn evaluate(&self, cumulative_before: f64, delta: f64) -> BudgetStatus {
        let before = round_currency(cumulative_before);
        let after = round_currency(cumulative_before + delta);
        let mut triggered = Vec::new();
        let mut exceeded = false;
        if self.monthly_budget > 0.0 {
            for t in &self.thresholds {
                let mark = t * self.monthly_budget;
                if before < mark && mark <= after {
                    triggered.push(*t);
                }
            }
            exceeded = after >= self.monthly_budget;
        }
        BudgetStatus {
            monthly_budget: self.monthly_budget,
            currency: self.currency.clone(),
            spent_before: before,
            spent_after: after,
            triggered_thresholds: triggered,
            exceeded,
            spend_cap_exceeded: self.spend_limit_enabled && after > self.spend_limit,
        }
    }
}

/// Outcome of one budget evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub monthly_budget: f64,
    pub currency: String,
    pub spent_before: f64,
    pub spent_after: f64,
    /// Thresholds crossed by this delta.
    pub triggered_thresholds: Vec<f64>,
    /// Spend reached the budget.
    pub exceeded: bool,
    /// Spend went over the enabled cap.
    pub spend_cap_exceeded: bool,
}
