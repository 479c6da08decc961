// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invoice arithmetic, numbering and settings.
//!
//! An invoice covers one quota period:
//!
//! ```text
//! subtotal = base_fee + Σ usage_event.cost
//! discount = clamp(subtotal × discount_rate + discount_amount, 0, subtotal)
//! tax      = (subtotal − discount) × tax_rate
//! total    = subtotal − discount + tax
//! ```

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use super::plans::round_currency;
use crate::error::{CoreError, Result};

/// Workspace settings key holding invoice adjustments.
pub const INVOICE_SETTINGS_KEY: &str = "billing_invoice_settings";

/// Default number of invoices listed.
pub const DEFAULT_INVOICE_LIMIT: usize = 6;

/// Largest number of invoices listed.
pub const MAX_INVOICE_LIMIT: usize = 24;

/// Invoice and payment statuses.
pub mod invoice_status {
    pub const PENDING: &str = "pending";
    pub const PAID: &str = "paid";
    pub const FAILED: &str = "failed";
    pub const REFUNDED: &str = "refunded";

    /// Every status a payment sync may set.
    pub const ALL: &[&str] = &[PENDING, PAID, FAILED, REFUNDED];
}

/// Normalizes and validates a payment status.
pub fn normalize_payment_status(raw: &str) -> Result<&'static str> {
    let lowered = raw.trim().to_lowercase();
    invoice_status::ALL
        .iter()
        .find(|s| **s == lowered)
        .copied()
        .ok_or_else(|| CoreError::validation("status", format!("unknown payment status '{raw}'")))
}

/// Clamps a list limit to `1..=24`, defaulting to 6.
pub fn effective_limit(limit: Option<usize>) -> usize {
    match limit {
        None | Some(0) => DEFAULT_INVOICE_LIMIT,
        Some(n) => n.min(MAX_INVOICE_LIMIT),
    }
}

/// `INV-YYYYMM-XXXXXX` where the suffix is the first six hex digits of the
/// workspace id.
pub fn invoice_number(workspace_id: Uuid, period_start: DateTime<Utc>) -> String {
    let simple = workspace_id.simple().to_string().to_uppercase();
    format!(
        "INV-{:04}{:02}-{}",
        period_start.year(),
        period_start.month(),
        &simple[..6]
    )
}

/// `{plan}订阅 - YYYY年MM月`.
pub fn invoice_description(plan_name: &str, period_start: DateTime<Utc>) -> String {
    format!(
        "{plan_name}订阅 - {:04}年{:02}月",
        period_start.year(),
        period_start.month()
    )
}

/// Discount and tax rules applied to every invoice of a workspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSettings {
    /// Fraction of the subtotal, in [0, 1].
    pub tax_rate: f64,
    /// Fraction of the subtotal, in [0, 1].
    pub discount_rate: f64,
    /// Fixed discount, ≥ 0.
    pub discount_amount: f64,
}

/// Partial update of [`InvoiceSettings`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceSettingsUpdate {
    pub tax_rate: Option<f64>,
    pub discount_rate: Option<f64>,
    pub discount_amount: Option<f64>,
}

fn clamp_rate(v: f64) -> f64 {
    if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 }
}

fn clamp_amount(v: f64) -> f64 {
    if v.is_finite() { v.max(0.0) } else { 0.0 }
}

impl InvoiceSettings {
    /// Reads settings, clamping out-of-range values.
    pub fn from_settings(settings: &Value) -> Self {
        let raw = settings.get(INVOICE_SETTINGS_KEY);
        let get = |k: &str| raw.and_then(|r| r.get(k)).and_then(Value::as_f64).unwrap_or(0.0);
        Self {
            tax_rate: clamp_rate(get("tax_rate")),
            discount_rate: clamp_rate(get("discount_rate")),
            discount_amount: clamp_amount(get("discount_amount")),
        }
    }

    /// Applies an update; values are clamped rather than rejected.
    pub fn merge(mut self, update: InvoiceSettingsUpdate) -> Self {
        if let Some(v) = update.tax_rate {
            self.tax_rate = clamp_rate(v);
        }
        if let Some(v) = update.discount_rate {
            self.discount_rate = clamp_rate(v);
        }
        if let Some(v) = update.discount_amount {
            self.discount_amount = clamp_amount(v);
        }
        self
    }

    /// Writes the settings into a workspace settings object.
    pub fn apply_to(&self, settings: &mut Value) {
        if !settings.is_object() {
            *settings = json!({});
        }
        if let Some(obj) = settings.as_object_mut() {
            obj.insert(
                INVOICE_SETTINGS_KEY.into(),
                json!({
                    "tax_rate": self.tax_rate,
                    "discount_rate": self.discount_rate,
                    "discount_amount": self.discount_amount,
                }),
            );
        }
    }
}

/// Computed invoice amounts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InvoiceTotals {
    pub base_fee: f64,
    pub usage_cost: f64,
    pub subtotal: f64,
    pub discount: f64,
    pub tax: f64,
    pub total: f64,
}

/// Applies discount and tax to a period's charges.
pub fn compute_totals(base_fee: f64, usage_cost: f64, settings: &InvoiceSettings) -> InvoiceTotals {
    let base_fee = round_currency(base_fee);
    let usage_cost = round_currency(usage_cost);
    let subtotal = round_currency(base_fee + usage_cost);
    let discount = if subtotal <= 0.0 {
        0.0
    } else {
        round_currency(subtotal * settings.discount_rate + settings.discount_amount)
            .clamp(0.0, subtotal)
    };
    let taxable = (subtotal - discount).max(0.0);
    let tax = round_currency(taxable * settings.tax_rate);
    InvoiceTotals {
        base_fee,
        usage_cost,
        subtotal,
        discount,
        tax,
        total: round_currency(taxable + tax),
    }
}

/// One invoice line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceLineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub amount: f64,
}

impl InvoiceLineItem {
    fn single(description: impl Into<String>, amount: f64) -> Self {
        Self {
            description: description.into(),
            quantity: 1.0,
            unit_price: amount,
            amount,
        }
    }
}

/// Subscription and usage lines, plus discount and tax lines when non-zero.
pub fn line_items(plan_name: &str, totals: &InvoiceTotals) -> Vec<InvoiceLineItem> {
    let mut items = vec![
        InvoiceLineItem::single(format!("{plan_name}订阅"), totals.base_fee),
        InvoiceLineItem::single("按量计费", totals.usage_cost),
    ];
    if totals.discount > 0.0 {
        items.push(InvoiceLineItem::single("优惠抵扣", -totals.discount));
    }
    if totals.tax > 0.0 {
        items.push(InvoiceLineItem::single("税费", totals.tax));
    }
    items
}

/// An invoice for one quota period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invoice {
    /// Quota the invoice was built from.
    pub id: Uuid,
    pub invoice_number: String,
    pub workspace_id: Uuid,
    pub description: String,
    pub plan_code: String,
    pub plan_name: String,
    pub currency: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    #[serde(flatten)]
    pub totals: InvoiceTotals,
    pub status: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_provider: Option<String>,
    pub payment_reference: Option<String>,
    pub usage: Value,
    pub line_items: Vec<InvoiceLineItem>,
}

/// Payment state reported by a payment provider.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentSync {
    pub invoice_number: String,
    pub status: String,
    /// Defaults to the invoice total.
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub provider: Option<String>,
    pub reference: Option<String>,
    /// Defaults to now when `status = paid`.
    pub paid_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_invoice_number_and_description() {
        let ws = Uuid::parse_str("a1b2c3d4-0000-4000-8000-000000000000").unwrap();
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(invoice_number(ws, start), "INV-202503-A1B2C3");
        assert_eq!(invoice_description("专业版", start), "专业版订阅 - 2025年03月");
    }

    #[test]
    fn test_totals_with_discount_and_tax() {
        let settings = InvoiceSettings {
            tax_rate: 0.06,
            discount_rate: 0.1,
            discount_amount: 5.0,
        };
        let t = compute_totals(99.0, 21.0, &settings);
        assert_eq!(t.subtotal, 120.0);
        assert_eq!(t.discount, 17.0);
        assert_eq!(t.tax, 6.18);
        assert_eq!(t.total, 109.18);

        let items = line_items("专业版", &t);
        let names: Vec<_> = items.iter().map(|i| i.description.as_str()).collect();
        assert_eq!(names, vec!["专业版订阅", "按量计费", "优惠抵扣", "税费"]);
        assert_eq!(items[2].amount, -17.0);
    }

    #[test]
    fn test_discount_never_exceeds_subtotal() {
        let settings = InvoiceSettings {
            tax_rate: 0.2,
            discount_rate: 0.0,
            discount_amount: 500.0,
        };
        let t = compute_totals(99.0, 0.0, &settings);
        assert_eq!(t.discount, 99.0);
        assert_eq!(t.tax, 0.0);
        assert_eq!(t.total, 0.0);
        assert_eq!(line_items("专业版", &t).len(), 3);

        let free = compute_totals(0.0, 0.0, &settings);
        assert_eq!(free.discount, 0.0);
    }

    #[test]
    fn test_settings_are_clamped() {
        let settings = json!({INVOICE_SETTINGS_KEY: {"tax_rate": 3.0, "discount_rate": -1.0, "discount_amount": -2.0}});
        assert_eq!(InvoiceSettings::from_settings(&settings), InvoiceSettings::default().merge(
            InvoiceSettingsUpdate { tax_rate: Some(1.0), ..Default::default() }
        ));
        assert_eq!(InvoiceSettings::from_settings(&Value::Null), InvoiceSettings::default());
    }

    #[test]
    fn test_limits_and_status() {
        assert_eq!(effective_limit(None), 6);
        assert_eq!(effective_limit(Some(100)), 24);
        assert_eq!(effective_limit(Some(3)), 3);
        assert_eq!(normalize_payment_status(" PAID ").unwrap(), "paid");
        assert!(normalize_payment_status("void").is_err());
    }
}
