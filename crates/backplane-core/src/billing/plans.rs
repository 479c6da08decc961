// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Billing dimensions and the default plan catalog.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{CoreError, Result};

/// Currency used when a plan does not name one.
pub const DEFAULT_CURRENCY: &str = "CNY";

/// Plan used for workspaces without a plan or with an unknown one.
pub const FALLBACK_PLAN: &str = "free";

/// Overage policy values.
pub mod overage {
    /// Calls over the limit still succeed.
    pub const ALLOW: &str = "allow";
    /// Calls over the limit are denied.
    pub const BLOCK: &str = "block";
}

/// A metered dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimension {
    /// Usage map key.
    pub key: &'static str,
    /// Display name.
    pub name: &'static str,
    /// Unit label.
    pub unit: &'static str,
    /// Cost category (bandwidth, llm, db, storage).
    pub category: &'static str,
}

/// The fixed dimension catalog.
pub const DIMENSIONS: &[Dimension] = &[
    Dimension { key: "requests", name: "请求次数", unit: "次", category: "bandwidth" },
    Dimension { key: "tokens", name: "Tokens", unit: "tokens", category: "llm" },
    Dimension { key: "db_storage_gb", name: "数据库存储", unit: "GB", category: "db" },
    Dimension { key: "storage_gb", name: "对象存储", unit: "GB", category: "storage" },
    Dimension { key: "egress_gb", name: "外网流量", unit: "GB", category: "bandwidth" },
];

/// Cost categories in reporting order.
pub const COST_CATEGORIES: &[&str] = &["db", "llm", "bandwidth", "storage"];

/// Looks up a dimension by key.
pub fn dimension(key: &str) -> Option<&'static Dimension> {
    DIMENSIONS.iter().find(|d| d.key == key)
}

/// Rejects empty maps, unknown keys and non-positive values.
pub fn validate_usage(usage: &BTreeMap<String, f64>) -> Result<()> {
    if usage.is_empty() {
        return Err(CoreError::InvalidUsage("usage is empty".into()));
    }
    for (key, value) in usage {
        if dimension(key).is_none() {
            return Err(CoreError::InvalidDimension(key.clone()));
        }
        if !value.is_finite() || *value <= 0.0 {
            return Err(CoreError::InvalidUsage(format!("'{key}' must be positive")));
        }
    }
    Ok(())
}

/// A plan the catalog seeds on first use.
#[derive(Debug, Clone)]
pub struct PlanSeed {
    /// Unique code.
    pub code: &'static str,
    /// Display name.
    pub name: &'static str,
    /// Monthly base fee.
    pub price_monthly: f64,
    /// Monthly fee when billed yearly.
    pub price_yearly: f64,
    /// Per-dimension limits; `-1` is unlimited.
    pub quota_limits: [(&'static str, f64); 5],
    /// Per-dimension unit prices.
    pub rate_rules: [(&'static str, f64); 5],
    /// `allow` or `block`.
    pub overage_policy: &'static str,
}

impl PlanSeed {
    /// Limits as a JSON object.
    pub fn limits_value(&self) -> Value {
        pairs_to_value(&self.quota_limits)
    }

    /// Rates as a JSON object.
    pub fn rates_value(&self) -> Value {
        pairs_to_value(&self.rate_rules)
    }

    /// Policy object stored on the plan.
    pub fn policy_value(&self) -> Value {
        json!({ "overage_policy": self.overage_policy })
    }
}

fn pairs_to_value(pairs: &[(&str, f64)]) -> Value {
    Value::Object(
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), json!(v)))
            .collect(),
    )
}

/// Seeded plans: `free` blocks overage, paid plans allow it.
pub fn default_plans() -> Vec<PlanSeed> {
    vec![
        PlanSeed {
            code: "free",
            name: "免费版",
            price_monthly: 0.0,
            price_yearly: 0.0,
            quota_limits: [
                ("requests", 10_000.0),
                ("tokens", 200_000.0),
                ("db_storage_gb", 5.0),
                ("storage_gb", 5.0),
                ("egress_gb", 10.0),
            ],
            rate_rules: [
                ("requests", 0.0),
                ("tokens", 0.0),
                ("db_storage_gb", 0.0),
                ("storage_gb", 0.0),
                ("egress_gb", 0.0),
            ],
            overage_policy: overage::BLOCK,
        },
        PlanSeed {
            code: "pro",
            name: "专业版",
            price_monthly: 99.0,
            price_yearly: 79.0,
            quota_limits: [
                ("requests", 200_000.0),
                ("tokens", 5_000_000.0),
                ("db_storage_gb", 50.0),
                ("storage_gb", 50.0),
                ("egress_gb", 200.0),
            ],
            rate_rules: [
                ("requests", 0.0002),
                ("tokens", 0.00001),
                ("db_storage_gb", 0.5),
                ("storage_gb", 0.3),
                ("egress_gb", 0.2),
            ],
            overage_policy: overage::ALLOW,
        },
        PlanSeed {
            code: "enterprise",
            name: "企业版",
            price_monthly: 299.0,
            price_yearly: 249.0,
            quota_limits: [
                ("requests", -1.0),
                ("tokens", -1.0),
                ("db_storage_gb", -1.0),
                ("storage_gb", -1.0),
                ("egress_gb", -1.0),
            ],
            rate_rules: [
                ("requests", 0.0001),
                ("tokens", 0.000008),
                ("db_storage_gb", 0.4),
                ("storage_gb", 0.2),
                ("egress_gb", 0.15),
            ],
            overage_policy: overage::ALLOW,
        },
    ]
}

/// Numeric entries of a JSON object; other values are skipped.
pub fn float_map(value: &Value) -> BTreeMap<String, f64> {
    value
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                .collect()
        })
        .unwrap_or_default()
}

/// Overage policy of a plan; missing means `block`.
pub fn overage_policy(policy: &Value) -> &str {
    policy
        .get("overage_policy")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .unwrap_or(overage::BLOCK)
}

/// Dimensions whose usage is over a non-negative limit, sorted.
pub fn exceeded_dimensions(
    usage: &BTreeMap<String, f64>,
    limits: &BTreeMap<String, f64>,
) -> Vec<String> {
    usage
        .iter()
        .filter(|(key, value)| {
            limits
                .get(*key)
                .is_some_and(|limit| *limit >= 0.0 && **value > *limit)
        })
        .map(|(key, _)| key.clone())
        .collect()
}

/// Σ usage × rate.
pub fn compute_cost(usage: &BTreeMap<String, f64>, rates: &BTreeMap<String, f64>) -> f64 {
    usage
        .iter()
        .filter_map(|(key, value)| rates.get(key).map(|rate| value * rate))
        .sum()
}

/// Rounds to cents.
pub fn round_currency(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Cost per category for a usage map.
pub fn cost_by_category(
    usage: &BTreeMap<String, f64>,
    rates: &BTreeMap<String, f64>,
) -> BTreeMap<&'static str, f64> {
    let mut out: BTreeMap<&'static str, f64> =
        COST_CATEGORIES.iter().map(|c| (*c, 0.0)).collect();
    for (key, value) in usage {
        if let (Some(dim), Some(rate)) = (dimension(key), rates.get(key)) {
            *out.entry(dim.category).or_default() += value * rate;
        }
    }
    for v in out.values_mut() {
        *v = round_currency(*v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[test]
    fn test_validate_usage() {
        assert!(validate_usage(&usage(&[("requests", 1.0)])).is_ok());
        assert_eq!(
            validate_usage(&BTreeMap::new()).unwrap_err().error_code(),
            "INVALID_USAGE"
        );
        assert_eq!(
            validate_usage(&usage(&[("cpu", 1.0)])).unwrap_err(),
            CoreError::InvalidDimension("cpu".into())
        );
        assert!(validate_usage(&usage(&[("tokens", 0.0)])).is_err());
        assert!(validate_usage(&usage(&[("tokens", -3.0)])).is_err());
    }

    #[test]
    fn test_exceeded_ignores_unlimited() {
        let limits = usage(&[("requests", 10_000.0), ("tokens", -1.0)]);
        let used = usage(&[("requests", 10_001.0), ("tokens", 9e9), ("egress_gb", 1.0)]);
        assert_eq!(exceeded_dimensions(&used, &limits), vec!["requests".to_string()]);
        let at_limit = usage(&[("requests", 10_000.0)]);
        assert!(exceeded_dimensions(&at_limit, &limits).is_empty());
    }

    #[test]
    fn test_cost_and_categories() {
        let pro = &default_plans()[1];
        let rates = float_map(&pro.rates_value());
        let used = usage(&[("requests", 1000.0), ("egress_gb", 2.0), ("tokens", 12345.0)]);
        assert_eq!(round_currency(compute_cost(&used, &rates)), 0.72);
        let by_cat = cost_by_category(&used, &rates);
        assert_eq!(by_cat["bandwidth"], 0.6);
        assert_eq!(by_cat["llm"], 0.12);
        assert_eq!(by_cat["db"], 0.0);
    }

    #[test]
    fn test_overage_policy_defaults_to_block() {
        assert_eq!(overage_policy(&Value::Null), overage::BLOCK);
        assert_eq!(overage_policy(&json!({"overage_policy": "allow"})), overage::ALLOW);
        let free = &default_plans()[0];
        assert_eq!(overage_policy(&free.policy_value()), overage::BLOCK);
        assert_eq!(dimension("tokens").unwrap().category, "llm");
    }
}
