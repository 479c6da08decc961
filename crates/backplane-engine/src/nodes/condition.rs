// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Branching condition node.
//!
//! Two configuration shapes are accepted:
//!
//! - `{field, operator, value}` for a single comparison;
//! - `{conditionGroups: [{logic: "and"|"or", conditions: [{left, operator, right}]}]}`
//!   where the groups are OR-ed together.
//!
//! The node selects the `"true"` or `"false"` source handle.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};

use super::interpolate::{display, resolve};
use crate::context::ExecutionContext;
use crate::definition::NodeDefinition;
use crate::error::Result;
use crate::executor::{NodeExecutor, NodeInput, NodeOutput};

/// Evaluates a predicate and branches.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionExecutor;

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    fn node_type(&self) -> &str {
        "condition"
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        input: NodeInput,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput> {
        let groups = node
            .config
            .get("conditionGroups")
            .and_then(Value::as_array)
            .filter(|g| !g.is_empty());

        let result = match groups {
            Some(groups) => groups
                .iter()
                .filter_map(Value::as_object)
                .any(|group| evaluate_group(group, &input, ctx)),
            None => {
                let field = node.config_str("field").unwrap_or_default();
                let operator = node.config_str("operator").unwrap_or_default();
                if field.is_empty() || operator.is_empty() {
                    false
                } else {
                    let left = resolve(&Value::String(format!("{{{{{field}}}}}")), &input, ctx);
                    let right = node
                        .config
                        .get("value")
                        .map(|v| resolve(v, &input, ctx))
                        .unwrap_or(Value::Null);
                    compare(&left, operator, &right)
                }
            }
        };

        let branch = if result { "true" } else { "false" };
        let mut outputs = Map::new();
        outputs.insert("result".into(), Value::Bool(result));
        outputs.insert("branch".into(), Value::String(branch.into()));
        outputs.insert(
            "branches".into(),
            serde_json::json!({"true": result, "false": !result}),
        );
        Ok(NodeOutput::new(outputs).with_next_handle(branch))
    }
}

fn evaluate_group(group: &Map<String, Value>, input: &NodeInput, ctx: &ExecutionContext) -> bool {
    let conditions = match group.get("conditions").and_then(Value::as_array) {
        Some(c) if !c.is_empty() => c,
        _ => return true,
    };
    let any = group.get("logic").and_then(Value::as_str) == Some("or");

    let mut results = conditions.iter().filter_map(Value::as_object).map(|c| {
        let left = c.get("left").map_or(Value::Null, |v| resolve(v, input, ctx));
        let right = c.get("right").map_or(Value::Null, |v| resolve(v, input, ctx));
        let op = c.get("operator").and_then(Value::as_str).unwrap_or_default();
        compare(&left, op, &right)
    });
    if any {
        results.any(|r| r)
    } else {
        results.all(|r| r)
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Compares two values with a named operator. Unknown operators are false.
pub fn compare(left: &Value, operator: &str, right: &Value) -> bool {
    let l = display(left);
    let r = display(right);
    match operator {
        "==" | "equals" => l == r,
        "!=" | "notEquals" => l != r,
        ">" | "gt" | "greater_than" | ">=" | "gte" | "greater_than_or_equal" | "<" | "lt"
        | "less_than" | "<=" | "lte" | "less_than_or_equal" => {
            let ord = match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => Some(l.cmp(&r)),
            };
            let Some(ord) = ord else {
                return false;
            };
            match operator {
                ">" | "gt" | "greater_than" => ord.is_gt(),
                ">=" | "gte" | "greater_than_or_equal" => ord.is_ge(),
                "<" | "lt" | "less_than" => ord.is_lt(),
                _ => ord.is_le(),
            }
        }
        "contains" => l.contains(&r),
        "startsWith" => l.starts_with(&r),
        "endsWith" => l.ends_with(&r),
        "matches" => Regex::new(&r).is_ok_and(|re| re.is_match(&l)),
        "isEmpty" => l.is_empty(),
        "isNotEmpty" => !l.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn node(config: Value) -> NodeDefinition {
        serde_json::from_value(json!({"id": "c", "type": "condition", "config": config})).unwrap()
    }

    #[test]
    fn test_compare_operators() {
        assert!(compare(&json!(10), ">", &json!("9")));
        assert!(compare(&json!("abc"), "startsWith", &json!("ab")));
        assert!(compare(&json!("a-12"), "matches", &json!(r"^a-\d+$")));
        assert!(compare(&json!(""), "isEmpty", &Value::Null));
        assert!(!compare(&json!(1), "teleport", &json!(1)));
        assert!(compare(&json!(1), "==", &json!("1")));
    }

    #[tokio::test]
    async fn test_simple_field_branch() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        let mut input = Map::new();
        input.insert("score".into(), json!(72));
        let out = ConditionExecutor
            .execute(
                &node(json!({"field": "score", "operator": "gte", "value": 60})),
                input,
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out.next_handle.as_deref(), Some("true"));
        assert_eq!(out.outputs["branch"], json!("true"));
    }

    #[tokio::test]
    async fn test_condition_groups_are_ored() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        let mut input = Map::new();
        input.insert("tier".into(), json!("free"));
        let config = json!({"conditionGroups": [
            {"logic": "and", "conditions": [
                {"left": "{{tier}}", "operator": "==", "right": "pro"}
            ]},
            {"logic": "or", "conditions": [
                {"left": "{{tier}}", "operator": "==", "right": "enterprise"},
                {"left": "{{tier}}", "operator": "==", "right": "free"}
            ]}
        ]});
        let out = ConditionExecutor
            .execute(&node(config), input, &ctx)
            .await
            .unwrap();
        assert_eq!(out.outputs["result"], json!(true));
    }

    #[tokio::test]
    async fn test_missing_field_is_false() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        let out = ConditionExecutor
            .execute(&node(json!({})), Map::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(out.next_handle.as_deref(), Some("false"));
    }
}
