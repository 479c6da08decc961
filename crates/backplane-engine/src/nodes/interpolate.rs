// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `{{path}}` placeholder resolution shared by the built-in nodes.
//!
//! A path is looked up in the node inputs first, then as `nodeId.key` in upstream
//! outputs, then in workflow variables. Unresolved placeholders are left as-is.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::context::ExecutionContext;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("valid placeholder pattern"));

/// Resolves one path.
pub fn lookup(path: &str, inputs: &Map<String, Value>, ctx: &ExecutionContext) -> Option<Value> {
    if let Some(v) = inputs.get(path) {
        return Some(v.clone());
    }
    if let Some((head, rest)) = path.split_once('.') {
        if let Some(v) = inputs.get(head).and_then(|v| walk(v, rest)) {
            return Some(v.clone());
        }
        if let Some(outputs) = ctx.node_output(head) {
            if let Some(v) = outputs.get(rest) {
                return Some(v.clone());
            }
            if let Some((key, tail)) = rest.split_once('.') {
                if let Some(v) = outputs.get(key).and_then(|v| walk(v, tail)) {
                    return Some(v.clone());
                }
            }
        }
    }
    ctx.variable(path)
}

fn walk<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |cur, seg| match cur {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Renders a value as placeholder text: strings unquoted, everything else as JSON.
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitutes every placeholder in `template`.
pub fn interpolate(template: &str, inputs: &Map<String, Value>, ctx: &ExecutionContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match lookup(caps[1].trim(), inputs, ctx) {
                Some(v) => display(&v),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Resolves a config value. A string that is exactly one placeholder yields the
/// referenced value with its JSON type intact; other strings are interpolated.
pub fn resolve(value: &Value, inputs: &Map<String, Value>, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(caps) = PLACEHOLDER.captures(trimmed) {
                if caps[0].len() == trimmed.len() {
                    if let Some(v) = lookup(caps[1].trim(), inputs, ctx) {
                        return v;
                    }
                }
            }
            Value::String(interpolate(s, inputs, ctx))
        }
        other => other.clone(),
    }
}

/// Recursively interpolates every string inside a JSON value.
pub fn resolve_deep(value: &Value, inputs: &Map<String, Value>, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(_) => resolve(value, inputs, ctx),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_deep(v, inputs, ctx))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_deep(v, inputs, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> ExecutionContext {
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        ctx.set_variable("region", json!("eu"));
        let mut out = Map::new();
        out.insert("status".into(), json!(200));
        out.insert("data".into(), json!({"items": [{"name": "first"}]}));
        ctx.set_node_output("fetch", out);
        ctx
    }

    #[test]
    fn test_lookup_order() {
        let ctx = ctx();
        let mut inputs = Map::new();
        inputs.insert("name".into(), json!("Ada"));
        assert_eq!(
            interpolate("hi {{name}} from {{ region }} ({{fetch.status}})", &inputs, &ctx),
            "hi Ada from eu (200)"
        );
        assert_eq!(
            interpolate("{{fetch.data.items.0.name}}", &inputs, &ctx),
            "first"
        );
    }

    #[test]
    fn test_unresolved_placeholder_kept() {
        let ctx = ctx();
        assert_eq!(
            interpolate("value={{missing.key}}", &Map::new(), &ctx),
            "value={{missing.key}}"
        );
    }

    #[test]
    fn test_resolve_keeps_json_type() {
        let ctx = ctx();
        assert_eq!(resolve(&json!("{{fetch.status}}"), &Map::new(), &ctx), json!(200));
        assert_eq!(
            resolve(&json!("code {{fetch.status}}"), &Map::new(), &ctx),
            json!("code 200")
        );
        assert_eq!(
            resolve_deep(&json!({"a": ["{{region}}"]}), &Map::new(), &ctx),
            json!({"a": ["eu"]})
        );
    }
}
