// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structural nodes and the variable node.

use async_trait::async_trait;
use serde_json::{Map, Number, Value};

use super::interpolate::{interpolate, resolve};
use crate::context::ExecutionContext;
use crate::definition::NodeDefinition;
use crate::error::Result;
use crate::executor::{NodeExecutor, NodeInput, NodeOutput};

/// Node types whose outputs are their inputs.
pub const PASSTHROUGH_TYPES: [&str; 5] = ["start", "end", "input", "output", "merge"];

/// Passes inputs through unchanged.
#[derive(Debug, Clone)]
pub struct PassthroughExecutor {
    node_type: &'static str,
}

impl PassthroughExecutor {
    /// Creates a passthrough executor for `node_type`.
    pub fn new(node_type: &'static str) -> Self {
        Self { node_type }
    }
}

#[async_trait]
impl NodeExecutor for PassthroughExecutor {
    fn node_type(&self) -> &str {
        self.node_type
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        input: NodeInput,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput> {
        let mut outputs = input;
        // Output nodes may carry display fields for the runtime UI.
        if self.node_type == "output" {
            for key in ["title", "type", "showTimestamp"] {
                if let Some(v) = node.config.get(key) {
                    outputs.insert(key.to_string(), v.clone());
                }
            }
            if let Some(v) = node.config.get("value") {
                let resolved = resolve(v, &outputs, ctx);
                outputs.insert("output".to_string(), resolved);
            }
        }
        Ok(NodeOutput::new(outputs))
    }
}

/// Sets workflow variables.
///
/// `variables` is either a map of name to value, or a list of
/// `{name, value, type}` entries where `type` converts the value.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariableExecutor;

#[async_trait]
impl NodeExecutor for VariableExecutor {
    fn node_type(&self) -> &str {
        "variable"
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        input: NodeInput,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput> {
        let mut outputs = Map::new();
        let mut assign = |name: &str, raw: &Value, ty: Option<&str>| {
            let value = match raw {
                Value::String(s) => Value::String(interpolate(s, &input, ctx)),
                other => other.clone(),
            };
            let value = match ty {
                Some(t) => convert(value, t),
                None => value,
            };
            ctx.set_variable(name, value.clone());
            outputs.insert(name.to_string(), value);
        };

        match node.config.get("variables") {
            Some(Value::Object(vars)) => {
                for (name, raw) in vars {
                    assign(name, raw, None);
                }
            }
            Some(Value::Array(vars)) => {
                for var in vars.iter().filter_map(Value::as_object) {
                    let Some(name) = var.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let raw = var.get("value").unwrap_or(&Value::Null);
                    assign(name, raw, var.get("type").and_then(Value::as_str));
                }
            }
            _ => {}
        }

        Ok(NodeOutput::new(outputs))
    }
}

/// Converts a value to a named type, leaving it unchanged when conversion fails.
pub fn convert(value: Value, ty: &str) -> Value {
    match (ty, value) {
        ("number", Value::String(s)) => match s.trim().parse::<f64>().ok().and_then(Number::from_f64) {
            Some(n) => Value::Number(n),
            None => Value::String(s),
        },
        ("number", Value::Bool(b)) => Value::from(u8::from(b)),
        ("boolean", v) => Value::Bool(truthy(&v)),
        ("string", Value::Null) => Value::String(String::new()),
        ("string", Value::String(s)) => Value::String(s),
        ("string", other) => Value::String(other.to_string()),
        ("object" | "array", Value::String(s)) => match serde_json::from_str(&s) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(s),
        },
        (_, v) => v,
    }
}

/// Loose truthiness used by conditions and conversions.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            !(s.is_empty() || s == "false" || s == "0" || s == "no")
        }
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn node(node_type: &str, config: Value) -> NodeDefinition {
        serde_json::from_value(json!({"id": "n", "type": node_type, "config": config})).unwrap()
    }

    #[tokio::test]
    async fn test_passthrough() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        let mut input = Map::new();
        input.insert("x".into(), json!(1));
        let out = PassthroughExecutor::new("start")
            .execute(&node("start", json!({})), input.clone(), &ctx)
            .await
            .unwrap();
        assert_eq!(out.outputs, input);
        assert!(out.next_handle.is_none());
    }

    #[tokio::test]
    async fn test_variable_list_with_types() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        let mut input = Map::new();
        input.insert("count".into(), json!("41"));
        let out = VariableExecutor
            .execute(
                &node(
                    "variable",
                    json!({"variables": [
                        {"name": "n", "value": "{{count}}", "type": "number"},
                        {"name": "flag", "value": "yes", "type": "boolean"}
                    ]}),
                ),
                input,
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out.outputs["n"], json!(41.0));
        assert_eq!(out.outputs["flag"], json!(true));
        assert_eq!(ctx.variable("n"), Some(json!(41.0)));
    }

    #[test]
    fn test_truthy() {
        assert!(!truthy(&json!("false")));
        assert!(!truthy(&json!(0)));
        assert!(truthy(&json!([1])));
    }
}
