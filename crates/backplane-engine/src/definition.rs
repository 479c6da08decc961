// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definition model.
//!
//! Definitions are stored as JSON on workspace versions. The editor writes camelCase
//! keys, older exports use snake_case; both are accepted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

/// Default execution timeout when a definition does not carry one.
pub const DEFAULT_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// A directed graph of typed nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    /// Definition format version.
    #[serde(default)]
    pub version: String,
    /// Nodes in declaration order.
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    /// Edges between node ports.
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
    /// Execution settings.
    #[serde(default)]
    pub settings: WorkflowSettings,
}

/// One node of the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeDefinition {
    /// Node id, unique within the definition.
    pub id: String,
    /// Executor type, e.g. `start`, `http`, `llm`.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// Executor configuration. Editor exports call this `data`.
    #[serde(default, alias = "data")]
    pub config: Map<String, Value>,
}

/// A connection from one node's output port to another node's input port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDefinition {
    /// Optional edge id.
    #[serde(default)]
    pub id: String,
    /// Upstream node id.
    pub source: String,
    /// Downstream node id.
    pub target: String,
    /// Upstream output port. Branching nodes select edges by this handle.
    #[serde(default, alias = "source_handle")]
    pub source_handle: Option<String>,
    /// Downstream input port.
    #[serde(default, alias = "target_handle")]
    pub target_handle: Option<String>,
}

/// Execution-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    /// Whole-execution timeout in milliseconds. `0` falls back to the engine default.
    #[serde(default)]
    pub timeout: u64,
    /// Node retry policy.
    #[serde(default, alias = "retry_policy")]
    pub retry_policy: RetryPolicy,
    /// What to do after an unrecoverable node failure.
    #[serde(default, alias = "error_handling")]
    pub error_handling: ErrorHandling,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            timeout: 0,
            retry_policy: RetryPolicy::default(),
            error_handling: ErrorHandling::Stop,
        }
    }
}

/// Retry policy applied to failing nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` disables retry.
    #[serde(default, alias = "max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry.
    #[serde(default, alias = "backoff_ms")]
    pub backoff_ms: u64,
}

/// Failure strategy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorHandling {
    /// Halt on the first unrecoverable failure.
    #[default]
    Stop,
    /// Record the failure and keep running independent branches.
    Continue,
}

impl WorkflowDefinition {
    /// Parses a definition from its stored JSON form.
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Err(EngineError::InvalidDefinition(
                "workflow definition is empty".into(),
            ));
        }
        serde_json::from_value(value.clone()).map_err(|e| {
            EngineError::InvalidDefinition(format!("failed to parse workflow definition: {e}"))
        })
    }

    /// Parses a definition from raw JSON bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(data).map_err(|e| {
            EngineError::InvalidDefinition(format!("failed to parse workflow definition: {e}"))
        })?;
        Self::from_value(&value)
    }

    /// Looks up a node by id.
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Effective timeout in milliseconds.
    pub fn timeout_ms(&self, engine_default: u64) -> u64 {
        if self.settings.timeout > 0 {
            self.settings.timeout
        } else if engine_default > 0 {
            engine_default
        } else {
            DEFAULT_TIMEOUT_MS
        }
    }
}

impl NodeDefinition {
    /// Reads a string config value.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Reads an integer config value, accepting numeric strings.
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        match self.config.get(key)? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}
