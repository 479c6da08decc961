// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-execution context shared by all nodes of one run.

use std::collections::HashMap;
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// LLM token counters reported by nodes and summed per execution.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    /// Prompt-side tokens.
    pub prompt_tokens: u64,
    /// Completion-side tokens.
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Prompt plus completion tokens.
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Adds another usage report to this one.
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    /// JSON form persisted on execution rows.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "prompt_tokens": self.prompt_tokens,
            "completion_tokens": self.completion_tokens,
            "total_tokens": self.total(),
        })
    }
}

/// State visible to every node of one execution.
///
/// Nodes run on separate tasks, so the mutable parts are behind concurrent maps.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Owning workspace.
    pub workspace_id: Uuid,
    /// This execution.
    pub execution_id: Uuid,
    /// Workflow (version) being executed.
    pub workflow_id: Option<Uuid>,
    /// Authenticated caller, if any.
    pub caller_id: Option<Uuid>,
    /// Provider name to credential, e.g. `openai` to an API key.
    pub secrets: HashMap<String, String>,
    variables: DashMap<String, Value>,
    node_outputs: DashMap<String, Map<String, Value>>,
    token_usage: Mutex<TokenUsage>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    /// Creates a context with a fresh cancellation token.
    pub fn new(workspace_id: Uuid, execution_id: Uuid) -> Self {
        Self {
            workspace_id,
            execution_id,
            workflow_id: None,
            caller_id: None,
            secrets: HashMap::new(),
            variables: DashMap::new(),
            node_outputs: DashMap::new(),
            token_usage: Mutex::new(TokenUsage::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the workflow id.
    pub fn with_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    /// Sets the caller id.
    pub fn with_caller(mut self, caller_id: Option<Uuid>) -> Self {
        self.caller_id = caller_id;
        self
    }

    /// Replaces the secret bag.
    pub fn with_secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Ties this execution to an outer cancellation handle, e.g. the inbound request.
    pub fn with_parent_cancel(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Looks up a provider credential.
    pub fn secret(&self, provider: &str) -> Option<&str> {
        self.secrets.get(provider).map(String::as_str)
    }

    /// Reads a workflow variable.
    pub fn variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).map(|v| v.clone())
    }

    /// Writes a workflow variable.
    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Snapshot of all variables.
    pub fn variables(&self) -> Map<String, Value> {
        self.variables
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Outputs of a completed node.
    pub fn node_output(&self, node_id: &str) -> Option<Map<String, Value>> {
        self.node_outputs.get(node_id).map(|v| v.clone())
    }

    /// Records the outputs of a completed node.
    pub fn set_node_output(&self, node_id: impl Into<String>, outputs: Map<String, Value>) {
        self.node_outputs.insert(node_id.into(), outputs);
    }

    /// Adds token usage reported by a node.
    pub fn add_token_usage(&self, usage: TokenUsage) {
        let mut guard = self
            .token_usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.add(usage);
    }

    /// Token usage accumulated so far.
    pub fn token_usage(&self) -> TokenUsage {
        *self
            .token_usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Requests cancellation of the execution.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The token nodes select on at suspension points.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_usage_accumulates() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        ctx.add_token_usage(TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
        });
        ctx.add_token_usage(TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 2,
        });
        let usage = ctx.token_usage();
        assert_eq!(usage.prompt_tokens, 11);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.to_value()["total_tokens"], json!(18));
    }

    #[test]
    fn test_parent_cancel_propagates() {
        let parent = CancellationToken::new();
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4()).with_parent_cancel(&parent);
        assert!(!ctx.is_cancelled());
        parent.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_variables_and_outputs() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        ctx.set_variable("x", json!(1));
        let mut out = Map::new();
        out.insert("y".into(), json!("z"));
        ctx.set_node_output("n1", out);
        assert_eq!(ctx.variable("x"), Some(json!(1)));
        assert_eq!(ctx.node_output("n1").unwrap()["y"], json!("z"));
        assert!(ctx.node_output("n2").is_none());
    }
}
