// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node executor trait and registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::context::{ExecutionContext, TokenUsage};
use crate::definition::NodeDefinition;
use crate::error::{EngineError, Result};

/// Inputs handed to a node: workflow variables, each predecessor's outputs under its
/// node id, and any handle-mapped ports.
pub type NodeInput = Map<String, Value>;

/// What a node produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    /// Output ports.
    pub outputs: Map<String, Value>,
    /// For branching nodes, the source handle whose edges should activate.
    pub next_handle: Option<String>,
    /// Tokens consumed by LLM calls made by this node.
    pub token_usage: Option<TokenUsage>,
}

impl NodeOutput {
    /// Output with the given ports and no branching.
    pub fn new(outputs: Map<String, Value>) -> Self {
        Self {
            outputs,
            ..Default::default()
        }
    }

    /// Selects a branch handle.
    pub fn with_next_handle(mut self, handle: impl Into<String>) -> Self {
        self.next_handle = Some(handle.into());
        self
    }

    /// Attaches token usage.
    pub fn with_token_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }
}

/// Runs one node type.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// The `type` string this executor handles.
    fn node_type(&self) -> &str;

    /// Executes a node. Implementations should select on
    /// [`ExecutionContext::cancellation_token`] around long waits.
    async fn execute(
        &self,
        node: &NodeDefinition,
        input: NodeInput,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput>;
}

/// Executors by node type.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in node except `llm`, which needs a provider.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::nodes::register_builtins(&mut registry);
        registry
    }

    /// Registers an executor, replacing any previous one for the same type.
    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        self.executors
            .insert(executor.node_type().to_string(), executor);
    }

    /// Looks up the executor for a node type.
    pub fn get(&self, node_type: &str) -> Result<Arc<dyn NodeExecutor>> {
        self.executors
            .get(node_type)
            .cloned()
            .ok_or_else(|| EngineError::ExecutorNotFound {
                node_type: node_type.to_string(),
            })
    }

    /// Registered node types, sorted.
    pub fn node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("node_types", &self.node_types())
            .finish()
    }
}
