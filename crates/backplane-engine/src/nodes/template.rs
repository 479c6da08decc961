// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Text template node.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::interpolate::interpolate;
use crate::context::ExecutionContext;
use crate::definition::NodeDefinition;
use crate::error::Result;
use crate::executor::{NodeExecutor, NodeInput, NodeOutput};

/// Renders `config.template`, exposing the result as both `output` and `text`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateExecutor;

#[async_trait]
impl NodeExecutor for TemplateExecutor {
    fn node_type(&self) -> &str {
        "template"
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        input: NodeInput,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput> {
        let template = node.config_str("template").unwrap_or_default();
        let rendered = interpolate(template, &input, ctx);

        let mut outputs = Map::new();
        outputs.insert("output".into(), Value::String(rendered.clone()));
        outputs.insert("text".into(), Value::String(rendered));
        Ok(NodeOutput::new(outputs))
    }
}
