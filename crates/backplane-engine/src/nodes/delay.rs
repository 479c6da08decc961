// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delay node.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::definition::NodeDefinition;
use crate::error::{EngineError, Result};
use crate::executor::{NodeExecutor, NodeInput, NodeOutput};

/// Longest accepted delay.
const MAX_DELAY_MS: u64 = 60 * 60 * 1000;

/// Sleeps for `config.duration` milliseconds, then passes its inputs through.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayExecutor;

#[async_trait]
impl NodeExecutor for DelayExecutor {
    fn node_type(&self) -> &str {
        "delay"
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        input: NodeInput,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput> {
        let ms = node
            .config_u64("duration")
            .or_else(|| node.config_u64("delay"))
            .unwrap_or(0)
            .min(MAX_DELAY_MS);

        tokio::select! {
            _ = ctx.cancellation_token().cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
        }

        let mut outputs = input;
        outputs.insert("delayed_ms".into(), Value::from(ms));
        Ok(NodeOutput::new(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use uuid::Uuid;

    fn node(ms: u64) -> NodeDefinition {
        serde_json::from_value(json!({"id": "d", "type": "delay", "config": {"duration": ms}}))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_completes() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        let out = DelayExecutor
            .execute(&node(500), Map::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(out.outputs["delayed_ms"], json!(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_cancelled() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        ctx.cancel();
        let err = DelayExecutor
            .execute(&node(10_000), Map::new(), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
    }
}
