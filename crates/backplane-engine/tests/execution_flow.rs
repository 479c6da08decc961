// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end engine runs observed through event sinks.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use backplane_engine::{
    Engine, EngineConfig, EngineError, EventSink, ExecutionContext, ExecutionEvent,
    ExecutionEventType, ExecutionHub, ExecutionStatus, ExecutorRegistry, FanoutSink,
    NodeDefinition, NodeExecutor, NodeInput, NodeOutput, NodeStatus, TokenUsage,
    WorkflowDefinition,
};
use serde_json::{Map, json};
use uuid::Uuid;

#[derive(Default)]
struct Collector(Mutex<Vec<ExecutionEvent>>);

impl Collector {
    fn kinds(&self) -> Vec<(ExecutionEventType, Option<String>)> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.event_type, e.node_id.clone()))
            .collect()
    }
}

impl EventSink for Collector {
    fn emit(&self, event: &ExecutionEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

struct AlwaysFails;

#[async_trait]
impl NodeExecutor for AlwaysFails {
    fn node_type(&self) -> &str {
        "explode"
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        _input: NodeInput,
        _ctx: &ExecutionContext,
    ) -> backplane_engine::Result<NodeOutput> {
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        Err(EngineError::node(&node.id, "upstream unavailable"))
    }
}

struct Metered;

#[async_trait]
impl NodeExecutor for Metered {
    fn node_type(&self) -> &str {
        "metered"
    }

    async fn execute(
        &self,
        _node: &NodeDefinition,
        _input: NodeInput,
        _ctx: &ExecutionContext,
    ) -> backplane_engine::Result<NodeOutput> {
        let mut outputs = Map::new();
        outputs.insert("answer".into(), json!("42"));
        Ok(NodeOutput::new(outputs).with_token_usage(TokenUsage {
            prompt_tokens: 12,
            completion_tokens: 30,
        }))
    }
}

fn engine() -> Engine {
    let mut registry = ExecutorRegistry::with_builtins();
    registry.register(Arc::new(AlwaysFails));
    registry.register(Arc::new(Metered));
    Engine::new(registry, EngineConfig::default())
}

#[tokio::test]
async fn test_stop_on_failure_event_order() {
    let def = WorkflowDefinition::from_value(&json!({
        "nodes": [
            {"id": "A", "type": "start"},
            {"id": "B", "type": "explode"},
            {"id": "C", "type": "end"}
        ],
        "edges": [
            {"source": "A", "target": "B"},
            {"source": "B", "target": "C"}
        ],
        "settings": {"errorHandling": "stop"}
    }))
    .unwrap();
    let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
    let sink = Collector::default();

    let result = engine().execute(&def, Map::new(), &ctx, &sink).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.duration_ms > 0);
    assert!(matches!(
        result.error,
        Some(EngineError::NodeFailed { ref node_id, .. }) if node_id == "B"
    ));
    assert_eq!(
        sink.kinds(),
        vec![
            (ExecutionEventType::ExecutionStarted, None),
            (ExecutionEventType::ExecutionNodeStarted, Some("A".to_string())),
            (ExecutionEventType::ExecutionNodeCompleted, Some("A".to_string())),
            (ExecutionEventType::ExecutionNodeStarted, Some("B".to_string())),
            (ExecutionEventType::ExecutionNodeFailed, Some("B".to_string())),
            (ExecutionEventType::ExecutionFailed, Some("B".to_string())),
        ]
    );
    assert!(result.node_runs.iter().all(|r| r.node_id != "C"));

    let events = sink.0.lock().unwrap();
    let failed = events
        .iter()
        .find(|e| e.event_type == ExecutionEventType::ExecutionNodeFailed)
        .unwrap();
    assert_eq!(failed.error.as_deref(), Some("upstream unavailable"));
    assert_eq!(failed.total_nodes, 3);
}

#[tokio::test]
async fn test_token_usage_aggregates() {
    let def = WorkflowDefinition::from_value(&json!({
        "nodes": [
            {"id": "one", "type": "metered"},
            {"id": "two", "type": "metered"}
        ],
        "edges": [{"source": "one", "target": "two"}]
    }))
    .unwrap();
    let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());

    let result = engine()
        .execute(&def, Map::new(), &ctx, &backplane_engine::NoopSink)
        .await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.token_usage.total(), 84);
    assert_eq!(result.outputs["answer"], json!("42"));
    assert!(
        result
            .node_runs
            .iter()
            .all(|r| r.status == NodeStatus::Completed)
    );
}

#[tokio::test]
async fn test_hub_subscribers_receive_stream_then_close() {
    let def = WorkflowDefinition::from_value(&json!({
        "nodes": [{"id": "greet", "type": "template", "config": {"template": "hi {{who}}"}}],
        "edges": []
    }))
    .unwrap();
    let execution_id = Uuid::new_v4();
    let ctx = ExecutionContext::new(Uuid::new_v4(), execution_id);
    let hub = Arc::new(ExecutionHub::new());
    let mut rx = hub.subscribe(execution_id);
    let collector = Arc::new(Collector::default());
    let sink = FanoutSink::new().with(collector.clone()).with(hub.clone());

    let mut inputs = Map::new();
    inputs.insert("who".into(), json!("there"));
    let result = engine().execute(&def, inputs, &ctx, &sink).await;
    assert_eq!(result.status, ExecutionStatus::Completed);

    let mut types = Vec::new();
    while let Ok(msg) = rx.recv().await {
        types.push(msg["type"].as_str().unwrap().to_string());
    }
    assert_eq!(
        types,
        vec![
            "execution_started",
            "execution_node_started",
            "execution_node_completed",
            "execution_completed"
        ]
    );
    assert_eq!(hub.channel_count(), 0);
    assert_eq!(collector.kinds().len(), 4);
}
