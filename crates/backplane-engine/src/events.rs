// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution events and sinks.
//!
//! Emission is synchronous: the engine calls [`EventSink::emit`] inline, in the order
//! transitions happen. Sinks that need IO (the recorder) must hand the event off to
//! their own task rather than block.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle transitions reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventType {
    /// Execution accepted and about to run its first level.
    ExecutionStarted,
    /// A node started running.
    ExecutionNodeStarted,
    /// A node finished successfully.
    ExecutionNodeCompleted,
    /// A node failed after its retries.
    ExecutionNodeFailed,
    /// A node was not activated by any predecessor.
    ExecutionNodeSkipped,
    /// Every reachable node finished.
    ExecutionCompleted,
    /// The execution failed.
    ExecutionFailed,
    /// The execution was cancelled.
    ExecutionCancelled,
}

impl ExecutionEventType {
    /// Wire name, identical to the runtime event type and WebSocket message type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStarted => "execution_started",
            Self::ExecutionNodeStarted => "execution_node_started",
            Self::ExecutionNodeCompleted => "execution_node_completed",
            Self::ExecutionNodeFailed => "execution_node_failed",
            Self::ExecutionNodeSkipped => "execution_node_skipped",
            Self::ExecutionCompleted => "execution_completed",
            Self::ExecutionFailed => "execution_failed",
            Self::ExecutionCancelled => "execution_cancelled",
        }
    }

    /// Whether this event ends the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted | Self::ExecutionFailed | Self::ExecutionCancelled
        )
    }
}

impl std::fmt::Display for ExecutionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One engine event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionEvent {
    /// Transition kind.
    #[serde(rename = "type")]
    pub event_type: ExecutionEventType,
    /// Owning workspace.
    pub workspace_id: Uuid,
    /// Execution the event belongs to.
    pub execution_id: Uuid,
    /// Workflow (version) id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    /// Node id for node-level events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Node type for node-level events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    /// Node or execution status after the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Node inputs on start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Map<String, Value>>,
    /// Node or execution outputs on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, Value>>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Elapsed milliseconds for the node or the execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Percentage of nodes settled, 0 to 100.
    pub progress: u32,
    /// Number of nodes in the graph.
    pub total_nodes: u32,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    /// Creates an event with no node fields set.
    pub fn new(event_type: ExecutionEventType, workspace_id: Uuid, execution_id: Uuid) -> Self {
        Self {
            event_type,
            workspace_id,
            execution_id,
            workflow_id: None,
            node_id: None,
            node_type: None,
            status: None,
            inputs: None,
            outputs: None,
            error: None,
            duration_ms: None,
            progress: 0,
            total_nodes: 0,
            timestamp: Utc::now(),
        }
    }

    /// Serializes the event as a WebSocket message.
    pub fn to_message(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Receives engine events.
pub trait EventSink: Send + Sync {
    /// Handles one event. Must not block.
    fn emit(&self, event: &ExecutionEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &ExecutionEvent) {}
}

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Creates an empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &ExecutionEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

impl<F> EventSink for F
where
    F: Fn(&ExecutionEvent) + Send + Sync,
{
    fn emit(&self, event: &ExecutionEvent) {
        self(event)
    }
}
