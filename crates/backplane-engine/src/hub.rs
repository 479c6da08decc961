// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WebSocket fan-out hub keyed by execution id.
//!
//! The HTTP layer subscribes a socket with [`ExecutionHub::subscribe`] and forwards
//! every received message. Message types mirror [`ExecutionEventType`] names 1:1.
//!
//! [`ExecutionEventType`]: crate::events::ExecutionEventType

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::events::{EventSink, ExecutionEvent};

/// Per-execution channel capacity. Slow subscribers lag rather than block the engine.
const CHANNEL_CAPACITY: usize = 256;

/// Broadcast channels per execution.
#[derive(Debug, Default)]
pub struct ExecutionHub {
    channels: DashMap<Uuid, broadcast::Sender<Value>>,
}

impl ExecutionHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the messages of one execution.
    pub fn subscribe(&self, execution_id: Uuid) -> broadcast::Receiver<Value> {
        self.channels
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Sends a message to current subscribers of an execution. Returns how many received it.
    pub fn publish(&self, execution_id: Uuid, message: Value) -> usize {
        match self.channels.get(&execution_id) {
            Some(tx) => tx.send(message).unwrap_or(0),
            None => 0,
        }
    }

    /// Drops the channel of a finished execution; subscribers see the stream close.
    pub fn close(&self, execution_id: Uuid) {
        if self.channels.remove(&execution_id).is_some() {
            debug!(execution_id = %execution_id, "Closed execution channel");
        }
    }

    /// Number of executions with an open channel.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl EventSink for ExecutionHub {
    fn emit(&self, event: &ExecutionEvent) {
        self.publish(event.execution_id, event.to_message());
        if event.event_type.is_terminal() {
            self.close(event.execution_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ExecutionEventType;

    #[tokio::test]
    async fn test_subscriber_receives_until_terminal() {
        let hub = ExecutionHub::new();
        let ws = Uuid::new_v4();
        let exec = Uuid::new_v4();
        let mut rx = hub.subscribe(exec);

        hub.emit(&ExecutionEvent::new(
            ExecutionEventType::ExecutionStarted,
            ws,
            exec,
        ));
        hub.emit(&ExecutionEvent::new(
            ExecutionEventType::ExecutionCompleted,
            ws,
            exec,
        ));

        assert_eq!(rx.recv().await.unwrap()["type"], "execution_started");
        assert_eq!(rx.recv().await.unwrap()["type"], "execution_completed");
        assert!(rx.recv().await.is_err());
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = ExecutionHub::new();
        assert_eq!(hub.publish(Uuid::new_v4(), Value::Null), 0);
    }

    #[tokio::test]
    async fn test_executions_are_isolated() {
        let hub = ExecutionHub::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = hub.subscribe(a);
        let _rx_b = hub.subscribe(b);
        hub.publish(b, serde_json::json!({"type": "execution_started"}));
        hub.publish(a, serde_json::json!({"type": "execution_failed"}));
        assert_eq!(rx_a.recv().await.unwrap()["type"], "execution_failed");
    }
}
