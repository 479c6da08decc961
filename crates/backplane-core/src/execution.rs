// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution service.
//!
//! Persists execution rows around engine runs, stores one log row per node and
//! forwards engine events to the recorder and the WebSocket hub. Runs started
//! with [`ExecutionService::start`] continue on a background task; their
//! cancellation tokens are kept until the run settles.

use std::sync::Arc;

use backplane_engine::{
    Engine, EventSink, ExecutionContext, ExecutionHub, ExecutionResult, ExecutionStatus,
    FanoutSink, WorkflowDefinition,
};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::events::EventRecorder;
use crate::persistence::{ExecutionRecord, NodeLogRecord, Persistence, VersionRecord};

/// Execution row status values.
pub mod status {
    /// Created, not yet picked up.
    pub const PENDING: &str = "pending";
    /// Engine is running it.
    pub const RUNNING: &str = "running";
    /// Finished successfully.
    pub const COMPLETED: &str = "completed";
    /// Finished with an error.
    pub const FAILED: &str = "failed";
    /// Cancelled before finishing.
    pub const CANCELLED: &str = "cancelled";
}

/// Trigger type used when the caller does not name one.
pub const DEFAULT_TRIGGER_TYPE: &str = "app_runtime";

// ============================================================================
// Requests
// ============================================================================

/// Everything needed to start one run of a version's workflow.
#[derive(Debug, Clone)]
pub struct StartExecution {
    /// Owning workspace.
    pub workspace_id: Uuid,
    /// Version whose workflow runs.
    pub version: VersionRecord,
    /// Inputs handed to the engine.
    pub inputs: Map<String, Value>,
    /// How the run was triggered (`app_runtime`, `webhook`, ...).
    pub trigger_type: String,
    /// Free-form trigger details.
    pub trigger_data: Value,
    /// Runtime session that started it.
    pub session_id: Option<Uuid>,
    /// Authenticated caller.
    pub user_id: Option<Uuid>,
    /// Provider credentials visible to nodes.
    pub secrets: std::collections::HashMap<String, String>,
    /// Failed execution this run retries.
    pub retry_of: Option<Uuid>,
}

impl StartExecution {
    /// A request with empty trigger data, no caller and no secrets.
    pub fn new(workspace_id: Uuid, version: VersionRecord, inputs: Map<String, Value>) -> Self {
        Self {
            workspace_id,
            version,
            inputs,
            trigger_type: DEFAULT_TRIGGER_TYPE.to_string(),
            trigger_data: Value::Object(Map::new()),
            session_id: None,
            user_id: None,
            secrets: Default::default(),
            retry_of: None,
        }
    }
}

// ============================================================================
// Service
// ============================================================================

/// Starts, tracks and finalizes workflow executions.
pub struct ExecutionService {
    persistence: Arc<dyn Persistence>,
    engine: Arc<Engine>,
    recorder: Arc<EventRecorder>,
    hub: Arc<ExecutionHub>,
    running: DashMap<Uuid, CancellationToken>,
    shutdown: CancellationToken,
}

impl ExecutionService {
    /// Creates the service. `shutdown` cancels every run still in flight.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        engine: Arc<Engine>,
        recorder: Arc<EventRecorder>,
        hub: Arc<ExecutionHub>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            persistence,
            engine,
            recorder,
            hub,
            running: DashMap::new(),
            shutdown,
        }
    }

    /// WebSocket hub fed by every run.
    pub fn hub(&self) -> &Arc<ExecutionHub> {
        &self.hub
    }

    /// Number of runs in flight in this process.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Creates the execution row and runs the workflow on a background task.
    ///
    /// The returned row is in `running` state.
    pub async fn start(self: &Arc<Self>, request: StartExecution) -> Result<ExecutionRecord> {
        let (record, definition) = self.prepare(&request).await?;
        let cancel = self.shutdown.child_token();
        self.running.insert(record.id, cancel.clone());

        let service = Arc::clone(self);
        let row = record.clone();
        tokio::spawn(async move {
            let id = row.id;
            if let Err(e) = service
                .drive(row, &definition, request.inputs, request.secrets, cancel)
                .await
            {
                error!(execution_id = %id, error = %e, "Failed to finalize execution");
            }
        });
        Ok(record)
    }

    /// Creates the execution row and runs the workflow to completion inline.
    pub async fn run(&self, request: StartExecution) -> Result<ExecutionRecord> {
        let (record, definition) = self.prepare(&request).await?;
        let cancel = self.shutdown.child_token();
        self.running.insert(record.id, cancel.clone());
        self.drive(record, &definition, request.inputs, request.secrets, cancel)
            .await
    }

    async fn prepare(
        &self,
        request: &StartExecution,
    ) -> Result<(ExecutionRecord, WorkflowDefinition)> {
        if request.version.workspace_id != request.workspace_id {
            return Err(CoreError::VersionNotFound);
        }
        let raw = request
            .version
            .workflow_definition
            .as_ref()
            .filter(|v| !v.is_null())
            .ok_or(CoreError::WorkflowRequired)?;
        let definition = WorkflowDefinition::from_value(raw)
            .map_err(|e| CoreError::ExecuteFailed(e.to_string()))?;

        let trigger_type = match request.trigger_type.trim() {
            "" => DEFAULT_TRIGGER_TYPE.to_string(),
            t => t.to_string(),
        };
        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            workspace_id: request.workspace_id,
            version_id: Some(request.version.id),
            status: status::RUNNING.to_string(),
            trigger_type,
            trigger_data: request.trigger_data.clone(),
            inputs: Value::Object(request.inputs.clone()),
            outputs: None,
            error_message: None,
            duration_ms: None,
            token_usage: Value::Object(Map::new()),
            session_id: request.session_id,
            user_id: request.user_id,
            retry_of: request.retry_of,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.persistence
            .create_execution(&record)
            .await
            .map_err(|e| CoreError::ExecuteFailed(e.to_string()))?;
        info!(
            execution_id = %record.id,
            workspace_id = %record.workspace_id,
            trigger_type = %record.trigger_type,
            "Execution created"
        );
        Ok((record, definition))
    }

    async fn drive(
        &self,
        mut record: ExecutionRecord,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
        secrets: std::collections::HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<ExecutionRecord> {
        let mut ctx = ExecutionContext::new(record.workspace_id, record.id)
            .with_caller(record.user_id)
            .with_secrets(secrets)
            .with_parent_cancel(&cancel);
        if let Some(version_id) = record.version_id {
            ctx = ctx.with_workflow(version_id);
        }
        let sink = FanoutSink::new()
            .with(Arc::clone(&self.recorder) as Arc<dyn EventSink>)
            .with(Arc::clone(&self.hub) as Arc<dyn EventSink>);

        let result = self.engine.execute(definition, inputs, &ctx, &sink).await;
        self.running.remove(&record.id);

        apply_result(&mut record, &result);
        let logs = node_logs(&result);
        if let Err(e) = self.persistence.insert_node_logs(&logs).await {
            warn!(execution_id = %record.id, error = %e, "Failed to persist node logs");
        }
        self.persistence.update_execution(&record).await?;
        info!(
            execution_id = %record.id,
            status = %record.status,
            duration_ms = record.duration_ms.unwrap_or_default(),
            "Execution finished"
        );
        Ok(record)
    }

    /// Cancels a `pending` or `running` execution.
    ///
    /// In-process runs are signalled and settle as `cancelled` on their own.
    /// Rows without a live run here are marked `cancelled` directly.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<ExecutionRecord> {
        let mut record = self.get(execution_id).await?;
        if record.status != status::PENDING && record.status != status::RUNNING {
            return Err(CoreError::InvalidState {
                expected: "pending|running".into(),
                actual: record.status,
            });
        }
        if let Some((_, token)) = self.running.remove(&execution_id) {
            token.cancel();
            debug!(execution_id = %execution_id, "Cancellation signalled");
            return Ok(record);
        }
        let now = Utc::now();
        record.status = status::CANCELLED.to_string();
        record.error_message = Some("cancelled".into());
        record.finished_at = Some(now);
        record.duration_ms = Some((now - record.started_at).num_milliseconds().max(1));
        self.persistence.update_execution(&record).await?;
        Ok(record)
    }

    /// Starts a fresh run with the inputs and trigger of a `failed` execution.
    pub async fn retry(self: &Arc<Self>, execution_id: Uuid) -> Result<ExecutionRecord> {
        let failed = self.get(execution_id).await?;
        if failed.status != status::FAILED {
            return Err(CoreError::InvalidState {
                expected: status::FAILED.into(),
                actual: failed.status,
            });
        }
        let version_id = failed.version_id.ok_or(CoreError::VersionRequired)?;
        let version = self
            .persistence
            .get_version(version_id)
            .await?
            .ok_or(CoreError::VersionNotFound)?;
        let inputs = match failed.inputs {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let mut request = StartExecution::new(failed.workspace_id, version, inputs);
        request.trigger_type = failed.trigger_type;
        request.trigger_data = failed.trigger_data;
        request.session_id = failed.session_id;
        request.user_id = failed.user_id;
        request.retry_of = Some(failed.id);
        self.start(request).await
    }

    /// Loads one execution.
    pub async fn get(&self, execution_id: Uuid) -> Result<ExecutionRecord> {
        self.persistence
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("execution".into()))
    }

    /// Per-node logs of one execution.
    pub async fn node_logs(&self, execution_id: Uuid) -> Result<Vec<NodeLogRecord>> {
        Ok(self.persistence.list_node_logs(execution_id).await?)
    }
}

fn apply_result(record: &mut ExecutionRecord, result: &ExecutionResult) {
    record.status = match result.status {
        ExecutionStatus::Completed => status::COMPLETED,
        ExecutionStatus::Failed => status::FAILED,
        ExecutionStatus::Cancelled => status::CANCELLED,
    }
    .to_string();
    record.outputs = Some(Value::Object(result.outputs.clone()));
    record.error_message = result.error.as_ref().map(|e| e.to_string());
    record.duration_ms = Some(i64::try_from(result.duration_ms).unwrap_or(i64::MAX));
    record.token_usage = result.token_usage.to_value();
    record.finished_at = Some(result.finished_at);
}

fn node_logs(result: &ExecutionResult) -> Vec<NodeLogRecord> {
    result
        .node_runs
        .iter()
        .map(|run| NodeLogRecord {
            id: Uuid::new_v4(),
            execution_id: result.execution_id,
            node_id: run.node_id.clone(),
            node_type: run.node_type.clone(),
            status: run.status.as_str().to_string(),
            inputs: Value::Object(run.inputs.clone()),
            outputs: Value::Object(run.outputs.clone()),
            error: run.error.clone(),
            attempts: i32::try_from(run.attempts).unwrap_or(i32::MAX),
            started_at: run.started_at,
            finished_at: run.finished_at,
            duration_ms: i64::try_from(run.duration_ms).unwrap_or(i64::MAX),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use backplane_engine::{EngineConfig, ExecutorRegistry};
    use serde_json::json;

    use super::*;
    use crate::persistence::MemoryPersistence;

    fn version(workspace_id: Uuid, definition: Value) -> VersionRecord {
        VersionRecord {
            id: Uuid::new_v4(),
            workspace_id,
            version: "1.0.0".into(),
            workflow_definition: Some(definition),
            ui_schema: None,
            db_schema: None,
            config: json!({}),
            changelog: None,
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    fn service(store: Arc<MemoryPersistence>) -> Arc<ExecutionService> {
        let recorder = Arc::new(EventRecorder::new(store.clone(), false));
        Arc::new(ExecutionService::new(
            store,
            Arc::new(Engine::new(
                ExecutorRegistry::with_builtins(),
                EngineConfig::default(),
            )),
            recorder,
            Arc::new(ExecutionHub::new()),
            CancellationToken::new(),
        ))
    }

    async fn wait_settled(service: &ExecutionService, id: Uuid) -> ExecutionRecord {
        for _ in 0..200 {
            let row = service.get(id).await.unwrap();
            if row.status != status::RUNNING {
                return row;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {id} did not settle");
    }

    #[tokio::test]
    async fn test_run_persists_row_and_node_types() {
        let store = Arc::new(MemoryPersistence::new());
        let svc = service(store.clone());
        let ws = Uuid::new_v4();
        let v = version(
            ws,
            json!({
                "nodes": [{"id": "in", "type": "start"}, {"id": "out", "type": "end"}],
                "edges": [{"source": "in", "target": "out"}]
            }),
        );
        store.create_version(&v).await.unwrap();

        let mut inputs = Map::new();
        inputs.insert("x".into(), json!(1));
        let row = svc.run(StartExecution::new(ws, v, inputs)).await.unwrap();
        assert_eq!(row.status, status::COMPLETED);
        assert_eq!(row.trigger_type, DEFAULT_TRIGGER_TYPE);
        assert!(row.duration_ms.unwrap() >= 1);

        let logs = svc.node_logs(row.id).await.unwrap();
        let types: Vec<_> = logs.iter().map(|l| l.node_type.as_str()).collect();
        assert_eq!(types, vec!["start", "end"]);
        assert_eq!(svc.running_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_workflow_is_rejected() {
        let store = Arc::new(MemoryPersistence::new());
        let svc = service(store);
        let ws = Uuid::new_v4();
        let mut v = version(ws, Value::Null);
        v.workflow_definition = None;
        let err = svc
            .run(StartExecution::new(ws, v, Map::new()))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::WorkflowRequired);
    }

    #[tokio::test]
    async fn test_cancel_then_retry_rules() {
        let store = Arc::new(MemoryPersistence::new());
        let svc = service(store.clone());
        let ws = Uuid::new_v4();
        let v = version(
            ws,
            json!({"nodes": [{"id": "wait", "type": "delay", "config": {"duration": 5000}}]}),
        );
        store.create_version(&v).await.unwrap();

        let started = svc
            .start(StartExecution::new(ws, v.clone(), Map::new()))
            .await
            .unwrap();
        assert_eq!(started.status, status::RUNNING);
        tokio::time::sleep(Duration::from_millis(20)).await;
        svc.cancel(started.id).await.unwrap();
        let settled = wait_settled(&svc, started.id).await;
        assert_eq!(settled.status, status::CANCELLED);

        let err = svc.cancel(started.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
        assert!(matches!(
            svc.retry(started.id).await.unwrap_err(),
            CoreError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn test_retry_creates_fresh_execution() {
        let store = Arc::new(MemoryPersistence::new());
        let svc = service(store.clone());
        let ws = Uuid::new_v4();
        let v = version(ws, json!({"nodes": [{"id": "boom", "type": "no_such_type"}]}));
        store.create_version(&v).await.unwrap();

        let mut request = StartExecution::new(ws, v, Map::new());
        request.trigger_type = "webhook".into();
        let failed = svc.run(request).await.unwrap();
        assert_eq!(failed.status, status::FAILED);
        assert!(failed.error_message.is_some());

        let retried = svc.retry(failed.id).await.unwrap();
        assert_ne!(retried.id, failed.id);
        assert_eq!(retried.retry_of, Some(failed.id));
        assert_eq!(retried.trigger_type, "webhook");
        assert_eq!(wait_settled(&svc, retried.id).await.status, status::FAILED);
    }
}
