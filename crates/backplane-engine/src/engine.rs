// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The DAG executor.
//!
//! A node is *active* when it has no predecessors or when a completed predecessor
//! activated it. Branching nodes activate only the out-edges whose `sourceHandle`
//! matches their chosen handle (or every out-edge when none match). Inactive
//! nodes are skipped. Under `errorHandling = continue`, descendants of a failed
//! node are skipped as well.

use std::collections::{HashMap, HashSet};
use std::env;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::context::{ExecutionContext, TokenUsage};
use crate::dag::Dag;
use crate::definition::{DEFAULT_TIMEOUT_MS, ErrorHandling, NodeDefinition, WorkflowDefinition};
use crate::error::EngineError;
use crate::events::{EventSink, ExecutionEvent, ExecutionEventType};
use crate::executor::{ExecutorRegistry, NodeInput, NodeOutput};
use crate::retry::{RetryConfig, cancellable_sleep};

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum nodes running at once within one execution.
    pub max_concurrent: usize,
    /// Timeout applied when a definition does not set one.
    pub default_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl EngineConfig {
    /// Reads `BACKPLANE_ENGINE_MAX_CONCURRENT` and `BACKPLANE_ENGINE_TIMEOUT_MS`,
    /// falling back to the defaults for missing or non-positive values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent: env::var("BACKPLANE_ENGINE_MAX_CONCURRENT")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent),
            default_timeout: env::var("BACKPLANE_ENGINE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_timeout),
        }
    }
}

/// Terminal execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every reachable node finished (failures tolerated under `continue`).
    Completed,
    /// A node failed under `stop`, the definition was invalid, or the run timed out.
    Failed,
    /// Cancelled through the context.
    Cancelled,
}

impl ExecutionStatus {
    /// Persisted status string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Final node status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Succeeded.
    Completed,
    /// Failed after retries.
    Failed,
    /// Not activated, or downstream of a failure.
    Skipped,
    /// Interrupted by cancellation or timeout.
    Cancelled,
}

impl NodeStatus {
    /// Persisted status string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Record of one node in one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRun {
    /// Node id.
    pub node_id: String,
    /// The node's own type.
    pub node_type: String,
    /// Final status.
    pub status: NodeStatus,
    /// Inputs the node received.
    pub inputs: Map<String, Value>,
    /// Outputs the node produced.
    pub outputs: Map<String, Value>,
    /// Failure message.
    pub error: Option<String>,
    /// Attempts made, including retries.
    pub attempts: u32,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Finish time.
    pub finished_at: DateTime<Utc>,
    /// Elapsed milliseconds.
    pub duration_ms: u64,
}

/// Outcome of [`Engine::execute`].
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Execution id.
    pub execution_id: uuid::Uuid,
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Merged outputs of the end nodes, plus `output_schema` when output nodes exist.
    pub outputs: Map<String, Value>,
    /// Why the execution failed or was cancelled.
    pub error: Option<EngineError>,
    /// Per-node records in settle order.
    pub node_runs: Vec<NodeRun>,
    /// Aggregated LLM usage.
    pub token_usage: TokenUsage,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Finish time.
    pub finished_at: DateTime<Utc>,
    /// Elapsed milliseconds, at least 1.
    pub duration_ms: u64,
}

/// Runs workflow definitions.
#[derive(Debug, Clone)]
pub struct Engine {
    registry: ExecutorRegistry,
    config: EngineConfig,
}

struct NodeOutcome {
    run: NodeRun,
    output: Option<NodeOutput>,
    error: Option<EngineError>,
}

/// Shared bookkeeping for one run. Lives outside the timed future so partial
/// progress survives a timeout.
struct Tracker {
    total: u32,
    settled: AtomicU32,
    runs: Mutex<Vec<NodeRun>>,
    in_flight: Mutex<HashMap<String, (String, DateTime<Utc>, Map<String, Value>)>>,
}

impl Tracker {
    fn new(total: usize) -> Self {
        Self {
            total: u32::try_from(total).unwrap_or(u32::MAX),
            settled: AtomicU32::new(0),
            runs: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn settle(&self) -> u32 {
        let done = self.settled.fetch_add(1, Ordering::SeqCst) + 1;
        self.progress_of(done)
    }

    fn progress(&self) -> u32 {
        self.progress_of(self.settled.load(Ordering::SeqCst))
    }

    fn progress_of(&self, done: u32) -> u32 {
        if self.total == 0 {
            100
        } else {
            done.saturating_mul(100) / self.total
        }
    }

    fn push(&self, run: NodeRun) {
        self.runs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(run);
    }

    fn take_runs(&self) -> Vec<NodeRun> {
        std::mem::take(&mut *self.runs.lock().unwrap_or_else(|p| p.into_inner()))
    }

    fn start(&self, node: &NodeDefinition, inputs: &Map<String, Value>) {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(node.id.clone(), (node.node_type.clone(), Utc::now(), inputs.clone()));
    }

    fn finish(&self, node_id: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(node_id);
    }

    /// Marks every node still running as cancelled.
    fn cancel_in_flight(&self) {
        let pending: Vec<_> = self
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .collect();
        let now = Utc::now();
        for (node_id, (node_type, started_at, inputs)) in pending {
            self.push(NodeRun {
                node_id,
                node_type,
                status: NodeStatus::Cancelled,
                inputs,
                outputs: Map::new(),
                error: Some("execution cancelled".into()),
                attempts: 1,
                started_at,
                finished_at: now,
                duration_ms: elapsed_ms(started_at, now),
            });
        }
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}

/// What ended the level loop.
enum Halt {
    Completed { failed_nodes: Vec<String> },
    Failed(EngineError),
    Cancelled,
}

impl Engine {
    /// Creates an engine over a registry.
    pub fn new(registry: ExecutorRegistry, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    /// The executor registry.
    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs a definition to completion, failure, cancellation or timeout.
    ///
    /// Errors are reported in the returned [`ExecutionResult`] and through the
    /// terminal event; this never returns early without emitting one.
    pub async fn execute(
        &self,
        def: &WorkflowDefinition,
        inputs: Map<String, Value>,
        ctx: &ExecutionContext,
        sink: &dyn EventSink,
    ) -> ExecutionResult {
        let started = Instant::now();
        let started_at = Utc::now();

        let dag = Dag::build(def);
        let total = dag.as_ref().map_or(0, Dag::len);
        let tracker = Tracker::new(total);

        let mut started_event = self.event(ctx, ExecutionEventType::ExecutionStarted, &tracker);
        started_event.inputs = Some(inputs.clone());
        started_event.status = Some("running".into());
        sink.emit(&started_event);

        info!(
            execution_id = %ctx.execution_id,
            workspace_id = %ctx.workspace_id,
            total_nodes = total,
            "Workflow execution started"
        );

        for (k, v) in &inputs {
            ctx.set_variable(k.clone(), v.clone());
        }

        let halt = match &dag {
            Err(e) => Halt::Failed(e.clone()),
            Ok(dag) => {
                let timeout_ms = def.timeout_ms(
                    u64::try_from(self.config.default_timeout.as_millis()).unwrap_or(u64::MAX),
                );
                let run = self.run_levels(dag, def, ctx, sink, &tracker);
                match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
                    Ok(halt) => halt,
                    Err(_) => {
                        ctx.cancel();
                        tracker.cancel_in_flight();
                        Halt::Failed(EngineError::Timeout { timeout_ms })
                    }
                }
            }
        };

        let finished_at = Utc::now();
        let duration_ms = u64::try_from(started.elapsed().as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        let node_runs = tracker.take_runs();
        let token_usage = ctx.token_usage();

        let (status, error, outputs) = match halt {
            Halt::Completed { failed_nodes } => {
                let mut outputs = match &dag {
                    Ok(dag) => collect_outputs(dag, ctx, &node_runs),
                    Err(_) => Map::new(),
                };
                if !failed_nodes.is_empty() {
                    outputs.insert("failed_nodes".into(), json!(failed_nodes));
                }
                (ExecutionStatus::Completed, None, outputs)
            }
            Halt::Failed(e) => (ExecutionStatus::Failed, Some(e), Map::new()),
            Halt::Cancelled => (
                ExecutionStatus::Cancelled,
                Some(EngineError::Cancelled),
                Map::new(),
            ),
        };

        let event_type = match status {
            ExecutionStatus::Completed => ExecutionEventType::ExecutionCompleted,
            ExecutionStatus::Failed => ExecutionEventType::ExecutionFailed,
            ExecutionStatus::Cancelled => ExecutionEventType::ExecutionCancelled,
        };
        let mut terminal = self.event(ctx, event_type, &tracker);
        terminal.status = Some(status.as_str().into());
        terminal.duration_ms = Some(duration_ms);
        terminal.error = error.as_ref().map(ToString::to_string);
        if let Some(EngineError::NodeFailed { node_id, .. }) = &error {
            terminal.node_id = Some(node_id.clone());
        }
        if status == ExecutionStatus::Completed {
            terminal.outputs = Some(outputs.clone());
        }
        sink.emit(&terminal);

        match &error {
            None => info!(
                execution_id = %ctx.execution_id,
                duration_ms,
                "Workflow execution completed"
            ),
            Some(e) => warn!(
                execution_id = %ctx.execution_id,
                duration_ms,
                error = %e,
                "Workflow execution did not complete"
            ),
        }

        ExecutionResult {
            execution_id: ctx.execution_id,
            status,
            outputs,
            error,
            node_runs,
            token_usage,
            started_at,
            finished_at,
            duration_ms,
        }
    }

    fn event(
        &self,
        ctx: &ExecutionContext,
        event_type: ExecutionEventType,
        tracker: &Tracker,
    ) -> ExecutionEvent {
        let mut event = ExecutionEvent::new(event_type, ctx.workspace_id, ctx.execution_id);
        event.workflow_id = ctx.workflow_id;
        event.total_nodes = tracker.total;
        event.progress = tracker.progress();
        event
    }

    async fn run_levels(
        &self,
        dag: &Dag,
        def: &WorkflowDefinition,
        ctx: &ExecutionContext,
        sink: &dyn EventSink,
        tracker: &Tracker,
    ) -> Halt {
        let semaphore = Semaphore::new(self.config.max_concurrent.max(1));
        let mut active: HashSet<String> = HashSet::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut failed_nodes = Vec::new();

        for level in dag.levels() {
            if ctx.is_cancelled() {
                return Halt::Cancelled;
            }

            let mut runnable = Vec::with_capacity(level.len());
            for node_id in level {
                let has_preds = !dag.predecessors(node_id).is_empty();
                if blocked.contains(node_id) || (has_preds && !active.contains(node_id)) {
                    self.skip(dag, node_id, ctx, sink, tracker);
                } else {
                    runnable.push(node_id.as_str());
                }
            }
            if runnable.is_empty() {
                continue;
            }

            let outcomes = join_all(
                runnable
                    .iter()
                    .map(|id| self.run_node(dag, def, id, ctx, sink, tracker, &semaphore)),
            )
            .await;

            let mut cancelled = false;
            let mut first_failure = None;
            for outcome in outcomes {
                let node_id = outcome.run.node_id.clone();
                tracker.push(outcome.run);
                match (outcome.output, outcome.error) {
                    (Some(output), _) => activate(dag, &node_id, output.next_handle.as_deref(), &mut active),
                    (None, Some(EngineError::Cancelled)) => cancelled = true,
                    (None, error) => {
                        let error = error.unwrap_or_else(|| EngineError::node(&node_id, "node failed"));
                        failed_nodes.push(node_id.clone());
                        if first_failure.is_none() {
                            first_failure = Some(error);
                        }
                        blocked.extend(dag.descendants(&node_id));
                    }
                }
            }

            if cancelled || ctx.is_cancelled() {
                return Halt::Cancelled;
            }
            if let Some(error) = first_failure {
                if def.settings.error_handling == ErrorHandling::Stop {
                    return Halt::Failed(error);
                }
            }
        }

        Halt::Completed { failed_nodes }
    }

    fn skip(
        &self,
        dag: &Dag,
        node_id: &str,
        ctx: &ExecutionContext,
        sink: &dyn EventSink,
        tracker: &Tracker,
    ) {
        let now = Utc::now();
        let node_type = dag
            .node(node_id)
            .map(|n| n.node_type.clone())
            .unwrap_or_default();
        let progress = tracker.settle();
        let mut event = self.event(ctx, ExecutionEventType::ExecutionNodeSkipped, tracker);
        event.node_id = Some(node_id.to_string());
        event.node_type = Some(node_type.clone());
        event.status = Some(NodeStatus::Skipped.as_str().into());
        event.progress = progress;
        sink.emit(&event);
        debug!(execution_id = %ctx.execution_id, node_id, "Node skipped");

        tracker.push(NodeRun {
            node_id: node_id.to_string(),
            node_type,
            status: NodeStatus::Skipped,
            inputs: Map::new(),
            outputs: Map::new(),
            error: None,
            attempts: 0,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_node(
        &self,
        dag: &Dag,
        def: &WorkflowDefinition,
        node_id: &str,
        ctx: &ExecutionContext,
        sink: &dyn EventSink,
        tracker: &Tracker,
        semaphore: &Semaphore,
    ) -> NodeOutcome {
        let node = match dag.node(node_id) {
            Some(node) => node,
            None => {
                let now = Utc::now();
                return NodeOutcome {
                    run: NodeRun {
                        node_id: node_id.to_string(),
                        node_type: String::new(),
                        status: NodeStatus::Failed,
                        inputs: Map::new(),
                        outputs: Map::new(),
                        error: Some("node not found".into()),
                        attempts: 0,
                        started_at: now,
                        finished_at: now,
                        duration_ms: 0,
                    },
                    output: None,
                    error: Some(EngineError::node(node_id, "node not found")),
                };
            }
        };

        // Closed only on drop; acquire cannot fail.
        let _permit = semaphore.acquire().await.ok();

        let inputs = collect_inputs(dag, node, ctx);
        let started_at = Utc::now();
        tracker.start(node, &inputs);

        let mut event = self.event(ctx, ExecutionEventType::ExecutionNodeStarted, tracker);
        event.node_id = Some(node.id.clone());
        event.node_type = Some(node.node_type.clone());
        event.status = Some("running".into());
        event.inputs = Some(inputs.clone());
        sink.emit(&event);

        let retry = RetryConfig::for_node(node, &def.settings.retry_policy);
        let (result, attempts) = self.attempt(node, &inputs, ctx, retry).await;

        let finished_at = Utc::now();
        let duration_ms = elapsed_ms(started_at, finished_at);
        tracker.finish(&node.id);
        let progress = tracker.settle();

        match result {
            Ok(output) => {
                if let Some(usage) = output.token_usage {
                    ctx.add_token_usage(usage);
                }
                ctx.set_node_output(node.id.clone(), output.outputs.clone());

                let mut event = self.event(ctx, ExecutionEventType::ExecutionNodeCompleted, tracker);
                event.node_id = Some(node.id.clone());
                event.node_type = Some(node.node_type.clone());
                event.status = Some(NodeStatus::Completed.as_str().into());
                event.outputs = Some(output.outputs.clone());
                event.duration_ms = Some(duration_ms);
                event.progress = progress;
                sink.emit(&event);

                NodeOutcome {
                    run: NodeRun {
                        node_id: node.id.clone(),
                        node_type: node.node_type.clone(),
                        status: NodeStatus::Completed,
                        inputs,
                        outputs: output.outputs.clone(),
                        error: None,
                        attempts,
                        started_at,
                        finished_at,
                        duration_ms,
                    },
                    output: Some(output),
                    error: None,
                }
            }
            Err(error) => {
                let status = if error == EngineError::Cancelled {
                    NodeStatus::Cancelled
                } else {
                    NodeStatus::Failed
                };
                let message = match &error {
                    EngineError::NodeFailed { message, .. } => message.clone(),
                    other => other.to_string(),
                };

                if status == NodeStatus::Failed {
                    let mut event = self.event(ctx, ExecutionEventType::ExecutionNodeFailed, tracker);
                    event.node_id = Some(node.id.clone());
                    event.node_type = Some(node.node_type.clone());
                    event.status = Some(status.as_str().into());
                    event.error = Some(message.clone());
                    event.duration_ms = Some(duration_ms);
                    event.progress = progress;
                    sink.emit(&event);
                }

                let error = match error {
                    EngineError::Cancelled => EngineError::Cancelled,
                    EngineError::NodeFailed { .. } => error,
                    other => EngineError::node(&node.id, other.to_string()),
                };

                NodeOutcome {
                    run: NodeRun {
                        node_id: node.id.clone(),
                        node_type: node.node_type.clone(),
                        status,
                        inputs,
                        outputs: Map::new(),
                        error: Some(message),
                        attempts,
                        started_at,
                        finished_at,
                        duration_ms,
                    },
                    output: None,
                    error: Some(error),
                }
            }
        }
    }

    /// Runs the node's executor with retries, per-node timeout and cancellation.
    async fn attempt(
        &self,
        node: &NodeDefinition,
        inputs: &NodeInput,
        ctx: &ExecutionContext,
        retry: RetryConfig,
    ) -> (Result<NodeOutput, EngineError>, u32) {
        let executor = match self.registry.get(&node.node_type) {
            Ok(executor) => executor,
            Err(e) => return (Err(e), 1),
        };
        let node_timeout = node
            .config_u64("timeout")
            .filter(|t| *t > 0)
            .map(Duration::from_millis);
        let token = ctx.cancellation_token();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let call = executor.execute(node, inputs.clone(), ctx);
            let result = tokio::select! {
                _ = token.cancelled() => Err(EngineError::Cancelled),
                r = async {
                    match node_timeout {
                        Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                            Err(EngineError::node(
                                &node.id,
                                format!("node timeout after {}ms", limit.as_millis()),
                            ))
                        }),
                        None => call.await,
                    }
                } => r,
            };

            match result {
                Ok(output) => return (Ok(output), attempt),
                Err(EngineError::Cancelled) => return (Err(EngineError::Cancelled), attempt),
                Err(e) if attempt <= retry.max_retries => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        execution_id = %ctx.execution_id,
                        node_id = %node.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Node failed, retrying"
                    );
                    if let Err(cancelled) = cancellable_sleep(delay, token).await {
                        return (Err(cancelled), attempt);
                    }
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

/// Variables, then each predecessor's outputs under its id, then handle mappings.
fn collect_inputs(dag: &Dag, node: &NodeDefinition, ctx: &ExecutionContext) -> Map<String, Value> {
    let mut inputs = ctx.variables();
    for pred in dag.predecessors(&node.id) {
        let Some(outputs) = ctx.node_output(pred) else {
            continue;
        };
        if let Some(edge) = dag.edge_between(pred, &node.id) {
            if let (Some(src), Some(dst)) = (&edge.source_handle, &edge.target_handle) {
                if let Some(v) = outputs.get(src) {
                    inputs.insert(dst.clone(), v.clone());
                }
            }
        }
        inputs.insert(pred.clone(), Value::Object(outputs));
    }
    inputs
}

fn activate(dag: &Dag, node_id: &str, next_handle: Option<&str>, active: &mut HashSet<String>) {
    let edges = dag.out_edges(node_id);
    if let Some(handle) = next_handle {
        let matched: Vec<_> = edges
            .iter()
            .filter(|e| e.source_handle.as_deref() == Some(handle))
            .collect();
        if !matched.is_empty() {
            active.extend(matched.into_iter().map(|e| e.target.clone()));
            return;
        }
    }
    active.extend(edges.iter().map(|e| e.target.clone()));
}

/// Merges outputs of completed `end` nodes (or of completed sinks when there is no
/// `end` node) and attaches the output schema of `output` nodes.
fn collect_outputs(dag: &Dag, ctx: &ExecutionContext, runs: &[NodeRun]) -> Map<String, Value> {
    let completed: HashSet<&str> = runs
        .iter()
        .filter(|r| r.status == NodeStatus::Completed)
        .map(|r| r.node_id.as_str())
        .collect();

    let ends: Vec<&NodeDefinition> = dag.nodes().iter().filter(|n| n.node_type == "end").collect();
    let sources = if ends.is_empty() { dag.sinks() } else { ends };

    let mut outputs = Map::new();
    for node in sources {
        if completed.contains(node.id.as_str()) {
            if let Some(out) = ctx.node_output(&node.id) {
                outputs.extend(out);
            }
        }
    }

    if let Some(schema) = output_schema(dag, ctx, &completed) {
        outputs.insert("output_schema".into(), schema);
    }
    outputs
}

fn output_schema(dag: &Dag, ctx: &ExecutionContext, completed: &HashSet<&str>) -> Option<Value> {
    let mut nodes: Vec<&NodeDefinition> = dag
        .nodes()
        .iter()
        .filter(|n| n.node_type == "output" && completed.contains(n.id.as_str()))
        .collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));

    let items: Vec<Value> = nodes
        .into_iter()
        .filter_map(|node| {
            let out = ctx.node_output(&node.id)?;
            let value = out
                .get("output")
                .or_else(|| out.get("value"))
                .cloned()
                .unwrap_or(Value::Null);
            Some(json!({
                "node_id": node.id,
                "label": node.label,
                "title": out.get("title"),
                "type": out.get("type"),
                "value": value,
                "show_timestamp": out.get("showTimestamp"),
            }))
        })
        .collect();

    if items.is_empty() {
        None
    } else {
        Some(json!({"version": "1.0", "items": items}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::NodeExecutor;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    /// Fails the first `fail_times` calls, then succeeds.
    struct Flaky {
        fail_times: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NodeExecutor for Flaky {
        fn node_type(&self) -> &str {
            "flaky"
        }

        async fn execute(
            &self,
            node: &NodeDefinition,
            _input: NodeInput,
            _ctx: &ExecutionContext,
        ) -> crate::Result<NodeOutput> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(EngineError::node(&node.id, format!("failure {n}")))
            } else {
                Ok(NodeOutput::default())
            }
        }
    }

    struct Recorder(Mutex<Vec<(ExecutionEventType, Option<String>)>>);

    impl EventSink for Recorder {
        fn emit(&self, event: &ExecutionEvent) {
            self.0
                .lock()
                .unwrap()
                .push((event.event_type, event.node_id.clone()));
        }
    }

    fn engine_with(extra: Vec<Arc<dyn NodeExecutor>>) -> Engine {
        let mut registry = ExecutorRegistry::with_builtins();
        for e in extra {
            registry.register(e);
        }
        Engine::new(registry, EngineConfig::default())
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let flaky = Arc::new(Flaky {
            fail_times: 2,
            calls: AtomicUsize::new(0),
        });
        let engine = engine_with(vec![flaky.clone()]);
        let def = WorkflowDefinition::from_value(&json!({
            "nodes": [{"id": "a", "type": "flaky"}],
            "edges": [],
            "settings": {"retryPolicy": {"maxRetries": 2, "backoffMs": 100}}
        }))
        .unwrap();

        let result = engine.execute(&def, Map::new(), &ctx(), &crate::NoopSink).await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.node_runs[0].attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_condition_routes_branch() {
        let engine = engine_with(vec![]);
        let def = WorkflowDefinition::from_value(&json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "check", "type": "condition", "config": {"field": "amount", "operator": ">", "value": 100}},
                {"id": "big", "type": "template", "config": {"template": "big {{amount}}"}},
                {"id": "small", "type": "template", "config": {"template": "small {{amount}}"}},
                {"id": "end", "type": "end"}
            ],
            "edges": [
                {"source": "start", "target": "check"},
                {"source": "check", "target": "big", "sourceHandle": "true"},
                {"source": "check", "target": "small", "sourceHandle": "false"},
                {"source": "big", "target": "end"}
            ]
        }))
        .unwrap();
        let mut inputs = Map::new();
        inputs.insert("amount".into(), json!(250));
        let sink = Recorder(Mutex::new(Vec::new()));

        let result = engine.execute(&def, inputs, &ctx(), &sink).await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        let small = result.node_runs.iter().find(|r| r.node_id == "small").unwrap();
        assert_eq!(small.status, NodeStatus::Skipped);
        assert_eq!(result.outputs["big"]["text"], json!("big 250"));

        let events = sink.0.lock().unwrap();
        assert!(events.contains(&(
            ExecutionEventType::ExecutionNodeSkipped,
            Some("small".to_string())
        )));
        assert_eq!(events.last().unwrap().0, ExecutionEventType::ExecutionCompleted);
    }

    #[tokio::test]
    async fn test_continue_skips_descendants_only() {
        let engine = engine_with(vec![Arc::new(Flaky {
            fail_times: usize::MAX,
            calls: AtomicUsize::new(0),
        })]);
        let def = WorkflowDefinition::from_value(&json!({
            "nodes": [
                {"id": "root", "type": "start"},
                {"id": "bad", "type": "flaky"},
                {"id": "after_bad", "type": "end"},
                {"id": "good", "type": "template", "config": {"template": "ok"}}
            ],
            "edges": [
                {"source": "root", "target": "bad"},
                {"source": "bad", "target": "after_bad"},
                {"source": "root", "target": "good"}
            ],
            "settings": {"errorHandling": "continue"}
        }))
        .unwrap();

        let result = engine.execute(&def, Map::new(), &ctx(), &crate::NoopSink).await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        let status = |id: &str| result.node_runs.iter().find(|r| r.node_id == id).unwrap().status;
        assert_eq!(status("bad"), NodeStatus::Failed);
        assert_eq!(status("after_bad"), NodeStatus::Skipped);
        assert_eq!(status("good"), NodeStatus::Completed);
        assert_eq!(result.outputs["failed_nodes"], json!(["bad"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_outstanding_nodes() {
        let engine = engine_with(vec![]);
        let def = WorkflowDefinition::from_value(&json!({
            "nodes": [{"id": "wait", "type": "delay", "config": {"duration": 60000}}],
            "edges": [],
            "settings": {"timeout": 1000}
        }))
        .unwrap();
        let ctx = ctx();

        let result = engine.execute(&def, Map::new(), &ctx, &crate::NoopSink).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error, Some(EngineError::Timeout { timeout_ms: 1000 }));
        assert_eq!(result.node_runs[0].status, NodeStatus::Cancelled);
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let engine = engine_with(vec![]);
        let def = WorkflowDefinition::from_value(&json!({
            "nodes": [{"id": "a", "type": "start"}],
            "edges": []
        }))
        .unwrap();
        let ctx = ctx();
        ctx.cancel();
        let sink = Recorder(Mutex::new(Vec::new()));

        let result = engine.execute(&def, Map::new(), &ctx, &sink).await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        let events = sink.0.lock().unwrap();
        assert_eq!(
            events.iter().map(|e| e.0).collect::<Vec<_>>(),
            vec![
                ExecutionEventType::ExecutionStarted,
                ExecutionEventType::ExecutionCancelled
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_definition_fails() {
        let engine = engine_with(vec![]);
        let def = WorkflowDefinition::from_value(&json!({
            "nodes": [{"id": "a", "type": "start"}, {"id": "b", "type": "start"}],
            "edges": [{"source": "a", "target": "b"}, {"source": "b", "target": "a"}]
        }))
        .unwrap();
        let result = engine.execute(&def, Map::new(), &ctx(), &crate::NoopSink).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(matches!(result.error, Some(EngineError::InvalidDefinition(_))));
    }

    #[tokio::test]
    async fn test_unknown_node_type_fails() {
        let engine = engine_with(vec![]);
        let def = WorkflowDefinition::from_value(&json!({
            "nodes": [{"id": "a", "type": "teleport"}],
            "edges": []
        }))
        .unwrap();
        let result = engine.execute(&def, Map::new(), &ctx(), &crate::NoopSink).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.node_runs[0].node_type, "teleport");
        assert!(result.node_runs[0].error.as_deref().unwrap().contains("teleport"));
    }

    #[tokio::test]
    async fn test_output_schema_and_handle_mapping() {
        let engine = engine_with(vec![]);
        let def = WorkflowDefinition::from_value(&json!({
            "nodes": [
                {"id": "t", "type": "template", "config": {"template": "Hi {{name}}"}},
                {"id": "out", "type": "output", "label": "Greeting", "config": {"title": "Result", "value": "{{greeting}}"}}
            ],
            "edges": [{"source": "t", "target": "out", "sourceHandle": "text", "targetHandle": "greeting"}]
        }))
        .unwrap();
        let mut inputs = Map::new();
        inputs.insert("name".into(), json!("Ada"));

        let result = engine.execute(&def, inputs, &ctx(), &crate::NoopSink).await;
        let schema = &result.outputs["output_schema"];
        assert_eq!(schema["items"][0]["value"], json!("Hi Ada"));
        assert_eq!(schema["items"][0]["label"], json!("Greeting"));
        assert_eq!(schema["items"][0]["title"], json!("Result"));
    }
}
