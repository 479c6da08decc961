// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sequenced persistence of runtime events.
//!
//! [`EventRecorder::record`] sanitizes, assigns severity and a sequence number,
//! persists, then hands the stored row to every registered [`EventDispatcher`]
//! on its own task. Dispatchers never affect the outcome of `record`.
//!
//! [`EventRecorder::record_async`] queues into a bounded buffer drained by a
//! background task every [`FLUSH_INTERVAL`] or every [`BATCH_SIZE`] events.
//!
//! Sequence numbers come from one process-wide counter seeded from the store's
//! current maximum, so they increase strictly across all workspaces.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use backplane_engine::{EventSink, ExecutionEvent};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, OnceCell, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::catalog::{Severity, default_severity};
use super::sanitize::PiiSanitizer;
use crate::error::{CoreError, Result};
use crate::model::RequestMeta;
use crate::persistence::{EventQuery, EventRecord, EventStat, Persistence, StoreError};

/// Async buffer capacity; events beyond it are dropped.
pub const BUFFER_CAPACITY: usize = 1000;
/// Buffered events written per batch.
pub const BATCH_SIZE: usize = 100;
/// Maximum age of a buffered event before it is written.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Receives every persisted event.
///
/// Implementations swallow and log their own failures.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Handles one persisted event.
    async fn dispatch(&self, event: &EventRecord);
}

/// An event under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeEvent {
    event_type: String,
    severity: Option<Severity>,
    workspace_id: Option<Uuid>,
    execution_id: Option<Uuid>,
    user_id: Option<Uuid>,
    session_id: Option<Uuid>,
    ip_hash: Option<String>,
    trace_id: Option<String>,
    request_id: Option<String>,
    node_id: Option<String>,
    node_type: Option<String>,
    http_method: Option<String>,
    http_path: Option<String>,
    http_status: Option<i32>,
    duration_ms: Option<i64>,
    error_code: Option<String>,
    error_message: Option<String>,
    message: Option<String>,
    metadata: Map<String, Value>,
}

impl RuntimeEvent {
    /// Starts an event of `event_type`.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            severity: None,
            workspace_id: None,
            execution_id: None,
            user_id: None,
            session_id: None,
            ip_hash: None,
            trace_id: None,
            request_id: None,
            node_id: None,
            node_type: None,
            http_method: None,
            http_path: None,
            http_status: None,
            duration_ms: None,
            error_code: None,
            error_message: None,
            message: None,
            metadata: Map::new(),
        }
    }

    /// The event type.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Overrides the catalog severity.
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn workspace(mut self, id: Uuid) -> Self {
        self.workspace_id = Some(id);
        self
    }

    pub fn execution(mut self, id: Uuid) -> Self {
        self.execution_id = Some(id);
        self
    }

    pub fn user(mut self, id: Option<Uuid>) -> Self {
        self.user_id = id;
        self
    }

    pub fn session(mut self, id: Option<Uuid>) -> Self {
        self.session_id = id;
        self
    }

    /// Copies correlators and the HTTP pair from request metadata.
    pub fn request(mut self, meta: &RequestMeta) -> Self {
        self.ip_hash = meta.ip_hash();
        if self.session_id.is_none() {
            self.session_id = meta.session_id;
        }
        self.trace_id = meta.trace_id.clone();
        self.request_id = meta.request_id.clone();
        self.http_method = meta.method.clone();
        self.http_path = meta.path.clone();
        self
    }

    pub fn ip_hash(mut self, hash: Option<String>) -> Self {
        self.ip_hash = hash;
        self
    }

    pub fn trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn node(mut self, node_id: impl Into<String>, node_type: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self.node_type = Some(node_type.into());
        self
    }

    pub fn http_status(mut self, status: u16) -> Self {
        self.http_status = Some(i32::from(status));
        self
    }

    pub fn duration_ms(mut self, ms: i64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    /// Attaches an error. Severity is raised to at least `error`.
    pub fn error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }

    /// Human-readable summary.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Adds one metadata entry.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Merges a metadata object; non-objects are stored under `data`.
    pub fn metadata(mut self, value: Value) -> Self {
        match value {
            Value::Object(map) => self.metadata.extend(map),
            Value::Null => {}
            other => {
                self.metadata.insert("data".into(), other);
            }
        }
        self
    }

    /// Severity after defaults and error escalation.
    pub fn effective_severity(&self) -> Severity {
        let base = self
            .severity
            .unwrap_or_else(|| default_severity(&self.event_type));
        if self.error_message.is_some() && base < Severity::Error {
            Severity::Error
        } else {
            base
        }
    }

    /// Converts an engine event.
    pub fn from_execution(event: &ExecutionEvent) -> Self {
        let mut ev = Self::new(event.event_type.as_str())
            .workspace(event.workspace_id)
            .execution(event.execution_id)
            .meta("progress", event.progress)
            .meta("total_nodes", event.total_nodes);
        if let Some(workflow_id) = event.workflow_id {
            ev = ev.meta("workflow_id", workflow_id.to_string());
        }
        if let Some(status) = &event.status {
            ev = ev.meta("status", status.clone());
        }
        if let (Some(id), Some(ty)) = (&event.node_id, &event.node_type) {
            ev = ev.node(id.clone(), ty.clone());
        }
        if let Some(ms) = event.duration_ms {
            ev = ev.duration_ms(i64::try_from(ms).unwrap_or(i64::MAX));
        }
        if let Some(err) = &event.error {
            ev = ev.error("EXECUTION_ERROR", err.clone());
        }
        ev
    }

    fn into_record(self, sequence_num: i64, created_at: DateTime<Utc>) -> EventRecord {
        let severity = self.effective_severity();
        EventRecord {
            id: Uuid::new_v4(),
            sequence_num,
            event_type: self.event_type,
            severity: severity.as_str().to_string(),
            workspace_id: self.workspace_id,
            execution_id: self.execution_id,
            user_id: self.user_id,
            session_id: self.session_id,
            ip_hash: self.ip_hash,
            trace_id: self.trace_id,
            request_id: self.request_id,
            node_id: self.node_id,
            node_type: self.node_type,
            http_method: self.http_method,
            http_path: self.http_path,
            http_status: self.http_status,
            duration_ms: self.duration_ms,
            error_code: self.error_code,
            error_message: self.error_message,
            message: self.message,
            metadata: Value::Object(self.metadata),
            created_at,
        }
    }
}

enum BufferMsg {
    Event(Box<RuntimeEvent>),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    persistence: Arc<dyn Persistence>,
    sanitizer: PiiSanitizer,
    sequence: AtomicI64,
    seeded: OnceCell<()>,
    dispatchers: RwLock<Vec<Arc<dyn EventDispatcher>>>,
}

impl Inner {
    async fn seed(&self) -> Result<()> {
        self.seeded
            .get_or_try_init(|| async {
                let max = self.persistence.max_event_sequence().await?;
                self.sequence.fetch_max(max, Ordering::SeqCst);
                debug!(sequence = max, "Seeded event sequence");
                Ok::<(), CoreError>(())
            })
            .await?;
        Ok(())
    }

    async fn persist(&self, event: RuntimeEvent) -> Result<EventRecord> {
        self.seed().await?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut record = event.into_record(seq, Utc::now());
        self.sanitizer.sanitize_event(&mut record);

        match self.persistence.insert_event(&record).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                // Another writer advanced the sequence; catch up once.
                let max = self.persistence.max_event_sequence().await?;
                self.sequence.fetch_max(max, Ordering::SeqCst);
                record.sequence_num = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                self.persistence.insert_event(&record).await?;
            }
            Err(e) => return Err(e.into()),
        }

        self.dispatch(&record);
        Ok(record)
    }

    fn dispatch(&self, record: &EventRecord) {
        let dispatchers = match self.dispatchers.read() {
            Ok(d) => d.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if dispatchers.is_empty() {
            return;
        }
        let record = Arc::new(record.clone());
        for dispatcher in dispatchers {
            let record = Arc::clone(&record);
            tokio::spawn(async move {
                dispatcher.dispatch(&record).await;
            });
        }
    }

    async fn drain(&self, batch: &mut Vec<RuntimeEvent>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        let mut failed = 0usize;
        for event in batch.drain(..) {
            if let Err(e) = self.persist(event).await {
                failed += 1;
                warn!(error = %e, "Failed to write buffered event");
            }
        }
        debug!(count, failed, "Flushed buffered events");
    }
}

async fn run_buffer(inner: Arc<Inner>, mut rx: mpsc::Receiver<BufferMsg>) {
    let mut batch: Vec<RuntimeEvent> = Vec::with_capacity(BATCH_SIZE);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(BufferMsg::Event(event)) => {
                    batch.push(*event);
                    if batch.len() >= BATCH_SIZE {
                        inner.drain(&mut batch).await;
                    }
                }
                Some(BufferMsg::Flush(ack)) => {
                    inner.drain(&mut batch).await;
                    let _ = ack.send(());
                }
                None => {
                    inner.drain(&mut batch).await;
                    break;
                }
            },
            _ = ticker.tick() => inner.drain(&mut batch).await,
        }
    }
    debug!("Event buffer writer stopped");
}

/// Event recorder. Cheap to share behind an `Arc`.
pub struct EventRecorder {
    inner: Arc<Inner>,
    tx: RwLock<Option<mpsc::Sender<BufferMsg>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl EventRecorder {
    /// Creates a recorder and starts its buffer writer. Must be called inside a
    /// Tokio runtime.
    pub fn new(persistence: Arc<dyn Persistence>, pii_masking: bool) -> Self {
        let inner = Arc::new(Inner {
            persistence,
            sanitizer: PiiSanitizer::new(pii_masking),
            sequence: AtomicI64::new(0),
            seeded: OnceCell::new(),
            dispatchers: RwLock::new(Vec::new()),
        });
        let (tx, rx) = mpsc::channel(BUFFER_CAPACITY);
        let writer = tokio::spawn(run_buffer(Arc::clone(&inner), rx));
        Self {
            inner,
            tx: RwLock::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Registers a dispatcher for every subsequently persisted event.
    pub fn add_dispatcher(&self, dispatcher: Arc<dyn EventDispatcher>) {
        let name = dispatcher.name();
        match self.inner.dispatchers.write() {
            Ok(mut d) => d.push(dispatcher),
            Err(poisoned) => poisoned.into_inner().push(dispatcher),
        }
        info!(dispatcher = name, "Registered event dispatcher");
    }

    /// The sanitizer applied before persistence.
    pub fn sanitizer(&self) -> PiiSanitizer {
        self.inner.sanitizer
    }

    /// Persists one event and returns the stored row.
    pub async fn record(&self, event: RuntimeEvent) -> Result<EventRecord> {
        let event_type = event.event_type.clone();
        self.inner.persist(event).await.inspect_err(|e| {
            warn!(event_type = %event_type, error = %e, "Failed to record event");
        })
    }

    /// Persists several events in order. Stops at the first failure.
    pub async fn record_batch(&self, events: Vec<RuntimeEvent>) -> Result<Vec<EventRecord>> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            out.push(self.record(event).await?);
        }
        Ok(out)
    }

    /// Queues an event without waiting. Drops it with a warning when the buffer
    /// is full or closed.
    pub fn record_async(&self, event: RuntimeEvent) {
        let tx = self.tx.read().ok().and_then(|guard| guard.clone());
        let Some(tx) = tx else {
            warn!(event_type = %event.event_type, "Event recorder closed, dropping event");
            return;
        };
        if let Err(e) = tx.try_send(BufferMsg::Event(Box::new(event))) {
            let event_type = match e.into_inner() {
                BufferMsg::Event(ev) => ev.event_type,
                BufferMsg::Flush(_) => String::new(),
            };
            warn!(event_type = %event_type, "Event buffer full, dropping event");
        }
    }

    /// Writes everything queued so far.
    pub async fn flush(&self) {
        let tx = self.tx.read().ok().and_then(|guard| guard.clone());
        let Some(tx) = tx else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(BufferMsg::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stops accepting async events, writes the remainder and stops the writer.
    pub async fn close(&self) {
        let tx = match self.tx.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tx);
        if let Some(handle) = self.writer.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Event buffer writer panicked");
            }
        }
        info!("Event recorder closed");
    }

    // ========================================================================
    // Convenience recorders
    // ========================================================================

    /// Workspace lifecycle or access event.
    pub async fn record_workspace_event(
        &self,
        event_type: &str,
        workspace_id: Uuid,
        session_id: Option<Uuid>,
        message: impl Into<String>,
        metadata: Value,
    ) -> Result<EventRecord> {
        self.record(
            RuntimeEvent::new(event_type)
                .workspace(workspace_id)
                .session(session_id)
                .message(message)
                .metadata(metadata),
        )
        .await
    }

    /// Execution-level event outside the engine stream.
    pub async fn record_execution_event(
        &self,
        event_type: &str,
        workspace_id: Uuid,
        execution_id: Uuid,
        duration_ms: Option<i64>,
        error: Option<&str>,
    ) -> Result<EventRecord> {
        let mut ev = RuntimeEvent::new(event_type)
            .workspace(workspace_id)
            .execution(execution_id);
        if let Some(ms) = duration_ms {
            ev = ev.duration_ms(ms);
        }
        if let Some(msg) = error {
            ev = ev.error("EXECUTION_ERROR", msg);
        }
        self.record(ev).await
    }

    /// Tenant database event.
    pub async fn record_db_event(
        &self,
        event_type: &str,
        workspace_id: Uuid,
        duration_ms: i64,
        error: Option<&str>,
        metadata: Value,
    ) -> Result<EventRecord> {
        let mut ev = RuntimeEvent::new(event_type)
            .workspace(workspace_id)
            .duration_ms(duration_ms)
            .metadata(metadata);
        if let Some(msg) = error {
            ev = ev.error("WORKSPACE_DB_ERROR", msg);
        }
        self.record(ev).await
    }

    /// Custom domain event.
    pub async fn record_domain_event(
        &self,
        event_type: &str,
        workspace_id: Uuid,
        domain: &str,
        duration_ms: i64,
        error: Option<&str>,
    ) -> Result<EventRecord> {
        let mut ev = RuntimeEvent::new(event_type)
            .workspace(workspace_id)
            .duration_ms(duration_ms)
            .meta("domain", domain);
        if let Some(msg) = error {
            ev = ev.error("DOMAIN_ERROR", msg);
        }
        self.record(ev).await
    }

    /// LLM call event with token counts.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_llm_event(
        &self,
        event_type: &str,
        workspace_id: Option<Uuid>,
        provider: &str,
        model: &str,
        duration_ms: i64,
        prompt_tokens: u64,
        completion_tokens: u64,
        error: Option<&str>,
    ) -> Result<EventRecord> {
        let mut ev = RuntimeEvent::new(event_type)
            .duration_ms(duration_ms)
            .metadata(json!({
                "provider": provider,
                "model": model,
                "prompt_tokens": prompt_tokens,
                "completion_tokens": completion_tokens,
                "total_tokens": prompt_tokens + completion_tokens,
            }));
        if let Some(ws) = workspace_id {
            ev = ev.workspace(ws);
        }
        if let Some(msg) = error {
            ev = ev.error("LLM_ERROR", msg);
        }
        self.record(ev).await
    }

    /// Security event keyed by request metadata.
    pub async fn record_security_event(
        &self,
        event_type: &str,
        workspace_id: Option<Uuid>,
        meta: &RequestMeta,
        reason: &str,
    ) -> Result<EventRecord> {
        let mut ev = RuntimeEvent::new(event_type)
            .request(meta)
            .message(reason)
            .meta("reason", reason);
        if let Some(ua) = meta.user_agent_hash() {
            ev = ev.meta("user_agent_hash", ua);
        }
        if let Some(ws) = workspace_id {
            ev = ev.workspace(ws);
        }
        self.record(ev).await
    }

    /// Process-level event.
    pub async fn record_system_event(
        &self,
        event_type: &str,
        message: &str,
        error: Option<&str>,
    ) -> Result<EventRecord> {
        let mut ev = RuntimeEvent::new(event_type).message(message);
        if let Some(msg) = error {
            ev = ev.error("SYSTEM_ERROR", msg);
        }
        self.record(ev).await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Events of one execution in sequence order.
    pub async fn events_by_execution(&self, execution_id: Uuid) -> Result<Vec<EventRecord>> {
        Ok(self
            .inner
            .persistence
            .list_events(&EventQuery {
                execution_id: Some(execution_id),
                limit: 1000,
                ..Default::default()
            })
            .await?)
    }

    /// Events sharing a trace id in sequence order.
    pub async fn events_by_trace(&self, trace_id: &str) -> Result<Vec<EventRecord>> {
        Ok(self
            .inner
            .persistence
            .list_events(&EventQuery {
                trace_id: Some(trace_id.to_string()),
                limit: 1000,
                ..Default::default()
            })
            .await?)
    }

    /// Filtered listing.
    pub async fn query(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        Ok(self.inner.persistence.list_events(query).await?)
    }

    /// Counts per type and severity since `since`.
    pub async fn stats(&self, workspace_id: Uuid, since: DateTime<Utc>) -> Result<Vec<EventStat>> {
        Ok(self.inner.persistence.event_stats(workspace_id, since).await?)
    }

    /// Events with a sequence number above `sequence_num`, for incremental readers.
    pub async fn stream_after(&self, sequence_num: i64, limit: i64) -> Result<Vec<EventRecord>> {
        let limit = if limit <= 0 { 100 } else { limit.min(1000) };
        Ok(self.inner.persistence.events_after(sequence_num, limit).await?)
    }
}

impl EventSink for EventRecorder {
    fn emit(&self, event: &ExecutionEvent) {
        self.record_async(RuntimeEvent::from_execution(event));
    }
}
