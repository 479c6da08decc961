// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime service: entry, schema and execute for published workspaces.
//!
//! Every call runs the same pipeline before its own work:
//!
//! ```text
//! resolve ──► authorize ──► session ──► anti-abuse ──► request event ──► captcha
//! ```
//!
//! Execute then maps inputs through the UI schema, meters usage against the
//! quota and hands the run to the execution service.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::abuse::{AbuseCheck, AbuseGuard, AccessDecision, RequestKind};
use super::access::{access_mode_of, authorize, ensure_anonymous_session, presented_session};
use super::captcha::CaptchaVerifier;
use super::resolver::Resolver;
use super::ui_schema::UiSchema;
use crate::billing::BillingService;
use crate::cache::RuntimeCache;
use crate::error::{CoreError, Result};
use crate::events::{EventRecorder, RuntimeEvent, types};
use crate::execution::{DEFAULT_TRIGGER_TYPE, ExecutionService, StartExecution};
use crate::model::{AccessMode, Caller, RequestMeta};
use crate::persistence::{Persistence, SessionRecord, VersionRecord, WorkspaceRecord};

/// Message returned with an accepted execute.
pub const EXECUTE_STARTED_MESSAGE: &str = "执行已开始";

/// How the client addressed the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeAddress {
    /// `/runtime/{slug}/…`
    Slug(String),
    /// A bound custom domain or platform subdomain.
    Host(String),
}

/// A resolved, serving workspace.
#[derive(Debug, Clone)]
pub struct RuntimeEntry {
    /// The workspace record.
    pub workspace: WorkspaceRecord,
}

/// Public view of a workspace.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceDescriptor {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub app_status: String,
    pub access_mode: String,
    pub data_classification: String,
    pub require_captcha: bool,
    pub current_version_id: Option<Uuid>,
}

impl From<&WorkspaceRecord> for WorkspaceDescriptor {
    fn from(ws: &WorkspaceRecord) -> Self {
        Self {
            id: ws.id,
            slug: ws.slug.clone(),
            name: ws.name.clone(),
            description: ws.description.clone(),
            app_status: ws.app_status.clone(),
            access_mode: ws.access_mode.clone(),
            data_classification: ws.data_classification.clone(),
            require_captcha: ws.require_captcha,
            current_version_id: ws.current_version_id,
        }
    }
}

/// Session and anti-abuse verdict for one request.
#[derive(Debug, Clone)]
pub struct TrackedAccess {
    /// Session attached to the request. Anonymous workspaces always have one.
    pub session: Option<SessionRecord>,
    /// Anti-abuse decision.
    pub decision: AccessDecision,
}

impl TrackedAccess {
    /// Id of the attached session.
    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.id)
    }
}

/// Body of `GET …/entry`.
#[derive(Debug, Clone, Serialize)]
pub struct EntryResponse {
    pub workspace: WorkspaceDescriptor,
    /// Effective access mode after fallback for unknown values.
    pub access_mode: String,
    pub session_id: Option<Uuid>,
    pub require_captcha: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub risk_signals: Vec<String>,
}

/// Body of `GET …/schema`.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSchema {
    pub workspace_id: Uuid,
    pub version_id: Uuid,
    pub version: String,
    pub workflow_definition: Option<Value>,
    /// Normalized UI schema.
    pub ui_schema: Option<Value>,
    pub db_schema: Option<Value>,
    pub session_id: Option<Uuid>,
}

/// Body of `POST …/execute`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub trigger_type: Option<String>,
    #[serde(default)]
    pub captcha_token: Option<String>,
    /// Usage to meter; defaults to one request.
    #[serde(default)]
    pub usage: Option<BTreeMap<String, f64>>,
}

/// Response of an accepted execute.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    pub execution_id: Uuid,
    pub status: String,
    /// Version whose workflow runs.
    pub workflow_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub session_id: Option<Uuid>,
    pub message: String,
}

fn default_usage() -> BTreeMap<String, f64> {
    BTreeMap::from([("requests".to_string(), 1.0)])
}

// ============================================================================
// Service
// ============================================================================

/// The runtime pipeline shared by the slug and host surfaces.
pub struct RuntimeService {
    persistence: Arc<dyn Persistence>,
    cache: Arc<RuntimeCache>,
    resolver: Resolver,
    recorder: Arc<EventRecorder>,
    guard: AbuseGuard,
    captcha: Option<Arc<dyn CaptchaVerifier>>,
    billing: Arc<BillingService>,
    executions: Arc<ExecutionService>,
}

impl RuntimeService {
    /// Creates the service. `base_hosts` are platform domains whose first
    /// label is a workspace slug.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        cache: Arc<RuntimeCache>,
        recorder: Arc<EventRecorder>,
        billing: Arc<BillingService>,
        executions: Arc<ExecutionService>,
        base_hosts: Vec<String>,
    ) -> Self {
        Self {
            resolver: Resolver::new(Arc::clone(&persistence), Arc::clone(&cache), base_hosts),
            guard: AbuseGuard::new(Arc::clone(&persistence), Arc::clone(&recorder)),
            persistence,
            cache,
            recorder,
            captcha: None,
            billing,
            executions,
        }
    }

    /// Verifies captcha tokens. Without a verifier a non-empty
    /// token is accepted as is.
    pub fn with_captcha(mut self, verifier: Arc<dyn CaptchaVerifier>) -> Self {
        self.captcha = Some(verifier);
        self
    }

    /// Execution service backing execute.
    pub fn executions(&self) -> &Arc<ExecutionService> {
        &self.executions
    }

    /// Resolves an address to a serving workspace.
    pub async fn resolve(&self, address: &RuntimeAddress) -> Result<RuntimeEntry> {
        let workspace = match address {
            RuntimeAddress::Slug(slug) => self.resolver.resolve_by_slug(slug).await?,
            RuntimeAddress::Host(host) => self.resolver.resolve_by_host(host).await?,
        };
        Ok(RuntimeEntry { workspace })
    }

    /// Authorizes the caller, attaches a session, runs the anti-abuse checks
    /// and records the request. When the decision demands a captcha the
    /// request is refused without a valid token.
    ///
    /// Anonymous sessions are issued only for `public_anonymous` workspaces
    /// and only to callers without credentials.
    pub async fn track_access(
        &self,
        entry: &RuntimeEntry,
        caller: &Caller,
        meta: &RequestMeta,
        kind: RequestKind,
    ) -> Result<TrackedAccess> {
        let ws = &entry.workspace;
        let now = Utc::now();
        authorize(self.persistence.as_ref(), ws, caller).await?;

        let prior = presented_session(self.persistence.as_ref(), ws.id, meta).await?;
        let session = if access_mode_of(ws) == AccessMode::PublicAnonymous && !caller.is_authenticated() {
            Some(ensure_anonymous_session(self.persistence.as_ref(), ws.id, prior, meta, now).await?)
        } else {
            prior
        };

        let decision = self
            .guard
            .evaluate(AbuseCheck {
                workspace: ws,
                session: session.as_ref(),
                meta,
                kind,
                now,
            })
            .await?;

        let session_id = session.as_ref().map(|s| s.id);
        // Window counts read these rows, so they are written before returning.
        self.recorder
            .record(
                RuntimeEvent::new(kind.event_type())
                    .workspace(ws.id)
                    .user(caller.user_id)
                    .session(session_id)
                    .request(meta)
                    .meta("event_type", kind.as_str()),
            )
            .await?;
        self.recorder
            .record_workspace_event(
                types::WORKSPACE_ACCESSED,
                ws.id,
                session_id,
                format!("{} accessed", kind.as_str()),
                json!({
                    "event_type": kind.as_str(),
                    "access_mode": access_mode_of(ws).as_str(),
                    "authenticated": caller.is_authenticated(),
                }),
            )
            .await?;

        if decision.require_captcha {
            self.check_captcha(meta).await?;
        }

        Ok(TrackedAccess { session, decision })
    }

    /// `GET …/entry`
    pub async fn entry(
        &self,
        address: &RuntimeAddress,
        caller: &Caller,
        meta: &RequestMeta,
    ) -> Result<EntryResponse> {
        let entry = self.resolve(address).await?;
        self.entry_for(&entry, caller, meta).await
    }

    /// [`Self::entry`] for an already resolved workspace.
    pub async fn entry_for(
        &self,
        entry: &RuntimeEntry,
        caller: &Caller,
        meta: &RequestMeta,
    ) -> Result<EntryResponse> {
        let access = self
            .track_access(entry, caller, meta, RequestKind::Entry)
            .await?;
        Ok(EntryResponse {
            workspace: WorkspaceDescriptor::from(&entry.workspace),
            access_mode: access_mode_of(&entry.workspace).as_str().to_string(),
            session_id: access.session_id(),
            require_captcha: access.decision.require_captcha,
            risk_signals: access.decision.risk_signals,
        })
    }

    /// `GET …/schema`
    pub async fn schema(
        &self,
        address: &RuntimeAddress,
        caller: &Caller,
        meta: &RequestMeta,
    ) -> Result<RuntimeSchema> {
        let entry = self.resolve(address).await?;
        self.schema_for(&entry, caller, meta).await
    }

    /// [`Self::schema`] for an already resolved workspace.
    pub async fn schema_for(
        &self,
        entry: &RuntimeEntry,
        caller: &Caller,
        meta: &RequestMeta,
    ) -> Result<RuntimeSchema> {
        let access = self
            .track_access(entry, caller, meta, RequestKind::Schema)
            .await?;
        let version = self.current_version(&entry.workspace).await?;
        let ui_schema = match &version.ui_schema {
            Some(raw) => UiSchema::normalize(raw)?.map(|s| s.to_value()),
            None => None,
        };
        Ok(RuntimeSchema {
            workspace_id: entry.workspace.id,
            version_id: version.id,
            version: version.version,
            workflow_definition: version.workflow_definition,
            ui_schema,
            db_schema: version.db_schema,
            session_id: access.session_id(),
        })
    }

    /// `POST …/execute`
    pub async fn execute(
        &self,
        address: &RuntimeAddress,
        caller: &Caller,
        meta: &RequestMeta,
        request: ExecuteRequest,
    ) -> Result<ExecuteResponse> {
        let entry = self.resolve(address).await?;
        self.execute_for(&entry, caller, meta, request).await
    }

    /// [`Self::execute`] for an already resolved workspace.
    pub async fn execute_for(
        &self,
        entry: &RuntimeEntry,
        caller: &Caller,
        meta: &RequestMeta,
        request: ExecuteRequest,
    ) -> Result<ExecuteResponse> {
        let mut meta = meta.clone();
        if meta.captcha_token.is_none() {
            meta.captcha_token = request.captcha_token.clone();
        }
        let access = self
            .track_access(entry, caller, &meta, RequestKind::Execute)
            .await?;

        let started = self.start_execution(&entry.workspace, caller, &meta, &access, request).await;
        let ws_id = entry.workspace.id;
        match &started {
            Ok(resp) => {
                self.recorder.record_async(
                    RuntimeEvent::new(types::RUNTIME_EXECUTE_SUCCESS)
                        .workspace(ws_id)
                        .execution(resp.execution_id)
                        .user(caller.user_id)
                        .session(resp.session_id)
                        .request(&meta),
                );
                info!(
                    workspace_id = %ws_id,
                    execution_id = %resp.execution_id,
                    "Runtime execute accepted"
                );
            }
            Err(e) => {
                // Failure-rate detection counts these, so they are written now.
                let _ = self
                    .recorder
                    .record(
                        RuntimeEvent::new(types::RUNTIME_EXECUTE_FAILED)
                            .workspace(ws_id)
                            .user(caller.user_id)
                            .session(access.session_id())
                            .request(&meta)
                            .error(e.error_code(), e.to_string()),
                    )
                    .await;
                debug!(workspace_id = %ws_id, error = %e, "Runtime execute refused");
            }
        }
        started
    }

    async fn start_execution(
        &self,
        ws: &WorkspaceRecord,
        caller: &Caller,
        meta: &RequestMeta,
        access: &TrackedAccess,
        request: ExecuteRequest,
    ) -> Result<ExecuteResponse> {
        let version = self.current_version(ws).await?;
        if version.workflow_definition.is_none() {
            return Err(CoreError::WorkflowRequired);
        }
        let inputs = match version.ui_schema.as_ref().map(UiSchema::normalize).transpose()? {
            Some(Some(schema)) => schema.map_inputs(&request.inputs)?,
            _ => request.inputs,
        };

        let usage = request.usage.unwrap_or_else(default_usage);
        let outcome = self
            .billing
            .consume_usage(ws, &usage, Utc::now())
            .await
            .map_err(|e| match e {
                CoreError::InvalidUsage(_) | CoreError::InvalidDimension(_) => e,
                other => CoreError::BillingFailed(other.to_string()),
            })?;
        if !outcome.allowed {
            warn!(
                workspace_id = %ws.id,
                exceeded = ?outcome.exceeded,
                spend_cap = outcome.budget.spend_cap_exceeded,
                "Execute denied by quota"
            );
            return Err(CoreError::QuotaExceeded {
                exceeded: outcome.exceeded,
                reset_at: outcome.quota.period_end,
            });
        }

        let trigger_type = request
            .trigger_type
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TRIGGER_TYPE.to_string());
        let workflow_id = version.id;
        let mut start = StartExecution::new(ws.id, version, inputs);
        start.trigger_type = trigger_type;
        start.trigger_data = json!({
            "request_id": meta.request_id,
            "trace_id": meta.trace_id,
        });
        start.session_id = access.session_id();
        start.user_id = caller.user_id;

        let row = self.executions.start(start).await?;
        Ok(ExecuteResponse {
            execution_id: row.id,
            status: row.status,
            workflow_id,
            started_at: row.started_at,
            session_id: access.session_id(),
            message: EXECUTE_STARTED_MESSAGE.to_string(),
        })
    }

    async fn check_captcha(&self, meta: &RequestMeta) -> Result<()> {
        let token = meta
            .captcha_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(CoreError::CaptchaRequired)?;
        let Some(verifier) = &self.captcha else {
            return Ok(());
        };
        if verifier.verify(token, meta.ip.as_deref()).await? {
            Ok(())
        } else {
            Err(CoreError::CaptchaInvalid)
        }
    }

    async fn current_version(&self, ws: &WorkspaceRecord) -> Result<VersionRecord> {
        let id = ws.current_version_id.ok_or(CoreError::VersionRequired)?;
        self.cache
            .version_by_id(&self.persistence, id)
            .await?
            .filter(|v| v.workspace_id == ws.id)
            .ok_or(CoreError::VersionNotFound)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use backplane_engine::{Engine, EngineConfig, ExecutionHub, ExecutorRegistry};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::cache::CacheConfig;
    use crate::crypto::sha256_hex;
    use crate::events::types;
    use crate::persistence::{EventQuery, MemoryPersistence};
    use crate::runtime::test_support::{published_workspace, request_from};

    struct FixedVerifier(bool);

    #[async_trait]
    impl CaptchaVerifier for FixedVerifier {
        async fn verify(&self, _token: &str, _remote_ip: Option<&str>) -> Result<bool> {
            Ok(self.0)
        }
    }

    fn runtime(store: Arc<MemoryPersistence>) -> RuntimeService {
        let recorder = Arc::new(EventRecorder::new(store.clone(), false));
        let cache = Arc::new(RuntimeCache::new(&CacheConfig::default()));
        let billing = Arc::new(BillingService::new(store.clone(), Arc::clone(&recorder)));
        let executions = Arc::new(ExecutionService::new(
            store.clone(),
            Arc::new(Engine::new(ExecutorRegistry::with_builtins(), EngineConfig::default())),
            Arc::clone(&recorder),
            Arc::new(ExecutionHub::new()),
            CancellationToken::new(),
        ));
        RuntimeService::new(store, cache, recorder, billing, executions, Vec::new())
    }

    async fn workspace_with_version(store: &MemoryPersistence, slug: &str) -> WorkspaceRecord {
        let mut ws = published_workspace(slug);
        let version = VersionRecord {
            id: Uuid::new_v4(),
            workspace_id: ws.id,
            version: "1.0.0".into(),
            workflow_definition: Some(json!({
                "nodes": [{"id": "in", "type": "start"}, {"id": "out", "type": "end"}],
                "edges": [{"source": "in", "target": "out"}]
            })),
            ui_schema: None,
            db_schema: None,
            config: json!({}),
            changelog: None,
            created_by: ws.owner_user_id,
            created_at: Utc::now(),
        };
        store.create_version(&version).await.unwrap();
        ws.current_version_id = Some(version.id);
        store.create_workspace(&ws).await.unwrap();
        ws
    }

    async fn events_of(store: &MemoryPersistence, ws: Uuid, event_type: &str) -> usize {
        store
            .list_events(&EventQuery {
                workspace_id: Some(ws),
                event_types: vec![event_type.to_string()],
                ..Default::default()
            })
            .await
            .unwrap()
            .len()
    }

    fn slug(s: &str) -> RuntimeAddress {
        RuntimeAddress::Slug(s.into())
    }

    #[tokio::test]
    async fn test_entry_issues_anonymous_session() {
        let store = Arc::new(MemoryPersistence::new());
        let ws = published_workspace("demo");
        store.create_workspace(&ws).await.unwrap();
        let svc = runtime(store.clone());

        let resp = svc
            .entry(&slug("demo"), &Caller::anonymous(), &request_from("1.2.3.4"))
            .await
            .unwrap();
        assert_eq!(resp.workspace.slug, "demo");
        assert_eq!(resp.access_mode, "public_anonymous");
        let session = store.get_session(resp.session_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(session.session_type, "anon");
        assert_eq!(session.user_id, None);
        assert_eq!(session.ip_hash.as_deref(), Some(sha256_hex("1.2.3.4").as_str()));
        assert_eq!(events_of(&store, ws.id, types::RUNTIME_ENTRY).await, 1);
        assert_eq!(events_of(&store, ws.id, types::WORKSPACE_ACCESSED).await, 1);
    }

    #[tokio::test]
    async fn test_presented_session_is_reused() {
        let store = Arc::new(MemoryPersistence::new());
        let ws = published_workspace("demo");
        store.create_workspace(&ws).await.unwrap();
        let svc = runtime(store.clone());

        let first = svc
            .entry(&slug("demo"), &Caller::anonymous(), &request_from("1.2.3.4"))
            .await
            .unwrap();
        let mut meta = request_from("1.2.3.4");
        meta.session_id = first.session_id;
        let second = svc.entry(&slug("demo"), &Caller::anonymous(), &meta).await.unwrap();
        assert_eq!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn test_private_workspace_requires_owner() {
        let store = Arc::new(MemoryPersistence::new());
        let mut ws = published_workspace("private-app");
        ws.access_mode = "private".into();
        store.create_workspace(&ws).await.unwrap();
        let svc = runtime(store.clone());
        let meta = request_from("1.2.3.4");

        let err = svc.entry(&slug("private-app"), &Caller::anonymous(), &meta).await.unwrap_err();
        assert_eq!(err, CoreError::Unauthorized);
        let err = svc
            .entry(&slug("private-app"), &Caller::user(Uuid::new_v4()), &meta)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");
        let ok = svc
            .entry(&slug("private-app"), &Caller::user(ws.owner_user_id), &meta)
            .await
            .unwrap();
        assert!(ok.session_id.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_on_fourth_entry() {
        let store = Arc::new(MemoryPersistence::new());
        let mut ws = published_workspace("demo");
        ws.rate_limit = json!({"per_ip": {"max_requests": 3, "window_seconds": 60}});
        store.create_workspace(&ws).await.unwrap();
        let svc = runtime(store.clone());
        let meta = request_from("1.2.3.4");

        for _ in 0..3 {
            svc.entry(&slug("demo"), &Caller::anonymous(), &meta).await.unwrap();
        }
        let err = svc.entry(&slug("demo"), &Caller::anonymous(), &meta).await.unwrap_err();
        assert_eq!(err.http_status(), 429);
        assert!(err.retry_after().unwrap().as_secs() >= 1);
        assert_eq!(events_of(&store, ws.id, types::RUNTIME_RATE_LIMITED).await, 1);
    }

    #[tokio::test]
    async fn test_schema_requires_version() {
        let store = Arc::new(MemoryPersistence::new());
        let ws = published_workspace("no-version");
        store.create_workspace(&ws).await.unwrap();
        let svc = runtime(store.clone());
        let err = svc
            .schema(&slug("no-version"), &Caller::anonymous(), &request_from("1.2.3.4"))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::VersionRequired);

        workspace_with_version(&store, "with-version").await;
        let schema = svc
            .schema(&slug("with-version"), &Caller::anonymous(), &request_from("1.2.3.4"))
            .await
            .unwrap();
        assert_eq!(schema.version, "1.0.0");
        assert!(schema.workflow_definition.is_some());
    }

    #[tokio::test]
    async fn test_execute_starts_run_and_meters_request() {
        let store = Arc::new(MemoryPersistence::new());
        let ws = workspace_with_version(&store, "demo").await;
        let svc = runtime(store.clone());

        let mut inputs = Map::new();
        inputs.insert("x".into(), json!(1));
        let resp = svc
            .execute(
                &slug("demo"),
                &Caller::anonymous(),
                &request_from("1.2.3.4"),
                ExecuteRequest {
                    inputs,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.message, EXECUTE_STARTED_MESSAGE);
        assert_eq!(Some(resp.workflow_id), ws.current_version_id);
        let row = store.get_execution(resp.execution_id).await.unwrap().unwrap();
        assert_eq!(row.trigger_type, DEFAULT_TRIGGER_TYPE);
        assert_eq!(row.session_id, resp.session_id);

        let quota = store.get_active_quota(ws.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(quota.usage["requests"], json!(1.0));
    }

    #[tokio::test]
    async fn test_execute_denied_when_quota_exceeded() {
        let store = Arc::new(MemoryPersistence::new());
        let ws = workspace_with_version(&store, "demo").await;
        let svc = runtime(store.clone());
        svc.billing
            .consume_usage(&ws, &BTreeMap::from([("requests".to_string(), 9999.0)]), Utc::now())
            .await
            .unwrap();

        let err = svc
            .execute(
                &slug("demo"),
                &Caller::anonymous(),
                &request_from("1.2.3.4"),
                ExecuteRequest {
                    usage: Some(BTreeMap::from([("requests".to_string(), 2.0)])),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "QUOTA_EXCEEDED");
        assert_eq!(err.http_status(), 403);
        assert_eq!(err.public_message(), "配额已超限");

        let quota = store.get_active_quota(ws.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(quota.usage["requests"], json!(10001.0));
        assert_eq!(quota.status, "exceeded");
        assert_eq!(svc.executions().running_count(), 0);
        assert_eq!(events_of(&store, ws.id, types::RUNTIME_EXECUTE_FAILED).await, 1);
    }

    #[tokio::test]
    async fn test_execute_captcha() {
        let store = Arc::new(MemoryPersistence::new());
        let mut ws = published_workspace("guarded");
        ws.require_captcha = true;
        store.create_workspace(&ws).await.unwrap();
        let svc = runtime(store.clone()).with_captcha(Arc::new(FixedVerifier(false)));
        let meta = request_from("1.2.3.4");

        let err = svc
            .execute(&slug("guarded"), &Caller::anonymous(), &meta, ExecuteRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::CaptchaRequired);
        assert_eq!(events_of(&store, ws.id, types::CAPTCHA_REQUIRED).await, 1);

        let err = svc
            .execute(
                &slug("guarded"),
                &Caller::anonymous(),
                &meta,
                ExecuteRequest {
                    captcha_token: Some("bad".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::CaptchaInvalid);
    }

    #[tokio::test]
    async fn test_entry_and_schema_require_captcha() {
        let store = Arc::new(MemoryPersistence::new());
        let mut ws = published_workspace("guarded");
        ws.require_captcha = true;
        store.create_workspace(&ws).await.unwrap();
        let svc = runtime(store.clone()).with_captcha(Arc::new(FixedVerifier(true)));
        let meta = request_from("1.2.3.4");

        let err = svc
            .entry(&slug("guarded"), &Caller::anonymous(), &meta)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::CaptchaRequired);
        let err = svc
            .schema(&slug("guarded"), &Caller::anonymous(), &meta)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::CaptchaRequired);
        assert_eq!(events_of(&store, ws.id, types::CAPTCHA_REQUIRED).await, 2);

        let mut with_token = request_from("1.2.3.4");
        with_token.captcha_token = Some("solved".into());
        let resp = svc
            .entry(&slug("guarded"), &Caller::anonymous(), &with_token)
            .await
            .unwrap();
        assert!(resp.require_captcha);
        assert!(resp.session_id.is_some());
    }

    #[tokio::test]
    async fn test_schema_rejects_invalid_captcha() {
        let store = Arc::new(MemoryPersistence::new());
        let mut ws = workspace_with_version(&store, "guarded").await;
        ws.require_captcha = true;
        store.update_workspace(&ws).await.unwrap();
        let svc = runtime(store.clone()).with_captcha(Arc::new(FixedVerifier(false)));
        let mut meta = request_from("1.2.3.4");
        meta.captcha_token = Some("forged".into());

        let err = svc
            .schema(&slug("guarded"), &Caller::anonymous(), &meta)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::CaptchaInvalid);
    }
}
