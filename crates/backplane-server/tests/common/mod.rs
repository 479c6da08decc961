// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for the HTTP surface.

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, Response};
use backplane_core::AppContext;
use backplane_core::auth::AuthService;
use backplane_core::cache::CacheConfig;
use backplane_core::config::{Config, StorageBackend};
use backplane_core::persistence::{
    EventQuery, MemoryPersistence, Persistence, VersionRecord, WorkspaceRecord,
};
use backplane_core::workers::{ConnectorHealthConfig, RetentionConfig};
use backplane_engine::EngineConfig;
use backplane_server::{AppState, build_router};
use base64::Engine as _;
use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

pub struct TestServer {
    pub ctx: Arc<AppContext>,
    pub store: Arc<MemoryPersistence>,
    pub router: Router,
}

impl TestServer {
    pub fn new() -> Self {
        let store = Arc::new(MemoryPersistence::new());
        let mut ctx = AppContext::build(test_config(), store.clone(), None).expect("context builds");
        // Low bcrypt cost keeps the auth round trips fast.
        ctx.auth = Arc::new(
            AuthService::new(
                ctx.persistence.clone(),
                Arc::clone(&ctx.recorder),
                ctx.config.jwt_secret.clone(),
            )
            .with_bcrypt_cost(4),
        );
        let ctx = Arc::new(ctx);
        let router = build_router(AppState::new(Arc::clone(&ctx)));
        Self { ctx, store, router }
    }

    /// Stores `workspace` with a start→end workflow version.
    pub async fn publish(&self, mut workspace: WorkspaceRecord) -> WorkspaceRecord {
        let version = VersionRecord {
            id: Uuid::new_v4(),
            workspace_id: workspace.id,
            version: "1.0.0".into(),
            workflow_definition: Some(json!({
                "nodes": [{"id": "in", "type": "start"}, {"id": "out", "type": "end"}],
                "edges": [{"source": "in", "target": "out"}]
            })),
            ui_schema: None,
            db_schema: None,
            config: json!({}),
            changelog: None,
            created_by: workspace.owner_user_id,
            created_at: Utc::now(),
        };
        self.store.create_version(&version).await.unwrap();
        workspace.current_version_id = Some(version.id);
        self.store.create_workspace(&workspace).await.unwrap();
        workspace
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        use tower::ServiceExt;
        self.router.clone().oneshot(request).await.expect("response")
    }

    pub async fn count_events(&self, workspace_id: Uuid, event_type: &str) -> usize {
        self.store
            .list_events(&EventQuery {
                workspace_id: Some(workspace_id),
                event_types: vec![event_type.to_string()],
                ..Default::default()
            })
            .await
            .unwrap()
            .len()
    }
}

pub fn test_config() -> Config {
    Config {
        storage: StorageBackend::Memory,
        database_url: None,
        http_port: 0,
        encryption_key: base64::engine::general_purpose::STANDARD.encode([5u8; 32]),
        jwt_secret: Some("http-secret".into()),
        pii_masking: true,
        captcha_secret: None,
        captcha_verify_url: "http://127.0.0.1:1/verify".into(),
        base_hosts: vec!["apps.example.com".into()],
        cache: CacheConfig::default(),
        engine: EngineConfig::default(),
        retention: RetentionConfig::default(),
        connector_health: ConnectorHealthConfig::default(),
        tenant_db: None,
        smtp: None,
        twilio: None,
    }
}

pub fn workspace(slug: &str) -> WorkspaceRecord {
    let now = Utc::now();
    WorkspaceRecord {
        id: Uuid::new_v4(),
        slug: slug.to_string(),
        name: format!("{slug} app"),
        description: None,
        owner_user_id: Uuid::new_v4(),
        app_status: "published".into(),
        access_mode: "public_anonymous".into(),
        data_classification: "public".into(),
        rate_limit: Value::Null,
        require_captcha: false,
        allowed_origins: Vec::new(),
        current_version_id: None,
        plan_code: "free".into(),
        settings: json!({}),
        deleted_at: None,
        purge_after: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn get(uri: &str, ip: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-forwarded-for", ip)
        .header("user-agent", "curl/8")
}

pub fn post(uri: &str, ip: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-forwarded-for", ip)
        .header("user-agent", "curl/8")
        .header("content-type", "application/json")
}

pub fn json_request(builder: axum::http::request::Builder, body: Value) -> Request<Body> {
    builder.body(Body::from(body.to_string())).expect("request")
}

pub fn empty(builder: axum::http::request::Builder) -> Request<Body> {
    builder.body(Body::empty()).expect("request")
}

pub async fn read_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}
