// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for backplane-core integration tests.
//!
//! Provides a fully wired in-memory [`AppContext`] and record builders.

#![allow(dead_code)]

use std::sync::Arc;

use backplane_core::cache::CacheConfig;
use backplane_core::config::{Config, StorageBackend};
use backplane_core::model::RequestMeta;
use backplane_core::persistence::{
    EventQuery, MemoryPersistence, Persistence, VersionRecord, WorkspaceRecord,
};
use backplane_core::tenant_db::{MemoryTenantAdmin, TenantDbConfig};
use backplane_core::workers::{ConnectorHealthConfig, RetentionConfig};
use backplane_core::AppContext;
use backplane_engine::EngineConfig;
use base64::Engine as _;
use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

/// In-memory backplane with a simulated tenant database server.
pub struct TestContext {
    pub ctx: AppContext,
    pub store: Arc<MemoryPersistence>,
    pub tenant_admin: MemoryTenantAdmin,
}

impl TestContext {
    pub fn new() -> Self {
        let store = Arc::new(MemoryPersistence::new());
        let tenant_admin = MemoryTenantAdmin::new();
        let ctx = AppContext::build(
            test_config(),
            store.clone(),
            Some(Arc::new(tenant_admin.clone())),
        )
        .expect("context builds");
        Self {
            ctx,
            store,
            tenant_admin,
        }
    }

    /// Stores `workspace`, attaching a two-node workflow version.
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
        encryption_key: base64::engine::general_purpose::STANDARD.encode([3u8; 32]),
        jwt_secret: Some("integration-secret".into()),
        pii_masking: true,
        captcha_secret: None,
        captcha_verify_url: "http://127.0.0.1:1/verify".into(),
        base_hosts: vec!["apps.example.com".into()],
        cache: CacheConfig::default(),
        engine: EngineConfig::default(),
        retention: RetentionConfig::default(),
        connector_health: ConnectorHealthConfig::default(),
        tenant_db: Some(TenantDbConfig::local()),
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

pub fn request(ip: &str) -> RequestMeta {
    RequestMeta {
        ip: Some(ip.to_string()),
        user_agent: Some("curl/8".into()),
        ..Default::default()
    }
}
