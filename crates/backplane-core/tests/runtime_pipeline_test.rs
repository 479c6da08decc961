// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime pipeline through a fully wired context: resolve, guard, meter, run.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use backplane_core::auth::{AuthService, LoginRequest, RegisterAppUser};
use backplane_core::crypto::sha256_hex;
use backplane_core::events::types;
use backplane_core::model::Caller;
use backplane_core::persistence::Persistence;
use backplane_core::runtime::{ExecuteRequest, RuntimeAddress};
use backplane_core::CoreError;
use chrono::{Duration, Utc};
use serde_json::{Map, json};

use common::{TestContext, request, workspace};

fn slug(s: &str) -> RuntimeAddress {
    RuntimeAddress::Slug(s.to_string())
}

#[tokio::test]
async fn test_anonymous_entry_first_call() {
    let t = TestContext::new();
    let ws = t.publish(workspace("demo")).await;

    let entry = t
        .ctx
        .runtime
        .entry(&slug("demo"), &Caller::anonymous(), &request("1.2.3.4"))
        .await
        .unwrap();
    assert_eq!(entry.workspace.slug, "demo");
    assert_eq!(entry.workspace.access_mode, "public_anonymous");

    let session = t
        .store
        .get_session(entry.session_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.session_type, "anon");
    assert_eq!(session.ip_hash, Some(sha256_hex("1.2.3.4")));
    let ttl = session.expired_at - Utc::now();
    assert!(ttl > Duration::hours(23) && ttl <= Duration::hours(24));

    assert_eq!(t.count_events(ws.id, types::RUNTIME_ENTRY).await, 1);
    assert_eq!(t.count_events(ws.id, types::WORKSPACE_ACCESSED).await, 1);
}

#[tokio::test]
async fn test_execute_blocked_by_quota() {
    let t = TestContext::new();
    let ws = t.publish(workspace("demo")).await;
    t.ctx
        .billing
        .consume_usage(
            &ws,
            &BTreeMap::from([("requests".to_string(), 9999.0)]),
            Utc::now(),
        )
        .await
        .unwrap();

    let mut inputs = Map::new();
    inputs.insert("x".into(), json!(1));
    let err = t
        .ctx
        .runtime
        .execute(
            &slug("demo"),
            &Caller::anonymous(),
            &request("1.2.3.4"),
            ExecuteRequest {
                inputs,
                trigger_type: Some("app_runtime".into()),
                captcha_token: None,
                usage: Some(BTreeMap::from([("requests".to_string(), 2.0)])),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "QUOTA_EXCEEDED");
    assert_eq!(err.http_status(), 403);
    assert_eq!(err.public_message(), "配额已超限");

    let quota = t
        .store
        .get_active_quota(ws.id, Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(quota.usage["requests"], json!(10001.0));
    assert_eq!(quota.status, "exceeded");
    assert_eq!(t.ctx.executions.running_count(), 0);
}

#[tokio::test]
async fn test_fourth_entry_is_rate_limited() {
    let t = TestContext::new();
    let mut ws = workspace("demo");
    ws.rate_limit = json!({"per_ip": {"max_requests": 3, "window_seconds": 60}});
    let ws = t.publish(ws).await;
    let meta = request("1.2.3.4");

    for _ in 0..3 {
        t.ctx
            .runtime
            .entry(&slug("demo"), &Caller::anonymous(), &meta)
            .await
            .unwrap();
    }
    let err = t
        .ctx
        .runtime
        .entry(&slug("demo"), &Caller::anonymous(), &meta)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "RATE_LIMITED");
    assert!(err.retry_after().unwrap().as_secs() >= 1);
    assert_eq!(t.count_events(ws.id, types::RUNTIME_RATE_LIMITED).await, 1);

    // Another address is unaffected.
    t.ctx
        .runtime
        .entry(&slug("demo"), &Caller::anonymous(), &request("5.6.7.8"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_public_auth_app_user_flow() {
    let t = TestContext::new();
    let mut ws = workspace("members");
    ws.access_mode = "public_auth".into();
    let ws = t.publish(ws).await;
    let auth = AuthService::new(
        t.ctx.persistence.clone(),
        Arc::clone(&t.ctx.recorder),
        t.ctx.config.jwt_secret.clone(),
    )
    .with_bcrypt_cost(4);
    let meta = request("9.9.9.9");

    let anonymous = t
        .ctx
        .runtime
        .entry(&slug("members"), &Caller::anonymous(), &meta)
        .await
        .unwrap_err();
    assert_eq!(anonymous, CoreError::Unauthorized);

    let user = auth
        .register(
            ws.id,
            RegisterAppUser {
                email: "Member@Example.com".into(),
                password: "long enough".into(),
                display_name: None,
            },
        )
        .await
        .unwrap();
    let login = auth
        .login(
            ws.id,
            LoginRequest {
                email: "member@example.com".into(),
                password: "long enough".into(),
            },
            &meta,
        )
        .await
        .unwrap();

    let header = format!("Bearer {}", login.token);
    let caller = auth.resolve_bearer(ws.id, Some(&header)).await.unwrap();
    assert_eq!(caller.user_id, Some(user.id));
    let entry = t
        .ctx
        .runtime
        .entry(&slug("members"), &caller, &meta)
        .await
        .unwrap();
    assert!(entry.session_id.is_none());

    auth.logout(&login.token).await.unwrap();
    assert_eq!(
        auth.resolve_bearer(ws.id, Some(&header)).await,
        Err(CoreError::InvalidToken)
    );
    assert_eq!(t.count_events(ws.id, types::APP_USER_LOGIN).await, 1);
}

#[tokio::test]
async fn test_unpublished_and_unknown_workspaces() {
    let t = TestContext::new();
    let mut draft = workspace("draft-app");
    draft.app_status = "draft".into();
    t.publish(draft).await;

    let err = t
        .ctx
        .runtime
        .entry(&slug("draft-app"), &Caller::anonymous(), &request("1.1.1.1"))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::NotPublished);
    let err = t
        .ctx
        .runtime
        .entry(&slug("nobody"), &Caller::anonymous(), &request("1.1.1.1"))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::WorkspaceNotFound);
}
