// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL backend checks. Skipped unless `TEST_BACKPLANE_DATABASE_URL` is set.

mod common;

use std::sync::Arc;

use backplane_core::crypto::sha256_hex;
use backplane_core::events::{EventRecorder, RuntimeEvent, types};
use backplane_core::migrations;
use backplane_core::persistence::{EventQuery, Persistence, PostgresPersistence, SessionRecord};
use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use common::workspace;

/// Helper macro to skip tests if database URL is not set.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_BACKPLANE_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_BACKPLANE_DATABASE_URL not set");
            return;
        }
    };
}

async fn get_test_store() -> Option<Arc<PostgresPersistence>> {
    let database_url = std::env::var("TEST_BACKPLANE_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    migrations::run_postgres(&pool).await.ok()?;
    Some(Arc::new(PostgresPersistence::new(pool)))
}

#[tokio::test]
async fn test_workspace_and_session_round_trip() {
    skip_if_no_db!();
    let store = get_test_store().await.expect("database available");

    let slug = format!("pg-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let ws = workspace(&slug);
    store.create_workspace(&ws).await.unwrap();
    let by_slug = store.get_workspace_by_slug(&slug).await.unwrap().unwrap();
    assert_eq!(by_slug.id, ws.id);
    assert_eq!(by_slug.access_mode, "public_anonymous");

    let now = Utc::now();
    let token_hash = sha256_hex(&Uuid::new_v4().to_string());
    let session = SessionRecord {
        id: Uuid::new_v4(),
        workspace_id: ws.id,
        session_type: "auth".into(),
        user_id: Some(Uuid::new_v4()),
        ip_hash: None,
        user_agent_hash: None,
        token_hash: Some(token_hash.clone()),
        expired_at: now + Duration::days(7),
        blocked_at: None,
        blocked_reason: None,
        created_at: now,
        updated_at: now,
    };
    store.create_session(&session).await.unwrap();
    let found = store
        .get_session_by_token_hash(&token_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, session.id);

    store.purge_workspace(ws.id).await.unwrap();
    assert!(store.get_workspace(ws.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_event_sequence_is_monotonic() {
    skip_if_no_db!();
    let store = get_test_store().await.expect("database available");
    let recorder = EventRecorder::new(store.clone(), true);
    let slug = format!("pg-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let workspace = workspace(&slug);
    store.create_workspace(&workspace).await.unwrap();
    let ws = workspace.id;

    let mut last = 0;
    for _ in 0..3 {
        let record = recorder
            .record(RuntimeEvent::new(types::RUNTIME_ENTRY).workspace(ws))
            .await
            .unwrap();
        assert!(record.sequence_num > last);
        last = record.sequence_num;
    }
    let stored = store
        .list_events(&EventQuery {
            workspace_id: Some(ws),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stored.len(), 3);
    store.purge_workspace(ws).await.unwrap();
}
