// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recorded events reach subscribed webhook endpoints through the recorder's
//! dispatchers, signed with the endpoint secret.

mod common;

use std::time::Duration;

use backplane_core::events::{RuntimeEvent, types};
use backplane_core::webhook::{CreateWebhookEndpoint, delivery_status, signing};
use serde_json::Value;
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::TestContext;

#[tokio::test]
async fn test_recorded_event_is_delivered_signed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/backplane"))
        .and(header("X-Webhook-Event", "app_published"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let t = TestContext::new();
    let ws = Uuid::new_v4();
    let endpoint = t
        .ctx
        .webhooks
        .create_endpoint(
            ws,
            CreateWebhookEndpoint {
                url: format!("{}/hooks/backplane", server.uri()),
                events: vec!["app_published".into()],
                secret: Some("s3cr3t".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .endpoint;

    t.ctx
        .recorder
        .record(
            RuntimeEvent::new(types::APP_PUBLISHED)
                .workspace(ws)
                .meta("version", "1.0.0"),
        )
        .await
        .unwrap();
    // Unsubscribed types and other workspaces are not delivered.
    t.ctx
        .recorder
        .record(RuntimeEvent::new(types::APP_ARCHIVED).workspace(ws))
        .await
        .unwrap();
    t.ctx
        .recorder
        .record(RuntimeEvent::new(types::APP_PUBLISHED).workspace(Uuid::new_v4()))
        .await
        .unwrap();

    let mut delivered = None;
    for _ in 0..100 {
        let deliveries = t
            .ctx
            .webhooks
            .list_deliveries(ws, endpoint.id, 10)
            .await
            .unwrap();
        if let Some(d) = deliveries
            .into_iter()
            .find(|d| d.status == delivery_status::SUCCESS)
        {
            delivered = Some(d);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let delivery = delivered.expect("delivery succeeded");
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(delivery.last_status_code, Some(200));

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let req = &received[0];
    let ts = req.headers.get("X-Webhook-Timestamp").unwrap().to_str().unwrap();
    let sig = req.headers.get(signing::SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert!(signing::verify("s3cr3t", ts, &req.body, sig));
    let body: Value = serde_json::from_slice(&req.body).unwrap();
    assert_eq!(body["type"], "app_published");
}
