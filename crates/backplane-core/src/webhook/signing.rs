// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Webhook wire format: headers, signature and payload envelope.

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde_json::{Map, Value, json};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::persistence::EventRecord;

/// Event type header.
pub const EVENT_HEADER: &str = "X-Webhook-Event";
/// Delivery id header.
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";
/// Unix seconds header, part of the signed message.
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
/// Hex HMAC-SHA256 header.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// `hex(HMAC-SHA256(secret, timestamp + "." + body))`.
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| CoreError::Crypto(format!("invalid HMAC key: {e}")))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a received signature.
pub fn verify(secret: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Envelope for a recorded event. Correlators that are set go into `data`.
pub fn event_payload(event: &EventRecord) -> Value {
    let mut data = Map::new();
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(v) = value {
            data.insert(key.to_string(), v);
        }
    };
    put("workspace_id", event.workspace_id.map(|id| json!(id)));
    put("execution_id", event.execution_id.map(|id| json!(id)));
    put("user_id", event.user_id.map(|id| json!(id)));
    put("session_id", event.session_id.map(|id| json!(id)));
    put("node_id", event.node_id.clone().map(Value::from));
    put("node_type", event.node_type.clone().map(Value::from));
    put("trace_id", event.trace_id.clone().map(Value::from));
    put("request_id", event.request_id.clone().map(Value::from));
    put("http_method", event.http_method.clone().map(Value::from));
    put("http_path", event.http_path.clone().map(Value::from));
    put("http_status", event.http_status.map(Value::from));
    put("duration_ms", event.duration_ms.map(Value::from));
    put("error_code", event.error_code.clone().map(Value::from));
    put("error_message", event.error_message.clone().map(Value::from));
    if !event.metadata.is_null() {
        put("metadata", Some(event.metadata.clone()));
    }

    let mut payload = json!({
        "id": event.id,
        "type": event.event_type,
        "created_at": rfc3339(event.created_at),
        "severity": event.severity,
        "data": data,
    });
    if let (Some(message), Some(obj)) = (&event.message, payload.as_object_mut()) {
        obj.insert("message".into(), json!(message));
    }
    payload
}

/// Envelope used by test deliveries.
pub fn sample_payload(event_type: &str, workspace_id: Uuid, now: DateTime<Utc>) -> Value {
    json!({
        "id": Uuid::new_v4(),
        "type": event_type,
        "created_at": rfc3339(now),
        "severity": "info",
        "data": {
            "workspace_id": workspace_id,
            "sample": true,
        },
    })
}
