// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upstream HTTP request node.
//!
//! Config keys: `method` (default GET), `url`, `headers`, `body`, and
//! `auth` = `{type: bearer|basic|apiKey, ...}`. String values are interpolated.
//! Non-2xx responses are returned as outputs, not failures, unless
//! `failOnError` is set.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value};

use super::interpolate::{display, interpolate, resolve_deep};
use crate::context::ExecutionContext;
use crate::definition::NodeDefinition;
use crate::error::{EngineError, Result};
use crate::executor::{NodeExecutor, NodeInput, NodeOutput};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Calls an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    /// Creates an executor with a 30s request timeout.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Creates an executor around an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for HttpExecutor {
    fn node_type(&self) -> &str {
        "http"
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        input: NodeInput,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput> {
        let method_str = node.config_str("method").unwrap_or("GET").to_uppercase();
        let method = Method::from_bytes(method_str.as_bytes())
            .map_err(|_| EngineError::node(&node.id, format!("invalid method '{method_str}'")))?;
        let url = interpolate(node.config_str("url").unwrap_or_default(), &input, ctx);
        if url.is_empty() {
            return Err(EngineError::node(&node.id, "url is required"));
        }

        let mut req = self.client.request(method.clone(), &url);

        if let Some(headers) = node.config.get("headers").and_then(Value::as_object) {
            for (k, v) in headers {
                let v = interpolate(&display(v), &input, ctx);
                req = req.header(k.as_str(), v);
            }
        }

        if let Some(auth) = node.config.get("auth").and_then(Value::as_object) {
            let field = |key: &str| {
                auth.get(key)
                    .and_then(Value::as_str)
                    .map(|s| interpolate(s, &input, ctx))
                    .unwrap_or_default()
            };
            match auth.get("type").and_then(Value::as_str) {
                Some("bearer") => req = req.bearer_auth(field("token")),
                Some("basic") => req = req.basic_auth(field("username"), Some(field("password"))),
                Some("apiKey") => {
                    let header = Some(field("key"))
                        .filter(|k| !k.is_empty())
                        .or_else(|| Some(field("headerName")).filter(|k| !k.is_empty()))
                        .unwrap_or_else(|| "X-API-Key".to_string());
                    req = req.header(header, field("value"));
                }
                _ => {}
            }
        }

        if method != Method::GET && method != Method::HEAD {
            if let Some(body) = node.config.get("body") {
                match resolve_deep(body, &input, ctx) {
                    Value::String(s) => req = req.body(s),
                    other => req = req.json(&other),
                }
            }
        }

        let resp = tokio::select! {
            _ = ctx.cancellation_token().cancelled() => return Err(EngineError::Cancelled),
            r = req.send() => r.map_err(|e| EngineError::node(&node.id, format!("request failed: {e}")))?,
        };

        let status = resp.status();
        let headers: Map<String, Value> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), Value::String(v.to_str().ok()?.to_string()))))
            .collect();
        let body = resp
            .text()
            .await
            .map_err(|e| EngineError::node(&node.id, format!("failed to read response: {e}")))?;

        let fail_on_error = node.config.get("failOnError").and_then(Value::as_bool) == Some(true);
        if fail_on_error && !status.is_success() {
            return Err(EngineError::node(
                &node.id,
                format!("upstream returned {}", status.as_u16()),
            ));
        }

        let data = serde_json::from_str(&body).unwrap_or_else(|_| Value::String(body.clone()));
        let mut outputs = Map::new();
        outputs.insert("data".into(), data);
        outputs.insert("status".into(), Value::from(status.as_u16()));
        outputs.insert("statusText".into(), Value::String(status.to_string()));
        outputs.insert("headers".into(), Value::Object(headers));
        outputs.insert("body".into(), Value::String(body));
        Ok(NodeOutput::new(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn node(config: Value) -> NodeDefinition {
        serde_json::from_value(json!({"id": "h", "type": "http", "config": config})).unwrap()
    }

    #[tokio::test]
    async fn test_post_with_interpolated_body_and_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(header("authorization", "Bearer tok-1"))
            .and(body_json(json!({"sku": "A1", "qty": 3})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7})))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        let mut input = Map::new();
        input.insert("sku".into(), json!("A1"));
        input.insert("qty".into(), json!(3));
        input.insert("token".into(), json!("tok-1"));

        let out = HttpExecutor::new()
            .execute(
                &node(json!({
                    "method": "post",
                    "url": format!("{}/orders", server.uri()),
                    "body": {"sku": "{{sku}}", "qty": "{{qty}}"},
                    "auth": {"type": "bearer", "token": "{{token}}"}
                })),
                input,
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(out.outputs["status"], json!(201));
        assert_eq!(out.outputs["data"]["id"], json!(7));
    }

    #[tokio::test]
    async fn test_fail_on_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        let lenient = HttpExecutor::new()
            .execute(&node(json!({"url": server.uri()})), Map::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(lenient.outputs["status"], json!(502));

        let err = HttpExecutor::new()
            .execute(
                &node(json!({"url": server.uri(), "failOnError": true})),
                Map::new(),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NodeFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_url() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        let err = HttpExecutor::new()
            .execute(&node(json!({})), Map::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NodeFailed { .. }));
    }
}
