// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! LLM chat-completion node.
//!
//! The node tries `provider`/`model` first, then each of `fallbackProviders` and
//! `fallbackModels`. The first successful attempt wins and its token usage is
//! reported to the engine. If every attempt fails and `fallbackText` is set, the
//! node succeeds with that text and zero usage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::interpolate::interpolate;
use crate::context::{ExecutionContext, TokenUsage};
use crate::definition::NodeDefinition;
use crate::error::{EngineError, Result};
use crate::executor::{NodeExecutor, NodeInput, NodeOutput};

const DEFAULT_PROVIDER: &str = "openai";
const DEFAULT_MAX_TOKENS: u64 = 2048;
const DEFAULT_TEMPERATURE: f64 = 0.7;

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

/// A completion request for one provider/model attempt.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Provider name, e.g. `openai`.
    pub provider: String,
    /// Model name.
    pub model: String,
    /// Credential resolved for the provider.
    pub api_key: String,
    /// Conversation.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    pub temperature: f64,
    /// Completion token cap.
    pub max_tokens: u64,
}

/// A completion result.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    /// Generated text.
    pub content: String,
    /// Tokens consumed.
    pub usage: TokenUsage,
}

/// Backend that performs chat completions.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Runs one completion.
    async fn complete(&self, request: &LlmRequest) -> std::result::Result<LlmResponse, String>;
}

/// Provider speaking the OpenAI `chat/completions` wire format.
///
/// Base URLs are configured per provider name so compatible vendors can share it.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    base_urls: HashMap<String, String>,
}

impl OpenAiCompatibleProvider {
    /// Creates a provider with the public OpenAI endpoint registered as `openai`.
    pub fn new(client: reqwest::Client) -> Self {
        let mut base_urls = HashMap::new();
        base_urls.insert(
            DEFAULT_PROVIDER.to_string(),
            "https://api.openai.com/v1".to_string(),
        );
        Self { client, base_urls }
    }

    /// Registers or overrides the base URL for a provider name.
    pub fn with_base_url(mut self, provider: impl Into<String>, url: impl Into<String>) -> Self {
        self.base_urls.insert(provider.into(), url.into());
        self
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(&self, request: &LlmRequest) -> std::result::Result<LlmResponse, String> {
        let base = self
            .base_urls
            .get(&request.provider)
            .ok_or_else(|| format!("unsupported provider: {}", request.provider))?;
        let resp = self
            .client
            .post(format!("{}/chat/completions", base.trim_end_matches('/')))
            .bearer_auth(&request.api_key)
            .json(&json!({
                "model": request.model,
                "messages": request.messages,
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
            }))
            .send()
            .await
            .map_err(|e| format!("{} request failed: {e}", request.provider))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!(
                "{} returned {}: {}",
                request.provider,
                status.as_u16(),
                body.chars().take(512).collect::<String>()
            ));
        }

        let parsed: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| format!("invalid {} response: {e}", request.provider))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| format!("{} returned no choices", request.provider))?;
        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        Ok(LlmResponse { content, usage })
    }
}

/// The `llm` node.
#[derive(Clone)]
pub struct LlmExecutor {
    provider: Arc<dyn LlmProvider>,
}

impl LlmExecutor {
    /// Creates the node around a provider.
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

fn string_list(config: &Map<String, Value>, key: &str) -> Vec<String> {
    config
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn attempts(node: &NodeDefinition) -> Vec<(String, String)> {
    let provider = node
        .config_str("provider")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_PROVIDER)
        .to_string();
    let model = node.config_str("model").unwrap_or_default().to_string();

    let mut out = vec![(provider.clone(), model.clone())];
    for p in string_list(&node.config, "fallbackProviders") {
        out.push((p, model.clone()));
    }
    for m in string_list(&node.config, "fallbackModels") {
        out.push((provider.clone(), m));
    }
    let mut seen = std::collections::HashSet::new();
    out.retain(|a| seen.insert(a.clone()));
    out
}

#[async_trait]
impl NodeExecutor for LlmExecutor {
    fn node_type(&self) -> &str {
        "llm"
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        input: NodeInput,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput> {
        let system = interpolate(
            node.config_str("systemPrompt").unwrap_or_default(),
            &input,
            ctx,
        );
        let user = interpolate(node.config_str("userPrompt").unwrap_or_default(), &input, ctx);
        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(ChatMessage {
                role: "system".into(),
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user".into(),
            content: user,
        });

        let temperature = node
            .config
            .get("temperature")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_TEMPERATURE);
        let max_tokens = node
            .config_u64("maxTokens")
            .or_else(|| node.config_u64("max_tokens"))
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_TOKENS);

        let mut last_error = None;
        let mut attempt_log = Vec::new();
        for (index, (provider, model)) in attempts(node).into_iter().enumerate() {
            let api_key = node
                .config_str("apiKey")
                .filter(|k| !k.is_empty() && index == 0)
                .map(String::from)
                .or_else(|| ctx.secret(&provider).map(String::from));
            let Some(api_key) = api_key else {
                let err = format!("API key not found for provider: {provider}");
                attempt_log.push(json!({"provider": provider, "model": model, "status": "skipped", "error": err}));
                last_error = Some(err);
                continue;
            };

            let request = LlmRequest {
                provider: provider.clone(),
                model: model.clone(),
                api_key,
                messages: messages.clone(),
                temperature,
                max_tokens,
            };
            let result = tokio::select! {
                _ = ctx.cancellation_token().cancelled() => return Err(EngineError::Cancelled),
                r = self.provider.complete(&request) => r,
            };

            match result {
                Ok(resp) => {
                    let mut outputs = Map::new();
                    outputs.insert("content".into(), Value::String(resp.content.clone()));
                    outputs.insert("text".into(), Value::String(resp.content));
                    outputs.insert("usage".into(), resp.usage.to_value());
                    outputs.insert("provider".into(), Value::String(provider));
                    outputs.insert("model".into(), Value::String(model));
                    if index > 0 {
                        outputs.insert("fallback_used".into(), Value::Bool(true));
                        outputs.insert("attempts".into(), Value::Array(attempt_log));
                    }
                    return Ok(NodeOutput::new(outputs).with_token_usage(resp.usage));
                }
                Err(err) => {
                    attempt_log.push(json!({"provider": provider, "model": model, "status": "failed", "error": err}));
                    last_error = Some(err);
                }
            }
        }

        if let Some(text) = node.config_str("fallbackText").filter(|t| !t.is_empty()) {
            let mut outputs = Map::new();
            outputs.insert("content".into(), Value::String(text.to_string()));
            outputs.insert("text".into(), Value::String(text.to_string()));
            outputs.insert("usage".into(), TokenUsage::default().to_value());
            outputs.insert("fallback_used".into(), Value::Bool(true));
            outputs.insert("attempts".into(), Value::Array(attempt_log));
            if let Some(reason) = last_error {
                outputs.insert("fallback_reason".into(), Value::String(reason));
            }
            return Ok(NodeOutput::new(outputs));
        }

        Err(EngineError::node(
            &node.id,
            last_error.unwrap_or_else(|| "LLM call failed without a specific error".into()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct ScriptedProvider {
        fail_providers: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(&self, request: &LlmRequest) -> std::result::Result<LlmResponse, String> {
            self.calls.lock().unwrap().push(request.provider.clone());
            if self.fail_providers.contains(&request.provider.as_str()) {
                return Err(format!("{} down", request.provider));
            }
            Ok(LlmResponse {
                content: format!("echo: {}", request.messages.last().unwrap().content),
                usage: TokenUsage {
                    prompt_tokens: 12,
                    completion_tokens: 4,
                },
            })
        }
    }

    fn node(config: Value) -> NodeDefinition {
        serde_json::from_value(json!({"id": "l", "type": "llm", "config": config})).unwrap()
    }

    fn ctx_with_keys(keys: &[&str]) -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4()).with_secrets(
            keys.iter()
                .map(|k| (k.to_string(), format!("key-{k}")))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_reports_usage() {
        let provider = Arc::new(ScriptedProvider {
            fail_providers: vec![],
            calls: Mutex::new(vec![]),
        });
        let mut input = Map::new();
        input.insert("q".into(), json!("ping"));
        let out = LlmExecutor::new(provider)
            .execute(
                &node(json!({"model": "m", "userPrompt": "{{q}}"})),
                input,
                &ctx_with_keys(&["openai"]),
            )
            .await
            .unwrap();
        assert_eq!(out.outputs["text"], json!("echo: ping"));
        assert_eq!(out.token_usage.unwrap().total(), 16);
    }

    #[tokio::test]
    async fn test_falls_back_to_next_provider() {
        let provider = Arc::new(ScriptedProvider {
            fail_providers: vec!["openai"],
            calls: Mutex::new(vec![]),
        });
        let out = LlmExecutor::new(provider.clone())
            .execute(
                &node(json!({"model": "m", "fallbackProviders": ["deepseek"]})),
                Map::new(),
                &ctx_with_keys(&["openai", "deepseek"]),
            )
            .await
            .unwrap();
        assert_eq!(out.outputs["provider"], json!("deepseek"));
        assert_eq!(out.outputs["fallback_used"], json!(true));
        assert_eq!(*provider.calls.lock().unwrap(), vec!["openai", "deepseek"]);
    }

    #[tokio::test]
    async fn test_fallback_text_without_keys() {
        let provider = Arc::new(ScriptedProvider {
            fail_providers: vec![],
            calls: Mutex::new(vec![]),
        });
        let out = LlmExecutor::new(provider)
            .execute(
                &node(json!({"model": "m", "fallbackText": "offline"})),
                Map::new(),
                &ctx_with_keys(&[]),
            )
            .await
            .unwrap();
        assert_eq!(out.outputs["text"], json!("offline"));
        assert!(out.token_usage.is_none());

        let provider = Arc::new(ScriptedProvider {
            fail_providers: vec![],
            calls: Mutex::new(vec![]),
        });
        let err = LlmExecutor::new(provider)
            .execute(&node(json!({"model": "m"})), Map::new(), &ctx_with_keys(&[]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("API key not found"));
    }

    #[tokio::test]
    async fn test_openai_wire_format() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hi"}}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1}
            })))
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(reqwest::Client::new())
            .with_base_url("openai", format!("{}/v1", server.uri()));
        let resp = provider
            .complete(&LlmRequest {
                provider: "openai".into(),
                model: "gpt-4o-mini".into(),
                api_key: "sk-test".into(),
                messages: vec![ChatMessage {
                    role: "user".into(),
                    content: "hello".into(),
                }],
                temperature: 0.0,
                max_tokens: 16,
            })
            .await
            .unwrap();
        assert_eq!(resp.content, "hi");
        assert_eq!(resp.usage.prompt_tokens, 3);
    }
}
