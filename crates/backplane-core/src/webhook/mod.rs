// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound webhooks.
//!
//! [`WebhookService`] manages endpoints and delivers recorded events to the
//! endpoints subscribed to them. Each delivery has one ledger row that every
//! attempt updates:
//!
//! ```text
//! pending ──attempt──▶ success
//!    │                   ▲
//!    └──▶ retrying ──────┘
//!            │
//!            └──(attempts exhausted)──▶ failed
//! ```
//!
//! Attempts are spaced by [`RETRY_DELAYS`]; the sleeps stop early when the
//! service is shut down.

pub mod signing;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::{Encryptor, random_hex, secret_preview};
use crate::error::{CoreError, Result};
use crate::events::{EventDispatcher, EventRecorder, RuntimeEvent, Severity, catalog, types};
use crate::persistence::{EventRecord, Persistence, WebhookDeliveryRecord, WebhookEndpointRecord};

/// Attempts per delivery when the ledger row does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// HTTP client timeout per attempt.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(12);

/// Longest response body kept on the ledger row.
pub const RESPONSE_BODY_LIMIT: usize = 4096;

/// Delay after attempt 1, 2 and 3.
pub const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(2),
    Duration::from_secs(5),
];

/// Delay used past the table.
const LATE_RETRY_DELAY: Duration = Duration::from_secs(8);

/// Signing secret length in random bytes.
const SECRET_BYTES: usize = 24;

/// Delivery listing cap.
const MAX_DELIVERY_LIST: i64 = 100;

/// Appended to `last_error` when shutdown cuts a retry schedule short.
const SHUTDOWN_INTERRUPTED: &str = "interrupted by shutdown";

/// Delivery ledger status values.
pub mod delivery_status {
    /// Created, no attempt finished yet.
    pub const PENDING: &str = "pending";
    /// Failed at least once, more attempts scheduled.
    pub const RETRYING: &str = "retrying";
    /// The endpoint answered 2xx.
    pub const SUCCESS: &str = "success";
    /// Attempts exhausted.
    pub const FAILED: &str = "failed";
}

// ============================================================================
// Requests and results
// ============================================================================

/// New endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateWebhookEndpoint {
    /// http(s) URL with a host.
    pub url: String,
    /// Subscribed event types.
    pub events: Vec<String>,
    /// Defaults to `true`.
    pub signing_enabled: Option<bool>,
    /// Caller-chosen secret; generated when absent.
    pub secret: Option<String>,
    /// Defaults to `true`.
    pub active: Option<bool>,
}

/// Partial endpoint update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateWebhookEndpoint {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub signing_enabled: Option<bool>,
    pub active: Option<bool>,
}

/// Endpoint returned with its plaintext secret, which is shown only once.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointWithSecret {
    #[serde(flatten)]
    pub endpoint: WebhookEndpointRecord,
    pub secret: Option<String>,
    pub secret_preview: Option<String>,
}

/// Outcome of a delivery, after its last attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryResult {
    pub delivery_id: Uuid,
    pub event_type: String,
    pub status: String,
    pub attempt: i32,
    pub status_code: Option<u16>,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryResult {
    /// Whether the endpoint answered 2xx.
    pub fn is_success(&self) -> bool {
        self.status == delivery_status::SUCCESS
    }
}

/// Catalog entries grouped by category.
#[derive(Debug, Clone, Serialize)]
pub struct EventGroup {
    pub category: &'static str,
    pub events: Vec<EventDefinition>,
}

/// One subscribable event type.
#[derive(Debug, Clone, Serialize)]
pub struct EventDefinition {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub description: &'static str,
}

/// Single-attempt HTTP outcome.
struct Attempt {
    status_code: Option<u16>,
    body: Option<String>,
    error: Option<String>,
    duration_ms: i64,
}

impl Attempt {
    /// An attempt that never reached the wire.
    fn aborted(error: String) -> Self {
        Self {
            status_code: None,
            body: None,
            error: Some(error),
            duration_ms: 0,
        }
    }

    fn succeeded(&self) -> bool {
        self.error.is_none() && self.status_code.is_some_and(|c| (200..300).contains(&c))
    }

    fn failure_message(&self) -> Option<String> {
        if self.succeeded() {
            return None;
        }
        self.error
            .clone()
            .or_else(|| self.status_code.map(|c| format!("http status {c}")))
    }
}

// ============================================================================
// Validation helpers
// ============================================================================

/// Lowercased, trimmed event type.
pub fn normalize_event_type(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Whether endpoints may subscribe to the type.
pub fn is_subscribable(event_type: &str) -> bool {
    catalog::lookup(event_type).is_some()
}

/// Trims, requires http or https and a host.
pub fn validate_url(raw: &str) -> Result<String> {
    let invalid = || CoreError::validation("url", "must be an http(s) URL with a host");
    let parsed = url::Url::parse(raw.trim()).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none_or(str::is_empty)
    {
        return Err(invalid());
    }
    Ok(parsed.to_string())
}

/// Normalizes, deduplicates and checks each type against the catalog.
pub fn normalize_events(raw: &[String]) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for event in raw {
        let ev = normalize_event_type(event);
        if ev.is_empty() {
            continue;
        }
        if !is_subscribable(&ev) {
            return Err(CoreError::validation("events", format!("unknown event '{ev}'")));
        }
        if !out.contains(&ev) {
            out.push(ev);
        }
    }
    if out.is_empty() {
        return Err(CoreError::validation("events", "at least one event is required"));
    }
    Ok(out)
}

/// Case-insensitive subscription match.
pub fn is_subscribed(events: &[String], event_type: &str) -> bool {
    let wanted = normalize_event_type(event_type);
    events.iter().any(|e| normalize_event_type(e) == wanted)
}

/// The event catalog grouped by category, in catalog order.
pub fn event_catalog() -> Vec<EventGroup> {
    let mut groups: Vec<EventGroup> = Vec::new();
    for info in catalog::all() {
        let category = info.category.as_str();
        let definition = EventDefinition {
            event_type: info.event_type,
            description: info.description,
        };
        match groups.iter_mut().find(|g| g.category == category) {
            Some(group) => group.events.push(definition),
            None => groups.push(EventGroup {
                category,
                events: vec![definition],
            }),
        }
    }
    groups
}

fn retry_delay(attempt: i32, delays: &[Duration]) -> Duration {
    usize::try_from(attempt - 1)
        .ok()
        .and_then(|i| delays.get(i).copied())
        .unwrap_or(LATE_RETRY_DELAY)
}

fn truncate_body(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() <= RESPONSE_BODY_LIMIT {
        return Some(trimmed.to_string());
    }
    let mut end = RESPONSE_BODY_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    Some(trimmed[..end].to_string())
}

// ============================================================================
// Service
// ============================================================================

/// Endpoint management and event delivery.
pub struct WebhookService {
    persistence: Arc<dyn Persistence>,
    encryptor: Arc<dyn Encryptor>,
    client: reqwest::Client,
    recorder: Weak<EventRecorder>,
    shutdown: CancellationToken,
    retry_delays: Vec<Duration>,
}

impl WebhookService {
    /// Creates the service. The recorder is held weakly because the recorder
    /// also holds this service as a dispatcher.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        encryptor: Arc<dyn Encryptor>,
        recorder: &Arc<EventRecorder>,
        shutdown: CancellationToken,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            persistence,
            encryptor,
            client,
            recorder: Arc::downgrade(recorder),
            shutdown,
            retry_delays: RETRY_DELAYS.to_vec(),
        }
    }

    /// Overrides the spacing between attempts.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    // ========================================================================
    // Endpoint management
    // ========================================================================

    /// Creates an endpoint. Signing is on unless disabled; the plaintext
    /// secret is returned once.
    pub async fn create_endpoint(
        &self,
        workspace_id: Uuid,
        req: CreateWebhookEndpoint,
    ) -> Result<EndpointWithSecret> {
        let url = validate_url(&req.url)?;
        let events = normalize_events(&req.events)?;
        let signing_enabled = req.signing_enabled.unwrap_or(true);

        let secret = signing_enabled.then(|| {
            req.secret
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| random_hex(SECRET_BYTES))
        });
        let secret_encrypted = secret
            .as_deref()
            .map(|s| self.encryptor.encrypt(s))
            .transpose()?;

        let now = Utc::now();
        let endpoint = WebhookEndpointRecord {
            id: Uuid::new_v4(),
            workspace_id,
            url,
            events,
            signing_enabled,
            secret_encrypted,
            active: req.active.unwrap_or(true),
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        };
        self.persistence.create_webhook_endpoint(&endpoint).await?;
        info!(
            workspace_id = %workspace_id,
            endpoint_id = %endpoint.id,
            events = ?endpoint.events,
            "Webhook endpoint created"
        );
        Ok(EndpointWithSecret {
            endpoint,
            secret_preview: secret.as_deref().map(secret_preview),
            secret,
        })
    }

    /// Applies a partial update. Re-enabling signing needs a stored secret.
    pub async fn update_endpoint(
        &self,
        workspace_id: Uuid,
        endpoint_id: Uuid,
        req: UpdateWebhookEndpoint,
    ) -> Result<WebhookEndpointRecord> {
        let mut endpoint = self.load_endpoint(workspace_id, endpoint_id).await?;
        if let Some(url) = req.url {
            endpoint.url = validate_url(&url)?;
        }
        if let Some(events) = req.events {
            endpoint.events = normalize_events(&events)?;
        }
        if let Some(signing) = req.signing_enabled {
            if signing && endpoint.secret_encrypted.is_none() {
                return Err(CoreError::validation(
                    "signing_enabled",
                    "rotate the secret to enable signing",
                ));
            }
            endpoint.signing_enabled = signing;
            if !signing {
                endpoint.secret_encrypted = None;
            }
        }
        if let Some(active) = req.active {
            endpoint.active = active;
        }
        endpoint.updated_at = Utc::now();
        self.persistence.update_webhook_endpoint(&endpoint).await?;
        Ok(endpoint)
    }

    /// Endpoints of a workspace.
    pub async fn list_endpoints(&self, workspace_id: Uuid) -> Result<Vec<WebhookEndpointRecord>> {
        Ok(self.persistence.list_webhook_endpoints(workspace_id).await?)
    }

    /// Issues a new signing secret and turns signing on.
    pub async fn rotate_secret(
        &self,
        workspace_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<EndpointWithSecret> {
        let mut endpoint = self.load_endpoint(workspace_id, endpoint_id).await?;
        let secret = random_hex(SECRET_BYTES);
        endpoint.secret_encrypted = Some(self.encryptor.encrypt(&secret)?);
        endpoint.signing_enabled = true;
        endpoint.updated_at = Utc::now();
        self.persistence.update_webhook_endpoint(&endpoint).await?;
        info!(endpoint_id = %endpoint.id, "Webhook secret rotated");
        Ok(EndpointWithSecret {
            endpoint,
            secret_preview: Some(secret_preview(&secret)),
            secret: Some(secret),
        })
    }

    /// Most recent deliveries of an endpoint.
    pub async fn list_deliveries(
        &self,
        workspace_id: Uuid,
        endpoint_id: Uuid,
        limit: i64,
    ) -> Result<Vec<WebhookDeliveryRecord>> {
        self.load_endpoint(workspace_id, endpoint_id).await?;
        let limit = if limit <= 0 { 20 } else { limit.min(MAX_DELIVERY_LIST) };
        Ok(self
            .persistence
            .list_webhook_deliveries(endpoint_id, limit)
            .await?)
    }

    /// Delivers a sample (or caller-supplied) payload with the full retry
    /// policy.
    pub async fn test_delivery(
        &self,
        workspace_id: Uuid,
        endpoint_id: Uuid,
        event_type: &str,
        payload: Option<Value>,
    ) -> Result<DeliveryResult> {
        let endpoint = self.load_endpoint(workspace_id, endpoint_id).await?;
        let event_type = normalize_event_type(event_type);
        if !is_subscribable(&event_type) {
            return Err(CoreError::validation("event_type", format!("unknown event '{event_type}'")));
        }
        let payload = payload
            .unwrap_or_else(|| signing::sample_payload(&event_type, workspace_id, Utc::now()));
        self.deliver(&endpoint, &event_type, payload).await
    }

    /// Re-issues one attempt of a non-successful delivery from its stored
    /// payload.
    pub async fn retry_delivery(
        &self,
        workspace_id: Uuid,
        endpoint_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<DeliveryResult> {
        let endpoint = self.load_endpoint(workspace_id, endpoint_id).await?;
        let mut delivery = self
            .persistence
            .get_webhook_delivery(delivery_id)
            .await?
            .filter(|d| d.endpoint_id == endpoint.id)
            .ok_or_else(|| CoreError::NotFound("webhook delivery".into()))?;
        if delivery.status == delivery_status::SUCCESS {
            return Err(CoreError::InvalidState {
                expected: "pending, retrying or failed".into(),
                actual: delivery.status,
            });
        }
        if delivery.payload.is_null() {
            return Err(CoreError::InvalidRequest("delivery payload missing".into()));
        }
        delivery.max_attempts = delivery.max_attempts.max(delivery.attempt_count + 1);
        self.persistence.update_webhook_delivery(&delivery).await?;
        let last = delivery.attempt_count + 1;
        self.run_attempts(&endpoint, delivery, last).await
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Delivers a recorded event to every active endpoint subscribed to it.
    /// Failures are logged; the returned results cover every endpoint tried.
    pub async fn dispatch_event(&self, event: &EventRecord) -> Vec<DeliveryResult> {
        let Some(workspace_id) = event.workspace_id else {
            return Vec::new();
        };
        // Delivery failures are reported as events themselves; never fan
        // them out again.
        if event.event_type == types::WEBHOOK_DELIVERY_FAILED || !is_subscribable(&event.event_type)
        {
            return Vec::new();
        }
        let endpoints = match self.persistence.list_webhook_endpoints(workspace_id).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(workspace_id = %workspace_id, error = %e, "Failed to list webhook endpoints");
                return Vec::new();
            }
        };

        let payload = signing::event_payload(event);
        let mut results = Vec::new();
        for endpoint in endpoints
            .iter()
            .filter(|e| e.active && is_subscribed(&e.events, &event.event_type))
        {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.deliver(endpoint, &event.event_type, payload.clone()).await {
                Ok(result) => results.push(result),
                Err(e) => warn!(
                    endpoint_id = %endpoint.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook delivery aborted"
                ),
            }
        }
        results
    }

    // ========================================================================
    // Delivery internals
    // ========================================================================

    async fn load_endpoint(
        &self,
        workspace_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<WebhookEndpointRecord> {
        self.persistence
            .get_webhook_endpoint(endpoint_id)
            .await?
            .filter(|e| e.workspace_id == workspace_id)
            .ok_or_else(|| CoreError::NotFound("webhook".into()))
    }

    /// Creates the ledger row and runs up to `max_attempts` attempts.
    async fn deliver(
        &self,
        endpoint: &WebhookEndpointRecord,
        event_type: &str,
        payload: Value,
    ) -> Result<DeliveryResult> {
        if !endpoint.active {
            return Err(CoreError::InvalidState {
                expected: "active".into(),
                actual: "inactive".into(),
            });
        }
        let now = Utc::now();
        let delivery = WebhookDeliveryRecord {
            id: Uuid::new_v4(),
            endpoint_id: endpoint.id,
            workspace_id: endpoint.workspace_id,
            event_type: event_type.to_string(),
            payload,
            status: delivery_status::PENDING.into(),
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            next_retry_at: None,
            last_status_code: None,
            response_body: None,
            last_error: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        };
        self.persistence.create_webhook_delivery(&delivery).await?;
        let last = delivery.max_attempts;
        self.run_attempts(endpoint, delivery, last).await
    }

    /// Attempts `attempt_count + 1 ..= last_attempt`, updating the ledger
    /// after each one.
    async fn run_attempts(
        &self,
        endpoint: &WebhookEndpointRecord,
        mut delivery: WebhookDeliveryRecord,
        last_attempt: i32,
    ) -> Result<DeliveryResult> {
        let body = serde_json::to_vec(&delivery.payload)?;
        let mut result = DeliveryResult {
            delivery_id: delivery.id,
            event_type: delivery.event_type.clone(),
            status: delivery.status.clone(),
            attempt: delivery.attempt_count,
            status_code: None,
            duration_ms: 0,
            response_body: None,
            error: None,
        };

        let mut attempt_no = delivery.attempt_count + 1;
        while attempt_no <= last_attempt {
            let attempt = match self.send(endpoint, &delivery, &body).await {
                Ok(attempt) => attempt,
                Err(e) => {
                    warn!(delivery_id = %delivery.id, error = %e, "Webhook request could not be built");
                    Attempt::aborted(e.to_string())
                }
            };
            let now = Utc::now();
            let success = attempt.succeeded();
            let more = !success && attempt_no < last_attempt;
            let status = if success {
                delivery_status::SUCCESS
            } else if more {
                delivery_status::RETRYING
            } else {
                delivery_status::FAILED
            };
            let delay = retry_delay(attempt_no, &self.retry_delays);

            delivery.attempt_count = attempt_no;
            delivery.status = status.into();
            delivery.last_status_code = attempt.status_code.map(i32::from);
            delivery.response_body = attempt.body.clone();
            delivery.last_error = attempt.failure_message();
            delivery.next_retry_at = more
                .then(|| chrono::Duration::from_std(delay).ok().map(|d| now + d))
                .flatten();
            if success {
                delivery.delivered_at = Some(now);
            }
            delivery.updated_at = now;
            if let Err(e) = self.persistence.update_webhook_delivery(&delivery).await {
                warn!(delivery_id = %delivery.id, error = %e, "Failed to update delivery ledger");
            }
            self.touch_endpoint(endpoint.id).await;

            result.status = status.into();
            result.attempt = attempt_no;
            result.status_code = attempt.status_code;
            result.duration_ms = attempt.duration_ms;
            result.error = delivery.last_error.clone();
            result.response_body = attempt.body;

            debug!(
                delivery_id = %delivery.id,
                attempt = attempt_no,
                status = status,
                status_code = ?result.status_code,
                "Webhook attempt finished"
            );
            if success || !more {
                break;
            }
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(delivery_id = %delivery.id, "Webhook retry interrupted by shutdown");
                    // Backoffs are not resumed after a restart.
                    delivery.status = delivery_status::FAILED.into();
                    delivery.next_retry_at = None;
                    delivery.last_error = Some(format!(
                        "{}; {SHUTDOWN_INTERRUPTED}",
                        delivery.last_error.as_deref().unwrap_or("attempt failed")
                    ));
                    delivery.updated_at = Utc::now();
                    if let Err(e) = self.persistence.update_webhook_delivery(&delivery).await {
                        warn!(delivery_id = %delivery.id, error = %e, "Failed to update delivery ledger");
                    }
                    result.status = delivery_status::FAILED.into();
                    result.error = delivery.last_error.clone();
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt_no += 1;
        }

        if result.status == delivery_status::FAILED {
            self.report_failure(endpoint, &delivery);
        }
        Ok(result)
    }

    /// One POST. Transport errors are part of the outcome; `Err` means the
    /// request could not be signed.
    async fn send(
        &self,
        endpoint: &WebhookEndpointRecord,
        delivery: &WebhookDeliveryRecord,
        body: &[u8],
    ) -> Result<Attempt> {
        let timestamp = Utc::now().timestamp().to_string();
        let mut req = self
            .client
            .post(&endpoint.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(signing::EVENT_HEADER, delivery.event_type.as_str())
            .header(signing::DELIVERY_HEADER, delivery.id.to_string())
            .header(signing::TIMESTAMP_HEADER, timestamp.as_str());
        if endpoint.signing_enabled {
            let encrypted = endpoint
                .secret_encrypted
                .as_deref()
                .ok_or_else(|| CoreError::Crypto("signing enabled without a secret".into()))?;
            let secret = self.encryptor.decrypt(encrypted)?;
            req = req.header(
                signing::SIGNATURE_HEADER,
                signing::sign(&secret, &timestamp, body)?,
            );
        }

        let started = Instant::now();
        let response = req.body(body.to_vec()).send().await;
        let elapsed = || i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        Ok(match response {
            Ok(resp) => {
                let status_code = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                Attempt {
                    status_code: Some(status_code),
                    body: truncate_body(&text),
                    error: None,
                    duration_ms: elapsed(),
                }
            }
            Err(e) => Attempt {
                status_code: None,
                body: None,
                error: Some(e.to_string()),
                duration_ms: elapsed(),
            },
        })
    }

    async fn touch_endpoint(&self, endpoint_id: Uuid) {
        let result = async {
            if let Some(mut endpoint) = self.persistence.get_webhook_endpoint(endpoint_id).await? {
                endpoint.last_triggered_at = Some(Utc::now());
                self.persistence.update_webhook_endpoint(&endpoint).await?;
            }
            Ok::<_, crate::persistence::StoreError>(())
        }
        .await;
        if let Err(e) = result {
            debug!(endpoint_id = %endpoint_id, error = %e, "Failed to update last_triggered_at");
        }
    }

    fn report_failure(&self, endpoint: &WebhookEndpointRecord, delivery: &WebhookDeliveryRecord) {
        warn!(
            endpoint_id = %endpoint.id,
            delivery_id = %delivery.id,
            event_type = %delivery.event_type,
            attempts = delivery.attempt_count,
            error = ?delivery.last_error,
            "Webhook delivery failed"
        );
        let Some(recorder) = self.recorder.upgrade() else {
            return;
        };
        let mut meta = BTreeMap::new();
        meta.insert("endpoint_id", json!(endpoint.id));
        meta.insert("delivery_id", json!(delivery.id));
        meta.insert("event_type", json!(delivery.event_type));
        meta.insert("attempts", json!(delivery.attempt_count));
        meta.insert("status_code", json!(delivery.last_status_code));
        recorder.record_async(
            RuntimeEvent::new(types::WEBHOOK_DELIVERY_FAILED)
                .severity(Severity::Warn)
                .workspace(endpoint.workspace_id)
                .error(
                    "WEBHOOK_DELIVERY_FAILED",
                    delivery.last_error.clone().unwrap_or_default(),
                )
                .metadata(json!(meta)),
        );
    }
}

#[async_trait]
impl EventDispatcher for WebhookService {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn dispatch(&self, event: &EventRecord) {
        self.dispatch_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use super::*;
    use crate::crypto::AesGcmEncryptor;
    use crate::persistence::MemoryPersistence;

    struct Fixture {
        store: Arc<MemoryPersistence>,
        recorder: Arc<EventRecorder>,
        service: WebhookService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryPersistence::new());
        let recorder = Arc::new(EventRecorder::new(store.clone(), false));
        let encryptor = Arc::new(AesGcmEncryptor::new(&[9u8; 32]).unwrap());
        let service = WebhookService::new(
            store.clone(),
            encryptor,
            &recorder,
            CancellationToken::new(),
        )
        .with_retry_delays(vec![Duration::ZERO; 3]);
        Fixture {
            store,
            recorder,
            service,
        }
    }

    fn published_event(workspace_id: Uuid) -> EventRecord {
        EventRecord {
            id: Uuid::new_v4(),
            sequence_num: 1,
            event_type: types::APP_PUBLISHED.into(),
            severity: "info".into(),
            workspace_id: Some(workspace_id),
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
            metadata: json!({"version": "1.0.0"}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_url_and_event_validation() {
        assert_eq!(
            validate_url(" https://hooks.example.com/x ").unwrap(),
            "https://hooks.example.com/x"
        );
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("not a url").is_err());

        let events = normalize_events(&[
            " App_Published ".into(),
            "app_published".into(),
            "".into(),
            "execution_completed".into(),
        ])
        .unwrap();
        assert_eq!(events, vec!["app_published", "execution_completed"]);
        assert!(normalize_events(&["made_up".into()]).is_err());
        assert!(normalize_events(&[]).is_err());
        assert!(is_subscribed(&["APP_PUBLISHED".into()], "app_published"));
    }

    #[test]
    fn test_retry_delay_table() {
        assert_eq!(retry_delay(1, &RETRY_DELAYS), Duration::from_millis(500));
        assert_eq!(retry_delay(2, &RETRY_DELAYS), Duration::from_secs(2));
        assert_eq!(retry_delay(3, &RETRY_DELAYS), Duration::from_secs(5));
        assert_eq!(retry_delay(4, &RETRY_DELAYS), LATE_RETRY_DELAY);
        let long = "é".repeat(RESPONSE_BODY_LIMIT);
        assert!(truncate_body(&long).unwrap().len() <= RESPONSE_BODY_LIMIT);
        assert_eq!(truncate_body("  "), None);
    }

    #[tokio::test]
    async fn test_signed_delivery_succeeds_first_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Webhook-Event", "app_published"))
            .and(header_exists("X-Webhook-Delivery"))
            .and(header_exists("X-Webhook-Signature"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture();
        let ws = Uuid::new_v4();
        let created = f
            .service
            .create_endpoint(
                ws,
                CreateWebhookEndpoint {
                    url: format!("{}/hook", server.uri()),
                    events: vec!["app_published".into()],
                    secret: Some("s3cr3t".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(created.secret.as_deref(), Some("s3cr3t"));
        assert!(created.endpoint.signing_enabled);
        assert_ne!(created.endpoint.secret_encrypted.as_deref(), Some("s3cr3t"));

        let results = f.service.dispatch_event(&published_event(ws)).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_success());

        let deliveries = f
            .service
            .list_deliveries(ws, created.endpoint.id, 10)
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        let d = &deliveries[0];
        assert_eq!(d.status, delivery_status::SUCCESS);
        assert_eq!(d.attempt_count, 1);
        assert_eq!(d.last_status_code, Some(200));
        assert_eq!(d.response_body.as_deref(), Some("ok"));
        assert!(d.delivered_at.is_some());

        let received: Vec<Request> = server.received_requests().await.unwrap();
        let req = &received[0];
        let ts = req.headers.get("X-Webhook-Timestamp").unwrap().to_str().unwrap();
        let sig = req.headers.get("X-Webhook-Signature").unwrap().to_str().unwrap();
        assert!(signing::verify("s3cr3t", ts, &req.body, sig));
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["type"], "app_published");
        assert_eq!(body["data"]["metadata"]["version"], "1.0.0");

        let endpoint = f
            .store
            .get_webhook_endpoint(created.endpoint.id)
            .await
            .unwrap()
            .unwrap();
        assert!(endpoint.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn test_failing_endpoint_exhausts_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .expect(3)
            .mount(&server)
            .await;

        let f = fixture();
        let ws = Uuid::new_v4();
        let created = f
            .service
            .create_endpoint(
                ws,
                CreateWebhookEndpoint {
                    url: server.uri(),
                    events: vec!["app_published".into()],
                    signing_enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(created.secret.is_none());

        let result = f
            .service
            .test_delivery(ws, created.endpoint.id, "app_published", None)
            .await
            .unwrap();
        assert_eq!(result.status, delivery_status::FAILED);
        assert_eq!(result.attempt, 3);
        assert_eq!(result.status_code, Some(503));
        assert_eq!(result.error.as_deref(), Some("http status 503"));

        let row = f
            .store
            .get_webhook_delivery(result.delivery_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, delivery_status::FAILED);
        assert_eq!(row.attempt_count, 3);
        assert!(row.next_retry_at.is_none());

        f.recorder.flush().await;
        let failures = f
            .recorder
            .query(&crate::persistence::EventQuery {
                workspace_id: Some(ws),
                event_types: vec![types::WEBHOOK_DELIVERY_FAILED.into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_retry_runs_one_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let f = fixture();
        let ws = Uuid::new_v4();
        let endpoint = f
            .service
            .create_endpoint(
                ws,
                CreateWebhookEndpoint {
                    url: server.uri(),
                    events: vec!["app_published".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .endpoint;

        let failed = f
            .service
            .test_delivery(ws, endpoint.id, "app_published", Some(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(failed.status, delivery_status::FAILED);

        let retried = f
            .service
            .retry_delivery(ws, endpoint.id, failed.delivery_id)
            .await
            .unwrap();
        assert!(retried.is_success());
        assert_eq!(retried.attempt, 4);

        let err = f
            .service
            .retry_delivery(ws, endpoint.id, failed.delivery_id)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_unreadable_secret_fails_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let f = fixture();
        let ws = Uuid::new_v4();
        let mut endpoint = f
            .service
            .create_endpoint(
                ws,
                CreateWebhookEndpoint {
                    url: server.uri(),
                    events: vec!["app_published".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .endpoint;
        endpoint.secret_encrypted = Some("enc:garbage".into());
        f.store.update_webhook_endpoint(&endpoint).await.unwrap();

        let results = f.service.dispatch_event(&published_event(ws)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, delivery_status::FAILED);
        assert_eq!(results[0].attempt, 3);
        assert_eq!(results[0].status_code, None);
        assert!(results[0].error.as_deref().unwrap().contains("decode"));

        let row = f
            .store
            .get_webhook_delivery(results[0].delivery_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, delivery_status::FAILED);
        assert_eq!(row.attempt_count, 3);
        assert_eq!(row.last_status_code, None);
        assert!(row.last_error.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_closes_out_pending_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryPersistence::new());
        let recorder = Arc::new(EventRecorder::new(store.clone(), false));
        let encryptor = Arc::new(AesGcmEncryptor::new(&[9u8; 32]).unwrap());
        let shutdown = CancellationToken::new();
        let service = WebhookService::new(store.clone(), encryptor, &recorder, shutdown.clone())
            .with_retry_delays(vec![Duration::from_secs(3600); 3]);
        let ws = Uuid::new_v4();
        let endpoint = service
            .create_endpoint(
                ws,
                CreateWebhookEndpoint {
                    url: server.uri(),
                    events: vec!["app_published".into()],
                    signing_enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .endpoint;

        shutdown.cancel();
        let result = service
            .test_delivery(ws, endpoint.id, "app_published", None)
            .await
            .unwrap();
        assert_eq!(result.status, delivery_status::FAILED);
        assert_eq!(result.attempt, 1);

        let row = store
            .get_webhook_delivery(result.delivery_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, delivery_status::FAILED);
        assert_eq!(row.attempt_count, 1);
        assert!(row.next_retry_at.is_none());
        assert_eq!(
            row.last_error.as_deref(),
            Some("http status 500; interrupted by shutdown")
        );
    }

    #[tokio::test]
    async fn test_endpoint_scoping_and_rotation() {
        let f = fixture();
        let ws = Uuid::new_v4();
        let endpoint = f
            .service
            .create_endpoint(
                ws,
                CreateWebhookEndpoint {
                    url: "https://hooks.example.com".into(),
                    events: vec!["app_published".into()],
                    signing_enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .endpoint;

        let other = Uuid::new_v4();
        assert!(matches!(
            f.service.rotate_secret(other, endpoint.id).await.unwrap_err(),
            CoreError::NotFound(_)
        ));

        let err = f
            .service
            .update_endpoint(
                ws,
                endpoint.id,
                UpdateWebhookEndpoint {
                    signing_enabled: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REQUEST");

        let rotated = f.service.rotate_secret(ws, endpoint.id).await.unwrap();
        let secret = rotated.secret.unwrap();
        assert_eq!(secret.len(), SECRET_BYTES * 2);
        assert!(rotated.endpoint.signing_enabled);

        let paused = f
            .service
            .update_endpoint(
                ws,
                endpoint.id,
                UpdateWebhookEndpoint {
                    active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!paused.active);
        assert!(f.service.dispatch_event(&published_event(ws)).await.is_empty());
    }

    #[test]
    fn test_catalog_groups_keep_order() {
        let groups = event_catalog();
        let total: usize = groups.iter().map(|g| g.events.len()).sum();
        assert_eq!(total, catalog::all().len());
        assert_eq!(groups[0].category, "runtime");
        assert_eq!(groups[0].events[0].event_type, types::RUNTIME_ENTRY);
    }
}
