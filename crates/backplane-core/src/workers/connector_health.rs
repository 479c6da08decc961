// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker watching connector credential expiry.
//!
//! Active `oauth_token` and `api_token` secrets are classified against the
//! warning window. Transitions into `expiring` or `expired` emit an event;
//! the classification is written back to the secret metadata either way.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::env_parse;
use crate::error::Result;
use crate::events::{EventRecorder, RuntimeEvent, Severity, types};
use crate::persistence::{Persistence, SecretRecord};
use crate::secrets::{CONNECTOR_SECRET_TYPES, owner_type};

/// Connector health worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorHealthConfig {
    /// Whether the worker runs at all.
    pub enabled: bool,
    /// Time between scans.
    pub interval: Duration,
    /// Credentials expiring within this many days are `expiring`.
    pub warning_days: i64,
}

impl Default for ConnectorHealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(6 * 3600),
            warning_days: 7,
        }
    }
}

impl ConnectorHealthConfig {
    /// Load configuration from environment variables.
    ///
    /// - `BACKPLANE_CONNECTOR_HEALTH_ENABLED` (default: true)
    /// - `BACKPLANE_CONNECTOR_HEALTH_INTERVAL_SECS` (default: 21600)
    /// - `BACKPLANE_CONNECTOR_HEALTH_WARNING_DAYS` (default: 7)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("BACKPLANE_CONNECTOR_HEALTH_ENABLED")
                .map(|v| !(v == "false" || v == "0"))
                .unwrap_or(defaults.enabled),
            interval: env_parse::<u64>("BACKPLANE_CONNECTOR_HEALTH_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            warning_days: env_parse::<i64>("BACKPLANE_CONNECTOR_HEALTH_WARNING_DAYS")
                .filter(|d| *d >= 0)
                .unwrap_or(defaults.warning_days),
        }
    }
}

/// Credential expiry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Expires after the warning window.
    Healthy,
    /// Expires inside the warning window.
    Expiring,
    /// Already expired.
    Expired,
    /// No expiry recorded.
    NoExpiry,
}

impl HealthStatus {
    /// Stored form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Expiring => "expiring",
            Self::Expired => "expired",
            Self::NoExpiry => "no_expiry",
        }
    }
}

/// Classifies an expiry relative to `now` and `now + warning_days`.
pub fn classify_expiry(
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    warning_days: i64,
) -> HealthStatus {
    match expires_at {
        None => HealthStatus::NoExpiry,
        Some(at) if at <= now => HealthStatus::Expired,
        Some(at) if at <= now + chrono::Duration::days(warning_days) => HealthStatus::Expiring,
        Some(_) => HealthStatus::Healthy,
    }
}

/// Counts from one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectorHealthReport {
    /// Secrets examined.
    pub checked: u64,
    /// Secrets newly classified as expiring.
    pub expiring: u64,
    /// Secrets newly classified as expired.
    pub expired: u64,
    /// Secrets that could not be updated.
    pub failed: u64,
}

/// Periodic connector credential scanner.
pub struct ConnectorHealthWorker {
    persistence: Arc<dyn Persistence>,
    recorder: Arc<EventRecorder>,
    config: ConnectorHealthConfig,
    shutdown: CancellationToken,
}

impl ConnectorHealthWorker {
    /// Create a new worker.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        recorder: Arc<EventRecorder>,
        config: ConnectorHealthConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            persistence,
            recorder,
            config,
            shutdown,
        }
    }

    /// Scan until shutdown. The first scan runs immediately.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Connector health worker disabled");
            return;
        }
        info!(
            interval_secs = self.config.interval.as_secs(),
            warning_days = self.config.warning_days,
            "Connector health worker started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Connector health worker received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!(error = %e, "Connector health scan failed");
                    }
                }
            }
        }

        info!("Connector health worker stopped");
    }

    /// One scan evaluated at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ConnectorHealthReport> {
        let secret_types: Vec<String> =
            CONNECTOR_SECRET_TYPES.iter().map(|s| s.to_string()).collect();
        let secrets = self
            .persistence
            .list_active_secrets_by_type(&secret_types)
            .await?;

        let mut report = ConnectorHealthReport::default();
        for secret in secrets {
            report.checked += 1;
            let status = classify_expiry(secret.expires_at, now, self.config.warning_days);
            let previous = secret
                .metadata
                .get("health_status")
                .and_then(Value::as_str)
                .map(str::to_string);
            let changed = previous.as_deref() != Some(status.as_str());

            if let Err(e) = self.store_status(secret.clone(), status, now).await {
                error!(secret_id = %secret.id, error = %e, "Failed to update connector health");
                report.failed += 1;
                continue;
            }
            if !changed {
                continue;
            }
            match status {
                HealthStatus::Expired => {
                    report.expired += 1;
                    self.emit(&secret, status, types::CONNECTOR_CREDENTIAL_EXPIRED, Severity::Error)
                        .await;
                }
                HealthStatus::Expiring => {
                    report.expiring += 1;
                    self.emit(&secret, status, types::CONNECTOR_CREDENTIAL_EXPIRING, Severity::Warn)
                        .await;
                }
                HealthStatus::Healthy | HealthStatus::NoExpiry => {}
            }
        }

        if report.expired > 0 || report.expiring > 0 {
            info!(
                checked = report.checked,
                expiring = report.expiring,
                expired = report.expired,
                "Connector health scan completed"
            );
        } else {
            debug!(checked = report.checked, "Connector health scan completed");
        }
        Ok(report)
    }

    async fn store_status(
        &self,
        mut secret: SecretRecord,
        status: HealthStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !secret.metadata.is_object() {
            secret.metadata = json!({});
        }
        if let Some(meta) = secret.metadata.as_object_mut() {
            meta.insert("health_status".into(), json!(status.as_str()));
            meta.insert("health_checked_at".into(), json!(now));
        }
        self.persistence.update_secret(&secret).await?;
        Ok(())
    }

    async fn emit(
        &self,
        secret: &SecretRecord,
        status: HealthStatus,
        event_type: &str,
        severity: Severity,
    ) {
        let mut event = RuntimeEvent::new(event_type)
            .severity(severity)
            .message(format!("Credential '{}' is {}", secret.name, status.as_str()))
            .meta("secret_id", secret.id.to_string())
            .meta("secret_type", secret.secret_type.clone())
            .meta("expires_at", json!(secret.expires_at));
        if let Some(provider) = secret.metadata.get("provider") {
            event = event.meta("provider", provider.clone());
        }
        event = if secret.owner_type == owner_type::WORKSPACE {
            event.workspace(secret.owner_id)
        } else {
            event.user(Some(secret.owner_id))
        };
        let _ = self.recorder.record(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_env::{ENV_MUTEX, EnvGuard};
    use crate::crypto::AesGcmEncryptor;
    use crate::persistence::{EventQuery, MemoryPersistence};
    use crate::secrets::{CreateSecret, SecretService};
    use uuid::Uuid;

    #[test]
    fn test_classify_expiry() {
        let now = Utc::now();
        let day = chrono::Duration::days(1);
        assert_eq!(classify_expiry(None, now, 7), HealthStatus::NoExpiry);
        assert_eq!(classify_expiry(Some(now - day), now, 7), HealthStatus::Expired);
        assert_eq!(classify_expiry(Some(now), now, 7), HealthStatus::Expired);
        assert_eq!(classify_expiry(Some(now + day * 3), now, 7), HealthStatus::Expiring);
        assert_eq!(classify_expiry(Some(now + day * 7), now, 7), HealthStatus::Expiring);
        assert_eq!(classify_expiry(Some(now + day * 8), now, 7), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_scan_emits_on_transition_only() {
        let store = Arc::new(MemoryPersistence::new());
        let persistence: Arc<dyn Persistence> = store.clone();
        let recorder = Arc::new(EventRecorder::new(Arc::clone(&persistence), false));
        let secrets = SecretService::new(
            Arc::clone(&persistence),
            Arc::new(AesGcmEncryptor::new(&[1u8; 32]).unwrap()),
            Arc::clone(&recorder),
        );
        let now = Utc::now();
        let workspace = Uuid::new_v4();
        let make = |secret_type: &str, expires_at| CreateSecret {
            owner_type: owner_type::WORKSPACE.into(),
            owner_id: workspace,
            secret_type: secret_type.into(),
            name: "shopify".into(),
            value: "token-value-123".into(),
            expires_at,
            metadata: json!({"provider": "shopify"}),
        };
        let expired = secrets
            .create(make("oauth_token", Some(now - chrono::Duration::hours(1))))
            .await
            .unwrap();
        secrets
            .create(make("api_token", Some(now + chrono::Duration::days(2))))
            .await
            .unwrap();
        secrets.create(make("api_token", None)).await.unwrap();
        secrets
            .create(make("api_key", Some(now - chrono::Duration::days(1))))
            .await
            .unwrap();

        let worker = ConnectorHealthWorker::new(
            persistence,
            recorder,
            ConnectorHealthConfig::default(),
            CancellationToken::new(),
        );
        let report = worker.run_once(now).await.unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.expired, 1);
        assert_eq!(report.expiring, 1);

        let stored = store.get_secret(expired.id).await.unwrap().unwrap();
        assert_eq!(stored.metadata["health_status"], "expired");
        assert!(stored.metadata.get("health_checked_at").is_some());
        assert_eq!(stored.metadata["provider"], "shopify");

        let again = worker.run_once(now).await.unwrap();
        assert_eq!((again.expired, again.expiring), (0, 0));

        let events = store
            .list_events(&EventQuery {
                event_types: vec![
                    types::CONNECTOR_CREDENTIAL_EXPIRED.into(),
                    types::CONNECTOR_CREDENTIAL_EXPIRING.into(),
                ],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        let expired_event = events
            .iter()
            .find(|e| e.event_type == types::CONNECTOR_CREDENTIAL_EXPIRED)
            .unwrap();
        assert_eq!(expired_event.severity, "error");
        assert_eq!(expired_event.workspace_id, Some(workspace));
    }

    #[test]
    fn test_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
        let mut env = EnvGuard::new();
        env.set("BACKPLANE_CONNECTOR_HEALTH_WARNING_DAYS", "14");
        env.set("BACKPLANE_CONNECTOR_HEALTH_ENABLED", "0");
        env.remove("BACKPLANE_CONNECTOR_HEALTH_INTERVAL_SECS");
        let config = ConnectorHealthConfig::from_env();
        assert!(!config.enabled);
        assert_eq!(config.warning_days, 14);
        assert_eq!(config.interval, Duration::from_secs(21600));
    }
}
