// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Twilio SMS channel.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Notification, NotificationChannel};
use crate::error::{CoreError, Result};
use crate::persistence::UserRecord;

/// Twilio REST base URL.
pub const DEFAULT_TWILIO_API_BASE: &str = "https://api.twilio.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// SMS bodies are cut to one concatenated message.
const MAX_SMS_CHARS: usize = 320;

/// Twilio account settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwilioConfig {
    /// Account SID.
    pub account_sid: String,
    /// Auth token.
    pub auth_token: String,
    /// Sender number.
    pub from: String,
    /// REST base URL.
    pub api_base: String,
}

impl TwilioConfig {
    /// Reads `AGENTFLOW_TWILIO_SID`, `_TOKEN` and `_FROM`; all three are
    /// required. `AGENTFLOW_TWILIO_API_BASE` overrides the REST base URL.
    pub fn from_env() -> Option<Self> {
        let var = |k: &str| env::var(k).ok().filter(|v| !v.trim().is_empty());
        Some(Self {
            account_sid: var("AGENTFLOW_TWILIO_SID")?,
            auth_token: var("AGENTFLOW_TWILIO_TOKEN")?,
            from: var("AGENTFLOW_TWILIO_FROM")?,
            api_base: var("AGENTFLOW_TWILIO_API_BASE")
                .unwrap_or_else(|| DEFAULT_TWILIO_API_BASE.to_string()),
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base.trim_end_matches('/'),
            self.account_sid
        )
    }
}

/// Sends the notification title and first body line as an SMS.
pub struct SmsChannel {
    config: TwilioConfig,
    client: reqwest::Client,
}

impl SmsChannel {
    /// Creates the channel.
    pub fn new(config: TwilioConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

fn sms_text(notification: &Notification) -> String {
    let first_line = notification.body.lines().next().unwrap_or_default();
    let text = format!("{} {}", notification.title, first_line);
    text.trim().chars().take(MAX_SMS_CHARS).collect()
}

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn name(&self) -> &'static str {
        "sms"
    }

    async fn send(&self, recipient: &UserRecord, notification: &Notification) -> Result<bool> {
        let Some(phone) = recipient.phone.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(false);
        };
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("To", phone)
            .append_pair("From", &self.config.from)
            .append_pair("Body", &sms_text(notification))
            .finish();
        let response = self
            .client
            .post(self.config.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(form)
            .send()
            .await
            .map_err(|e| CoreError::Internal(format!("sms request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Internal(format!("sms provider returned {status}: {body}")));
        }
        debug!(user_id = %recipient.id, "SMS notification sent");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn user(phone: Option<&str>) -> UserRecord {
        UserRecord {
            id: Uuid::new_v4(),
            email: None,
            phone: phone.map(str::to_string),
            display_name: "Owner".into(),
            created_at: Utc::now(),
        }
    }

    fn notification() -> Notification {
        Notification {
            event_type: "quota_exceeded".into(),
            severity: "critical".into(),
            workspace_id: None,
            title: "[CRITICAL] Quota exceeded".into(),
            body: "Workspace: demo\nMore".into(),
        }
    }

    #[tokio::test]
    async fn test_sms_posts_form_to_account() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .and(header_exists("authorization"))
            .and(body_string_contains("To=%2B15550001111"))
            .and(body_string_contains("From=%2B15559990000"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let channel = SmsChannel::new(TwilioConfig {
            account_sid: "AC123".into(),
            auth_token: "tok".into(),
            from: "+15559990000".into(),
            api_base: server.uri(),
        });
        assert!(channel.send(&user(Some("+15550001111")), &notification()).await.unwrap());
        assert!(!channel.send(&user(None), &notification()).await.unwrap());
    }

    #[tokio::test]
    async fn test_sms_provider_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad number"))
            .mount(&server)
            .await;
        let channel = SmsChannel::new(TwilioConfig {
            account_sid: "AC1".into(),
            auth_token: "t".into(),
            from: "+1".into(),
            api_base: server.uri(),
        });
        let err = channel
            .send(&user(Some("+1000")), &notification())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad number"));
    }

    #[test]
    fn test_sms_text_uses_first_line() {
        assert_eq!(sms_text(&notification()), "[CRITICAL] Quota exceeded Workspace: demo");
    }
}
