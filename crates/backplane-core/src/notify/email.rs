// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SMTP email channel.

use std::env;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};

use super::{Notification, NotificationChannel};
use crate::error::{CoreError, Result};
use crate::persistence::UserRecord;

/// Implicit-TLS submission port.
const SMTPS_PORT: u16 = 465;

/// SMTP server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    /// Server host.
    pub host: String,
    /// Server port (default: 587).
    pub port: u16,
    /// Sender address.
    pub from: String,
    /// Sender display name.
    pub from_name: Option<String>,
    /// Login user.
    pub username: Option<String>,
    /// Login password.
    pub password: Option<String>,
}

impl SmtpConfig {
    /// Reads `AGENTFLOW_SMTP_*`. Returns `None` unless host and sender are set.
    ///
    /// - `AGENTFLOW_SMTP_HOST`, `AGENTFLOW_SMTP_FROM`: required
    /// - `AGENTFLOW_SMTP_PORT`: default 587
    /// - `AGENTFLOW_SMTP_FROM_NAME`, `AGENTFLOW_SMTP_USERNAME`, `AGENTFLOW_SMTP_PASSWORD`
    pub fn from_env() -> Option<Self> {
        let var = |k: &str| env::var(k).ok().filter(|v| !v.trim().is_empty());
        let host = var("AGENTFLOW_SMTP_HOST")?;
        let from = var("AGENTFLOW_SMTP_FROM")?;
        Some(Self {
            host,
            port: var("AGENTFLOW_SMTP_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(587),
            from,
            from_name: var("AGENTFLOW_SMTP_FROM_NAME"),
            username: var("AGENTFLOW_SMTP_USERNAME"),
            password: var("AGENTFLOW_SMTP_PASSWORD"),
        })
    }
}

/// Sends notifications as plain-text email.
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl EmailChannel {
    /// Builds the transport: implicit TLS on 465, STARTTLS when credentials
    /// are set, plain otherwise.
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let address: Address = config
            .from
            .parse()
            .map_err(|e| CoreError::Internal(format!("invalid SMTP sender: {e}")))?;
        let sender = Mailbox::new(config.from_name.clone(), address);

        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some(Credentials::new(user.clone(), pass.clone())),
            _ => None,
        };
        let mut builder = if config.port == SMTPS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else if credentials.is_some() {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        } else {
            Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host))
        }
        .map_err(|e| CoreError::Internal(format!("SMTP transport: {e}")))?
        .port(config.port);
        if let Some(credentials) = credentials {
            builder = builder.credentials(credentials);
        }

        Ok(Self {
            transport: builder.build(),
            sender,
        })
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, recipient: &UserRecord, notification: &Notification) -> Result<bool> {
        let Some(email) = recipient.email.as_deref().filter(|e| !e.is_empty()) else {
            return Ok(false);
        };
        let to: Address = email
            .parse()
            .map_err(|e| CoreError::InvalidRequest(format!("invalid recipient email: {e}")))?;
        let message = Message::builder()
            .from(self.sender.clone())
            .to(Mailbox::new(Some(recipient.display_name.clone()), to))
            .subject(&notification.title)
            .header(ContentType::TEXT_PLAIN)
            .body(notification.body.clone())
            .map_err(|e| CoreError::Internal(format!("build email: {e}")))?;
        self.transport
            .send(message)
            .await
            .map_err(|e| CoreError::Internal(format!("smtp send: {e}")))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_env::{ENV_MUTEX, EnvGuard};

    #[test]
    fn test_smtp_config_requires_host_and_sender() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("AGENTFLOW_SMTP_HOST");
        guard.set("AGENTFLOW_SMTP_FROM", "ops@example.com");
        assert!(SmtpConfig::from_env().is_none());

        guard.set("AGENTFLOW_SMTP_HOST", "smtp.example.com");
        guard.set("AGENTFLOW_SMTP_PORT", "465");
        guard.set("AGENTFLOW_SMTP_FROM_NAME", "Backplane");
        guard.remove("AGENTFLOW_SMTP_USERNAME");
        guard.remove("AGENTFLOW_SMTP_PASSWORD");
        let config = SmtpConfig::from_env().unwrap();
        assert_eq!(config.port, 465);
        assert_eq!(config.from_name.as_deref(), Some("Backplane"));
        assert!(config.username.is_none());

        guard.set("AGENTFLOW_SMTP_PORT", "nope");
        assert_eq!(SmtpConfig::from_env().unwrap().port, 587);
    }

    #[tokio::test]
    async fn test_channel_rejects_bad_sender() {
        let config = SmtpConfig {
            host: "localhost".into(),
            port: 25,
            from: "not an address".into(),
            from_name: None,
            username: None,
            password: None,
        };
        assert!(EmailChannel::new(&config).is_err());
        let ok = SmtpConfig {
            from: "ops@example.com".into(),
            ..config
        };
        assert!(EmailChannel::new(&ok).is_ok());
    }
}
