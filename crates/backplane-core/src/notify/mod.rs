// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Critical-event notifications.
//!
//! [`CriticalEventNotifier`] is an [`EventDispatcher`]: for every recorded
//! event whose type is critical it resolves the recipients (the triggering
//! user and the workspace owner) and sends one [`Notification`] per recipient
//! through each configured [`NotificationChannel`]. The in-app channel is
//! always present; email and SMS are added when their configs are set.
//!
//! Channel failures are logged and never reach the recorder.

mod email;
mod sms;

pub use email::{EmailChannel, SmtpConfig};
pub use sms::{DEFAULT_TWILIO_API_BASE, SmsChannel, TwilioConfig};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::events::{EventDispatcher, catalog};
use crate::persistence::{EventRecord, NotificationRecord, Persistence, UserRecord};

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Source event type.
    pub event_type: String,
    /// Source event severity.
    pub severity: String,
    /// Workspace correlator.
    pub workspace_id: Option<Uuid>,
    /// One-line title.
    pub title: String,
    /// Multi-line body.
    pub body: String,
}

/// A transport for notifications.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Sends to one recipient. `Ok(false)` means the recipient has no address
    /// for this channel.
    async fn send(&self, recipient: &UserRecord, notification: &Notification) -> Result<bool>;
}

/// Builds the notification for a critical event; `None` for other events.
pub fn compose(event: &EventRecord) -> Option<Notification> {
    if !catalog::is_critical(&event.event_type) {
        return None;
    }
    let description = catalog::lookup(&event.event_type)
        .map_or(event.event_type.as_str(), |info| info.description);
    let title = format!("[{}] {}", event.severity.to_uppercase(), description);

    let mut lines = Vec::new();
    if let Some(ws) = event.workspace_id {
        lines.push(format!("Workspace: {ws}"));
    }
    if let Some(exec) = event.execution_id {
        lines.push(format!("Execution: {exec}"));
    }
    if let Some(message) = event.message.as_deref().filter(|m| !m.is_empty()) {
        lines.push(format!("Message: {message}"));
    }
    match (&event.error_code, &event.error_message) {
        (Some(code), Some(msg)) => lines.push(format!("Error: {code} {msg}")),
        (Some(code), None) => lines.push(format!("Error: {code}")),
        (None, Some(msg)) => lines.push(format!("Error: {msg}")),
        (None, None) => {}
    }
    lines.push(format!("Event: {}", event.event_type));
    lines.push(format!(
        "Time: {}",
        event.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));

    Some(Notification {
        event_type: event.event_type.clone(),
        severity: event.severity.clone(),
        workspace_id: event.workspace_id,
        title,
        body: lines.join("\n"),
    })
}

/// Stores notifications for the in-app inbox.
pub struct InAppChannel {
    persistence: Arc<dyn Persistence>,
}

impl InAppChannel {
    /// Creates the channel.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl NotificationChannel for InAppChannel {
    fn name(&self) -> &'static str {
        "in_app"
    }

    async fn send(&self, recipient: &UserRecord, notification: &Notification) -> Result<bool> {
        let record = NotificationRecord {
            id: Uuid::new_v4(),
            user_id: recipient.id,
            workspace_id: notification.workspace_id,
            event_type: notification.event_type.clone(),
            severity: notification.severity.clone(),
            title: notification.title.clone(),
            body: notification.body.clone(),
            created_at: Utc::now(),
        };
        self.persistence.insert_notification(&record).await?;
        Ok(true)
    }
}

/// Fans critical events out to every channel.
pub struct CriticalEventNotifier {
    persistence: Arc<dyn Persistence>,
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl CriticalEventNotifier {
    /// A notifier with the in-app channel only.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        let in_app: Arc<dyn NotificationChannel> =
            Arc::new(InAppChannel::new(Arc::clone(&persistence)));
        Self {
            persistence,
            channels: vec![in_app],
        }
    }

    /// Adds the email and SMS channels that are configured. A broken SMTP
    /// config is logged and skipped.
    pub fn from_config(
        persistence: Arc<dyn Persistence>,
        smtp: Option<&SmtpConfig>,
        twilio: Option<&TwilioConfig>,
    ) -> Self {
        let mut notifier = Self::new(persistence);
        if let Some(config) = smtp {
            match EmailChannel::new(config) {
                Ok(channel) => notifier = notifier.with_channel(Arc::new(channel)),
                Err(e) => warn!(host = %config.host, error = %e, "SMTP channel disabled"),
            }
        }
        if let Some(config) = twilio {
            notifier = notifier.with_channel(Arc::new(SmsChannel::new(config.clone())));
        }
        notifier
    }

    /// Adds a channel.
    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Names of the active channels.
    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Triggering user first, then the workspace owner; unknown ids are
    /// skipped.
    async fn recipients(&self, event: &EventRecord) -> Vec<UserRecord> {
        let mut ids: Vec<Uuid> = Vec::with_capacity(2);
        if let Some(user_id) = event.user_id {
            ids.push(user_id);
        }
        if let Some(ws) = event.workspace_id {
            match self.persistence.get_workspace(ws).await {
                Ok(Some(workspace)) if !ids.contains(&workspace.owner_user_id) => {
                    ids.push(workspace.owner_user_id)
                }
                Ok(_) => {}
                Err(e) => warn!(workspace_id = %ws, error = %e, "Failed to load workspace owner"),
            }
        }

        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            match self.persistence.get_user(id).await {
                Ok(Some(user)) => users.push(user),
                Ok(None) => debug!(user_id = %id, "Notification recipient not found"),
                Err(e) => warn!(user_id = %id, error = %e, "Failed to load notification recipient"),
            }
        }
        users
    }

    /// Sends the event's notification; returns the number of successful
    /// sends.
    pub async fn notify(&self, event: &EventRecord) -> usize {
        let Some(notification) = compose(event) else {
            return 0;
        };
        let recipients = self.recipients(event).await;
        if recipients.is_empty() {
            debug!(event_type = %event.event_type, "Critical event has no recipients");
            return 0;
        }

        let mut sent = 0;
        for recipient in &recipients {
            for channel in &self.channels {
                match channel.send(recipient, &notification).await {
                    Ok(true) => sent += 1,
                    Ok(false) => {}
                    Err(e) => warn!(
                        channel = channel.name(),
                        user_id = %recipient.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Notification channel failed"
                    ),
                }
            }
        }
        debug!(event_type = %event.event_type, sent, "Critical event notified");
        sent
    }
}

#[async_trait]
impl EventDispatcher for CriticalEventNotifier {
    fn name(&self) -> &'static str {
        "critical_notifier"
    }

    async fn dispatch(&self, event: &EventRecord) {
        self.notify(event).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::error::CoreError;
    use crate::events::types;
    use crate::persistence::MemoryPersistence;
    use crate::runtime::test_support::published_workspace;

    struct Recording {
        sent: Mutex<Vec<(Uuid, String)>>,
    }

    #[async_trait]
    impl NotificationChannel for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, recipient: &UserRecord, n: &Notification) -> Result<bool> {
            self.sent.lock().unwrap().push((recipient.id, n.title.clone()));
            Ok(true)
        }
    }

    struct Broken;

    #[async_trait]
    impl NotificationChannel for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn send(&self, _: &UserRecord, _: &Notification) -> Result<bool> {
            Err(CoreError::Internal("transport down".into()))
        }
    }

    fn event(event_type: &str, workspace_id: Uuid, user_id: Option<Uuid>) -> EventRecord {
        EventRecord {
            id: Uuid::new_v4(),
            sequence_num: 1,
            event_type: event_type.into(),
            severity: "critical".into(),
            workspace_id: Some(workspace_id),
            execution_id: None,
            user_id,
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
            error_code: Some("DB_ERROR".into()),
            error_message: Some("connection refused".into()),
            message: Some("provisioning failed".into()),
            metadata: json!({}),
            created_at: Utc::now(),
        }
    }

    async fn user(store: &MemoryPersistence, id: Uuid) {
        store
            .upsert_user(&UserRecord {
                id,
                email: Some("owner@example.com".into()),
                phone: None,
                display_name: "Owner".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_compose_only_for_critical_types() {
        let ws = Uuid::new_v4();
        let n = compose(&event(types::DB_PROVISION_FAILED, ws, None)).unwrap();
        assert_eq!(n.title, "[CRITICAL] Workspace database provisioning failed");
        assert!(n.body.contains(&format!("Workspace: {ws}")));
        assert!(n.body.contains("Error: DB_ERROR connection refused"));
        assert!(compose(&event(types::RUNTIME_ENTRY, ws, None)).is_none());
    }

    #[tokio::test]
    async fn test_notifies_user_and_owner_and_swallows_failures() {
        let store = Arc::new(MemoryPersistence::new());
        let ws = published_workspace("notify");
        store.create_workspace(&ws).await.unwrap();
        user(&store, ws.owner_user_id).await;
        let actor = Uuid::new_v4();
        user(&store, actor).await;

        let recording = Arc::new(Recording {
            sent: Mutex::new(Vec::new()),
        });
        let notifier = CriticalEventNotifier::new(store.clone())
            .with_channel(Arc::new(Broken))
            .with_channel(recording.clone());
        assert_eq!(notifier.channel_names(), vec!["in_app", "broken", "recording"]);

        let sent = notifier
            .notify(&event(types::DB_PROVISION_FAILED, ws.id, Some(actor)))
            .await;
        // in_app + recording for each of the two recipients.
        assert_eq!(sent, 4);
        let recipients: Vec<Uuid> = recording.sent.lock().unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(recipients, vec![actor, ws.owner_user_id]);

        let inbox = store.list_notifications(ws.owner_user_id).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].event_type, types::DB_PROVISION_FAILED);
        assert_eq!(inbox[0].workspace_id, Some(ws.id));
    }

    #[tokio::test]
    async fn test_owner_is_not_notified_twice() {
        let store = Arc::new(MemoryPersistence::new());
        let ws = published_workspace("dedup");
        store.create_workspace(&ws).await.unwrap();
        user(&store, ws.owner_user_id).await;

        let notifier = CriticalEventNotifier::new(store.clone());
        let sent = notifier
            .notify(&event(types::QUOTA_EXCEEDED, ws.id, Some(ws.owner_user_id)))
            .await;
        assert_eq!(sent, 1);
        assert_eq!(notifier.notify(&event(types::APP_PUBLISHED, ws.id, None)).await, 0);
    }
}
