// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Encrypted credential store: create, reveal, rotate, revoke.
//!
//! Plaintext never leaves this module except through [`SecretService::reveal`],
//! which also stamps `last_used_at`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::crypto::{Encryptor, secret_preview};
use crate::error::{CoreError, Result};
use crate::events::{EventRecorder, RuntimeEvent, types};
use crate::persistence::{Persistence, SecretRecord};

/// Secret lifecycle states.
pub mod secret_status {
    /// Usable.
    pub const ACTIVE: &str = "active";
    /// Permanently disabled.
    pub const REVOKED: &str = "revoked";
}

/// Owner kinds.
pub mod owner_type {
    /// Owned by a platform user.
    pub const USER: &str = "user";
    /// Owned by a workspace.
    pub const WORKSPACE: &str = "workspace";
}

/// Secret types scanned by the connector health worker.
pub const CONNECTOR_SECRET_TYPES: &[&str] = &["oauth_token", "api_token"];

/// Input for [`SecretService::create`].
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSecret {
    /// `user` or `workspace`.
    pub owner_type: String,
    /// Owner id.
    pub owner_id: Uuid,
    /// `oauth_token`, `api_token`, `api_key`, ...
    pub secret_type: String,
    /// Display name.
    pub name: String,
    /// Plaintext value.
    pub value: String,
    /// Optional expiry.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider or connector details.
    #[serde(default)]
    pub metadata: Value,
}

/// Secret lifecycle service.
pub struct SecretService {
    persistence: Arc<dyn Persistence>,
    encryptor: Arc<dyn Encryptor>,
    events: Arc<EventRecorder>,
}

impl SecretService {
    /// Creates the service.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        encryptor: Arc<dyn Encryptor>,
        events: Arc<EventRecorder>,
    ) -> Self {
        Self {
            persistence,
            encryptor,
            events,
        }
    }

    /// Encrypts and stores a new secret.
    pub async fn create(&self, input: CreateSecret) -> Result<SecretRecord> {
        if input.owner_type != owner_type::USER && input.owner_type != owner_type::WORKSPACE {
            return Err(CoreError::validation("owner_type", "must be user or workspace"));
        }
        if input.name.trim().is_empty() {
            return Err(CoreError::validation("name", "must not be empty"));
        }
        if input.secret_type.trim().is_empty() {
            return Err(CoreError::validation("secret_type", "must not be empty"));
        }
        if input.value.is_empty() {
            return Err(CoreError::validation("value", "must not be empty"));
        }
        let now = Utc::now();
        let secret = SecretRecord {
            id: Uuid::new_v4(),
            owner_type: input.owner_type,
            owner_id: input.owner_id,
            secret_type: input.secret_type,
            name: input.name.trim().to_string(),
            encrypted_value: self.encryptor.encrypt(&input.value)?,
            preview: secret_preview(&input.value),
            status: secret_status::ACTIVE.into(),
            expires_at: input.expires_at,
            last_rotated_at: None,
            last_used_at: None,
            metadata: if input.metadata.is_null() {
                json!({})
            } else {
                input.metadata
            },
            created_at: now,
            updated_at: now,
        };
        self.persistence.create_secret(&secret).await?;
        Ok(secret)
    }

    /// Metadata only.
    pub async fn get(&self, id: Uuid) -> Result<SecretRecord> {
        self.persistence
            .get_secret(id)
            .await?
            .ok_or_else(|| CoreError::NotFound("secret".into()))
    }

    /// Decrypts an active secret and records the use.
    pub async fn reveal(&self, id: Uuid) -> Result<String> {
        let mut secret = self.active(id).await?;
        let plaintext = self.encryptor.decrypt(&secret.encrypted_value)?;
        secret.last_used_at = Some(Utc::now());
        self.persistence.update_secret(&secret).await?;
        Ok(plaintext)
    }

    /// Replaces the value of an active secret. A new expiry may be supplied;
    /// otherwise the old one is cleared, since it described the old value.
    pub async fn rotate(
        &self,
        id: Uuid,
        new_value: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<SecretRecord> {
        if new_value.is_empty() {
            return Err(CoreError::validation("value", "must not be empty"));
        }
        let mut secret = self.active(id).await?;
        let now = Utc::now();
        secret.encrypted_value = self.encryptor.encrypt(new_value)?;
        secret.preview = secret_preview(new_value);
        secret.expires_at = expires_at;
        secret.last_rotated_at = Some(now);
        secret.updated_at = now;
        if let Some(meta) = secret.metadata.as_object_mut() {
            meta.remove("health_status");
            meta.remove("health_checked_at");
        }
        self.persistence.update_secret(&secret).await?;
        self.emit(types::SECRET_ROTATED, &secret, None).await;
        info!(secret_id = %secret.id, secret_type = %secret.secret_type, "Secret rotated");
        Ok(secret)
    }

    /// Revokes a secret. Revoking twice is a no-op.
    pub async fn revoke(&self, id: Uuid, reason: Option<&str>) -> Result<SecretRecord> {
        let mut secret = self.get(id).await?;
        if secret.status == secret_status::REVOKED {
            return Ok(secret);
        }
        secret.status = secret_status::REVOKED.into();
        secret.updated_at = Utc::now();
        self.persistence.update_secret(&secret).await?;
        self.emit(types::SECRET_REVOKED, &secret, reason).await;
        info!(secret_id = %secret.id, "Secret revoked");
        Ok(secret)
    }

    async fn active(&self, id: Uuid) -> Result<SecretRecord> {
        let secret = self.get(id).await?;
        if secret.status != secret_status::ACTIVE {
            return Err(CoreError::InvalidState {
                expected: secret_status::ACTIVE.into(),
                actual: secret.status,
            });
        }
        Ok(secret)
    }

    async fn emit(&self, event_type: &str, secret: &SecretRecord, reason: Option<&str>) {
        let mut event = RuntimeEvent::new(event_type)
            .meta("secret_id", secret.id.to_string())
            .meta("secret_type", secret.secret_type.clone())
            .meta("preview", secret.preview.clone());
        if let Some(reason) = reason {
            event = event.meta("reason", reason);
        }
        event = if secret.owner_type == owner_type::WORKSPACE {
            event.workspace(secret.owner_id)
        } else {
            event.user(Some(secret.owner_id))
        };
        let _ = self.events.record(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AesGcmEncryptor;
    use crate::persistence::{EventQuery, MemoryPersistence};

    fn service() -> (SecretService, Arc<MemoryPersistence>) {
        let store = Arc::new(MemoryPersistence::new());
        let persistence: Arc<dyn Persistence> = store.clone();
        let events = Arc::new(EventRecorder::new(Arc::clone(&persistence), false));
        let encryptor = Arc::new(AesGcmEncryptor::new(&[7u8; 32]).unwrap());
        (SecretService::new(persistence, encryptor, events), store)
    }

    fn input(value: &str) -> CreateSecret {
        CreateSecret {
            owner_type: owner_type::WORKSPACE.into(),
            owner_id: Uuid::new_v4(),
            secret_type: "api_token".into(),
            name: "stripe".into(),
            value: value.into(),
            expires_at: None,
            metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_create_encrypts_and_previews() {
        let (service, store) = service();
        let secret = service.create(input("sk_live_1234567890")).await.unwrap();
        assert_eq!(secret.preview, "sk_l****7890");
        assert!(!secret.encrypted_value.contains("1234567890"));
        assert_eq!(secret.metadata, json!({}));
        let stored = store.get_secret(secret.id).await.unwrap().unwrap();
        assert_eq!(stored.last_used_at, None);

        assert_eq!(service.reveal(secret.id).await.unwrap(), "sk_live_1234567890");
        let used = store.get_secret(secret.id).await.unwrap().unwrap();
        assert!(used.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_create_validates() {
        let (service, _) = service();
        let bad_owner = CreateSecret {
            owner_type: "team".into(),
            ..input("value-value")
        };
        assert!(matches!(
            service.create(bad_owner).await,
            Err(CoreError::Validation { .. })
        ));
        assert!(service.create(input("")).await.is_err());
    }

    #[tokio::test]
    async fn test_rotate_then_revoke() {
        let (service, store) = service();
        let secret = service
            .create(CreateSecret {
                metadata: json!({"provider": "stripe", "health_status": "expired"}),
                ..input("old-token-aaaa")
            })
            .await
            .unwrap();
        let rotated = service
            .rotate(secret.id, "new-token-bbbb", None)
            .await
            .unwrap();
        assert_eq!(rotated.preview, "new-****bbbb");
        assert!(rotated.last_rotated_at.is_some());
        assert_eq!(rotated.metadata, json!({"provider": "stripe"}));
        assert_eq!(service.reveal(secret.id).await.unwrap(), "new-token-bbbb");

        service.revoke(secret.id, Some("leaked")).await.unwrap();
        assert!(matches!(
            service.reveal(secret.id).await,
            Err(CoreError::InvalidState { .. })
        ));
        assert!(matches!(
            service.rotate(secret.id, "x-token-cccc", None).await,
            Err(CoreError::InvalidState { .. })
        ));
        service.revoke(secret.id, None).await.unwrap();

        let events = store
            .list_events(&EventQuery {
                event_types: vec![types::SECRET_ROTATED.into(), types::SECRET_REVOKED.into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.workspace_id == Some(secret.owner_id)));
    }
}
