// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace administration: member access checks, access-policy and
//! settings updates, soft delete and restore.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::cache::RuntimeCache;
use crate::error::{CoreError, Result};
use crate::events::{EventRecorder, types};
use crate::model::{AccessMode, DataClassification, permission, validate_access_policy};
use crate::persistence::{Persistence, WorkspaceRecord};
use crate::workers::RetentionConfig;

// ============================================================================
// Access
// ============================================================================

/// What a platform user may do in a workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceAccess {
    /// The workspace, never soft-deleted.
    pub workspace: WorkspaceRecord,
    /// The user owns the workspace.
    pub is_owner: bool,
    /// Permissions from the member's role. Empty for the owner, who holds all.
    pub permissions: Vec<String>,
}

impl WorkspaceAccess {
    /// Resolves the user's standing in the workspace. Non-members are refused.
    pub async fn load(
        store: &dyn Persistence,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> Result<Self> {
        let workspace = store
            .get_workspace(workspace_id)
            .await?
            .filter(|w| w.deleted_at.is_none())
            .ok_or(CoreError::WorkspaceNotFound)?;

        if workspace.owner_user_id == user_id {
            return Ok(Self {
                workspace,
                is_owner: true,
                permissions: Vec::new(),
            });
        }

        let member = store
            .get_member(workspace_id, user_id)
            .await?
            .ok_or_else(|| CoreError::Forbidden("not a workspace member".into()))?;
        let permissions = store
            .get_role(member.role_id)
            .await?
            .map(|r| r.permissions)
            .unwrap_or_default();
        Ok(Self {
            workspace,
            is_owner: false,
            permissions,
        })
    }

    /// Owner, or a member holding any of `wanted`.
    pub fn has_any(&self, wanted: &[&str]) -> bool {
        self.is_owner || self.permissions.iter().any(|p| wanted.contains(&p.as_str()))
    }

    /// Like [`has_any`](Self::has_any) but fails with `Forbidden`.
    pub fn require_any(self, wanted: &[&str]) -> Result<Self> {
        if self.has_any(wanted) {
            Ok(self)
        } else {
            Err(CoreError::Forbidden(format!("requires one of {wanted:?}")))
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Partial access-policy update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAccessPolicy {
    /// New access mode.
    pub access_mode: Option<String>,
    /// New data classification.
    pub data_classification: Option<String>,
    /// Replacement anti-abuse settings blob.
    pub rate_limit: Option<Value>,
    /// Replacement CORS origin list.
    pub allowed_origins: Option<Vec<String>>,
    /// Always require captcha from anonymous callers.
    pub require_captcha: Option<bool>,
}

/// Outcome of a delete or restore.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspaceDeletion {
    /// Workspace.
    pub workspace_id: Uuid,
    /// `soft_deleted` or `restored`.
    pub stage: &'static str,
    /// When the workspace was deleted.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Last instant a restore is accepted.
    pub restore_until: Option<DateTime<Utc>>,
    /// When the retention worker may purge it.
    pub purge_after: Option<DateTime<Utc>>,
}

// ============================================================================
// Service
// ============================================================================

/// Workspace administration.
pub struct WorkspaceService {
    persistence: Arc<dyn Persistence>,
    cache: Arc<RuntimeCache>,
    recorder: Arc<EventRecorder>,
    grace_days: i64,
    cold_storage_days: i64,
}

impl WorkspaceService {
    /// Creates the service. Deletion deadlines come from the retention settings.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        cache: Arc<RuntimeCache>,
        recorder: Arc<EventRecorder>,
        retention: &RetentionConfig,
    ) -> Self {
        Self {
            persistence,
            cache,
            recorder,
            grace_days: retention.workspace_deletion_grace_days,
            cold_storage_days: retention.workspace_cold_storage_days,
        }
    }

    /// The workspace, for any member.
    pub async fn get(&self, workspace_id: Uuid, user_id: Uuid) -> Result<WorkspaceRecord> {
        Ok(WorkspaceAccess::load(self.persistence.as_ref(), workspace_id, user_id)
            .await?
            .workspace)
    }

    /// Updates access mode, classification and anti-abuse settings. The
    /// resulting mode × classification pair must be valid.
    pub async fn update_access_policy(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        req: UpdateAccessPolicy,
    ) -> Result<WorkspaceRecord> {
        let mut workspace = self.admin_access(workspace_id, user_id).await?.workspace;
        let before = workspace.clone();

        let mode: AccessMode = req
            .access_mode
            .as_deref()
            .unwrap_or(&workspace.access_mode)
            .parse()?;
        let classification: DataClassification = req
            .data_classification
            .as_deref()
            .unwrap_or(&workspace.data_classification)
            .parse()?;
        validate_access_policy(mode, classification)?;
        workspace.access_mode = mode.as_str().to_string();
        workspace.data_classification = classification.as_str().to_string();

        if let Some(rate_limit) = req.rate_limit {
            if !(rate_limit.is_object() || rate_limit.is_null()) {
                return Err(CoreError::validation("rate_limit", "must be an object"));
            }
            workspace.rate_limit = rate_limit;
        }
        if let Some(origins) = req.allowed_origins {
            workspace.allowed_origins = origins
                .into_iter()
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(require) = req.require_captcha {
            workspace.require_captcha = require;
        }

        self.save(&before, &mut workspace, "access_policy").await?;
        Ok(workspace)
    }

    /// Replaces the free-form settings map.
    pub async fn update_settings(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        settings: Value,
    ) -> Result<WorkspaceRecord> {
        if !settings.is_object() {
            return Err(CoreError::validation("settings", "must be an object"));
        }
        let mut workspace = self.admin_access(workspace_id, user_id).await?.workspace;
        let before = workspace.clone();
        workspace.settings = settings;
        self.save(&before, &mut workspace, "settings").await?;
        Ok(workspace)
    }

    /// Soft-deletes the workspace. It stops resolving at once and becomes
    /// purgeable after the grace and cold-storage periods.
    pub async fn soft_delete(&self, workspace_id: Uuid, user_id: Uuid) -> Result<WorkspaceDeletion> {
        let mut workspace = self.admin_access(workspace_id, user_id).await?.workspace;
        let now = Utc::now();
        let purge_after = now + Duration::days(self.grace_days + self.cold_storage_days);
        workspace.deleted_at = Some(now);
        workspace.purge_after = Some(purge_after);
        workspace.updated_at = now;
        self.persistence.update_workspace(&workspace).await?;
        self.cache.invalidate_workspace(&workspace);

        self.recorder
            .record_workspace_event(
                types::WORKSPACE_DELETED,
                workspace.id,
                None,
                "workspace soft-deleted",
                json!({ "purge_after": purge_after, "actor_id": user_id }),
            )
            .await
            .ok();
        info!(workspace_id = %workspace.id, purge_after = %purge_after, "Workspace soft-deleted");

        Ok(WorkspaceDeletion {
            workspace_id: workspace.id,
            stage: "soft_deleted",
            deleted_at: Some(now),
            restore_until: Some(now + Duration::days(self.grace_days)),
            purge_after: Some(purge_after),
        })
    }

    /// Undoes a soft delete. Owner only, within the grace period.
    pub async fn restore(&self, workspace_id: Uuid, user_id: Uuid) -> Result<WorkspaceDeletion> {
        let mut workspace = self
            .persistence
            .get_workspace(workspace_id)
            .await?
            .ok_or(CoreError::WorkspaceNotFound)?;
        if workspace.owner_user_id != user_id {
            return Err(CoreError::Forbidden("only the owner can restore".into()));
        }
        let Some(deleted_at) = workspace.deleted_at else {
            return Err(CoreError::InvalidState {
                expected: "deleted".into(),
                actual: "active".into(),
            });
        };
        let restore_until = deleted_at + Duration::days(self.grace_days);
        if Utc::now() > restore_until {
            return Err(CoreError::InvalidState {
                expected: "within restore window".into(),
                actual: "restore window elapsed".into(),
            });
        }

        workspace.deleted_at = None;
        workspace.purge_after = None;
        workspace.updated_at = Utc::now();
        self.persistence.update_workspace(&workspace).await?;
        self.cache.invalidate_workspace(&workspace);
        info!(workspace_id = %workspace.id, "Workspace restored");

        Ok(WorkspaceDeletion {
            workspace_id: workspace.id,
            stage: "restored",
            deleted_at: Some(deleted_at),
            restore_until: None,
            purge_after: None,
        })
    }

    async fn admin_access(&self, workspace_id: Uuid, user_id: Uuid) -> Result<WorkspaceAccess> {
        WorkspaceAccess::load(self.persistence.as_ref(), workspace_id, user_id)
            .await?
            .require_any(&[permission::WORKSPACE_ADMIN])
    }

    async fn save(
        &self,
        before: &WorkspaceRecord,
        workspace: &mut WorkspaceRecord,
        section: &str,
    ) -> Result<()> {
        workspace.updated_at = Utc::now();
        self.persistence.update_workspace(workspace).await?;
        self.cache.invalidate_workspace(before);
        self.recorder
            .record_workspace_event(
                types::WORKSPACE_UPDATED,
                workspace.id,
                None,
                format!("workspace {section} updated"),
                json!({ "section": section }),
            )
            .await
            .ok();
        Ok(())
    }
}
