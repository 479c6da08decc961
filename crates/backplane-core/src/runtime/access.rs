// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Layered runtime authorization and anonymous session handling.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::{AccessMode, Caller, DataClassification, RequestMeta, permission, session_type};
use crate::persistence::{Persistence, SessionRecord, WorkspaceRecord};

/// Lifetime of an anonymous session in hours, refreshed on every tracked request.
pub const ANON_SESSION_TTL_HOURS: i64 = 24;

fn anon_session_ttl() -> Duration {
    Duration::hours(ANON_SESSION_TTL_HOURS)
}

/// Parsed access mode; unreadable values fall back to the strictest mode.
pub fn access_mode_of(workspace: &WorkspaceRecord) -> AccessMode {
    workspace.access_mode.parse().unwrap_or_else(|_| {
        warn!(workspace_id = %workspace.id, access_mode = %workspace.access_mode, "Unknown access mode, treating as private");
        AccessMode::Private
    })
}

/// Parsed classification; unreadable values fall back to `restricted`.
pub fn classification_of(workspace: &WorkspaceRecord) -> DataClassification {
    workspace.data_classification.parse().unwrap_or_else(|_| {
        warn!(workspace_id = %workspace.id, data_classification = %workspace.data_classification, "Unknown data classification, treating as restricted");
        DataClassification::Restricted
    })
}

/// Runs the access-mode layer, then the classification layer.
pub async fn authorize(
    store: &dyn Persistence,
    workspace: &WorkspaceRecord,
    caller: &Caller,
) -> Result<()> {
    let is_owner = caller.user_id == Some(workspace.owner_user_id);

    match access_mode_of(workspace) {
        AccessMode::PublicAnonymous => {}
        AccessMode::PublicAuth => {
            if !caller.is_authenticated() {
                return Err(CoreError::Unauthorized);
            }
        }
        AccessMode::Private => {
            if !caller.is_authenticated() {
                return Err(CoreError::Unauthorized);
            }
            if !is_owner {
                return Err(CoreError::Forbidden("owner only".into()));
            }
        }
    }

    let classification = classification_of(workspace);
    if classification == DataClassification::Public || is_owner {
        return Ok(());
    }
    let Some(user_id) = caller.user_id else {
        return Err(CoreError::Unauthorized);
    };
    if classification == DataClassification::Restricted {
        return Err(CoreError::Forbidden("restricted to the owner".into()));
    }

    let member = store
        .get_member(workspace.id, user_id)
        .await?
        .ok_or_else(|| CoreError::Forbidden("members only".into()))?;
    if classification == DataClassification::Confidential {
        let is_admin = match store.get_role(member.role_id).await? {
            Some(role) => role.permissions.iter().any(|p| p == permission::WORKSPACE_ADMIN),
            None => false,
        };
        if !is_admin {
            return Err(CoreError::Forbidden("workspace_admin required".into()));
        }
    }
    Ok(())
}

/// Looks up the session the client presented, scoped to `workspace_id`.
///
/// Sessions of other workspaces are ignored. A blocked session is refused.
pub async fn presented_session(
    store: &dyn Persistence,
    workspace_id: Uuid,
    meta: &RequestMeta,
) -> Result<Option<SessionRecord>> {
    let Some(id) = meta.session_id else {
        return Ok(None);
    };
    let session = store
        .get_session(id)
        .await?
        .filter(|s| s.workspace_id == workspace_id);
    if session.as_ref().is_some_and(|s| s.blocked_at.is_some()) {
        return Err(CoreError::SessionBlocked);
    }
    Ok(session)
}

/// Refreshes the presented anonymous session or issues a fresh one.
///
/// A live session is kept: anon sessions get `expired_at = now + 24h`,
/// auth sessions are returned untouched.
pub async fn ensure_anonymous_session(
    store: &dyn Persistence,
    workspace_id: Uuid,
    prior: Option<SessionRecord>,
    meta: &RequestMeta,
    now: DateTime<Utc>,
) -> Result<SessionRecord> {
    if let Some(mut session) = prior.filter(|s| s.expired_at > now && s.blocked_at.is_none()) {
        if session.session_type == session_type::ANON {
            session.expired_at = now + anon_session_ttl();
            session.updated_at = now;
            store.update_session(&session).await?;
            debug!(session_id = %session.id, "Refreshed anonymous session");
        }
        return Ok(session);
    }

    let session = SessionRecord {
        id: Uuid::new_v4(),
        workspace_id,
        session_type: session_type::ANON.to_string(),
        user_id: None,
        ip_hash: meta.ip_hash(),
        user_agent_hash: meta.user_agent_hash(),
        token_hash: None,
        expired_at: now + anon_session_ttl(),
        blocked_at: None,
        blocked_reason: None,
        created_at: now,
        updated_at: now,
    };
    store.create_session(&session).await?;
    debug!(session_id = %session.id, workspace_id = %workspace_id, "Issued anonymous session");
    Ok(session)
}
