// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scoped database principals.
//!
//! At most one active role per `(workspace, role_type)`. Passwords are
//! generated here, handed back once and stored sealed. Every create, rotate,
//! revoke and expiry writes an audit log entry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::provisioner::DB_MANAGERS;
use super::{
    TenantDbAdmin, db_status, generate_password, open_secret, role_user, seal_secret,
};
use crate::crypto::Encryptor;
use crate::error::{CoreError, Result};
use crate::events::{EventRecorder, types};
use crate::persistence::{AuditLogRecord, DbRoleRecord, Persistence, WorkspaceDatabaseRecord};
use crate::workspace::WorkspaceAccess;

/// Role lifecycle states.
pub mod role_status {
    /// Usable.
    pub const ACTIVE: &str = "active";
    /// Revoked by a user.
    pub const REVOKED: &str = "revoked";
    /// Past `expires_at`.
    pub const EXPIRED: &str = "expired";
}

const AUDIT_RESOURCE: &str = "workspace_db_role";

/// Privilege tier of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbRoleType {
    /// SELECT.
    Read,
    /// Read plus INSERT, UPDATE, DELETE.
    Write,
    /// Write plus CREATE, ALTER, INDEX, DROP.
    Admin,
}

impl DbRoleType {
    /// Lowercases and maps `-` to `_` before matching.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().replace('-', "_").as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "admin" => Ok(Self::Admin),
            other => Err(CoreError::validation(
                "role_type",
                format!("unsupported role type '{other}'"),
            )),
        }
    }

    /// Stored name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }

    /// One-letter user name suffix.
    pub fn suffix(&self) -> char {
        match self {
            Self::Read => 'r',
            Self::Write => 'w',
            Self::Admin => 'a',
        }
    }

    /// Grants on the workspace database.
    pub fn privileges(&self) -> &'static [&'static str] {
        match self {
            Self::Read => &["SELECT"],
            Self::Write => &["SELECT", "INSERT", "UPDATE", "DELETE"],
            Self::Admin => &[
                "SELECT", "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "INDEX", "DROP",
            ],
        }
    }
}

/// Create request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateDbRole {
    /// read, write or admin.
    pub role_type: String,
    /// Optional expiry; must not be in the past.
    pub expires_at: Option<DateTime<Utc>>,
}

/// List filter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DbRoleFilter {
    /// Only roles in this status.
    pub status: Option<String>,
}

/// A role with its freshly generated password and where to use it.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedDbRole {
    /// Stored role.
    pub role: DbRoleRecord,
    /// Clear password, shown once.
    pub password: String,
    /// Database to connect to.
    pub database: String,
    /// Host.
    pub host: Option<String>,
    /// Port.
    pub port: Option<i32>,
}

/// Issues, rotates, revokes and expires tenant database roles.
pub struct DbRoleService {
    persistence: Arc<dyn Persistence>,
    admin: Arc<dyn TenantDbAdmin>,
    encryptor: Arc<dyn Encryptor>,
    events: Arc<EventRecorder>,
}

impl DbRoleService {
    /// Creates the service.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        admin: Arc<dyn TenantDbAdmin>,
        encryptor: Arc<dyn Encryptor>,
        events: Arc<EventRecorder>,
    ) -> Self {
        Self {
            persistence,
            admin,
            encryptor,
            events,
        }
    }

    /// Issues a role. Fails with `Conflict` when an active one of the type exists.
    pub async fn create(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        request: CreateDbRole,
    ) -> Result<IssuedDbRole> {
        self.authorize(workspace_id, user_id).await?;
        let role_type = DbRoleType::parse(&request.role_type)?;
        let now = Utc::now();
        if request.expires_at.is_some_and(|at| at <= now) {
            return Err(CoreError::validation("expires_at", "must be in the future"));
        }

        self.expire_stale(workspace_id, Some(user_id)).await?;
        let existing = self.persistence.list_db_roles(workspace_id).await?;
        if existing
            .iter()
            .any(|r| r.role_type == role_type.as_str() && r.status == role_status::ACTIVE)
        {
            return Err(CoreError::Conflict(format!(
                "an active {} role already exists",
                role_type.as_str()
            )));
        }
        let database = self.ready_database(workspace_id).await?;

        let db_user = role_user(workspace_id, role_type);
        let password = generate_password();
        self.admin.upsert_user(&db_user, &password).await?;
        self.admin
            .grant(&database.db_name, &db_user, role_type.privileges())
            .await?;
        let secret_ref = match seal_secret(self.encryptor.as_ref(), &password) {
            Ok(s) => s,
            Err(e) => {
                let _ = self.admin.drop_user(&db_user).await;
                return Err(e);
            }
        };

        let role = DbRoleRecord {
            id: Uuid::new_v4(),
            workspace_id,
            role_type: role_type.as_str().into(),
            db_user,
            secret_ref,
            status: role_status::ACTIVE.into(),
            expires_at: request.expires_at,
            last_rotated_at: None,
            revoked_at: None,
            revoked_reason: None,
            created_at: now,
        };
        self.persistence.create_db_role(&role).await?;
        self.audit(&role, Some(user_id), "workspace.db.role.created").await;
        let _ = self
            .events
            .record_db_event(
                types::DB_ROLE_CREATED,
                workspace_id,
                0,
                None,
                json!({ "role_id": role.id, "role_type": role.role_type, "db_user": role.db_user }),
            )
            .await;
        info!(workspace_id = %workspace_id, role_type = %role.role_type, "Database role created");
        Ok(issued(role, password, &database))
    }

    /// Roles of the workspace, oldest first. Active roles past their expiry
    /// are expired before filtering.
    pub async fn list(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        filter: DbRoleFilter,
    ) -> Result<Vec<DbRoleRecord>> {
        self.authorize(workspace_id, user_id).await?;
        self.expire_stale(workspace_id, Some(user_id)).await?;
        let status = filter.status.map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty());
        Ok(self
            .persistence
            .list_db_roles(workspace_id)
            .await?
            .into_iter()
            .filter(|r| status.as_ref().is_none_or(|s| &r.status == s))
            .collect())
    }

    /// Issues a new password for an active role.
    pub async fn rotate(&self, workspace_id: Uuid, role_id: Uuid, user_id: Uuid) -> Result<IssuedDbRole> {
        self.authorize(workspace_id, user_id).await?;
        self.expire_stale(workspace_id, Some(user_id)).await?;
        let mut role = self.require_role(workspace_id, role_id).await?;
        if role.status != role_status::ACTIVE {
            return Err(CoreError::InvalidState {
                expected: role_status::ACTIVE.into(),
                actual: role.status,
            });
        }
        let database = self.ready_database(workspace_id).await?;
        let password = generate_password();
        self.admin.upsert_user(&role.db_user, &password).await?;
        role.secret_ref = seal_secret(self.encryptor.as_ref(), &password)?;
        role.last_rotated_at = Some(Utc::now());
        self.persistence.update_db_role(&role).await?;
        self.audit(&role, Some(user_id), "workspace.db.role.rotated").await;
        let _ = self
            .events
            .record_db_event(
                types::DB_SECRET_ROTATED,
                workspace_id,
                0,
                None,
                json!({ "role_id": role.id, "db_user": role.db_user }),
            )
            .await;
        Ok(issued(role, password, &database))
    }

    /// Drops the principal. Roles that are no longer active come back unchanged.
    pub async fn revoke(
        &self,
        workspace_id: Uuid,
        role_id: Uuid,
        user_id: Uuid,
        reason: Option<String>,
    ) -> Result<DbRoleRecord> {
        self.authorize(workspace_id, user_id).await?;
        let role = self.require_role(workspace_id, role_id).await?;
        if role.status != role_status::ACTIVE {
            return Ok(role);
        }
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "revoked".into());
        self.retire(role, role_status::REVOKED, &reason, Some(user_id))
            .await
    }

    /// Decrypts the stored password of an active role.
    pub async fn reveal_password(&self, workspace_id: Uuid, role_id: Uuid, user_id: Uuid) -> Result<String> {
        self.authorize(workspace_id, user_id).await?;
        let role = self.require_role(workspace_id, role_id).await?;
        if role.status != role_status::ACTIVE {
            return Err(CoreError::InvalidState {
                expected: role_status::ACTIVE.into(),
                actual: role.status,
            });
        }
        open_secret(self.encryptor.as_ref(), Some(&role.secret_ref))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn expire_stale(&self, workspace_id: Uuid, actor: Option<Uuid>) -> Result<()> {
        let now = Utc::now();
        let stale: Vec<DbRoleRecord> = self
            .persistence
            .list_db_roles(workspace_id)
            .await?
            .into_iter()
            .filter(|r| r.status == role_status::ACTIVE && r.expires_at.is_some_and(|at| at <= now))
            .collect();
        for role in stale {
            let role_id = role.id;
            if let Err(e) = self.retire(role, role_status::EXPIRED, "expired", actor).await {
                warn!(role_id = %role_id, error = %e, "Failed to expire database role");
            }
        }
        Ok(())
    }

    async fn retire(
        &self,
        mut role: DbRoleRecord,
        status: &str,
        reason: &str,
        actor: Option<Uuid>,
    ) -> Result<DbRoleRecord> {
        self.admin.drop_user(&role.db_user).await?;
        role.status = status.into();
        role.revoked_at = Some(Utc::now());
        role.revoked_reason = Some(reason.to_string());
        self.persistence.update_db_role(&role).await?;
        let action = if status == role_status::EXPIRED {
            "workspace.db.role.expired"
        } else {
            "workspace.db.role.revoked"
        };
        self.audit(&role, actor, action).await;
        let _ = self
            .events
            .record_db_event(
                types::DB_ROLE_REVOKED,
                role.workspace_id,
                0,
                None,
                json!({ "role_id": role.id, "role_type": role.role_type, "reason": reason }),
            )
            .await;
        info!(role_id = %role.id, status, "Database role retired");
        Ok(role)
    }

    async fn audit(&self, role: &DbRoleRecord, actor: Option<Uuid>, action: &str) {
        let entry = AuditLogRecord {
            id: Uuid::new_v4(),
            workspace_id: Some(role.workspace_id),
            actor_id: actor,
            action: action.to_string(),
            resource_type: AUDIT_RESOURCE.into(),
            resource_id: Some(role.id.to_string()),
            metadata: json!({
                "role_id": role.id,
                "role_type": role.role_type,
                "db_user": role.db_user,
                "status": role.status,
                "expires_at": role.expires_at,
            }),
            created_at: Utc::now(),
        };
        if let Err(e) = self.persistence.insert_audit_log(&entry).await {
            warn!(action, role_id = %role.id, error = %e, "Failed to write audit log");
        }
    }

    async fn authorize(&self, workspace_id: Uuid, user_id: Uuid) -> Result<()> {
        WorkspaceAccess::load(self.persistence.as_ref(), workspace_id, user_id)
            .await?
            .require_any(DB_MANAGERS)
            .map(|_| ())
    }

    async fn require_role(&self, workspace_id: Uuid, role_id: Uuid) -> Result<DbRoleRecord> {
        self.persistence
            .get_db_role(role_id)
            .await?
            .filter(|r| r.workspace_id == workspace_id)
            .ok_or_else(|| CoreError::NotFound("database role".into()))
    }

    async fn ready_database(&self, workspace_id: Uuid) -> Result<WorkspaceDatabaseRecord> {
        let database = self
            .persistence
            .get_workspace_database(workspace_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("workspace database".into()))?;
        if database.status != db_status::READY {
            return Err(CoreError::InvalidState {
                expected: db_status::READY.into(),
                actual: database.status,
            });
        }
        Ok(database)
    }
}

fn issued(role: DbRoleRecord, password: String, database: &WorkspaceDatabaseRecord) -> IssuedDbRole {
    IssuedDbRole {
        role,
        password,
        database: database.db_name.clone(),
        host: database.db_host.clone(),
        port: database.db_port,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::tenant_db::provisioner::tests::{Fixture, fixture};

    async fn setup() -> (DbRoleService, Fixture) {
        let f = fixture().await;
        f.service
            .provision(f.workspace.id, f.workspace.owner_user_id)
            .await
            .unwrap();
        let roles = DbRoleService::new(
            Arc::clone(&f.service.persistence),
            Arc::clone(&f.service.admin),
            Arc::clone(&f.service.encryptor),
            Arc::clone(&f.service.events),
        );
        (roles, f)
    }

    fn request(role_type: &str) -> CreateDbRole {
        CreateDbRole {
            role_type: role_type.into(),
            expires_at: None,
        }
    }

    #[test]
    fn test_role_type_parse() {
        assert_eq!(DbRoleType::parse(" Write ").unwrap(), DbRoleType::Write);
        assert_eq!(DbRoleType::Admin.privileges().len(), 8);
        assert!(matches!(
            DbRoleType::parse("read-only"),
            Err(CoreError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_grants_by_tier() {
        let (roles, f) = setup().await;
        let owner = f.workspace.owner_user_id;
        let read = roles.create(f.workspace.id, owner, request("read")).await.unwrap();
        assert!(read.role.db_user.ends_with("_r"));
        assert_eq!(f.admin.grants(&read.role.db_user, &read.database), vec!["SELECT"]);
        assert_eq!(
            roles
                .reveal_password(f.workspace.id, read.role.id, owner)
                .await
                .unwrap(),
            read.password
        );

        let write = roles.create(f.workspace.id, owner, request("write")).await.unwrap();
        assert_eq!(f.admin.grants(&write.role.db_user, &write.database).len(), 4);

        let dup = roles.create(f.workspace.id, owner, request("read")).await;
        assert!(matches!(dup, Err(CoreError::Conflict(_))));

        let audit = f.store.list_audit_logs(f.workspace.id).await.unwrap();
        assert_eq!(
            audit.iter().filter(|a| a.action == "workspace.db.role.created").count(),
            2
        );
        assert_eq!(audit[0].resource_type, "workspace_db_role");
    }

    #[tokio::test]
    async fn test_create_rejects_past_expiry() {
        let (roles, f) = setup().await;
        let err = roles
            .create(
                f.workspace.id,
                f.workspace.owner_user_id,
                CreateDbRole {
                    role_type: "read".into(),
                    expires_at: Some(Utc::now() - Duration::minutes(1)),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "expires_at"));
    }

    #[tokio::test]
    async fn test_list_expires_stale_roles() {
        let (roles, f) = setup().await;
        let owner = f.workspace.owner_user_id;
        let issued = roles
            .create(
                f.workspace.id,
                owner,
                CreateDbRole {
                    role_type: "admin".into(),
                    expires_at: Some(Utc::now() + Duration::hours(1)),
                },
            )
            .await
            .unwrap();
        let mut stored = issued.role.clone();
        stored.expires_at = Some(Utc::now() - Duration::seconds(1));
        f.store.update_db_role(&stored).await.unwrap();

        let active = roles
            .list(
                f.workspace.id,
                owner,
                DbRoleFilter {
                    status: Some("active".into()),
                },
            )
            .await
            .unwrap();
        assert!(active.is_empty());

        let all = roles.list(f.workspace.id, owner, DbRoleFilter::default()).await.unwrap();
        assert_eq!(all[0].status, role_status::EXPIRED);
        assert_eq!(all[0].revoked_reason.as_deref(), Some("expired"));
        assert!(!f.admin.has_user(&issued.role.db_user));
        let audit = f.store.list_audit_logs(f.workspace.id).await.unwrap();
        assert!(audit.iter().any(|a| a.action == "workspace.db.role.expired"));

        // The slot is free again.
        roles.create(f.workspace.id, owner, request("admin")).await.unwrap();
    }

    #[tokio::test]
    async fn test_rotate_and_revoke() {
        let (roles, f) = setup().await;
        let owner = f.workspace.owner_user_id;
        let issued = roles.create(f.workspace.id, owner, request("write")).await.unwrap();

        let rotated = roles.rotate(f.workspace.id, issued.role.id, owner).await.unwrap();
        assert_ne!(rotated.password, issued.password);
        assert!(rotated.role.last_rotated_at.is_some());

        let revoked = roles
            .revoke(f.workspace.id, issued.role.id, owner, Some("offboarding".into()))
            .await
            .unwrap();
        assert_eq!(revoked.status, role_status::REVOKED);
        assert_eq!(revoked.revoked_reason.as_deref(), Some("offboarding"));
        assert!(!f.admin.has_user(&revoked.db_user));

        let again = roles
            .revoke(f.workspace.id, issued.role.id, owner, None)
            .await
            .unwrap();
        assert_eq!(again, revoked);
        assert!(matches!(
            roles.rotate(f.workspace.id, issued.role.id, owner).await,
            Err(CoreError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_role_of_other_workspace_is_not_found() {
        let (roles, f) = setup().await;
        let owner = f.workspace.owner_user_id;
        let issued = roles.create(f.workspace.id, owner, request("read")).await.unwrap();

        let other = crate::runtime::test_support::published_workspace("other");
        f.store.create_workspace(&other).await.unwrap();
        let err = roles
            .revoke(other.id, issued.role.id, other.owner_user_id, None)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::NotFound("database role".into()));
    }
}
