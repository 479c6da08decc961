// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenant database provisioning, admin secret rotation, backup and restore.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    ADMIN_PRIVILEGES, TenantConnection, TenantDbAdmin, TenantDbConfig, TenantMigration,
    TenantTarget, admin_user, backup_name, builtin_migrations, database_name, db_status,
    generate_password, is_backup_of, is_safe_identifier, open_secret, seal_secret,
};
use crate::crypto::Encryptor;
use crate::error::{CoreError, Result};
use crate::events::{EventRecorder, types};
use crate::model::permission;
use crate::persistence::{Persistence, WorkspaceDatabaseRecord};
use crate::workspace::WorkspaceAccess;

/// Provisioning attempts before the record is marked `error`.
pub const PROVISION_ATTEMPTS: u32 = 3;
/// First retry delay; doubles per attempt.
pub const PROVISION_BACKOFF_INITIAL: Duration = Duration::from_millis(300);
/// Retry delay cap.
pub const PROVISION_BACKOFF_MAX: Duration = Duration::from_secs(3);

/// Permissions that allow managing the tenant database.
pub(crate) const DB_MANAGERS: &[&str] = &[permission::WORKSPACE_ADMIN, permission::WORKSPACE_DB_ACCESS];

/// Outcome of [`TenantDbService::rotate_secret`]. The password is returned once.
#[derive(Debug, Clone, Serialize)]
pub struct RotatedSecret {
    /// Updated record.
    pub database: WorkspaceDatabaseRecord,
    /// New admin password.
    pub password: String,
}

/// A captured backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupResult {
    /// Backup database name.
    pub backup_id: String,
    /// Copied tables.
    pub tables: Vec<String>,
}

/// A finished restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreResult {
    /// Source backup.
    pub backup_id: String,
    /// Tables copied back.
    pub tables: Vec<String>,
}

/// Owns the tenant database lifecycle and governed schema changes.
pub struct TenantDbService {
    pub(super) persistence: Arc<dyn Persistence>,
    pub(super) admin: Arc<dyn TenantDbAdmin>,
    pub(super) encryptor: Arc<dyn Encryptor>,
    pub(super) events: Arc<EventRecorder>,
    pub(super) config: TenantDbConfig,
    pub(super) migrations: Vec<TenantMigration>,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl TenantDbService {
    /// Creates the service with the built-in tenant schema.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        admin: Arc<dyn TenantDbAdmin>,
        encryptor: Arc<dyn Encryptor>,
        events: Arc<EventRecorder>,
        config: TenantDbConfig,
    ) -> Self {
        Self {
            persistence,
            admin,
            encryptor,
            events,
            config,
            migrations: builtin_migrations(),
            backoff_initial: PROVISION_BACKOFF_INITIAL,
            backoff_max: PROVISION_BACKOFF_MAX,
        }
    }

    /// Replaces the tenant schema versions. They are sorted by version.
    pub fn with_migrations(mut self, mut migrations: Vec<TenantMigration>) -> Self {
        migrations.sort_by(|a, b| a.version.cmp(&b.version));
        self.migrations = migrations;
        self
    }

    /// Overrides the provisioning retry delays.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    /// Known tenant schema versions, ascending.
    pub fn migrations(&self) -> &[TenantMigration] {
        &self.migrations
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Creates the workspace database, its admin user and base schema.
    ///
    /// Ready databases are returned unchanged. Each failed attempt drops
    /// whatever it created before the next one starts.
    pub async fn provision(&self, workspace_id: Uuid, user_id: Uuid) -> Result<WorkspaceDatabaseRecord> {
        WorkspaceAccess::load(self.persistence.as_ref(), workspace_id, user_id)
            .await?
            .require_any(DB_MANAGERS)?;

        let existing = self.persistence.get_workspace_database(workspace_id).await?;
        let mut record = match existing {
            Some(r) if r.status == db_status::READY => return Ok(r),
            Some(r) if r.status == db_status::BLOCKED => {
                return Err(CoreError::InvalidState {
                    expected: db_status::PENDING.into(),
                    actual: r.status,
                });
            }
            Some(r) => r,
            None => {
                let now = Utc::now();
                WorkspaceDatabaseRecord {
                    id: Uuid::new_v4(),
                    workspace_id,
                    db_name: database_name(workspace_id),
                    db_user: admin_user(workspace_id),
                    db_host: None,
                    db_port: None,
                    secret_ref: None,
                    status: db_status::PENDING.into(),
                    error_message: None,
                    created_at: now,
                    updated_at: now,
                }
            }
        };
        record.db_host = Some(self.config.host.clone());
        record.db_port = Some(i32::from(self.config.port));
        record.status = db_status::PROVISIONING.into();
        record.updated_at = Utc::now();
        self.persistence.upsert_workspace_database(&record).await?;

        let started = Instant::now();
        let password = generate_password();
        let mut delay = self.backoff_initial;
        let mut last_error = None;
        for attempt in 1..=PROVISION_ATTEMPTS {
            match self.provision_once(&record, &password).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(
                        workspace_id = %workspace_id,
                        attempt,
                        error = %e,
                        "Tenant database provisioning attempt failed"
                    );
                    self.rollback_provision(&record).await;
                    last_error = Some(e);
                    if attempt < PROVISION_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(self.backoff_max);
                    }
                }
            }
        }
        let elapsed = started.elapsed().as_millis() as i64;

        if let Some(e) = last_error {
            record.status = db_status::ERROR.into();
            record.error_message = Some(e.to_string());
            record.updated_at = Utc::now();
            self.persistence.upsert_workspace_database(&record).await?;
            let _ = self
                .events
                .record_db_event(
                    types::DB_PROVISION_FAILED,
                    workspace_id,
                    elapsed,
                    Some(&e.to_string()),
                    json!({ "db_name": record.db_name, "attempts": PROVISION_ATTEMPTS }),
                )
                .await;
            return Err(CoreError::TenantDb(format!(
                "provisioning failed after {PROVISION_ATTEMPTS} attempts: {e}"
            )));
        }

        record.secret_ref = Some(seal_secret(self.encryptor.as_ref(), &password)?);
        record.status = db_status::READY.into();
        record.error_message = None;
        record.updated_at = Utc::now();
        self.persistence.upsert_workspace_database(&record).await?;
        let _ = self
            .events
            .record_db_event(
                types::DB_PROVISIONED,
                workspace_id,
                elapsed,
                None,
                json!({ "db_name": record.db_name, "db_user": record.db_user }),
            )
            .await;
        info!(workspace_id = %workspace_id, db_name = %record.db_name, "Tenant database provisioned");
        Ok(record)
    }

    async fn provision_once(&self, record: &WorkspaceDatabaseRecord, password: &str) -> Result<()> {
        self.admin.create_database(&record.db_name).await?;
        self.admin.upsert_user(&record.db_user, password).await?;
        self.admin
            .grant(&record.db_name, &record.db_user, ADMIN_PRIVILEGES)
            .await?;
        let mut conn = self.admin.connect(&self.target(record, password)).await?;
        let applied = conn.applied_versions().await?;
        for migration in self.migrations.iter().filter(|m| !applied.contains(&m.version)) {
            conn.apply(migration).await?;
        }
        conn.seed_workspace_meta(record.workspace_id).await
    }

    async fn rollback_provision(&self, record: &WorkspaceDatabaseRecord) {
        if let Err(e) = self.admin.drop_database(&record.db_name).await {
            warn!(db_name = %record.db_name, error = %e, "Rollback: drop database failed");
        }
        if let Err(e) = self.admin.drop_user(&record.db_user).await {
            warn!(db_user = %record.db_user, error = %e, "Rollback: drop user failed");
        }
    }

    /// Marks a database `blocked`. Blocked databases refuse roles and migrations.
    pub async fn block(&self, workspace_id: Uuid, reason: &str) -> Result<WorkspaceDatabaseRecord> {
        let mut record = self.require_database(workspace_id).await?;
        record.status = db_status::BLOCKED.into();
        record.error_message = Some(reason.to_string());
        record.updated_at = Utc::now();
        self.persistence.upsert_workspace_database(&record).await?;
        warn!(workspace_id = %workspace_id, reason, "Tenant database blocked");
        Ok(record)
    }

    /// The workspace's database record.
    pub async fn get(&self, workspace_id: Uuid, user_id: Uuid) -> Result<WorkspaceDatabaseRecord> {
        WorkspaceAccess::load(self.persistence.as_ref(), workspace_id, user_id)
            .await?
            .require_any(DB_MANAGERS)?;
        self.require_database(workspace_id).await
    }

    // ========================================================================
    // Secrets
    // ========================================================================

    /// Issues a new admin password and stores its sealed reference.
    pub async fn rotate_secret(&self, workspace_id: Uuid, user_id: Uuid) -> Result<RotatedSecret> {
        WorkspaceAccess::load(self.persistence.as_ref(), workspace_id, user_id)
            .await?
            .require_any(DB_MANAGERS)?;
        let mut record = self.ready_database(workspace_id).await?;
        let password = generate_password();
        self.admin.upsert_user(&record.db_user, &password).await?;
        record.secret_ref = Some(seal_secret(self.encryptor.as_ref(), &password)?);
        record.updated_at = Utc::now();
        self.persistence.upsert_workspace_database(&record).await?;
        let _ = self
            .events
            .record_db_event(
                types::DB_SECRET_ROTATED,
                workspace_id,
                0,
                None,
                json!({ "db_user": record.db_user, "rotated_by": user_id }),
            )
            .await;
        Ok(RotatedSecret {
            database: record,
            password,
        })
    }

    // ========================================================================
    // Backup & restore
    // ========================================================================

    /// Copies every table into a fresh `wsb_` database.
    pub async fn backup(&self, workspace_id: Uuid) -> Result<BackupResult> {
        let record = self.ready_database(workspace_id).await?;
        let backup_id = backup_name(workspace_id, Utc::now());
        let tables = self.admin.list_tables(&record.db_name).await?;
        self.admin.create_database(&backup_id).await?;
        if let Err(e) = self
            .admin
            .copy_tables(&record.db_name, &backup_id, &tables)
            .await
        {
            let _ = self.admin.drop_database(&backup_id).await;
            return Err(e);
        }
        info!(workspace_id = %workspace_id, backup_id = %backup_id, tables = tables.len(), "Tenant database backed up");
        Ok(BackupResult { backup_id, tables })
    }

    /// Replaces every table with the backup's copy.
    pub async fn restore(&self, workspace_id: Uuid, backup_id: &str) -> Result<RestoreResult> {
        if !is_safe_identifier(backup_id) || !is_backup_of(backup_id, workspace_id) {
            return Err(CoreError::validation("backup_id", "not a backup of this workspace"));
        }
        let record = self.ready_database(workspace_id).await?;
        if !self.admin.database_exists(backup_id).await? {
            return Err(CoreError::NotFound("backup".into()));
        }
        let current = self.admin.list_tables(&record.db_name).await?;
        self.admin.drop_tables(&record.db_name, &current).await?;
        let tables = self.admin.list_tables(backup_id).await?;
        self.admin
            .copy_tables(backup_id, &record.db_name, &tables)
            .await?;
        info!(workspace_id = %workspace_id, backup_id, tables = tables.len(), "Tenant database restored");
        Ok(RestoreResult {
            backup_id: backup_id.to_string(),
            tables,
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    pub(super) async fn require_database(&self, workspace_id: Uuid) -> Result<WorkspaceDatabaseRecord> {
        self.persistence
            .get_workspace_database(workspace_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("workspace database".into()))
    }

    pub(super) async fn ready_database(&self, workspace_id: Uuid) -> Result<WorkspaceDatabaseRecord> {
        let record = self.require_database(workspace_id).await?;
        if record.status != db_status::READY {
            return Err(CoreError::InvalidState {
                expected: db_status::READY.into(),
                actual: record.status,
            });
        }
        Ok(record)
    }

    pub(super) fn target(&self, record: &WorkspaceDatabaseRecord, password: &str) -> TenantTarget {
        TenantTarget {
            host: record.db_host.clone().unwrap_or_else(|| self.config.host.clone()),
            port: record
                .db_port
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(self.config.port),
            database: record.db_name.clone(),
            user: record.db_user.clone(),
            password: password.to_string(),
        }
    }

    /// Opens a session as the workspace admin user.
    pub(super) async fn connect_ready(
        &self,
        workspace_id: Uuid,
    ) -> Result<(WorkspaceDatabaseRecord, Box<dyn TenantConnection>)> {
        let record = self.ready_database(workspace_id).await?;
        let password = open_secret(self.encryptor.as_ref(), record.secret_ref.as_deref())?;
        let conn = self.admin.connect(&self.target(&record, &password)).await?;
        Ok((record, conn))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::AesGcmEncryptor;
    use crate::persistence::{MemoryPersistence, WorkspaceRecord};
    use crate::runtime::test_support::published_workspace;
    use crate::tenant_db::{MIGRATION_TABLE, MemoryTenantAdmin};

    pub(crate) struct Fixture {
        pub service: TenantDbService,
        pub admin: MemoryTenantAdmin,
        pub store: Arc<MemoryPersistence>,
        pub workspace: WorkspaceRecord,
    }

    pub(crate) async fn fixture() -> Fixture {
        let store = Arc::new(MemoryPersistence::new());
        let workspace = published_workspace("demo");
        store.create_workspace(&workspace).await.unwrap();
        let persistence: Arc<dyn Persistence> = store.clone();
        let admin = MemoryTenantAdmin::new();
        let service = TenantDbService::new(
            Arc::clone(&persistence),
            Arc::new(admin.clone()),
            Arc::new(AesGcmEncryptor::new(&[9u8; 32]).unwrap()),
            Arc::new(EventRecorder::new(persistence, false)),
            TenantDbConfig::local(),
        )
        .with_backoff(Duration::from_millis(1), Duration::from_millis(2));
        Fixture {
            service,
            admin,
            store,
            workspace,
        }
    }

    #[tokio::test]
    async fn test_provision_creates_database_user_and_schema() {
        let f = fixture().await;
        let owner = f.workspace.owner_user_id;
        let record = f.service.provision(f.workspace.id, owner).await.unwrap();

        assert_eq!(record.status, db_status::READY);
        assert!(record.secret_ref.as_deref().unwrap().starts_with("enc:"));
        assert_eq!(record.db_host.as_deref(), Some("localhost"));
        assert!(f.admin.has_user(&record.db_user));
        assert_eq!(f.admin.grants(&record.db_user, &record.db_name).len(), 8);
        let tables = f.admin.tables(&record.db_name);
        assert!(tables.contains(&"workspace_meta".to_string()));
        assert!(tables.contains(&MIGRATION_TABLE.to_string()));

        let again = f.service.provision(f.workspace.id, owner).await.unwrap();
        assert_eq!(again.id, record.id);

        let events = f.store.list_events(&Default::default()).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == types::DB_PROVISIONED));
    }

    #[tokio::test]
    async fn test_provision_retries_then_succeeds() {
        let f = fixture().await;
        f.admin.fail_op("grant", 2);
        let record = f
            .service
            .provision(f.workspace.id, f.workspace.owner_user_id)
            .await
            .unwrap();
        assert_eq!(record.status, db_status::READY);
        let drops = f
            .admin
            .operations()
            .iter()
            .filter(|op| *op == "drop_database")
            .count();
        assert_eq!(drops, 2);
    }

    #[tokio::test]
    async fn test_provision_exhausts_attempts() {
        let f = fixture().await;
        f.admin.fail_op("create_database", 5);
        let err = f
            .service
            .provision(f.workspace.id, f.workspace.owner_user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TenantDb(_)));

        let stored = f
            .store
            .get_workspace_database(f.workspace.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, db_status::ERROR);
        assert!(stored.error_message.is_some());
        assert!(f.admin.databases().is_empty());

        let events = f.store.list_events(&Default::default()).await.unwrap();
        let failed = events
            .iter()
            .find(|e| e.event_type == types::DB_PROVISION_FAILED)
            .unwrap();
        assert_eq!(failed.severity, "critical");
    }

    #[tokio::test]
    async fn test_provision_requires_db_permission() {
        let f = fixture().await;
        let err = f
            .service
            .provision(f.workspace.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_rotate_secret_changes_login() {
        let f = fixture().await;
        let owner = f.workspace.owner_user_id;
        let before = f.service.provision(f.workspace.id, owner).await.unwrap();
        let rotated = f.service.rotate_secret(f.workspace.id, owner).await.unwrap();
        assert_ne!(rotated.database.secret_ref, before.secret_ref);
        assert!(f.service.connect_ready(f.workspace.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let f = fixture().await;
        let record = f
            .service
            .provision(f.workspace.id, f.workspace.owner_user_id)
            .await
            .unwrap();
        let backup = f.service.backup(f.workspace.id).await.unwrap();
        assert!(f.admin.databases().contains(&backup.backup_id));
        assert_eq!(backup.tables, f.admin.tables(&record.db_name));

        let (_, mut conn) = f.service.connect_ready(f.workspace.id).await.unwrap();
        conn.apply(&TenantMigration::new("29990101000000", "CREATE TABLE scratch (id INT)", ""))
            .await
            .unwrap();
        drop(conn);
        assert!(f.admin.tables(&record.db_name).contains(&"scratch".to_string()));

        f.service.restore(f.workspace.id, &backup.backup_id).await.unwrap();
        assert_eq!(f.admin.tables(&record.db_name), backup.tables);

        let foreign = backup_name(Uuid::new_v4(), Utc::now());
        assert!(matches!(
            f.service.restore(f.workspace.id, &foreign).await,
            Err(CoreError::Validation { .. })
        ));
    }
}
