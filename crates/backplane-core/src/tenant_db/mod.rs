// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-workspace tenant databases on a MySQL-family server.
//!
//! - [`TenantDbService`] provisions the database and its admin user, rotates
//!   the admin secret, takes backups and restores them, and drives governed
//!   schema migrations through review.
//! - [`DbRoleService`] issues scoped read/write/admin principals.
//!
//! Both talk to the server through [`TenantDbAdmin`]. [`MySqlTenantAdmin`] is
//! the production implementation; [`MemoryTenantAdmin`] simulates a server for
//! tests and local runs.
//!
//! Passwords never leave this module in clear except as a return value of the
//! call that generated them. Stored references have the form `enc:<ciphertext>`.

pub mod memory;
pub mod migrator;
pub mod mysql;
pub mod provisioner;
pub mod roles;

pub use memory::MemoryTenantAdmin;
pub use migrator::{
    MigrationPlan, MigrationPlanItem, MigrationPrecheck, MigrationPreview, RiskLevel,
    SubmitMigration, build_plan, migration_status, review_snapshot, scan_risk,
    validate_verify_sql,
};
pub use mysql::MySqlTenantAdmin;
pub use provisioner::{BackupResult, RestoreResult, RotatedSecret, TenantDbService};
pub use roles::{CreateDbRole, DbRoleFilter, DbRoleService, DbRoleType, IssuedDbRole, role_status};

use std::collections::BTreeSet;
use std::env;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use uuid::Uuid;

use crate::crypto::Encryptor;
use crate::error::{CoreError, Result};

/// Default server character set.
pub const DEFAULT_CHARSET: &str = "utf8mb4";
/// Collation used for every tenant database.
pub const DEFAULT_COLLATION: &str = "utf8mb4_unicode_ci";

const NAME_PREFIX: &str = "ws_";
const USER_PREFIX: &str = "wsu_";
const BACKUP_PREFIX: &str = "wsb_";
const ROLE_USER_PREFIX: &str = "wsr_";
const NAME_MAX_LEN: usize = 63;
const USER_MAX_LEN: usize = 32;
const PASSWORD_BYTES: usize = 24;
const SECRET_REF_PREFIX: &str = "enc:";

/// How long `GET_LOCK` waits for the migration lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Privileges of the workspace admin user.
pub const ADMIN_PRIVILEGES: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "INDEX", "DROP",
];

/// Tenant database lifecycle.
pub mod db_status {
    /// Record created, nothing allocated.
    pub const PENDING: &str = "pending";
    /// Allocation in progress.
    pub const PROVISIONING: &str = "provisioning";
    /// Database, user and base schema exist.
    pub const READY: &str = "ready";
    /// Disabled by an operator.
    pub const BLOCKED: &str = "blocked";
    /// Provisioning exhausted its attempts.
    pub const ERROR: &str = "error";
}

/// Table tracking applied tenant schema versions.
pub const MIGRATION_TABLE: &str = "workspace_db_migrations";

/// DDL for [`MIGRATION_TABLE`].
pub const MIGRATION_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS workspace_db_migrations (\
     version VARCHAR(64) PRIMARY KEY, \
     applied_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP\
     ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci";

// ============================================================================
// Configuration
// ============================================================================

/// Admin connection to the tenant database server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantDbConfig {
    /// Server host, also stored on each provisioned record.
    pub host: String,
    /// Server port (default: 3306).
    pub port: u16,
    /// Admin user able to create databases and users.
    pub user: String,
    /// Admin password.
    pub password: String,
    /// Character set (default: utf8mb4).
    pub charset: String,
}

impl TenantDbConfig {
    /// Reads `BACKPLANE_TENANT_DB_*`. Returns `None` unless host and user are set.
    ///
    /// - `BACKPLANE_TENANT_DB_HOST`, `BACKPLANE_TENANT_DB_USER`: required
    /// - `BACKPLANE_TENANT_DB_PORT`: default 3306
    /// - `BACKPLANE_TENANT_DB_PASSWORD`: default empty
    /// - `BACKPLANE_TENANT_DB_CHARSET`: default utf8mb4
    pub fn from_env() -> Option<Self> {
        let var = |k: &str| env::var(k).ok().filter(|v| !v.trim().is_empty());
        Some(Self {
            host: var("BACKPLANE_TENANT_DB_HOST")?,
            user: var("BACKPLANE_TENANT_DB_USER")?,
            port: var("BACKPLANE_TENANT_DB_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(3306),
            password: env::var("BACKPLANE_TENANT_DB_PASSWORD").unwrap_or_default(),
            charset: var("BACKPLANE_TENANT_DB_CHARSET")
                .unwrap_or_else(|| DEFAULT_CHARSET.to_string()),
        })
    }

    /// Config for [`MemoryTenantAdmin`] runs.
    pub fn local() -> Self {
        Self {
            host: "localhost".into(),
            port: 3306,
            user: "root".into(),
            password: String::new(),
            charset: DEFAULT_CHARSET.into(),
        }
    }
}

// ============================================================================
// Schema versions
// ============================================================================

/// One versioned tenant schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantMigration {
    /// Sortable version string.
    pub version: String,
    /// Forward SQL, possibly several statements.
    pub up_sql: String,
    /// Compensating SQL run when the forward SQL fails.
    pub down_sql: String,
}

impl TenantMigration {
    /// Convenience constructor.
    pub fn new(version: &str, up_sql: &str, down_sql: &str) -> Self {
        Self {
            version: version.to_string(),
            up_sql: up_sql.to_string(),
            down_sql: down_sql.to_string(),
        }
    }
}

/// The schema every tenant database starts from, ascending.
pub fn builtin_migrations() -> Vec<TenantMigration> {
    vec![
        TenantMigration::new(
            "20250101000000",
            include_str!("../../migrations/tenant/20250101000000_workspace_meta.up.sql"),
            include_str!("../../migrations/tenant/20250101000000_workspace_meta.down.sql"),
        ),
        TenantMigration::new(
            "20250115000000",
            include_str!("../../migrations/tenant/20250115000000_app_records.up.sql"),
            include_str!("../../migrations/tenant/20250115000000_app_records.down.sql"),
        ),
    ]
}

// ============================================================================
// Server port
// ============================================================================

/// Credentials and location of one tenant database.
#[derive(Debug, Clone)]
pub struct TenantTarget {
    /// Host.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Login user.
    pub user: String,
    /// Login password.
    pub password: String,
}

/// Administrative operations on the tenant database server.
///
/// Identifiers passed in are generated by this module and pass
/// [`is_safe_identifier`]; implementations still quote them.
#[async_trait]
pub trait TenantDbAdmin: Send + Sync {
    /// `CREATE DATABASE IF NOT EXISTS` with the configured charset.
    async fn create_database(&self, name: &str) -> Result<()>;
    /// `DROP DATABASE IF EXISTS`.
    async fn drop_database(&self, name: &str) -> Result<()>;
    /// Whether the schema exists.
    async fn database_exists(&self, name: &str) -> Result<bool>;
    /// Creates the user or resets its password.
    async fn upsert_user(&self, user: &str, password: &str) -> Result<()>;
    /// `DROP USER IF EXISTS`.
    async fn drop_user(&self, user: &str) -> Result<()>;
    /// Grants privileges on every table of `database`, then flushes.
    async fn grant(&self, database: &str, user: &str, privileges: &[&str]) -> Result<()>;
    /// Base tables of `database`, sorted.
    async fn list_tables(&self, database: &str) -> Result<Vec<String>>;
    /// `CREATE TABLE t LIKE s` plus `INSERT … SELECT` for each table.
    async fn copy_tables(&self, source: &str, target: &str, tables: &[String]) -> Result<()>;
    /// `DROP TABLE IF EXISTS` for each table.
    async fn drop_tables(&self, database: &str, tables: &[String]) -> Result<()>;
    /// Opens a session as the workspace user.
    async fn connect(&self, target: &TenantTarget) -> Result<Box<dyn TenantConnection>>;
}

/// A session inside one tenant database. Named locks belong to the session.
#[async_trait]
pub trait TenantConnection: Send {
    /// Versions recorded in [`MIGRATION_TABLE`], creating it when missing.
    async fn applied_versions(&mut self) -> Result<BTreeSet<String>>;
    /// Runs the forward SQL and records the version. On failure the down
    /// SQL is attempted before the error is returned.
    async fn apply(&mut self, migration: &TenantMigration) -> Result<()>;
    /// Runs a read-only statement and discards the rows.
    async fn verify(&mut self, sql: &str) -> Result<()>;
    /// `GET_LOCK(key, timeout)`; false when the wait timed out.
    async fn try_lock(&mut self, key: &str, timeout: Duration) -> Result<bool>;
    /// `RELEASE_LOCK(key)`.
    async fn release_lock(&mut self, key: &str) -> Result<()>;
    /// Inserts the workspace id into `workspace_meta` once.
    async fn seed_workspace_meta(&mut self, workspace_id: Uuid) -> Result<()>;
}

// ============================================================================
// Naming & secrets
// ============================================================================

fn compact_id(workspace_id: Uuid) -> String {
    workspace_id.simple().to_string()
}

fn truncate(mut value: String, max: usize) -> String {
    value.truncate(max);
    value
}

/// `ws_<hex>`, at most 63 characters.
pub fn database_name(workspace_id: Uuid) -> String {
    truncate(format!("{NAME_PREFIX}{}", compact_id(workspace_id)), NAME_MAX_LEN)
}

/// `wsu_<hex>` cut to 32 characters.
pub fn admin_user(workspace_id: Uuid) -> String {
    truncate(format!("{USER_PREFIX}{}", compact_id(workspace_id)), USER_MAX_LEN)
}

/// `wsb_<hex>_<yyyymmddhhmmss>`, at most 63 characters.
pub fn backup_name(workspace_id: Uuid, at: DateTime<Utc>) -> String {
    truncate(
        format!(
            "{BACKUP_PREFIX}{}_{}",
            compact_id(workspace_id),
            at.format("%Y%m%d%H%M%S")
        ),
        NAME_MAX_LEN,
    )
}

/// Whether `name` is a backup of this workspace.
pub fn is_backup_of(name: &str, workspace_id: Uuid) -> bool {
    name.starts_with(&format!("{BACKUP_PREFIX}{}_", compact_id(workspace_id)))
}

/// `wsr_<first 8 hex>_<r|w|a>`.
pub fn role_user(workspace_id: Uuid, role: DbRoleType) -> String {
    let ws = compact_id(workspace_id);
    truncate(
        format!("{ROLE_USER_PREFIX}{}_{}", &ws[..8], role.suffix()),
        USER_MAX_LEN,
    )
}

/// Letters, digits and underscore only.
pub fn is_safe_identifier(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Backtick-quotes an identifier.
pub fn quote_identifier(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}

/// Escapes a value for a single-quoted SQL literal.
pub fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// 24 random bytes, base64url without padding.
pub fn generate_password() -> String {
    let mut buf = [0u8; PASSWORD_BYTES];
    rand::rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Encrypts a password into an `enc:` reference.
pub fn seal_secret(encryptor: &dyn Encryptor, password: &str) -> Result<String> {
    Ok(format!("{SECRET_REF_PREFIX}{}", encryptor.encrypt(password)?))
}

/// Decrypts an `enc:` reference.
pub fn open_secret(encryptor: &dyn Encryptor, secret_ref: Option<&str>) -> Result<String> {
    let sealed = secret_ref
        .map(str::trim)
        .and_then(|r| r.strip_prefix(SECRET_REF_PREFIX))
        .filter(|r| !r.is_empty())
        .ok_or_else(|| CoreError::InvalidState {
            expected: "sealed secret".into(),
            actual: "missing secret reference".into(),
        })?;
    encryptor.decrypt(sealed)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::test_env::{ENV_MUTEX, EnvGuard};
    use crate::crypto::AesGcmEncryptor;

    #[test]
    fn test_names() {
        let ws = Uuid::parse_str("0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0").unwrap();
        assert_eq!(database_name(ws), "ws_0f1e2d3c4b5a69788796a5b4c3d2e1f0");
        assert_eq!(admin_user(ws), "wsu_0f1e2d3c4b5a69788796a5b4c3d2e");
        assert_eq!(admin_user(ws).len(), 32);
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 5).unwrap();
        let backup = backup_name(ws, at);
        assert_eq!(backup, "wsb_0f1e2d3c4b5a69788796a5b4c3d2e1f0_20250601123005");
        assert!(is_backup_of(&backup, ws));
        assert!(!is_backup_of(&backup, Uuid::new_v4()));
        assert_eq!(role_user(ws, DbRoleType::Write), "wsr_0f1e2d3c_w");
    }

    #[test]
    fn test_identifiers() {
        assert!(is_safe_identifier("wsb_abc_2025"));
        assert!(!is_safe_identifier("x`; DROP"));
        assert!(!is_safe_identifier(""));
        assert_eq!(quote_identifier("a`b"), "`a``b`");
        assert_eq!(escape_literal(r"it's\"), r"it\'s\\");
    }

    #[test]
    fn test_secret_ref_round_trip() {
        let enc = AesGcmEncryptor::new(&[3u8; 32]).unwrap();
        let password = generate_password();
        assert_eq!(password.len(), 32);
        let sealed = seal_secret(&enc, &password).unwrap();
        assert!(sealed.starts_with("enc:"));
        assert_eq!(open_secret(&enc, Some(&sealed)).unwrap(), password);
        assert!(open_secret(&enc, Some("plain")).is_err());
        assert!(open_secret(&enc, None).is_err());
    }

    #[test]
    fn test_builtin_migrations_sorted() {
        let versions: Vec<_> = builtin_migrations().into_iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn test_config_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("BACKPLANE_TENANT_DB_HOST");
        guard.set("BACKPLANE_TENANT_DB_USER", "admin");
        assert!(TenantDbConfig::from_env().is_none());

        guard.set("BACKPLANE_TENANT_DB_HOST", "mysql.internal");
        guard.remove("BACKPLANE_TENANT_DB_PORT");
        guard.remove("BACKPLANE_TENANT_DB_CHARSET");
        guard.set("BACKPLANE_TENANT_DB_PASSWORD", "pw");
        let config = TenantDbConfig::from_env().unwrap();
        assert_eq!(config.port, 3306);
        assert_eq!(config.charset, "utf8mb4");
        assert_eq!(config.password, "pw");
    }
}
