// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process stand-in for the tenant database server.
//!
//! Tracks databases, tables, rows, users, grants and named locks closely
//! enough to exercise provisioning, backup/restore and governed migrations.
//! SQL is interpreted at the statement-head level: `CREATE TABLE`,
//! `DROP TABLE`, `TRUNCATE` change the catalog; `ALTER`, `INSERT`, `UPDATE`,
//! `DELETE` and `CREATE INDEX` require their table to exist. Anything else is
//! accepted as a no-op.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use uuid::Uuid;

use super::{MIGRATION_TABLE, TenantConnection, TenantDbAdmin, TenantMigration, TenantTarget};
use crate::error::{CoreError, Result};

static CREATE_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^create\s+table\s+(if\s+not\s+exists\s+)?`?(\w+)`?")
        .expect("valid create table pattern")
});
static DROP_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^drop\s+table\s+(if\s+exists\s+)?`?(\w+)`?").expect("valid drop table pattern")
});
static TRUNCATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^truncate\s+(table\s+)?`?(\w+)`?").expect("valid truncate pattern")
});
static TOUCH_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:alter\s+table|insert\s+(?:ignore\s+)?into|update|delete\s+from|create\s+(?:unique\s+)?index\s+\w+\s+on)\s+`?(\w+)`?",
    )
    .expect("valid table statement pattern")
});
static FROM_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bfrom\s+`?(\w+)`?").expect("valid from pattern"));

type Tables = BTreeMap<String, Vec<String>>;

#[derive(Debug, Default, Clone)]
struct MemoryUser {
    password: String,
    grants: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct ServerState {
    databases: BTreeMap<String, Tables>,
    users: BTreeMap<String, MemoryUser>,
    locks: HashMap<String, Uuid>,
    operations: Vec<String>,
    failures: HashMap<String, u32>,
}

impl ServerState {
    /// Logs the operation and consumes one injected failure, if any.
    fn enter(&mut self, op: &str) -> Result<()> {
        self.operations.push(op.to_string());
        match self.failures.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(CoreError::TenantDb(format!("injected failure in {op}")))
            }
            _ => Ok(()),
        }
    }

    fn tables_mut(&mut self, database: &str) -> Result<&mut Tables> {
        self.databases
            .get_mut(database)
            .ok_or_else(|| CoreError::TenantDb(format!("unknown database '{database}'")))
    }
}

/// Simulated tenant database server shared by every connection it opens.
#[derive(Clone, Default)]
pub struct MemoryTenantAdmin {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryTenantAdmin {
    /// Empty server.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Makes the next `times` calls of `op` fail (`create_database`,
    /// `upsert_user`, `grant`, `copy_tables`, `connect`, `apply`, `verify`, ...).
    pub fn fail_op(&self, op: &str, times: u32) {
        self.state().failures.insert(op.to_string(), times);
    }

    /// Operation names in call order.
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }

    /// Existing database names.
    pub fn databases(&self) -> Vec<String> {
        self.state().databases.keys().cloned().collect()
    }

    /// Table names of one database.
    pub fn tables(&self, database: &str) -> Vec<String> {
        self.state()
            .databases
            .get(database)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the user exists.
    pub fn has_user(&self, user: &str) -> bool {
        self.state().users.contains_key(user)
    }

    /// Privileges a user holds on a database.
    pub fn grants(&self, user: &str, database: &str) -> Vec<String> {
        self.state()
            .users
            .get(user)
            .and_then(|u| u.grants.get(database).cloned())
            .unwrap_or_default()
    }

    /// Takes a named lock on behalf of another session.
    pub fn hold_lock(&self, key: &str) {
        self.state().locks.insert(key.to_string(), Uuid::new_v4());
    }

    /// Whether any session holds the lock.
    pub fn is_locked(&self, key: &str) -> bool {
        self.state().locks.contains_key(key)
    }
}

#[async_trait]
impl TenantDbAdmin for MemoryTenantAdmin {
    async fn create_database(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.enter("create_database")?;
        state.databases.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.enter("drop_database")?;
        state.databases.remove(name);
        for user in state.users.values_mut() {
            user.grants.remove(name);
        }
        Ok(())
    }

    async fn database_exists(&self, name: &str) -> Result<bool> {
        let mut state = self.state();
        state.enter("database_exists")?;
        Ok(state.databases.contains_key(name))
    }

    async fn upsert_user(&self, user: &str, password: &str) -> Result<()> {
        let mut state = self.state();
        state.enter("upsert_user")?;
        state.users.entry(user.to_string()).or_default().password = password.to_string();
        Ok(())
    }

    async fn drop_user(&self, user: &str) -> Result<()> {
        let mut state = self.state();
        state.enter("drop_user")?;
        state.users.remove(user);
        Ok(())
    }

    async fn grant(&self, database: &str, user: &str, privileges: &[&str]) -> Result<()> {
        let mut state = self.state();
        state.enter("grant")?;
        let entry = state
            .users
            .get_mut(user)
            .ok_or_else(|| CoreError::TenantDb(format!("unknown user '{user}'")))?;
        let grants = entry.grants.entry(database.to_string()).or_default();
        for privilege in privileges {
            if !grants.iter().any(|g| g == privilege) {
                grants.push((*privilege).to_string());
            }
        }
        Ok(())
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<String>> {
        let mut state = self.state();
        state.enter("list_tables")?;
        Ok(state.tables_mut(database)?.keys().cloned().collect())
    }

    async fn copy_tables(&self, source: &str, target: &str, tables: &[String]) -> Result<()> {
        let mut state = self.state();
        state.enter("copy_tables")?;
        let from = state
            .databases
            .get(source)
            .cloned()
            .ok_or_else(|| CoreError::TenantDb(format!("unknown database '{source}'")))?;
        let to = state.tables_mut(target)?;
        for table in tables {
            if to.contains_key(table) {
                return Err(CoreError::TenantDb(format!("table '{table}' already exists")));
            }
            let rows = from
                .get(table)
                .cloned()
                .ok_or_else(|| CoreError::TenantDb(format!("no such table {table}")))?;
            to.insert(table.clone(), rows);
        }
        Ok(())
    }

    async fn drop_tables(&self, database: &str, tables: &[String]) -> Result<()> {
        let mut state = self.state();
        state.enter("drop_tables")?;
        let db = state.tables_mut(database)?;
        for table in tables {
            db.remove(table);
        }
        Ok(())
    }

    async fn connect(&self, target: &TenantTarget) -> Result<Box<dyn TenantConnection>> {
        let mut state = self.state();
        state.enter("connect")?;
        match state.users.get(&target.user) {
            Some(user) if user.password == target.password => {}
            _ => {
                return Err(CoreError::TenantDb(format!(
                    "access denied for user '{}'",
                    target.user
                )));
            }
        }
        if !state.databases.contains_key(&target.database) {
            return Err(CoreError::TenantDb(format!(
                "unknown database '{}'",
                target.database
            )));
        }
        Ok(Box::new(MemoryTenantConnection {
            state: Arc::clone(&self.state),
            database: target.database.clone(),
            session: Uuid::new_v4(),
        }))
    }
}

/// Session bound to one simulated database. Locks are released on drop.
pub struct MemoryTenantConnection {
    state: Arc<Mutex<ServerState>>,
    database: String,
    session: Uuid,
}

impl MemoryTenantConnection {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn execute_statement(tables: &mut Tables, statement: &str) -> Result<()> {
    if let Some(c) = CREATE_TABLE.captures(statement) {
        let name = c[2].to_lowercase();
        if tables.contains_key(&name) {
            if c.get(1).is_none() {
                return Err(CoreError::TenantDb(format!("table '{name}' already exists")));
            }
        } else {
            tables.insert(name, Vec::new());
        }
        return Ok(());
    }
    if let Some(c) = DROP_TABLE.captures(statement) {
        let name = c[2].to_lowercase();
        if tables.remove(&name).is_none() && c.get(1).is_none() {
            return Err(CoreError::TenantDb(format!("unknown table '{name}'")));
        }
        return Ok(());
    }
    if let Some(c) = TRUNCATE.captures(statement) {
        let name = c[2].to_lowercase();
        return match tables.get_mut(&name) {
            Some(rows) => {
                rows.clear();
                Ok(())
            }
            None => Err(CoreError::TenantDb(format!("no such table {name}"))),
        };
    }
    if let Some(c) = TOUCH_TABLE.captures(statement) {
        let name = c[1].to_lowercase();
        let rows = tables
            .get_mut(&name)
            .ok_or_else(|| CoreError::TenantDb(format!("no such table {name}")))?;
        if statement.to_lowercase().starts_with("insert") {
            rows.push(statement.to_string());
        }
    }
    Ok(())
}

fn execute_script(tables: &mut Tables, sql: &str) -> Result<()> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .try_for_each(|s| execute_statement(tables, s))
}

#[async_trait]
impl TenantConnection for MemoryTenantConnection {
    async fn applied_versions(&mut self) -> Result<BTreeSet<String>> {
        let database = self.database.clone();
        let mut state = self.state();
        state.enter("applied_versions")?;
        let tables = state.tables_mut(&database)?;
        Ok(tables
            .entry(MIGRATION_TABLE.to_string())
            .or_default()
            .iter()
            .cloned()
            .collect())
    }

    async fn apply(&mut self, migration: &TenantMigration) -> Result<()> {
        let database = self.database.clone();
        let mut state = self.state();
        state.enter("apply")?;
        let tables = state.tables_mut(&database)?;
        let mut staged = tables.clone();
        if let Err(e) = execute_script(&mut staged, &migration.up_sql) {
            // Statements before the failure are not transactional in MySQL.
            let _ = execute_script(tables, &migration.up_sql);
            let _ = execute_script(tables, &migration.down_sql);
            return Err(CoreError::TenantDb(format!(
                "migration {} failed: {e}",
                migration.version
            )));
        }
        staged
            .entry(MIGRATION_TABLE.to_string())
            .or_default()
            .push(migration.version.clone());
        *tables = staged;
        Ok(())
    }

    async fn verify(&mut self, sql: &str) -> Result<()> {
        let database = self.database.clone();
        let mut state = self.state();
        state.enter("verify")?;
        let tables = state.tables_mut(&database)?;
        for c in FROM_TABLE.captures_iter(sql) {
            let name = c[1].to_lowercase();
            if !tables.contains_key(&name) {
                return Err(CoreError::TenantDb(format!(
                    "verify failed: no such table {name}"
                )));
            }
        }
        Ok(())
    }

    async fn try_lock(&mut self, key: &str, _timeout: Duration) -> Result<bool> {
        let session = self.session;
        let mut state = self.state();
        state.enter("try_lock")?;
        match state.locks.get(key) {
            Some(owner) if *owner != session => Ok(false),
            _ => {
                state.locks.insert(key.to_string(), session);
                Ok(true)
            }
        }
    }

    async fn release_lock(&mut self, key: &str) -> Result<()> {
        let session = self.session;
        let mut state = self.state();
        state.enter("release_lock")?;
        if state.locks.get(key) == Some(&session) {
            state.locks.remove(key);
        }
        Ok(())
    }

    async fn seed_workspace_meta(&mut self, workspace_id: Uuid) -> Result<()> {
        let database = self.database.clone();
        let mut state = self.state();
        state.enter("seed_workspace_meta")?;
        let rows = state
            .tables_mut(&database)?
            .get_mut("workspace_meta")
            .ok_or_else(|| CoreError::TenantDb("no such table workspace_meta".into()))?;
        let id = workspace_id.to_string();
        if !rows.contains(&id) {
            rows.push(id);
        }
        Ok(())
    }
}

impl Drop for MemoryTenantConnection {
    fn drop(&mut self) {
        let session = self.session;
        self.state().locks.retain(|_, owner| *owner != session);
    }
}
