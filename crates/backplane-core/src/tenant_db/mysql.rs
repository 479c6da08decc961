// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MySQL-family tenant database server.
//!
//! DDL and account statements cannot be prepared, so they are rendered with
//! [`quote_identifier`] / [`escape_literal`] and sent through `raw_sql`.
//! Everything that takes a value as data (lock names, schema lookups) binds it.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions};
use sqlx::{Connection, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    DEFAULT_COLLATION, MIGRATION_TABLE_SQL, TenantConnection, TenantDbAdmin, TenantDbConfig,
    TenantMigration, TenantTarget, escape_literal, quote_identifier,
};
use crate::error::{CoreError, Result};

const ADMIN_POOL_SIZE: u32 = 4;

fn db_err(context: &str) -> impl FnOnce(sqlx::Error) -> CoreError + '_ {
    move |e| CoreError::TenantDb(format!("{context}: {e}"))
}

/// Admin pool against the tenant server.
#[derive(Clone)]
pub struct MySqlTenantAdmin {
    pool: MySqlPool,
    charset: String,
}

impl MySqlTenantAdmin {
    /// Opens a lazily connecting admin pool.
    pub fn new(config: &TenantDbConfig) -> Self {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .charset(&config.charset);
        let pool = MySqlPoolOptions::new()
            .max_connections(ADMIN_POOL_SIZE)
            .connect_lazy_with(options);
        Self {
            pool,
            charset: config.charset.clone(),
        }
    }

    async fn exec(&self, sql: &str, context: &str) -> Result<()> {
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(db_err(context))?;
        Ok(())
    }

    fn account(user: &str) -> String {
        format!("'{}'@'%'", escape_literal(user))
    }
}

#[async_trait]
impl TenantDbAdmin for MySqlTenantAdmin {
    async fn create_database(&self, name: &str) -> Result<()> {
        let sql = format!(
            "CREATE DATABASE IF NOT EXISTS {} CHARACTER SET {} COLLATE {}",
            quote_identifier(name),
            self.charset,
            DEFAULT_COLLATION
        );
        self.exec(&sql, "create database").await
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let sql = format!("DROP DATABASE IF EXISTS {}", quote_identifier(name));
        self.exec(&sql, "drop database").await
    }

    async fn database_exists(&self, name: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM information_schema.schemata WHERE schema_name = ?",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("lookup database"))?;
        let count: i64 = row.try_get("n").map_err(db_err("lookup database"))?;
        Ok(count > 0)
    }

    async fn upsert_user(&self, user: &str, password: &str) -> Result<()> {
        let account = Self::account(user);
        let secret = escape_literal(password);
        self.exec(
            &format!("CREATE USER IF NOT EXISTS {account} IDENTIFIED BY '{secret}'"),
            "create user",
        )
        .await?;
        self.exec(
            &format!("ALTER USER {account} IDENTIFIED BY '{secret}'"),
            "alter user",
        )
        .await?;
        self.exec("FLUSH PRIVILEGES", "flush privileges").await
    }

    async fn drop_user(&self, user: &str) -> Result<()> {
        self.exec(
            &format!("DROP USER IF EXISTS {}", Self::account(user)),
            "drop user",
        )
        .await?;
        self.exec("FLUSH PRIVILEGES", "flush privileges").await
    }

    async fn grant(&self, database: &str, user: &str, privileges: &[&str]) -> Result<()> {
        let sql = format!(
            "GRANT {} ON {}.* TO {}",
            privileges.join(", "),
            quote_identifier(database),
            Self::account(user)
        );
        self.exec(&sql, "grant").await?;
        self.exec("FLUSH PRIVILEGES", "flush privileges").await
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT CAST(table_name AS CHAR) AS name FROM information_schema.tables \
             WHERE table_schema = ? AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .bind(database)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list tables"))?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("name").map_err(db_err("list tables")))
            .collect()
    }

    async fn copy_tables(&self, source: &str, target: &str, tables: &[String]) -> Result<()> {
        for table in tables {
            let from = format!("{}.{}", quote_identifier(source), quote_identifier(table));
            let to = format!("{}.{}", quote_identifier(target), quote_identifier(table));
            self.exec(&format!("CREATE TABLE {to} LIKE {from}"), "copy table")
                .await?;
            self.exec(&format!("INSERT INTO {to} SELECT * FROM {from}"), "copy rows")
                .await?;
            debug!(source, target, table = %table, "Copied tenant table");
        }
        Ok(())
    }

    async fn drop_tables(&self, database: &str, tables: &[String]) -> Result<()> {
        for table in tables {
            let sql = format!(
                "DROP TABLE IF EXISTS {}.{}",
                quote_identifier(database),
                quote_identifier(table)
            );
            self.exec(&sql, "drop table").await?;
        }
        Ok(())
    }

    async fn connect(&self, target: &TenantTarget) -> Result<Box<dyn TenantConnection>> {
        let options = MySqlConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&target.user)
            .password(&target.password)
            .database(&target.database)
            .charset(&self.charset);
        let conn = MySqlConnection::connect_with(&options)
            .await
            .map_err(db_err("connect tenant database"))?;
        Ok(Box::new(MySqlTenantConnection { conn }))
    }
}

/// One session as the workspace admin user.
pub struct MySqlTenantConnection {
    conn: MySqlConnection,
}

#[async_trait]
impl TenantConnection for MySqlTenantConnection {
    async fn applied_versions(&mut self) -> Result<BTreeSet<String>> {
        sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(MIGRATION_TABLE_SQL))
            .await
            .map_err(db_err("ensure migration table"))?;
        let rows = sqlx::query("SELECT version FROM workspace_db_migrations")
            .fetch_all(&mut self.conn)
            .await
            .map_err(db_err("read applied versions"))?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("version").map_err(db_err("read applied versions")))
            .collect()
    }

    async fn apply(&mut self, migration: &TenantMigration) -> Result<()> {
        let forward = sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(&migration.up_sql)).await;
        if let Err(e) = forward {
            if !migration.down_sql.trim().is_empty() {
                if let Err(down) = sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(&migration.down_sql)).await
                {
                    warn!(version = %migration.version, error = %down, "Down migration failed");
                }
            }
            return Err(CoreError::TenantDb(format!(
                "migration {} failed: {e}",
                migration.version
            )));
        }
        sqlx::query("INSERT INTO workspace_db_migrations (version) VALUES (?)")
            .bind(&migration.version)
            .execute(&mut self.conn)
            .await
            .map_err(db_err("record migration"))?;
        Ok(())
    }

    async fn verify(&mut self, sql: &str) -> Result<()> {
        sqlx::query(sql)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| CoreError::TenantDb(format!("verify failed: {e}")))?;
        Ok(())
    }

    async fn try_lock(&mut self, key: &str, timeout: Duration) -> Result<bool> {
        let acquired: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, ?)")
            .bind(key)
            .bind(timeout.as_secs() as i64)
            .fetch_one(&mut self.conn)
            .await
            .map_err(db_err("acquire migration lock"))?;
        Ok(acquired == Some(1))
    }

    async fn release_lock(&mut self, key: &str) -> Result<()> {
        sqlx::query("SELECT RELEASE_LOCK(?)")
            .bind(key)
            .execute(&mut self.conn)
            .await
            .map_err(db_err("release migration lock"))?;
        Ok(())
    }

    async fn seed_workspace_meta(&mut self, workspace_id: Uuid) -> Result<()> {
        sqlx::query("INSERT IGNORE INTO workspace_meta (workspace_id) VALUES (?)")
            .bind(workspace_id.to_string())
            .execute(&mut self.conn)
            .await
            .map_err(db_err("seed workspace_meta"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_escapes_user() {
        assert_eq!(MySqlTenantAdmin::account("wsu_abc"), "'wsu_abc'@'%'");
        assert_eq!(MySqlTenantAdmin::account("o'brien"), r"'o\'brien'@'%'");
    }

    #[tokio::test]
    async fn test_admin_pool_is_lazy() {
        // No server is listening; construction must not dial.
        let admin = MySqlTenantAdmin::new(&TenantDbConfig {
            host: "127.0.0.1".into(),
            port: 1,
            user: "root".into(),
            password: String::new(),
            charset: "utf8mb4".into(),
        });
        assert_eq!(admin.charset, "utf8mb4");
    }
}
