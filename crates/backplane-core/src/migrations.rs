// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane database migrations for backplane-core.
//!
//! The migrations are embedded at compile time; the server runs them on startup
//! when `BACKPLANE_STORAGE=postgres`.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::PgPool;
//! use backplane_core::migrations;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! migrations::run_postgres(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with all control-plane migrations embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// Run PostgreSQL migrations.
///
/// Already-applied migrations are skipped, so this is safe to call on every start.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}
