// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backplane Core - Multi-tenant Runtime Pipeline
//!
//! Everything behind a published workspace app: resolving the request to a
//! workspace, guarding it, metering it, running its workflow and reporting
//! what happened.
//!
//! # Request Pipeline
//!
//! ```text
//!   /runtime/{slug}/...  or  Host: app.example.com
//!            │
//!            ▼
//!   Resolver ──► Access controller ──► Abuse guard ──► Billing pre-check
//!   (slug/alias/     (mode, session,      (lists, rate       (quota, spend
//!    domain, cache)   bearer, roles)       limits, anomaly,   limit)
//!                                          captcha)
//!                                                │
//!                                                ▼
//!                                   ExecutionService ──► backplane-engine
//!                                                │
//!                                                ▼
//!                   EventRecorder ──► webhooks / critical-event notifier
//! ```
//!
//! # Background Work
//!
//! | Worker | Default cadence | Does |
//! |--------|-----------------|------|
//! | Retention | 1 h | Expires events, audit logs, anonymous sessions; purges deleted workspaces |
//! | Connector health | 6 h | Classifies connector credential expiry |
//! | Webhook delivery | per event | Signed POST with retries |
//!
//! # Tenant Databases
//!
//! Workspaces may own a MySQL-family database ([`tenant_db`]) with scoped
//! roles, backups and reviewed schema migrations.
//!
//! # Modules
//!
//! - [`context`]: service wiring for the server and tests
//! - [`persistence`]: repository port with PostgreSQL and in-memory backends
//! - [`runtime`]: resolver, access controller, abuse guard, runtime service
//! - [`billing`]: quotas, usage, budgets, invoices
//! - [`events`]: event catalog, recorder, PII sanitizer

#![warn(missing_docs)]

/// App-user registration, login and bearer resolution.
pub mod auth;

/// Billing plans, quotas, usage metering and invoices.
pub mod billing;

/// TTL caches in front of hot runtime lookups.
pub mod cache;

/// Configuration loaded from environment variables.
pub mod config;

/// Service wiring.
pub mod context;

/// Secret encryption and hashing helpers.
pub mod crypto;

/// Error type with client codes and HTTP status mapping.
pub mod error;

/// Runtime event catalog, recorder and PII sanitizer.
pub mod events;

/// Workflow execution bridged onto the engine.
pub mod execution;

/// Embedded control-plane migrations.
pub mod migrations;

/// Shared domain vocabulary.
pub mod model;

/// Critical-event notifications.
pub mod notify;

/// Repository port and its backends.
pub mod persistence;

/// The runtime request pipeline.
pub mod runtime;

/// Encrypted credential store.
pub mod secrets;

/// Per-workspace MySQL-family databases.
pub mod tenant_db;

/// Outgoing webhooks.
pub mod webhook;

/// Periodic background workers.
pub mod workers;

/// Workspace lifecycle and access policy.
pub mod workspace;

pub use config::Config;
pub use context::AppContext;
pub use error::{CoreError, Result};
