// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic background workers.
//!
//! Each worker exposes a single pass (`run_once`) used by tests and admin
//! tooling, and a `run` loop that repeats it until the shutdown token fires.

pub mod connector_health;
pub mod retention;

pub use connector_health::{
    ConnectorHealthConfig, ConnectorHealthReport, ConnectorHealthWorker, HealthStatus,
    classify_expiry,
};
pub use retention::{RetentionConfig, RetentionReport, RetentionWorker};

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
