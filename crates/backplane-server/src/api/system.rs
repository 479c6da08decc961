// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Probes and the catch-all.

use axum::Json;
use backplane_core::CoreError;
use serde::Serialize;

use super::edge::Edge;
use super::response::ApiError;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
}

/// `GET /health`
pub async fn health() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Unknown routes answer with the envelope too.
pub async fn not_found(edge: Edge) -> ApiError {
    ApiError::new(CoreError::NotFound("route".into()), &edge.meta)
}
