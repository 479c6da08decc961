// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router wiring and the listener loop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::{get, post};
use backplane_core::AppContext;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::{auth, runtime, system};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AppContext>,
}

impl AppState {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

/// Builds the runtime router.
pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version()
            )
        });

    Router::new()
        .route("/health", get(system::health))
        .route("/runtime/{slug}/entry", get(runtime::slug_entry))
        .route("/runtime/{slug}/schema", get(runtime::slug_schema))
        .route("/runtime/{slug}/execute", post(runtime::slug_execute))
        .route("/runtime/{slug}/auth/register", post(auth::register))
        .route("/runtime/{slug}/auth/login", post(auth::login))
        .route("/runtime/{slug}/auth/logout", post(auth::logout))
        .route("/runtime/entry", get(runtime::host_entry))
        .route("/runtime/schema", get(runtime::host_schema))
        .route("/runtime/execute", post(runtime::host_execute))
        .fallback(system::not_found)
        .layer(trace_layer)
        .with_state(state)
}

/// Serves until the context's shutdown token is cancelled.
pub async fn serve(ctx: Arc<AppContext>, addr: SocketAddr) -> Result<()> {
    let shutdown = ctx.shutdown_token();
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Runtime HTTP server listening");

    axum::serve(
        listener,
        build_router(AppState::new(ctx)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    info!("Runtime HTTP server stopped");
    Ok(())
}
