// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backplane Server
//!
//! Loads configuration, wires the backplane services, starts the background
//! workers and serves the runtime surface until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;

use backplane_core::{AppContext, Config};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backplane_server=info,backplane_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));

    info!(
        storage = ?config.storage,
        http_addr = %addr,
        "Starting Backplane"
    );

    let ctx = Arc::new(AppContext::connect(config).await?);
    ctx.billing.ensure_default_plans().await?;
    info!("Default billing plans verified");

    let workers = ctx.spawn_workers();
    ctx.announce_startup().await;

    let mut server = tokio::spawn(backplane_server::serve(Arc::clone(&ctx), addr));

    tokio::select! {
        result = &mut server => {
            // The listener exited on its own, usually a bind failure.
            ctx.shutdown().await;
            result??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
        }
    }

    ctx.shutdown().await;
    match server.await {
        Ok(Err(e)) => error!(error = %e, "HTTP server stopped with error"),
        Err(e) => error!(error = %e, "HTTP server task panicked"),
        Ok(Ok(())) => {}
    }
    for worker in workers {
        let _ = worker.await;
    }

    info!("Backplane shut down");
    Ok(())
}
