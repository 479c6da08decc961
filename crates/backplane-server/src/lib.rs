// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backplane Server - HTTP Runtime Surface
//!
//! Serves published workspace apps over axum, either by slug or by bound
//! host:
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | GET  | `/runtime/{slug}/entry`, `/runtime/entry` | descriptor, access mode, session |
//! | GET  | `/runtime/{slug}/schema`, `/runtime/schema` | workflow, UI and DB schema |
//! | POST | `/runtime/{slug}/execute`, `/runtime/execute` | start a workflow run |
//! | POST | `/runtime/{slug}/auth/{register,login,logout}` | app users |
//! | GET  | `/health` | liveness |
//!
//! Every runtime response uses the envelope in [`api::response`]. Sessions
//! travel in `X-App-Session-Id`; retryable failures set `Retry-After`.

pub mod api;
pub mod app;

pub use app::{AppState, build_router, serve};
