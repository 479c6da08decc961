// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP handlers and the response envelope.

pub mod auth;
pub mod edge;
pub mod response;
pub mod runtime;
pub mod system;

pub use edge::Edge;
pub use response::{ApiError, ApiResponse, ApiResult, Envelope, SESSION_HEADER};
