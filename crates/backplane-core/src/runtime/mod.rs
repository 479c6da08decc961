// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The public runtime pipeline: resolve a workspace by slug or host,
//! authorize the caller, run anti-abuse checks and serve entry, schema and
//! execute.

pub mod abuse;
pub mod access;
pub mod captcha;
pub mod resolver;
pub mod service;
pub mod ui_schema;

pub use abuse::{AbuseCheck, AbuseGuard, AccessDecision, RateLimitSettings, RequestKind};
pub use access::{authorize, ensure_anonymous_session, presented_session};
pub use captcha::{CaptchaVerifier, HttpCaptchaVerifier};
pub use resolver::{Resolver, normalize_host, normalize_slug};
pub use service::{
    EntryResponse, ExecuteRequest, ExecuteResponse, RuntimeAddress, RuntimeEntry, RuntimeSchema,
    RuntimeService, TrackedAccess, WorkspaceDescriptor,
};
pub use ui_schema::UiSchema;
