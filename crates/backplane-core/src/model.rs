// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed views over the string-valued enums stored on workspace rows, plus the
//! per-request caller and metadata carried through the runtime pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::sha256_hex;
use crate::error::CoreError;

/// Who may reach a workspace's runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Anyone, no login.
    PublicAnonymous,
    /// Any authenticated user.
    PublicAuth,
    /// The owner only.
    Private,
}

impl AccessMode {
    /// Stored form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PublicAnonymous => "public_anonymous",
            Self::PublicAuth => "public_auth",
            Self::Private => "private",
        }
    }
}

impl FromStr for AccessMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "public_anonymous" => Ok(Self::PublicAnonymous),
            "public_auth" => Ok(Self::PublicAuth),
            "private" => Ok(Self::Private),
            other => Err(CoreError::validation(
                "access_mode",
                format!("unknown access mode '{other}'"),
            )),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sensitivity of the data a workspace handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClassification {
    /// No extra requirement.
    Public,
    /// Authenticated members only.
    Internal,
    /// Members holding `workspace_admin`.
    Confidential,
    /// The owner only.
    Restricted,
}

impl DataClassification {
    /// Stored form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
        }
    }
}

impl FromStr for DataClassification {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "public" => Ok(Self::Public),
            "internal" => Ok(Self::Internal),
            "confidential" => Ok(Self::Confidential),
            "restricted" => Ok(Self::Restricted),
            other => Err(CoreError::validation(
                "data_classification",
                format!("unknown data classification '{other}'"),
            )),
        }
    }
}

impl fmt::Display for DataClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks that an access mode and a classification may be combined.
///
/// `restricted` needs `private`, and anything other than `public` rules out
/// `public_anonymous`.
pub fn validate_access_policy(
    mode: AccessMode,
    classification: DataClassification,
) -> Result<(), CoreError> {
    if classification == DataClassification::Restricted && mode != AccessMode::Private {
        return Err(CoreError::validation(
            "access_mode",
            "restricted data requires private access",
        ));
    }
    if classification != DataClassification::Public && mode == AccessMode::PublicAnonymous {
        return Err(CoreError::validation(
            "access_mode",
            "non-public data cannot be served anonymously",
        ));
    }
    Ok(())
}

/// Workspace lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    /// Not yet published.
    Draft,
    /// Serving runtime traffic.
    Published,
    /// Legacy alias of `Published`.
    Active,
    /// Superseded; runtime closed.
    Deprecated,
    /// Frozen; runtime closed.
    Archived,
}

impl AppStatus {
    /// Parses a stored status, treating unknown values as `Draft`.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "published" => Self::Published,
            "active" => Self::Active,
            "deprecated" => Self::Deprecated,
            "archived" => Self::Archived,
            _ => Self::Draft,
        }
    }

    /// Whether runtime traffic is served.
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Published | Self::Active)
    }
}

/// Session kinds.
pub mod session_type {
    /// Server-issued anonymous identity.
    pub const ANON: &str = "anon";
    /// Logged-in app user.
    pub const AUTH: &str = "auth";
}

/// Workspace permissions granted through roles.
#[allow(missing_docs)]
pub mod permission {
    pub const WORKSPACE_ADMIN: &str = "workspace_admin";
    pub const WORKSPACE_DB_ACCESS: &str = "workspace_db_access";
    pub const APP_VIEW_METRICS: &str = "app_view_metrics";
    pub const LOGS_VIEW: &str = "logs_view";
    pub const BILLING_MANAGE: &str = "billing_manage";
    pub const CONNECTORS_MANAGE: &str = "connectors_manage";
}

/// The authenticated principal behind a request, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caller {
    /// Platform or app user id.
    pub user_id: Option<Uuid>,
}

impl Caller {
    /// No credentials presented.
    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    /// Authenticated as `user_id`.
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
        }
    }

    /// Whether credentials were presented and resolved.
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Per-request metadata extracted at the HTTP edge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// Client IP after proxy header resolution.
    pub ip: Option<String>,
    /// Raw user agent.
    pub user_agent: Option<String>,
    /// Session id the client presented.
    pub session_id: Option<Uuid>,
    /// Captcha token the client presented.
    pub captcha_token: Option<String>,
    /// Correlates events of one logical operation.
    pub trace_id: Option<String>,
    /// Unique per HTTP request.
    pub request_id: Option<String>,
    /// HTTP method.
    pub method: Option<String>,
    /// HTTP path.
    pub path: Option<String>,
}

impl RequestMeta {
    /// `sha256(ip)` as hex.
    pub fn ip_hash(&self) -> Option<String> {
        self.ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .map(sha256_hex)
    }

    /// `sha256(user_agent)` as hex.
    pub fn user_agent_hash(&self) -> Option<String> {
        self.user_agent
            .as_deref()
            .filter(|ua| !ua.is_empty())
            .map(sha256_hex)
    }
}

/// Picks the client IP: `CF-Connecting-IP`, then the first `X-Forwarded-For`
/// entry, then the peer address.
pub fn resolve_client_ip(
    cf_connecting_ip: Option<&str>,
    forwarded_for: Option<&str>,
    peer: Option<&str>,
) -> Option<String> {
    let cf = cf_connecting_ip.map(str::trim).filter(|s| !s.is_empty());
    if let Some(ip) = cf {
        return Some(ip.to_string());
    }
    let forwarded = forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }
    peer.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
