// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for backplane-core.
//!
//! Every domain failure carries a stable wire code (`error_code`), the HTTP
//! status it surfaces as, a client-facing message and optional retry guidance.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::persistence::StoreError;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// One failed input field, returned in the error envelope's `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Input key as the client sent it.
    pub field: String,
    /// Human-readable reason.
    pub message: String,
}

/// Domain errors raised by the runtime pipeline and its services.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Bearer token could not be parsed or has expired.
    #[error("invalid or expired token")]
    InvalidToken,

    /// The workspace requires an authenticated caller.
    #[error("authentication required")]
    Unauthorized,

    /// The caller is authenticated but lacks access.
    #[error("access denied: {0}")]
    Forbidden(String),

    /// Captcha escalation is active and no token was supplied.
    #[error("captcha required")]
    CaptchaRequired,

    /// The supplied captcha token was rejected by the verifier.
    #[error("captcha rejected")]
    CaptchaInvalid,

    /// Captcha is required but no verifier is configured or reachable.
    #[error("captcha verifier unavailable: {0}")]
    CaptchaUnavailable(String),

    /// Generic missing resource.
    #[error("{0} not found")]
    NotFound(String),

    /// No workspace matches the slug or id.
    #[error("workspace not found")]
    WorkspaceNotFound,

    /// The workspace exists but is not serving runtime traffic.
    #[error("workspace is not published")]
    NotPublished,

    /// No domain binding exists for the host.
    #[error("domain '{0}' is not bound")]
    DomainNotFound(String),

    /// The domain binding exists but is not active yet.
    #[error("domain '{0}' is not active")]
    DomainNotActive(String),

    /// The domain binding has been blocked.
    #[error("domain '{0}' is blocked")]
    DomainBlocked(String),

    /// Host header could not be normalized into a domain.
    #[error("invalid domain")]
    InvalidDomain,

    /// Slug is empty or contains illegal characters.
    #[error("invalid workspace slug")]
    InvalidSlug,

    /// The workspace has no current version.
    #[error("workspace has no current version")]
    VersionRequired,

    /// The current version does not exist or belongs to another workspace.
    #[error("workspace version not found")]
    VersionNotFound,

    /// Malformed request body or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// UI schema attached to the version is not usable.
    #[error("invalid ui schema: {0}")]
    InvalidUiSchema(String),

    /// Execute inputs failed validation against the UI schema.
    #[error("invalid inputs: {0:?}")]
    InvalidInputs(Vec<FieldError>),

    /// The current version carries no workflow definition.
    #[error("workspace has no workflow")]
    WorkflowRequired,

    /// A fixed-window rate limit was hit.
    #[error("rate limited ({scope}), retry after {retry_after_secs}s")]
    RateLimited {
        /// Which limit fired (`per_ip`, `per_session`, `per_workspace`).
        scope: String,
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// The client IP matched the workspace blacklist.
    #[error("ip blocked")]
    IpBlocked,

    /// The session was blocked earlier and is permanently refused.
    #[error("session blocked")]
    SessionBlocked,

    /// Usage map is empty or contains non-positive values.
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// Usage map names an unknown billing dimension.
    #[error("unknown billing dimension '{0}'")]
    InvalidDimension(String),

    /// Referenced app does not exist.
    #[error("app not found")]
    AppNotFound,

    /// Referenced app belongs to another workspace.
    #[error("app does not belong to this workspace")]
    AppMismatch,

    /// Quota or spend cap denied the call.
    #[error("quota exceeded: {exceeded:?}")]
    QuotaExceeded {
        /// Dimensions over their limit (may be empty when a spend cap fired).
        exceeded: Vec<String>,
        /// When the current quota period ends.
        reset_at: DateTime<Utc>,
    },

    /// Billing bookkeeping failed.
    #[error("billing failed: {0}")]
    BillingFailed(String),

    /// Load shedding or executor saturation.
    #[error("overloaded")]
    Overloaded,

    /// The workflow to run could not be found.
    #[error("workflow not found")]
    WorkflowNotFound,

    /// The execution could not be started.
    #[error("execute failed: {0}")]
    ExecuteFailed(String),

    /// Uniqueness or state conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation not allowed in the entity's current state.
    #[error("invalid state: expected '{expected}', got '{actual}'")]
    InvalidState {
        /// The state the operation requires.
        expected: String,
        /// The state the entity is in.
        actual: String,
    },

    /// Input validation failed.
    #[error("validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Schema migration precheck found blocking statements.
    #[error("migration blocked by risk signals: {0:?}")]
    BlockedByRisk(Vec<String>),

    /// Another process holds the tenant migration lock.
    #[error("migration lock for workspace is held elsewhere")]
    MigrationLocked,

    /// Tenant database or admin operation failed.
    #[error("tenant database error: {0}")]
    TenantDb(String),

    /// Encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Storage failure that is not a domain condition.
    #[error("storage error: {0}")]
    Storage(String),

    /// Unclassified internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable wire code for the error envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidToken => "INVALID_TOKEN",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden(_) | Self::CaptchaRequired | Self::CaptchaInvalid => "FORBIDDEN",
            Self::CaptchaUnavailable(_) => "CAPTCHA_UNAVAILABLE",
            Self::NotFound(_) | Self::WorkspaceNotFound | Self::NotPublished => "NOT_FOUND",
            Self::DomainNotFound(_) => "DOMAIN_NOT_FOUND",
            Self::DomainNotActive(_) => "DOMAIN_NOT_ACTIVE",
            Self::DomainBlocked(_) => "DOMAIN_BLOCKED",
            Self::InvalidDomain => "INVALID_DOMAIN",
            Self::InvalidSlug => "INVALID_SLUG",
            Self::VersionRequired | Self::VersionNotFound => "VERSION_REQUIRED",
            Self::InvalidRequest(_) | Self::Validation { .. } => "INVALID_REQUEST",
            Self::InvalidUiSchema(_) => "INVALID_UI_SCHEMA",
            Self::InvalidInputs(_) => "INVALID_INPUTS",
            Self::WorkflowRequired => "WORKFLOW_REQUIRED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::IpBlocked => "IP_BLOCKED",
            Self::SessionBlocked => "SESSION_BLOCKED",
            Self::InvalidUsage(_) | Self::InvalidDimension(_) => "INVALID_USAGE",
            Self::AppNotFound => "APP_NOT_FOUND",
            Self::AppMismatch => "APP_MISMATCH",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::BillingFailed(_) => "BILLING_FAILED",
            Self::Overloaded => "OVERLOADED",
            Self::WorkflowNotFound => "WORKFLOW_NOT_FOUND",
            Self::ExecuteFailed(_) => "EXECUTE_FAILED",
            Self::Conflict(_) | Self::InvalidState { .. } | Self::MigrationLocked => "CONFLICT",
            Self::BlockedByRisk(_) => "MIGRATION_BLOCKED",
            Self::TenantDb(_) | Self::Crypto(_) | Self::Storage(_) | Self::Internal(_) => {
                "RUNTIME_FAILED"
            }
        }
    }

    /// HTTP status code the error surfaces as.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidToken | Self::Unauthorized => 401,
            Self::Forbidden(_)
            | Self::CaptchaRequired
            | Self::CaptchaInvalid
            | Self::DomainBlocked(_)
            | Self::IpBlocked
            | Self::SessionBlocked
            | Self::QuotaExceeded { .. }
            | Self::BlockedByRisk(_) => 403,
            Self::NotFound(_)
            | Self::WorkspaceNotFound
            | Self::NotPublished
            | Self::DomainNotFound(_)
            | Self::AppNotFound
            | Self::WorkflowNotFound => 404,
            Self::DomainNotActive(_)
            | Self::Conflict(_)
            | Self::InvalidState { .. }
            | Self::MigrationLocked => 409,
            Self::InvalidDomain
            | Self::InvalidSlug
            | Self::VersionRequired
            | Self::VersionNotFound
            | Self::InvalidRequest(_)
            | Self::Validation { .. }
            | Self::InvalidUiSchema(_)
            | Self::InvalidInputs(_)
            | Self::WorkflowRequired
            | Self::InvalidUsage(_)
            | Self::InvalidDimension(_)
            | Self::AppMismatch => 400,
            Self::RateLimited { .. } => 429,
            Self::Overloaded | Self::CaptchaUnavailable(_) => 503,
            Self::BillingFailed(_)
            | Self::ExecuteFailed(_)
            | Self::TenantDb(_)
            | Self::Crypto(_)
            | Self::Storage(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Client-facing message. Internal details stay in logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidToken => "无效或过期的 Token",
            Self::Unauthorized => "需要登录后访问",
            Self::Forbidden(_) => "无权限访问该 Workspace",
            Self::CaptchaRequired | Self::CaptchaInvalid => "访问被拒绝",
            Self::CaptchaUnavailable(_) => "验证码服务不可用",
            Self::NotFound(_) => "资源不存在",
            Self::WorkspaceNotFound | Self::NotPublished => "Workspace 不存在或未发布",
            Self::DomainNotFound(_) => "域名未绑定",
            Self::DomainNotActive(_) => "域名未生效",
            Self::DomainBlocked(_) => "域名已被封禁",
            Self::InvalidDomain => "域名无效",
            Self::InvalidSlug => "访问入口参数无效",
            Self::VersionRequired | Self::VersionNotFound => "Workspace 版本未就绪",
            Self::InvalidRequest(_) | Self::Validation { .. } => "请求参数无效",
            Self::InvalidUiSchema(_) => "UI Schema 无效",
            Self::InvalidInputs(_) => "输入校验失败",
            Self::WorkflowRequired => "Workspace 未绑定工作流",
            Self::RateLimited { .. } => "访问过于频繁",
            Self::IpBlocked => "访问已被封禁",
            Self::SessionBlocked => "会话已被封禁",
            Self::InvalidUsage(_) | Self::InvalidDimension(_) => "用量数据无效",
            Self::AppNotFound => "应用不存在",
            Self::AppMismatch => "应用与 Workspace 不匹配",
            Self::QuotaExceeded { .. } => "配额已超限",
            Self::BillingFailed(_) => "配额扣减失败",
            Self::Overloaded => "系统繁忙，请稍后重试",
            Self::WorkflowNotFound => "工作流不存在",
            Self::ExecuteFailed(_) => "执行失败",
            Self::Conflict(_) | Self::InvalidState { .. } | Self::MigrationLocked => "资源状态冲突",
            Self::BlockedByRisk(_) => "迁移包含高风险语句",
            Self::TenantDb(_) | Self::Crypto(_) | Self::Storage(_) | Self::Internal(_) => {
                "服务内部错误"
            }
        }
    }

    /// Retry guidance surfaced as `Retry-After` / `retry_after_seconds`.
    ///
    /// `None` means the call should not be retried as-is.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            } => Some(Duration::from_secs((*retry_after_secs).clamp(1, 60))),
            Self::Overloaded => Some(Duration::from_secs(2)),
            Self::BillingFailed(_)
            | Self::ExecuteFailed(_)
            | Self::Storage(_)
            | Self::Internal(_) => Some(Duration::from_secs(5)),
            _ => None,
        }
    }

    /// Shorthand for a field validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => CoreError::NotFound(what),
            StoreError::Conflict(what) => CoreError::Conflict(what),
            StoreError::Transient(msg) | StoreError::Serialization(msg) => {
                CoreError::Storage(msg)
            }
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("json: {err}"))
    }
}
