// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event-type catalog.
//!
//! Every event type the backplane records has a category, a human description
//! and a default severity. Types outside the catalog are still accepted by the
//! recorder (at `info`), but webhook subscriptions may only name catalog types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Event severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    Info,
    /// Degraded but handled.
    Warn,
    /// Operation failed.
    Error,
    /// Needs operator attention.
    Critical,
}

impl Severity {
    /// Stored form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Parses a stored severity; `warning` is accepted for `warn`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grouping used by dashboards and the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum EventCategory {
    Runtime,
    Workspace,
    Execution,
    Database,
    Domain,
    Billing,
    Llm,
    Security,
    Connector,
    Webhook,
    System,
}

impl EventCategory {
    /// Stored form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Runtime => "runtime",
            Self::Workspace => "workspace",
            Self::Execution => "execution",
            Self::Database => "workspace_db",
            Self::Domain => "domain",
            Self::Billing => "billing",
            Self::Llm => "llm",
            Self::Security => "security",
            Self::Connector => "connector",
            Self::Webhook => "webhook",
            Self::System => "system",
        }
    }
}

/// Catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTypeInfo {
    /// Wire name.
    pub event_type: &'static str,
    /// Category.
    pub category: EventCategory,
    /// Human description, used as the notification title for critical events.
    pub description: &'static str,
    /// Severity assigned when the caller does not set one.
    pub severity: Severity,
}

/// Event type names.
#[allow(missing_docs)]
pub mod types {
    pub const RUNTIME_ENTRY: &str = "runtime_entry";
    pub const RUNTIME_SCHEMA: &str = "runtime_schema";
    pub const RUNTIME_EXECUTE: &str = "runtime_execute";
    pub const RUNTIME_EXECUTE_SUCCESS: &str = "runtime_execute_success";
    pub const RUNTIME_EXECUTE_FAILED: &str = "runtime_execute_failed";
    pub const RUNTIME_RATE_LIMITED: &str = "runtime_rate_limited";
    pub const WORKSPACE_ACCESSED: &str = "workspace_accessed";
    pub const ACCESS_BLOCKED: &str = "access_blocked";
    pub const CAPTCHA_REQUIRED: &str = "captcha_required";
    pub const ANOMALY_DETECTED: &str = "anomaly_detected";
    pub const LOAD_SHED: &str = "load_shed";

    pub const WORKSPACE_CREATED: &str = "workspace_created";
    pub const WORKSPACE_UPDATED: &str = "workspace_updated";
    pub const WORKSPACE_DELETED: &str = "workspace_deleted";
    pub const APP_PUBLISHED: &str = "app_published";
    pub const APP_DEPRECATED: &str = "app_deprecated";
    pub const APP_ARCHIVED: &str = "app_archived";

    pub const EXECUTION_STARTED: &str = "execution_started";
    pub const EXECUTION_NODE_STARTED: &str = "execution_node_started";
    pub const EXECUTION_NODE_COMPLETED: &str = "execution_node_completed";
    pub const EXECUTION_NODE_FAILED: &str = "execution_node_failed";
    pub const EXECUTION_NODE_SKIPPED: &str = "execution_node_skipped";
    pub const EXECUTION_COMPLETED: &str = "execution_completed";
    pub const EXECUTION_FAILED: &str = "execution_failed";
    pub const EXECUTION_CANCELLED: &str = "execution_cancelled";

    pub const DB_PROVISIONED: &str = "db_provisioned";
    pub const DB_PROVISION_FAILED: &str = "db_provision_failed";
    pub const DB_SECRET_ROTATED: &str = "db_secret_rotated";
    pub const DB_MIGRATION_SUBMITTED: &str = "db_migration_submitted";
    pub const DB_MIGRATION_APPROVED: &str = "db_migration_approved";
    pub const DB_MIGRATION_REJECTED: &str = "db_migration_rejected";
    pub const DB_MIGRATION_COMPLETED: &str = "db_migration_completed";
    pub const DB_MIGRATION_FAILED: &str = "db_migration_failed";
    pub const DB_ROLE_CREATED: &str = "db_role_created";
    pub const DB_ROLE_REVOKED: &str = "db_role_revoked";

    pub const DOMAIN_BOUND: &str = "domain_bound";
    pub const DOMAIN_VERIFIED: &str = "domain_verified";
    pub const DOMAIN_VERIFY_FAILED: &str = "domain_verify_failed";
    pub const CERT_ISSUED: &str = "cert_issued";
    pub const CERT_ISSUE_FAILED: &str = "cert_issue_failed";

    pub const USAGE_RECORDED: &str = "usage_recorded";
    pub const QUOTA_EXCEEDED: &str = "quota_exceeded";
    pub const BUDGET_THRESHOLD_REACHED: &str = "budget_threshold_reached";
    pub const SPEND_LIMIT_EXCEEDED: &str = "spend_limit_exceeded";
    pub const INVOICE_PAID: &str = "invoice_paid";

    pub const LLM_REQUEST: &str = "llm_request";
    pub const LLM_ERROR: &str = "llm_error";

    pub const SECURITY_AUTH_FAILED: &str = "security_auth_failed";
    pub const APP_USER_REGISTERED: &str = "app_user_registered";
    pub const APP_USER_LOGIN: &str = "app_user_login";
    pub const APP_USER_LOGOUT: &str = "app_user_logout";
    pub const SECRET_ROTATED: &str = "secret_rotated";
    pub const SECRET_REVOKED: &str = "secret_revoked";

    pub const CONNECTOR_CREDENTIAL_EXPIRING: &str = "connector_credential_expiring";
    pub const CONNECTOR_CREDENTIAL_EXPIRED: &str = "connector_credential_expired";

    pub const WEBHOOK_DELIVERY_FAILED: &str = "webhook_delivery_failed";

    pub const SYSTEM_STARTUP: &str = "system_startup";
    pub const SYSTEM_ERROR: &str = "system_error";
}

/// Types that page an operator.
pub const CRITICAL_TYPES: &[&str] = &[
    types::EXECUTION_FAILED,
    types::DB_PROVISION_FAILED,
    types::DB_MIGRATION_FAILED,
    types::DOMAIN_VERIFY_FAILED,
    types::CERT_ISSUE_FAILED,
    types::QUOTA_EXCEEDED,
    types::SECURITY_AUTH_FAILED,
    types::SYSTEM_ERROR,
    types::CONNECTOR_CREDENTIAL_EXPIRED,
];

macro_rules! entry {
    ($ty:expr, $cat:ident, $sev:ident, $desc:expr) => {
        EventTypeInfo {
            event_type: $ty,
            category: EventCategory::$cat,
            description: $desc,
            severity: Severity::$sev,
        }
    };
}

static CATALOG: &[EventTypeInfo] = &[
    entry!(types::RUNTIME_ENTRY, Runtime, Info, "Runtime entry requested"),
    entry!(types::RUNTIME_SCHEMA, Runtime, Info, "Runtime schema requested"),
    entry!(types::RUNTIME_EXECUTE, Runtime, Info, "Runtime execute requested"),
    entry!(types::RUNTIME_EXECUTE_SUCCESS, Runtime, Info, "Runtime execute accepted"),
    entry!(types::RUNTIME_EXECUTE_FAILED, Runtime, Warn, "Runtime execute failed"),
    entry!(types::RUNTIME_RATE_LIMITED, Runtime, Warn, "Runtime request rate limited"),
    entry!(types::WORKSPACE_ACCESSED, Runtime, Info, "Workspace accessed"),
    entry!(types::ACCESS_BLOCKED, Security, Warn, "Access blocked by list policy"),
    entry!(types::CAPTCHA_REQUIRED, Security, Warn, "Captcha challenge required"),
    entry!(types::ANOMALY_DETECTED, Security, Warn, "Traffic anomaly detected"),
    entry!(types::LOAD_SHED, Runtime, Warn, "Request shed under load"),
    entry!(types::WORKSPACE_CREATED, Workspace, Info, "Workspace created"),
    entry!(types::WORKSPACE_UPDATED, Workspace, Info, "Workspace updated"),
    entry!(types::WORKSPACE_DELETED, Workspace, Warn, "Workspace deleted"),
    entry!(types::APP_PUBLISHED, Workspace, Info, "App published"),
    entry!(types::APP_DEPRECATED, Workspace, Info, "App deprecated"),
    entry!(types::APP_ARCHIVED, Workspace, Info, "App archived"),
    entry!(types::EXECUTION_STARTED, Execution, Info, "Execution started"),
    entry!(types::EXECUTION_NODE_STARTED, Execution, Debug, "Execution node started"),
    entry!(types::EXECUTION_NODE_COMPLETED, Execution, Debug, "Execution node completed"),
    entry!(types::EXECUTION_NODE_FAILED, Execution, Error, "Execution node failed"),
    entry!(types::EXECUTION_NODE_SKIPPED, Execution, Debug, "Execution node skipped"),
    entry!(types::EXECUTION_COMPLETED, Execution, Info, "Execution completed"),
    entry!(types::EXECUTION_FAILED, Execution, Critical, "Workflow execution failed"),
    entry!(types::EXECUTION_CANCELLED, Execution, Warn, "Execution cancelled"),
    entry!(types::DB_PROVISIONED, Database, Info, "Workspace database provisioned"),
    entry!(types::DB_PROVISION_FAILED, Database, Critical, "Workspace database provisioning failed"),
    entry!(types::DB_SECRET_ROTATED, Database, Info, "Workspace database secret rotated"),
    entry!(types::DB_MIGRATION_SUBMITTED, Database, Info, "Schema migration submitted"),
    entry!(types::DB_MIGRATION_APPROVED, Database, Info, "Schema migration approved"),
    entry!(types::DB_MIGRATION_REJECTED, Database, Info, "Schema migration rejected"),
    entry!(types::DB_MIGRATION_COMPLETED, Database, Info, "Schema migration completed"),
    entry!(types::DB_MIGRATION_FAILED, Database, Critical, "Schema migration failed"),
    entry!(types::DB_ROLE_CREATED, Database, Info, "Database role created"),
    entry!(types::DB_ROLE_REVOKED, Database, Info, "Database role revoked"),
    entry!(types::DOMAIN_BOUND, Domain, Info, "Domain bound"),
    entry!(types::DOMAIN_VERIFIED, Domain, Info, "Domain verified"),
    entry!(types::DOMAIN_VERIFY_FAILED, Domain, Critical, "Domain verification failed"),
    entry!(types::CERT_ISSUED, Domain, Info, "Certificate issued"),
    entry!(types::CERT_ISSUE_FAILED, Domain, Critical, "Certificate issuance failed"),
    entry!(types::USAGE_RECORDED, Billing, Debug, "Usage recorded"),
    entry!(types::QUOTA_EXCEEDED, Billing, Critical, "Quota exceeded"),
    entry!(types::BUDGET_THRESHOLD_REACHED, Billing, Warn, "Budget threshold reached"),
    entry!(types::SPEND_LIMIT_EXCEEDED, Billing, Error, "Spend limit exceeded"),
    entry!(types::INVOICE_PAID, Billing, Info, "Invoice paid"),
    entry!(types::LLM_REQUEST, Llm, Info, "LLM request"),
    entry!(types::LLM_ERROR, Llm, Error, "LLM request failed"),
    entry!(types::SECURITY_AUTH_FAILED, Security, Critical, "Authentication failed"),
    entry!(types::APP_USER_REGISTERED, Security, Info, "App user registered"),
    entry!(types::APP_USER_LOGIN, Security, Info, "App user logged in"),
    entry!(types::APP_USER_LOGOUT, Security, Info, "App user logged out"),
    entry!(types::SECRET_ROTATED, Security, Info, "Secret rotated"),
    entry!(types::SECRET_REVOKED, Security, Info, "Secret revoked"),
    entry!(types::CONNECTOR_CREDENTIAL_EXPIRING, Connector, Warn, "Connector credential expiring"),
    entry!(types::CONNECTOR_CREDENTIAL_EXPIRED, Connector, Critical, "Connector credential expired"),
    entry!(types::WEBHOOK_DELIVERY_FAILED, Webhook, Warn, "Webhook delivery failed"),
    entry!(types::SYSTEM_STARTUP, System, Info, "System started"),
    entry!(types::SYSTEM_ERROR, System, Critical, "System error"),
];

/// Every catalog entry.
pub fn all() -> &'static [EventTypeInfo] {
    CATALOG
}

/// Catalog entry for `event_type`.
pub fn lookup(event_type: &str) -> Option<&'static EventTypeInfo> {
    CATALOG.iter().find(|info| info.event_type == event_type)
}

/// Severity used when the caller does not choose one.
pub fn default_severity(event_type: &str) -> Severity {
    lookup(event_type).map_or(Severity::Info, |info| info.severity)
}

/// Whether the type is dispatched to operators.
pub fn is_critical(event_type: &str) -> bool {
    CRITICAL_TYPES.contains(&event_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_names_are_unique() {
        let mut names: Vec<_> = all().iter().map(|i| i.event_type).collect();
        let before = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), before);
    }

    #[test]
    fn test_critical_types_default_to_critical() {
        for ty in CRITICAL_TYPES {
            let info = lookup(ty).unwrap_or_else(|| panic!("{ty} missing from catalog"));
            assert_eq!(info.severity, Severity::Critical, "{ty}");
        }
        assert!(is_critical("db_migration_failed"));
        assert!(!is_critical("runtime_entry"));
    }

    #[test]
    fn test_default_severity() {
        assert_eq!(default_severity("runtime_rate_limited"), Severity::Warn);
        assert_eq!(default_severity("something_new"), Severity::Info);
        assert_eq!(
            lookup("db_migration_failed").map(|i| i.category.as_str()),
            Some("workspace_db")
        );
    }

    #[test]
    fn test_severity_order_and_parse() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Info < Severity::Warn);
        assert_eq!(Severity::parse("WARNING"), Some(Severity::Warn));
        assert_eq!(Severity::parse("loud"), None);
    }
}
