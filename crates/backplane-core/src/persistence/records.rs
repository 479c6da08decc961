// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Row types shared by every persistence backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Workspace
// ============================================================================

/// Workspace record. A workspace is the published app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkspaceRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Globally unique human-readable slug.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Optional description shown on the runtime entry.
    pub description: Option<String>,
    /// Owning platform user.
    pub owner_user_id: Uuid,
    /// Lifecycle (draft, published, deprecated, archived).
    pub app_status: String,
    /// Access mode (private, public_auth, public_anonymous).
    pub access_mode: String,
    /// Data classification (public, internal, confidential, restricted).
    pub data_classification: String,
    /// Nested anti-abuse settings blob.
    pub rate_limit: Value,
    /// Always require captcha for anonymous callers.
    pub require_captcha: bool,
    /// CORS origins allowed to call the runtime.
    pub allowed_origins: Vec<String>,
    /// Version served at runtime.
    pub current_version_id: Option<Uuid>,
    /// Billing plan code.
    pub plan_code: String,
    /// Free-form settings map (budget, invoice settings, ...).
    pub settings: Value,
    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
    /// When a soft-deleted workspace may be purged.
    pub purge_after: Option<DateTime<Utc>>,
    /// When the workspace was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Previous slug that still points at a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SlugAliasRecord {
    /// The retired or alternate slug.
    pub slug: String,
    /// Workspace the alias resolves to.
    pub workspace_id: Uuid,
    /// active or retired.
    pub status: String,
    /// When the alias was created.
    pub created_at: DateTime<Utc>,
}

/// Immutable workspace snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct VersionRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning workspace.
    pub workspace_id: Uuid,
    /// Semantic version label.
    pub version: String,
    /// Workflow definition run by execute.
    pub workflow_definition: Option<Value>,
    /// UI schema describing the execute form.
    pub ui_schema: Option<Value>,
    /// Tenant database schema description.
    pub db_schema: Option<Value>,
    /// Version configuration.
    pub config: Value,
    /// Changelog text.
    pub changelog: Option<String>,
    /// User who created the version.
    pub created_by: Uuid,
    /// When the version was created.
    pub created_at: DateTime<Utc>,
}

/// Custom hostname bound to a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DomainRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning workspace.
    pub workspace_id: Uuid,
    /// Normalized hostname.
    pub domain: String,
    /// pending, active or blocked.
    pub status: String,
    /// Certificate state.
    pub ssl_status: String,
    /// Verification attempts made so far.
    pub verification_attempts: i32,
    /// Last verification attempt.
    pub last_verified_at: Option<DateTime<Utc>>,
    /// When the binding was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Workspace role carrying a permission set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoleRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning workspace.
    pub workspace_id: Uuid,
    /// Role name.
    pub name: String,
    /// Granted permissions (workspace_admin, logs_view, ...).
    pub permissions: Vec<String>,
    /// When the role was created.
    pub created_at: DateTime<Utc>,
}

/// Membership linking a user to a workspace role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MemberRecord {
    /// Workspace.
    pub workspace_id: Uuid,
    /// Member user.
    pub user_id: Uuid,
    /// Assigned role.
    pub role_id: Uuid,
    /// When the member joined.
    pub created_at: DateTime<Utc>,
}

/// Platform user, used for critical-event recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Contact email.
    pub email: Option<String>,
    /// Contact phone (E.164).
    pub phone: Option<String>,
    /// Display name.
    pub display_name: String,
    /// When the user was created.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Sessions & Events
// ============================================================================

/// Ephemeral runtime identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRecord {
    /// Unique identifier, returned to the client.
    pub id: Uuid,
    /// Workspace the session belongs to.
    pub workspace_id: Uuid,
    /// anon or auth.
    pub session_type: String,
    /// App user for auth sessions; always `None` for anon.
    pub user_id: Option<Uuid>,
    /// sha256 of the client IP.
    pub ip_hash: Option<String>,
    /// sha256 of the user agent.
    pub user_agent_hash: Option<String>,
    /// sha256 of the opaque token (auth only).
    pub token_hash: Option<String>,
    /// Expiry.
    pub expired_at: DateTime<Utc>,
    /// When the session was blocked.
    pub blocked_at: Option<DateTime<Utc>>,
    /// Why the session was blocked.
    pub blocked_reason: Option<String>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Append-only runtime event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Strictly increasing sequence number.
    pub sequence_num: i64,
    /// Event type (see the event catalog).
    pub event_type: String,
    /// debug, info, warn, error or critical.
    pub severity: String,
    /// Workspace correlator.
    pub workspace_id: Option<Uuid>,
    /// Execution correlator.
    pub execution_id: Option<Uuid>,
    /// User correlator.
    pub user_id: Option<Uuid>,
    /// Session correlator.
    pub session_id: Option<Uuid>,
    /// Hashed client IP, indexed for per-IP windows.
    pub ip_hash: Option<String>,
    /// Distributed trace id.
    pub trace_id: Option<String>,
    /// Request id.
    pub request_id: Option<String>,
    /// Workflow node id.
    pub node_id: Option<String>,
    /// Workflow node type.
    pub node_type: Option<String>,
    /// HTTP method.
    pub http_method: Option<String>,
    /// HTTP path.
    pub http_path: Option<String>,
    /// HTTP status.
    pub http_status: Option<i32>,
    /// Duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// Machine-readable error code.
    pub error_code: Option<String>,
    /// Error message.
    pub error_message: Option<String>,
    /// Human-readable summary.
    pub message: Option<String>,
    /// Sanitized free-form metadata.
    pub metadata: Value,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

/// Audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Workspace the action applies to.
    pub workspace_id: Option<Uuid>,
    /// Acting user, if any.
    pub actor_id: Option<Uuid>,
    /// Dotted action name (`workspace.db.role.created`).
    pub action: String,
    /// Resource type.
    pub resource_type: String,
    /// Resource identifier.
    pub resource_id: Option<String>,
    /// Extra context.
    pub metadata: Value,
    /// When the action happened.
    pub created_at: DateTime<Utc>,
}

/// In-app notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Recipient.
    pub user_id: Uuid,
    /// Workspace correlator.
    pub workspace_id: Option<Uuid>,
    /// Source event type.
    pub event_type: String,
    /// Source event severity.
    pub severity: String,
    /// Title line.
    pub title: String,
    /// Body text.
    pub body: String,
    /// When the notification was created.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Billing
// ============================================================================

/// Billing plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlanRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Unique plan code (free, pro, enterprise).
    pub code: String,
    /// Display name.
    pub name: String,
    /// Monthly price.
    pub price_monthly: f64,
    /// Yearly price (per month).
    pub price_yearly: f64,
    /// ISO currency.
    pub currency: String,
    /// Dimension to limit; `-1` is unlimited.
    pub quota_limits: Value,
    /// Dimension to unit price.
    pub rate_rules: Value,
    /// Policy map (`overage_policy`).
    pub policy: Value,
    /// active or inactive.
    pub status: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Per-period quota state of a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct QuotaRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Plan snapshot source.
    pub plan_id: Uuid,
    /// Period start, inclusive (first of a UTC month).
    pub period_start: DateTime<Utc>,
    /// Period end, exclusive.
    pub period_end: DateTime<Utc>,
    /// Limits snapshot.
    pub limits: Value,
    /// Accumulated usage.
    pub usage: Value,
    /// active or exceeded.
    pub status: String,
    /// When the quota was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Immutable usage ingestion record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageEventRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Quota the usage was merged into.
    pub quota_id: Option<Uuid>,
    /// Normalized usage map.
    pub usage: Value,
    /// Cost of this delta.
    pub cost: f64,
    /// ISO currency.
    pub currency: String,
    /// Whether the call was allowed.
    pub allowed: bool,
    /// When the usage was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Payment state synchronized against an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvoicePaymentRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Invoice number (`INV-YYYYMM-XXXXXX`).
    pub invoice_number: String,
    /// Billing period start.
    pub period_start: DateTime<Utc>,
    /// Billing period end.
    pub period_end: DateTime<Utc>,
    /// pending, paid, failed or refunded.
    pub status: String,
    /// Amount paid.
    pub amount: f64,
    /// ISO currency.
    pub currency: String,
    /// Payment provider.
    pub provider: Option<String>,
    /// Provider reference.
    pub reference: Option<String>,
    /// When payment cleared.
    pub paid_at: Option<DateTime<Utc>>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Secrets & App Users
// ============================================================================

/// Encrypted credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SecretRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// user or workspace.
    pub owner_type: String,
    /// Owner id.
    pub owner_id: Uuid,
    /// oauth_token, api_token, api_key, ...
    pub secret_type: String,
    /// Display name.
    pub name: String,
    /// Encryptor output.
    pub encrypted_value: String,
    /// First and last characters of the plaintext.
    pub preview: String,
    /// active or revoked.
    pub status: String,
    /// Expiry, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Last rotation.
    pub last_rotated_at: Option<DateTime<Utc>>,
    /// Last use.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Extra fields (connector health, provider).
    pub metadata: Value,
    /// When the secret was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Authenticated user of a published app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AppUserRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Workspace the user registered with.
    pub workspace_id: Uuid,
    /// Normalized email, unique per workspace.
    pub email: String,
    /// bcrypt hash.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Display name.
    pub display_name: Option<String>,
    /// App-level role.
    pub role: String,
    /// active or blocked.
    pub status: String,
    /// Last successful login.
    pub last_login_at: Option<DateTime<Utc>>,
    /// When the user registered.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Tenant Databases
// ============================================================================

/// Provisioned tenant database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkspaceDatabaseRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Database name (`ws_<hex>`).
    pub db_name: String,
    /// Admin user (`wsu_<hex>`).
    pub db_user: String,
    /// Host.
    pub db_host: Option<String>,
    /// Port.
    pub db_port: Option<i32>,
    /// `enc:<ciphertext>` reference to the admin password.
    pub secret_ref: Option<String>,
    /// pending, provisioning, ready, blocked or error.
    pub status: String,
    /// Last provisioning error.
    pub error_message: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Scoped principal in a tenant database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DbRoleRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// read, write or admin.
    pub role_type: String,
    /// Database user (`wsr_<8hex>_<r|w|a>`).
    pub db_user: String,
    /// `enc:<ciphertext>` reference to the password.
    pub secret_ref: String,
    /// active, revoked or expired.
    pub status: String,
    /// Expiry, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Last password rotation.
    pub last_rotated_at: Option<DateTime<Utc>>,
    /// When the role was revoked or expired.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Why the role was revoked.
    pub revoked_reason: Option<String>,
    /// When the role was created.
    pub created_at: DateTime<Utc>,
}

/// Governed schema migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SchemaMigrationRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Submitting user.
    pub submitter_id: Uuid,
    /// FSM state.
    pub status: String,
    /// Applied version when the plan was built.
    pub from_version: Option<String>,
    /// Highest pending version.
    pub target_version: Option<String>,
    /// Versions to apply, ascending.
    pub pending_versions: Vec<String>,
    /// Serialized plan.
    pub plan: Value,
    /// Serialized precheck.
    pub precheck: Value,
    /// Outcome details.
    pub result: Value,
    /// Optional single read-only statement run after apply.
    pub verify_sql: Option<String>,
    /// Backup database captured before apply.
    pub backup_id: Option<String>,
    /// Review queue entry.
    pub review_queue_id: Option<Uuid>,
    /// Reviewer note or rejection reason.
    pub review_note: Option<String>,
    /// Approving reviewer.
    pub approved_by: Option<Uuid>,
    /// When the review decision was made.
    pub approved_at: Option<DateTime<Utc>>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished (any terminal state).
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure message.
    pub error_message: Option<String>,
    /// When the migration was submitted.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Review queue entry for governed changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReviewItemRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Kind of item (`db_schema`).
    pub item_type: String,
    /// Reviewed entity.
    pub item_id: Uuid,
    /// Submitting user.
    pub submitter_id: Uuid,
    /// pending, approved or rejected.
    pub status: String,
    /// Title line.
    pub title: String,
    /// Submission note.
    pub submission_note: Option<String>,
    /// Snapshot of the reviewed entity.
    pub snapshot: Value,
    /// Deciding reviewer.
    pub reviewer_id: Option<Uuid>,
    /// Decision note.
    pub review_note: Option<String>,
    /// When the item was submitted.
    pub created_at: DateTime<Utc>,
    /// When the decision was made.
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Reviewer with decision counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReviewerRecord {
    /// Reviewer's user id.
    pub user_id: Uuid,
    /// Whether the reviewer may decide.
    pub active: bool,
    /// Decisions made.
    pub total_reviews: i32,
    /// Approvals.
    pub approved_count: i32,
    /// Rejections.
    pub rejected_count: i32,
}

// ============================================================================
// Webhooks
// ============================================================================

/// Webhook subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEndpointRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Target URL.
    pub url: String,
    /// Subscribed event types, lowercase.
    pub events: Vec<String>,
    /// Whether deliveries are signed.
    pub signing_enabled: bool,
    /// Encrypted signing secret.
    #[serde(skip_serializing)]
    pub secret_encrypted: Option<String>,
    /// Whether the endpoint receives deliveries.
    pub active: bool,
    /// Last delivery attempt.
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// When the endpoint was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Delivery ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookDeliveryRecord {
    /// Unique identifier, sent as `X-Webhook-Delivery`.
    pub id: Uuid,
    /// Endpoint.
    pub endpoint_id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Event type.
    pub event_type: String,
    /// Payload snapshot.
    pub payload: Value,
    /// pending, retrying, success or failed.
    pub status: String,
    /// Attempts made.
    pub attempt_count: i32,
    /// Attempt budget.
    pub max_attempts: i32,
    /// Next scheduled attempt when retrying.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last HTTP status.
    pub last_status_code: Option<i32>,
    /// Last response body (at most 4 KiB).
    pub response_body: Option<String>,
    /// Last transport error.
    pub last_error: Option<String>,
    /// When the delivery succeeded.
    pub delivered_at: Option<DateTime<Utc>>,
    /// When the delivery was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Executions
// ============================================================================

/// Workflow execution row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExecutionRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Version whose workflow ran.
    pub version_id: Option<Uuid>,
    /// pending, running, completed, failed or cancelled.
    pub status: String,
    /// Trigger (`app_runtime`, `manual`, `retry`, ...).
    pub trigger_type: String,
    /// Trigger context.
    pub trigger_data: Value,
    /// Inputs.
    pub inputs: Value,
    /// Outputs.
    pub outputs: Option<Value>,
    /// Error message for failed executions.
    pub error_message: Option<String>,
    /// Duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// Aggregated `{prompt_tokens, completion_tokens}`.
    pub token_usage: Value,
    /// Runtime session.
    pub session_id: Option<Uuid>,
    /// Calling user.
    pub user_id: Option<Uuid>,
    /// Execution this one retries.
    pub retry_of: Option<Uuid>,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
    /// When the execution finished.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-node log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeLogRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Execution.
    pub execution_id: Uuid,
    /// Node id.
    pub node_id: String,
    /// The node's own type.
    pub node_type: String,
    /// completed, failed, skipped or cancelled.
    pub status: String,
    /// Node inputs.
    pub inputs: Value,
    /// Node outputs.
    pub outputs: Value,
    /// Error message.
    pub error: Option<String>,
    /// Attempts made.
    pub attempts: i32,
    /// When the node started.
    pub started_at: DateTime<Utc>,
    /// When the node finished.
    pub finished_at: DateTime<Utc>,
    /// Duration in milliseconds.
    pub duration_ms: i64,
}
