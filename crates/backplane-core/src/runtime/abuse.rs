// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Anti-abuse engine.
//!
//! Counters are not kept in memory: every window is an authoritative count
//! over the event log, so the verdicts are only as fresh as the recorder.
//!
//! Per request the checks run in a fixed order:
//!
//! ```text
//! blacklist ──► graylist (tighten limits) ──► fixed windows ──► anomalies ──► captcha
//!    │                                             │                │
//!    └─ IpBlocked                                  └─ RateLimited   └─ Overloaded (execute only)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::events::{EventRecorder, RuntimeEvent, types};
use crate::model::RequestMeta;
use crate::persistence::{EventCountFilter, Persistence, SessionRecord, WorkspaceRecord};

/// The only supported window algorithm.
pub const FIXED_WINDOW: &str = "fixed_window";

/// Event types that count as one runtime request.
pub const REQUEST_EVENT_TYPES: &[&str] = &[
    types::RUNTIME_ENTRY,
    types::RUNTIME_SCHEMA,
    types::RUNTIME_EXECUTE,
];

/// Event types that close an execute request.
pub const EXECUTE_OUTCOME_EVENT_TYPES: &[&str] =
    &[types::RUNTIME_EXECUTE_SUCCESS, types::RUNTIME_EXECUTE_FAILED];

const DEFAULT_MAX_REQUESTS: u32 = 120;
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const HIGH_FREQ_RATIO: f64 = 0.8;
const FAILURE_RATE_THRESHOLD: f64 = 0.5;
const FAILURE_RATE_MIN_REQUESTS: u32 = 5;
const FAILURE_RATE_WINDOW: Duration = Duration::from_secs(300);
const SPIKE_RATIO: f64 = 3.0;
const SPIKE_MIN_PREVIOUS: u32 = 5;
const SPIKE_WINDOW: Duration = Duration::from_secs(60);

/// Risk signal names.
pub mod signal {
    /// Request count in the short window is above the high-frequency bar.
    pub const HIGH_FREQUENCY: &str = "high_frequency";
    /// Too many executes failed recently.
    pub const FAILURE_RATE: &str = "failure_rate";
    /// Traffic jumped against the previous window.
    pub const RATE_SPIKE: &str = "rate_spike";
    /// The client IP is graylisted.
    pub const GRAYLIST: &str = "graylist";
}

/// Which runtime endpoint a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// `GET …/entry`
    Entry,
    /// `GET …/schema`
    Schema,
    /// `POST …/execute`
    Execute,
}

impl RequestKind {
    /// Short name used in event metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Schema => "schema",
            Self::Execute => "execute",
        }
    }

    /// The request event recorded once the request passes.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Entry => types::RUNTIME_ENTRY,
            Self::Schema => types::RUNTIME_SCHEMA,
            Self::Execute => types::RUNTIME_EXECUTE,
        }
    }
}

/// Fixed-window limit. Disabled unless both fields are positive.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RateLimitRule {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimitRule {
    /// Creates a rule.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// Whether the rule is enforced.
    pub fn enabled(&self) -> bool {
        self.max_requests > 0 && !self.window.is_zero()
    }

    fn parse(raw: &Value, fallback: Self) -> Self {
        let mut rule = fallback;
        if let Some(max) = raw.get("max_requests").and_then(to_u32) {
            rule.max_requests = max;
        }
        if let Some(window) = raw.get("window_seconds").and_then(to_secs) {
            rule.window = window;
        }
        rule
    }
}

/// Limits applied to graylisted clients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrayPolicy {
    /// Explicit cap; 0 halves each base limit instead.
    pub max_requests: u32,
    /// Window override.
    pub window: Option<Duration>,
    /// Escalate graylisted clients to captcha.
    pub require_captcha: bool,
}

impl Default for GrayPolicy {
    fn default() -> Self {
        Self {
            max_requests: 0,
            window: None,
            require_captcha: true,
        }
    }
}

impl GrayPolicy {
    fn parse(raw: &Value, fallback: Self) -> Self {
        let mut policy = fallback;
        if raw.is_object() {
            if let Some(max) = raw.get("max_requests").and_then(to_u32) {
                policy.max_requests = max;
            }
            if let Some(window) = raw.get("window_seconds").and_then(to_secs) {
                policy.window = Some(window);
            }
            if let Some(require) = raw.get("require_captcha").and_then(to_bool) {
                policy.require_captcha = require;
            }
        }
        policy
    }

    /// Tightens a base rule for a graylisted client.
    pub fn apply(&self, rule: RateLimitRule) -> RateLimitRule {
        let mut adjusted = rule;
        if self.max_requests > 0 {
            if adjusted.max_requests == 0 || self.max_requests < adjusted.max_requests {
                adjusted.max_requests = self.max_requests;
            }
        } else if adjusted.max_requests > 1 {
            adjusted.max_requests = (adjusted.max_requests / 2).max(1);
        }
        if let Some(window) = self.window {
            adjusted.window = window;
        }
        adjusted
    }
}

/// Execute failure ratio rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureRateRule {
    /// Failed / total ratio that fires the signal.
    pub threshold: f64,
    /// Minimum executes in the window before the ratio counts.
    pub min_requests: u32,
    /// Window length.
    pub window: Duration,
}

/// Traffic spike rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeRule {
    /// current >= ratio × previous fires the signal.
    pub ratio: f64,
    /// Minimum previous-window count before a spike counts.
    pub min_previous: u32,
    /// Window length; the previous window is the one before it.
    pub window: Duration,
}

/// Anomaly detector tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyConfig {
    /// Signal fires when the window count exceeds `max_requests`.
    pub high_freq: RateLimitRule,
    /// Execute failure ratio.
    pub failure_rate: FailureRateRule,
    /// Spike against the previous window.
    pub spike: SpikeRule,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            high_freq: RateLimitRule::default(),
            failure_rate: FailureRateRule {
                threshold: FAILURE_RATE_THRESHOLD,
                min_requests: FAILURE_RATE_MIN_REQUESTS,
                window: FAILURE_RATE_WINDOW,
            },
            spike: SpikeRule {
                ratio: SPIKE_RATIO,
                min_previous: SPIKE_MIN_PREVIOUS,
                window: SPIKE_WINDOW,
            },
        }
    }
}

impl AnomalyConfig {
    fn parse(raw: &Value, fallback: Self) -> Self {
        let mut config = fallback;
        if let Some(high_freq) = raw.get("high_freq") {
            config.high_freq = RateLimitRule::parse(high_freq, config.high_freq);
        }
        if let Some(rule) = raw.get("failure_rate").filter(|v| v.is_object()) {
            if let Some(threshold) = rule.get("threshold").and_then(to_f64) {
                config.failure_rate.threshold = threshold;
            }
            if let Some(min) = rule.get("min_requests").and_then(to_u32) {
                config.failure_rate.min_requests = min;
            }
            if let Some(window) = rule.get("window_seconds").and_then(to_secs) {
                config.failure_rate.window = window;
            }
        }
        if let Some(rule) = raw.get("spike").filter(|v| v.is_object()) {
            if let Some(ratio) = rule.get("ratio").and_then(to_f64) {
                config.spike.ratio = ratio;
            }
            if let Some(min) = rule.get("min_previous").and_then(to_u32) {
                config.spike.min_previous = min;
            }
            if let Some(window) = rule.get("window_seconds").and_then(to_secs) {
                config.spike.window = window;
            }
        }
        config
    }
}

/// High-frequency bar derived from the per-IP limit: `floor(0.8 × max)`, so
/// the signal fires once the count is strictly above `0.8 × max`.
pub fn default_high_freq(per_ip: RateLimitRule) -> RateLimitRule {
    if !per_ip.enabled() {
        return RateLimitRule::default();
    }
    let scaled = (f64::from(per_ip.max_requests) * HIGH_FREQ_RATIO) as u32;
    let max_requests = if scaled == 0 {
        per_ip.max_requests
    } else {
        scaled.min(per_ip.max_requests)
    };
    RateLimitRule::new(max_requests, per_ip.window)
}

/// Workspace anti-abuse settings, parsed from the `rate_limit` blob.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitSettings {
    /// Window algorithm (always `fixed_window`).
    pub algorithm: String,
    /// Per hashed client IP.
    pub per_ip: RateLimitRule,
    /// Per runtime session.
    pub per_session: RateLimitRule,
    /// Per workspace.
    pub per_workspace: RateLimitRule,
    /// Raw IPs or `sha256:`/`hash:` prefixed hashes that are refused.
    pub blacklist: Vec<String>,
    /// Entries that get the tighter gray policy.
    pub graylist: Vec<String>,
    /// Limits for graylisted clients.
    pub gray_policy: GrayPolicy,
    /// Anomaly detector tuning.
    pub anomaly: AnomalyConfig,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let per_ip = RateLimitRule::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW);
        Self {
            algorithm: FIXED_WINDOW.to_string(),
            per_ip,
            per_session: RateLimitRule::default(),
            per_workspace: RateLimitRule::default(),
            blacklist: Vec::new(),
            graylist: Vec::new(),
            gray_policy: GrayPolicy::default(),
            anomaly: AnomalyConfig {
                high_freq: default_high_freq(per_ip),
                ..AnomalyConfig::default()
            },
        }
    }
}

impl RateLimitSettings {
    /// Parses the nested settings blob. Missing fields keep their defaults;
    /// malformed ones are ignored.
    ///
    /// Top-level `max_requests`/`window_seconds` set the per-IP rule.
    /// `per_app` is accepted for `per_workspace`.
    pub fn from_value(raw: &Value) -> Self {
        let mut settings = Self::default();
        if !raw.is_object() {
            return settings;
        }

        for key in ["algorithm", "rate_limit_algorithm"] {
            if let Some(algo) = raw.get(key).and_then(Value::as_str) {
                let algo = algo.trim().to_lowercase();
                if !algo.is_empty() {
                    settings.algorithm = algo;
                }
            }
        }
        if settings.algorithm != FIXED_WINDOW {
            warn!(
                algorithm = %settings.algorithm,
                "Unsupported rate limit algorithm, using fixed_window"
            );
            settings.algorithm = FIXED_WINDOW.to_string();
        }

        settings.per_ip = RateLimitRule::parse(raw, settings.per_ip);
        if let Some(per_ip) = raw.get("per_ip") {
            settings.per_ip = RateLimitRule::parse(per_ip, settings.per_ip);
        }
        if let Some(per_session) = raw.get("per_session") {
            settings.per_session = RateLimitRule::parse(per_session, settings.per_session);
        }
        for key in ["per_app", "per_workspace"] {
            if let Some(rule) = raw.get(key) {
                settings.per_workspace = RateLimitRule::parse(rule, settings.per_workspace);
            }
        }

        settings.blacklist = merge_lists(
            raw,
            &[
                "blacklist",
                "denylist",
                "blocklist",
                "blocked_ips",
                "blocked_ip_hashes",
            ],
        );
        settings.graylist = merge_lists(raw, &["graylist", "greylist"]);

        for key in ["gray_policy", "graylist_policy"] {
            if let Some(policy) = raw.get(key) {
                settings.gray_policy = GrayPolicy::parse(policy, settings.gray_policy);
            }
        }

        let mut anomaly = AnomalyConfig::default();
        if let Some(raw_anomaly) = raw.get("anomaly").filter(|v| v.is_object()) {
            anomaly = AnomalyConfig::parse(raw_anomaly, anomaly);
        }
        if !anomaly.high_freq.enabled() {
            anomaly.high_freq = default_high_freq(settings.per_ip);
        }
        settings.anomaly = anomaly;
        settings
    }
}

/// Whether `ip` (raw) or `ip_hash` matches any list entry.
pub fn is_listed(ip: Option<&str>, ip_hash: Option<&str>, list: &[String]) -> bool {
    let ip = ip.map(str::trim).filter(|s| !s.is_empty());
    list.iter().map(|e| e.trim()).filter(|e| !e.is_empty()).any(|entry| {
        if ip.is_some_and(|ip| ip.eq_ignore_ascii_case(entry)) {
            return true;
        }
        let hashed = entry.strip_prefix("sha256:").unwrap_or(entry);
        let hashed = hashed.strip_prefix("hash:").unwrap_or(hashed);
        ip_hash.is_some_and(|h| !h.is_empty() && h.eq_ignore_ascii_case(hashed))
    })
}

/// Outcome of the anti-abuse checks for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    /// The caller must present a valid captcha before executing.
    pub require_captcha: bool,
    /// Signals observed for this request.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub risk_signals: Vec<String>,
}

/// Inputs of one anti-abuse evaluation.
#[derive(Debug, Clone, Copy)]
pub struct AbuseCheck<'a> {
    /// Target workspace.
    pub workspace: &'a WorkspaceRecord,
    /// Session attached to the request, if any.
    pub session: Option<&'a SessionRecord>,
    /// Request metadata.
    pub meta: &'a RequestMeta,
    /// Endpoint.
    pub kind: RequestKind,
    /// Evaluation instant.
    pub now: DateTime<Utc>,
}

impl AbuseCheck<'_> {
    fn session_id(&self) -> Option<Uuid> {
        self.session.map(|s| s.id)
    }

    fn captcha_provided(&self) -> bool {
        self.meta
            .captcha_token
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }
}

/// Risk payload shared by every anti-abuse event.
pub fn risk_payload(meta: &RequestMeta, signals: &[String], extra: Value) -> Value {
    let mut payload = Map::new();
    if let Some(path) = meta.path.as_deref().filter(|p| !p.is_empty()) {
        payload.insert("path".into(), json!(path));
    }
    if let Some(hash) = meta.ip_hash() {
        payload.insert("ip_hash".into(), json!(hash));
    }
    if let Some(hash) = meta.user_agent_hash() {
        payload.insert("user_agent_hash".into(), json!(hash));
    }
    if meta
        .captcha_token
        .as_deref()
        .is_some_and(|t| !t.trim().is_empty())
    {
        payload.insert("captcha_provided".into(), json!(true));
    }
    if !signals.is_empty() {
        payload.insert("risk_signals".into(), json!(signals));
    }
    if let Value::Object(extra) = extra {
        payload.extend(extra);
    }
    Value::Object(payload)
}

/// Counts request events and turns them into allow/deny decisions.
pub struct AbuseGuard {
    persistence: Arc<dyn Persistence>,
    recorder: Arc<EventRecorder>,
}

impl AbuseGuard {
    /// Creates a guard over the event log.
    pub fn new(persistence: Arc<dyn Persistence>, recorder: Arc<EventRecorder>) -> Self {
        Self {
            persistence,
            recorder,
        }
    }

    /// Runs every check for one request.
    ///
    /// Denials record their own event (`access_blocked`, `runtime_rate_limited`,
    /// `load_shed`, `captcha_required`) before returning. On success the caller
    /// records the request event itself.
    pub async fn evaluate(&self, check: AbuseCheck<'_>) -> Result<AccessDecision> {
        let settings = RateLimitSettings::from_value(&check.workspace.rate_limit);
        let ip_hash = check.meta.ip_hash();
        let mut decision = AccessDecision {
            require_captcha: check.workspace.require_captcha,
            risk_signals: Vec::new(),
        };

        if is_listed(
            check.meta.ip.as_deref(),
            ip_hash.as_deref(),
            &settings.blacklist,
        ) {
            self.block_session(check.session, "blacklist", check.now)
                .await;
            self.record(
                &check,
                RuntimeEvent::new(types::ACCESS_BLOCKED)
                    .message("client ip blacklisted")
                    .metadata(risk_payload(
                        check.meta,
                        &decision.risk_signals,
                        json!({"reason": "blacklist", "event_type": check.kind.as_str()}),
                    )),
            )
            .await;
            return Err(CoreError::IpBlocked);
        }

        let mut per_ip = settings.per_ip;
        let mut per_session = settings.per_session;
        let mut per_workspace = settings.per_workspace;
        let graylisted = is_listed(
            check.meta.ip.as_deref(),
            ip_hash.as_deref(),
            &settings.graylist,
        );
        if graylisted {
            decision.risk_signals.push(signal::GRAYLIST.to_string());
            per_ip = settings.gray_policy.apply(per_ip);
            per_session = settings.gray_policy.apply(per_session);
            per_workspace = settings.gray_policy.apply(per_workspace);
            if settings.gray_policy.require_captcha {
                decision.require_captcha = true;
            }
        }

        let windows = [
            ("per_session", per_session, None, check.session_id()),
            ("per_ip", per_ip, ip_hash.clone(), None),
            ("per_workspace", per_workspace, None, None),
        ];
        for (scope, rule, hash, session_id) in windows {
            if !rule.enabled() {
                continue;
            }
            if scope == "per_session" && session_id.is_none() {
                continue;
            }
            if scope == "per_ip" && hash.is_none() {
                continue;
            }
            let count = self
                .count(
                    &check,
                    REQUEST_EVENT_TYPES,
                    check.now - to_chrono(rule.window),
                    hash,
                    session_id,
                )
                .await?;
            if count < i64::from(rule.max_requests) {
                continue;
            }
            return Err(self
                .rate_limited(&check, &decision, graylisted, &settings, scope, rule, count)
                .await);
        }

        let anomalies = self
            .detect_anomalies(&check, &settings.anomaly, ip_hash.as_deref())
            .await?;
        if !anomalies.is_empty() {
            decision.require_captcha = true;
            decision.risk_signals.extend(anomalies.iter().cloned());
            self.record(
                &check,
                RuntimeEvent::new(types::ANOMALY_DETECTED)
                    .message("runtime anomaly detected")
                    .metadata(risk_payload(
                        check.meta,
                        &decision.risk_signals,
                        json!({"reason": "anomaly", "event_type": check.kind.as_str()}),
                    )),
            )
            .await;
            if check.kind == RequestKind::Execute {
                self.record(
                    &check,
                    RuntimeEvent::new(types::LOAD_SHED)
                        .message("execute shed under anomaly")
                        .metadata(risk_payload(
                            check.meta,
                            &decision.risk_signals,
                            json!({"reason": "load_shed"}),
                        )),
                )
                .await;
                return Err(CoreError::Overloaded);
            }
        }

        if decision.require_captcha && !check.captcha_provided() {
            self.record(
                &check,
                RuntimeEvent::new(types::CAPTCHA_REQUIRED)
                    .message("captcha required")
                    .metadata(risk_payload(
                        check.meta,
                        &decision.risk_signals,
                        json!({"event_type": check.kind.as_str()}),
                    )),
            )
            .await;
        }

        debug!(
            workspace_id = %check.workspace.id,
            kind = check.kind.as_str(),
            require_captcha = decision.require_captcha,
            signals = ?decision.risk_signals,
            "Anti-abuse checks passed"
        );
        Ok(decision)
    }

    #[allow(clippy::too_many_arguments)]
    async fn rate_limited(
        &self,
        check: &AbuseCheck<'_>,
        decision: &AccessDecision,
        graylisted: bool,
        settings: &RateLimitSettings,
        scope: &str,
        rule: RateLimitRule,
        count: i64,
    ) -> CoreError {
        self.block_session(check.session, "rate_limit", check.now)
            .await;
        let window_secs = rule.window.as_secs();
        self.record(
            check,
            RuntimeEvent::new(types::RUNTIME_RATE_LIMITED)
                .message(format!("{scope} limit reached"))
                .metadata(risk_payload(
                    check.meta,
                    &decision.risk_signals,
                    json!({
                        "limit_scope": scope,
                        "max_requests": rule.max_requests,
                        "window_seconds": window_secs,
                        "current_count": count,
                    }),
                )),
        )
        .await;

        // A graylisted client without a captcha is escalated instead of throttled.
        if graylisted && settings.gray_policy.require_captcha && !check.captcha_provided() {
            self.record(
                check,
                RuntimeEvent::new(types::CAPTCHA_REQUIRED)
                    .message("captcha required")
                    .metadata(risk_payload(
                        check.meta,
                        &decision.risk_signals,
                        json!({"event_type": check.kind.as_str(), "limit_scope": scope}),
                    )),
            )
            .await;
            return CoreError::CaptchaRequired;
        }
        CoreError::RateLimited {
            scope: scope.to_string(),
            retry_after_secs: window_secs,
        }
    }

    async fn detect_anomalies(
        &self,
        check: &AbuseCheck<'_>,
        config: &AnomalyConfig,
        ip_hash: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut signals = Vec::new();
        let ip_hash = ip_hash.map(str::to_string);

        if config.high_freq.enabled() {
            let since = check.now - to_chrono(config.high_freq.window);
            let (hash, session) = match (&ip_hash, check.session_id()) {
                (Some(h), _) => (Some(h.clone()), None),
                (None, Some(s)) => (None, Some(s)),
                (None, None) => (None, None),
            };
            let count = self
                .count(check, REQUEST_EVENT_TYPES, since, hash, session)
                .await?;
            if count > i64::from(config.high_freq.max_requests) {
                signals.push(signal::HIGH_FREQUENCY.to_string());
            }
        }

        let failure = config.failure_rate;
        if !failure.window.is_zero() && failure.threshold > 0.0 {
            let since = check.now - to_chrono(failure.window);
            let total = self
                .count(check, EXECUTE_OUTCOME_EVENT_TYPES, since, None, None)
                .await?;
            if total > 0 && total >= i64::from(failure.min_requests) {
                let failed = self
                    .count(check, &[types::RUNTIME_EXECUTE_FAILED], since, None, None)
                    .await?;
                if failed as f64 / total as f64 >= failure.threshold {
                    signals.push(signal::FAILURE_RATE.to_string());
                }
            }
        }

        let spike = config.spike;
        if !spike.window.is_zero() && spike.ratio > 0.0 {
            let window = to_chrono(spike.window);
            let current = self
                .count(
                    check,
                    REQUEST_EVENT_TYPES,
                    check.now - window,
                    ip_hash.clone(),
                    None,
                )
                .await?;
            let both = self
                .count(
                    check,
                    REQUEST_EVENT_TYPES,
                    check.now - window - window,
                    ip_hash.clone(),
                    None,
                )
                .await?;
            let previous = (both - current).max(0);
            if previous >= i64::from(spike.min_previous)
                && current as f64 >= spike.ratio * previous as f64
            {
                signals.push(signal::RATE_SPIKE.to_string());
            }
        }

        Ok(signals)
    }

    async fn count(
        &self,
        check: &AbuseCheck<'_>,
        event_types: &[&str],
        since: DateTime<Utc>,
        ip_hash: Option<String>,
        session_id: Option<Uuid>,
    ) -> Result<i64> {
        let filter = EventCountFilter {
            workspace_id: check.workspace.id,
            event_types: event_types.iter().map(|t| (*t).to_string()).collect(),
            since,
            ip_hash,
            session_id,
        };
        Ok(self.persistence.count_events(&filter).await?)
    }

    async fn block_session(&self, session: Option<&SessionRecord>, reason: &str, now: DateTime<Utc>) {
        let Some(session) = session.filter(|s| s.blocked_at.is_none()) else {
            return;
        };
        let mut blocked = session.clone();
        blocked.blocked_at = Some(now);
        blocked.blocked_reason = Some(reason.to_string());
        blocked.updated_at = now;
        if let Err(e) = self.persistence.update_session(&blocked).await {
            warn!(session_id = %session.id, error = %e, "Failed to block session");
        }
    }

    async fn record(&self, check: &AbuseCheck<'_>, event: RuntimeEvent) {
        let event = event
            .workspace(check.workspace.id)
            .session(check.session_id())
            .request(check.meta);
        if let Err(e) = self.recorder.record(event).await {
            warn!(workspace_id = %check.workspace.id, error = %e, "Failed to record anti-abuse event");
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn merge_lists(raw: &Value, keys: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for key in keys {
        let items: Vec<&str> = match raw.get(*key) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            Some(Value::String(s)) => vec![s.as_str()],
            _ => continue,
        };
        for item in items {
            let item = item.trim();
            if !item.is_empty() && !out.iter().any(|e| e == item) {
                out.push(item.to_string());
            }
        }
    }
    out
}

fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_u32(value: &Value) -> Option<u32> {
    let n = to_f64(value)?;
    (n >= 0.0).then(|| n.min(f64::from(u32::MAX)) as u32)
}

fn to_secs(value: &Value) -> Option<Duration> {
    to_u32(value)
        .filter(|n| *n > 0)
        .map(|n| Duration::from_secs(u64::from(n)))
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256_hex;
    use crate::persistence::MemoryPersistence;
    use crate::runtime::test_support::{published_workspace, request_from};

    #[test]
    fn test_default_settings() {
        let s = RateLimitSettings::from_value(&Value::Null);
        assert_eq!(s.algorithm, FIXED_WINDOW);
        assert_eq!(s.per_ip, RateLimitRule::new(120, Duration::from_secs(60)));
        assert!(!s.per_session.enabled());
        assert_eq!(s.anomaly.high_freq.max_requests, 96);
        assert!(s.gray_policy.require_captcha);
        assert_eq!(s.anomaly.failure_rate.min_requests, 5);
        assert_eq!(s.anomaly.spike.ratio, 3.0);
    }

    #[test]
    fn test_alias_keys_and_lists() {
        let s = RateLimitSettings::from_value(&json!({
            "rate_limit_algorithm": "sliding_log",
            "per_ip": {"max_requests": 3, "window_seconds": 60},
            "per_app": {"max_requests": "50", "window_seconds": 10},
            "denylist": ["9.9.9.9", " 9.9.9.9 "],
            "blocked_ip_hashes": "sha256:abc",
            "greylist": ["5.5.5.5"],
            "graylist_policy": {"max_requests": 2, "require_captcha": "no"},
        }));
        assert_eq!(s.algorithm, FIXED_WINDOW);
        assert_eq!(s.per_ip.max_requests, 3);
        assert_eq!(s.per_workspace, RateLimitRule::new(50, Duration::from_secs(10)));
        assert_eq!(s.blacklist, vec!["9.9.9.9".to_string(), "sha256:abc".to_string()]);
        assert_eq!(s.graylist, vec!["5.5.5.5".to_string()]);
        assert_eq!(s.gray_policy.max_requests, 2);
        assert!(!s.gray_policy.require_captcha);
        assert_eq!(s.anomaly.high_freq.max_requests, 2);
    }

    #[test]
    fn test_gray_policy_tightens() {
        let base = RateLimitRule::new(10, Duration::from_secs(60));
        assert_eq!(GrayPolicy::default().apply(base).max_requests, 5);
        assert_eq!(GrayPolicy::default().apply(RateLimitRule::new(1, base.window)).max_requests, 1);
        let explicit = GrayPolicy {
            max_requests: 3,
            window: Some(Duration::from_secs(120)),
            require_captcha: true,
        };
        assert_eq!(explicit.apply(base), RateLimitRule::new(3, Duration::from_secs(120)));
        assert_eq!(explicit.apply(RateLimitRule::default()).max_requests, 3);
    }

    #[test]
    fn test_is_listed_matches_raw_and_hashes() {
        let hash = sha256_hex("1.2.3.4");
        let list = vec![format!("hash:{}", hash.to_uppercase())];
        assert!(is_listed(Some("1.2.3.4"), Some(&hash), &list));
        assert!(is_listed(Some("1.2.3.4"), None, &["1.2.3.4".to_string()]));
        assert!(!is_listed(Some("1.2.3.5"), Some(&sha256_hex("1.2.3.5")), &list));
        assert!(!is_listed(None, None, &["".to_string()]));
    }

    #[test]
    fn test_high_freq_bar() {
        let r = default_high_freq(RateLimitRule::new(3, Duration::from_secs(60)));
        assert_eq!(r.max_requests, 2);
        let r = default_high_freq(RateLimitRule::new(1, Duration::from_secs(60)));
        assert_eq!(r.max_requests, 1);
        assert!(!default_high_freq(RateLimitRule::default()).enabled());
    }

    async fn seed_requests(recorder: &EventRecorder, ws: Uuid, meta: &RequestMeta, n: usize) {
        for _ in 0..n {
            recorder
                .record(RuntimeEvent::new(types::RUNTIME_ENTRY).workspace(ws).request(meta))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_per_ip_limit_fires_at_max() {
        let store: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let recorder = Arc::new(EventRecorder::new(store.clone(), false));
        let guard = AbuseGuard::new(store.clone(), recorder.clone());
        let mut ws = published_workspace("demo");
        ws.rate_limit = json!({"per_ip": {"max_requests": 3, "window_seconds": 60}});
        let meta = request_from("1.2.3.4");

        seed_requests(&recorder, ws.id, &meta, 2).await;
        let check = AbuseCheck {
            workspace: &ws,
            session: None,
            meta: &meta,
            kind: RequestKind::Entry,
            now: Utc::now(),
        };
        assert!(guard.evaluate(check).await.is_ok());

        seed_requests(&recorder, ws.id, &meta, 1).await;
        let err = guard
            .evaluate(AbuseCheck { now: Utc::now(), ..check })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::RateLimited {
                scope: "per_ip".into(),
                retry_after_secs: 60
            }
        );
        let limited = store
            .count_events(&EventCountFilter {
                workspace_id: ws.id,
                event_types: vec![types::RUNTIME_RATE_LIMITED.into()],
                since: Utc::now() - chrono::Duration::minutes(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited, 1);

        // Another client is unaffected.
        let other = request_from("5.6.7.8");
        assert!(
            guard
                .evaluate(AbuseCheck { meta: &other, now: Utc::now(), ..check })
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_blacklist_blocks_session() {
        let store: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let recorder = Arc::new(EventRecorder::new(store.clone(), false));
        let guard = AbuseGuard::new(store.clone(), recorder);
        let mut ws = published_workspace("demo");
        ws.rate_limit = json!({"blacklist": [format!("sha256:{}", sha256_hex("6.6.6.6"))]});
        let session = crate::runtime::test_support::anon_session(ws.id);
        store.create_session(&session).await.unwrap();
        let meta = request_from("6.6.6.6");

        let err = guard
            .evaluate(AbuseCheck {
                workspace: &ws,
                session: Some(&session),
                meta: &meta,
                kind: RequestKind::Execute,
                now: Utc::now(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::IpBlocked);
        let stored = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.blocked_reason.as_deref(), Some("blacklist"));
    }

    #[tokio::test]
    async fn test_graylist_escalates_to_captcha() {
        let store: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let recorder = Arc::new(EventRecorder::new(store.clone(), false));
        let guard = AbuseGuard::new(store.clone(), recorder.clone());
        let mut ws = published_workspace("demo");
        ws.rate_limit = json!({
            "per_ip": {"max_requests": 4, "window_seconds": 60},
            "graylist": ["7.7.7.7"],
        });
        let meta = request_from("7.7.7.7");
        let check = AbuseCheck {
            workspace: &ws,
            session: None,
            meta: &meta,
            kind: RequestKind::Entry,
            now: Utc::now(),
        };

        let decision = guard.evaluate(check).await.unwrap();
        assert!(decision.require_captcha);
        assert_eq!(decision.risk_signals, vec![signal::GRAYLIST.to_string()]);

        // Gray policy halves 4 to 2.
        seed_requests(&recorder, ws.id, &meta, 2).await;
        let err = guard
            .evaluate(AbuseCheck { now: Utc::now(), ..check })
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::CaptchaRequired);
    }

    #[tokio::test]
    async fn test_failure_rate_sheds_execute() {
        let store: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let recorder = Arc::new(EventRecorder::new(store.clone(), false));
        let guard = AbuseGuard::new(store.clone(), recorder.clone());
        let ws = published_workspace("demo");
        for i in 0..6 {
            let ty = if i < 4 {
                types::RUNTIME_EXECUTE_FAILED
            } else {
                types::RUNTIME_EXECUTE_SUCCESS
            };
            recorder
                .record(RuntimeEvent::new(ty).workspace(ws.id))
                .await
                .unwrap();
        }
        let meta = request_from("8.8.8.8");
        let check = AbuseCheck {
            workspace: &ws,
            session: None,
            meta: &meta,
            kind: RequestKind::Schema,
            now: Utc::now(),
        };
        let decision = guard.evaluate(check).await.unwrap();
        assert!(decision.require_captcha);
        assert!(decision.risk_signals.contains(&signal::FAILURE_RATE.to_string()));

        let err = guard
            .evaluate(AbuseCheck {
                kind: RequestKind::Execute,
                now: Utc::now(),
                ..check
            })
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Overloaded);
    }
}
