// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PII masking for event text and metadata.
//!
//! Two passes run over every value:
//!
//! | Pass | Trigger | Effect |
//! |------|---------|--------|
//! | Field rule | key name (`email`, `password`, `remote_ip`, ...) | mask or redact the whole value |
//! | Pattern rule | value text (emails, IPv4, bearer, JWT, API keys) | rewrite matches in place |
//!
//! Structure is preserved: maps keep their keys, arrays their length.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::persistence::EventRecord;

/// Replacement for redacted credentials.
pub const REDACTED: &str = "[REDACTED]";

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z0-9._%+\-])[a-z0-9._%+\-]*@([a-z0-9.\-]+\.[a-z]{2,})\b")
        .expect("valid email pattern")
});
static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.\d{1,3}\b").expect("valid ipv4 pattern")
});
static BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bbearer\s+[a-z0-9._~+/\-]+=*").expect("valid bearer pattern")
});
static JWT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\beyJ[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+").expect("valid jwt pattern")
});
static API_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:sk-[A-Za-z0-9_\-]{8,}|sk_(?:live|test)_[A-Za-z0-9]{8,}|pk_(?:live|test)_[A-Za-z0-9]{8,}|ghp_[A-Za-z0-9]{20,}|xox[abpr]-[A-Za-z0-9\-]{10,}|AKIA[0-9A-Z]{16})")
        .expect("valid api key pattern")
});

const SECRET_FIELDS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "access_token",
    "refresh_token",
    "api_key",
    "apikey",
    "authorization",
    "client_secret",
    "private_key",
    "captcha_token",
];
const EMAIL_FIELDS: &[&str] = &["email", "user_email", "contact_email"];
const IP_FIELDS: &[&str] = &["ip", "remote_ip", "client_ip", "ip_address"];
const PHONE_FIELDS: &[&str] = &["phone", "mobile", "phone_number"];

/// Masks an email as `a***@domain`.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            let first: String = local.chars().take(1).collect();
            format!("{first}***@{domain}")
        }
        _ => "***".to_string(),
    }
}

/// Masks the last IPv4 octet, or the last IPv6 group.
pub fn mask_ip(ip: &str) -> String {
    let ip = ip.trim();
    if let Some((head, _)) = ip.rsplit_once('.') {
        return format!("{head}.*");
    }
    if let Some((head, _)) = ip.rsplit_once(':') {
        return format!("{head}:*");
    }
    "*".to_string()
}

/// Keeps the last four digits of a phone number.
pub fn mask_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("****{tail}")
}

/// Field- and pattern-driven PII sanitizer.
#[derive(Debug, Clone, Copy)]
pub struct PiiSanitizer {
    enabled: bool,
}

impl PiiSanitizer {
    /// Creates a sanitizer; a disabled one returns input unchanged.
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Whether masking is on.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Rewrites pattern matches inside free text.
    pub fn sanitize_str(&self, input: &str) -> String {
        if !self.enabled || input.is_empty() {
            return input.to_string();
        }
        let out = BEARER.replace_all(input, format!("Bearer {REDACTED}").as_str());
        let out = JWT.replace_all(&out, REDACTED);
        let out = API_KEY.replace_all(&out, REDACTED);
        let out = EMAIL.replace_all(&out, |c: &Captures<'_>| format!("{}***@{}", &c[1], &c[2]));
        let out = IPV4.replace_all(&out, |c: &Captures<'_>| format!("{}.{}.{}.*", &c[1], &c[2], &c[3]));
        out.into_owned()
    }

    /// Masks a JSON value in place.
    pub fn sanitize_value(&self, value: &mut Value) {
        if !self.enabled {
            return;
        }
        match value {
            Value::String(s) => *s = self.sanitize_str(s),
            Value::Array(items) => items.iter_mut().for_each(|v| self.sanitize_value(v)),
            Value::Object(map) => {
                for (key, v) in map.iter_mut() {
                    self.sanitize_field(key, v);
                }
            }
            _ => {}
        }
    }

    fn sanitize_field(&self, key: &str, value: &mut Value) {
        let key = key.to_lowercase();
        let key = key.as_str();
        if SECRET_FIELDS.contains(&key) || key.ends_with("_password") || key.ends_with("_secret") {
            if !value.is_null() {
                *value = Value::String(REDACTED.to_string());
            }
            return;
        }
        if let Value::String(s) = value {
            if EMAIL_FIELDS.contains(&key) {
                *s = mask_email(s);
                return;
            }
            if IP_FIELDS.contains(&key) {
                *s = mask_ip(s);
                return;
            }
            if PHONE_FIELDS.contains(&key) {
                *s = mask_phone(s);
                return;
            }
        }
        self.sanitize_value(value);
    }

    /// Masks the free-text columns and metadata of an event.
    pub fn sanitize_event(&self, event: &mut EventRecord) {
        if !self.enabled {
            return;
        }
        for field in [&mut event.message, &mut event.error_message, &mut event.http_path] {
            if let Some(text) = field.as_mut() {
                *text = self.sanitize_str(text);
            }
        }
        self.sanitize_value(&mut event.metadata);
    }
}
