// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::env;

use backplane_engine::EngineConfig;

use crate::cache::CacheConfig;
use crate::notify::{SmtpConfig, TwilioConfig};
use crate::tenant_db::TenantDbConfig;
use crate::workers::{ConnectorHealthConfig, RetentionConfig};

/// Default verification endpoint for the shared-secret captcha verifier.
pub const DEFAULT_CAPTCHA_VERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";

/// Which persistence backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// PostgreSQL via `BACKPLANE_DATABASE_URL`.
    Postgres,
    /// Process-local, non-durable.
    Memory,
}

/// Backplane configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Persistence backend
    pub storage: StorageBackend,
    /// PostgreSQL connection URL (absent for the memory backend)
    pub database_url: Option<String>,
    /// HTTP listen port
    pub http_port: u16,
    /// 32-byte secret encryption key (base64 or raw)
    pub encryption_key: String,
    /// HS256 secret for JWT bearer tokens; JWT auth is off when unset
    pub jwt_secret: Option<String>,
    /// Mask PII in event text and metadata before persisting
    pub pii_masking: bool,
    /// Captcha verifier shared secret; when unset any non-empty token passes
    pub captcha_secret: Option<String>,
    /// Captcha verification endpoint
    pub captcha_verify_url: String,
    /// Hosts that serve `/runtime/{slug}` routing rather than custom domains
    pub base_hosts: Vec<String>,
    /// Runtime cache tuning
    pub cache: CacheConfig,
    /// Workflow engine tuning
    pub engine: EngineConfig,
    /// Retention worker settings
    pub retention: RetentionConfig,
    /// Connector health worker settings
    pub connector_health: ConnectorHealthConfig,
    /// Tenant database server, when provisioning is enabled
    pub tenant_db: Option<TenantDbConfig>,
    /// SMTP transport for critical events
    pub smtp: Option<SmtpConfig>,
    /// SMS transport for critical events
    pub twilio: Option<TwilioConfig>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `BACKPLANE_ENCRYPTION_KEY`: 32-byte key, base64 or raw
    /// - `BACKPLANE_DATABASE_URL`: PostgreSQL connection string (unless `BACKPLANE_STORAGE=memory`)
    ///
    /// Optional (with defaults):
    /// - `BACKPLANE_STORAGE`: `postgres` or `memory` (default: postgres)
    /// - `BACKPLANE_HTTP_PORT`: HTTP port (default: 8080)
    /// - `BACKPLANE_JWT_SECRET`: enables HS256 JWT bearer auth
    /// - `BACKPLANE_PII_MASKING`: mask PII in events (default: true)
    /// - `BACKPLANE_CAPTCHA_SECRET`: captcha verifier secret
    /// - `BACKPLANE_CAPTCHA_VERIFY_URL`: captcha verifier endpoint
    /// - `BACKPLANE_RUNTIME_BASE_HOSTS`: comma-separated platform hosts (default: localhost)
    ///
    /// Sub-configs read their own variables; see [`CacheConfig::from_env`],
    /// [`RetentionConfig::from_env`], [`ConnectorHealthConfig::from_env`],
    /// [`TenantDbConfig::from_env`], [`SmtpConfig::from_env`] and [`TwilioConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let storage = match env::var("BACKPLANE_STORAGE")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" | "postgresql" => StorageBackend::Postgres,
            "memory" => StorageBackend::Memory,
            _ => {
                return Err(ConfigError::Invalid(
                    "BACKPLANE_STORAGE",
                    "must be 'postgres' or 'memory'",
                ));
            }
        };

        let database_url = env::var("BACKPLANE_DATABASE_URL").ok();
        if storage == StorageBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("BACKPLANE_DATABASE_URL"));
        }

        let http_port: u16 = env::var("BACKPLANE_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("BACKPLANE_HTTP_PORT", "must be a valid port number"))?;

        let encryption_key = env::var("BACKPLANE_ENCRYPTION_KEY")
            .map_err(|_| ConfigError::Missing("BACKPLANE_ENCRYPTION_KEY"))?;

        let pii_masking = parse_bool("BACKPLANE_PII_MASKING", true)?;

        let base_hosts = env::var("BACKPLANE_RUNTIME_BASE_HOSTS")
            .unwrap_or_else(|_| "localhost".to_string())
            .split(',')
            .map(|h| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect();

        Ok(Self {
            storage,
            database_url,
            http_port,
            encryption_key,
            jwt_secret: non_empty("BACKPLANE_JWT_SECRET"),
            pii_masking,
            captcha_secret: non_empty("BACKPLANE_CAPTCHA_SECRET"),
            captcha_verify_url: non_empty("BACKPLANE_CAPTCHA_VERIFY_URL")
                .unwrap_or_else(|| DEFAULT_CAPTCHA_VERIFY_URL.to_string()),
            base_hosts,
            cache: CacheConfig::from_env(),
            engine: EngineConfig::from_env(),
            retention: RetentionConfig::from_env(),
            connector_health: ConnectorHealthConfig::from_env(),
            tenant_db: TenantDbConfig::from_env(),
            smtp: SmtpConfig::from_env(),
            twilio: TwilioConfig::from_env(),
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(v) => match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(key, "must be true or false")),
        },
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    pub static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    pub struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        pub fn new() -> Self {
            Self { vars: Vec::new() }
        }

        pub fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        pub fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_env::{ENV_MUTEX, EnvGuard};
    use super::*;

    fn clear(guard: &mut EnvGuard) {
        for key in [
            "BACKPLANE_STORAGE",
            "BACKPLANE_DATABASE_URL",
            "BACKPLANE_HTTP_PORT",
            "BACKPLANE_JWT_SECRET",
            "BACKPLANE_PII_MASKING",
            "BACKPLANE_CAPTCHA_SECRET",
            "BACKPLANE_CAPTCHA_VERIFY_URL",
            "BACKPLANE_RUNTIME_BASE_HOSTS",
            "BACKPLANE_TENANT_DB_HOST",
            "AGENTFLOW_SMTP_HOST",
            "AGENTFLOW_TWILIO_SID",
        ] {
            guard.remove(key);
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear(&mut guard);

        guard.set("BACKPLANE_DATABASE_URL", "postgres://localhost/test");
        guard.set("BACKPLANE_ENCRYPTION_KEY", "0123456789abcdef0123456789abcdef");

        let config = Config::from_env().unwrap();

        assert_eq!(config.storage, StorageBackend::Postgres);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/test"));
        assert_eq!(config.http_port, 8080);
        assert!(config.pii_masking);
        assert!(config.jwt_secret.is_none());
        assert_eq!(config.captcha_verify_url, DEFAULT_CAPTCHA_VERIFY_URL);
        assert_eq!(config.base_hosts, vec!["localhost".to_string()]);
        assert!(config.tenant_db.is_none());
        assert!(config.smtp.is_none());
        assert!(config.twilio.is_none());
    }

    #[test]
    fn test_config_memory_backend_needs_no_database() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear(&mut guard);

        guard.set("BACKPLANE_STORAGE", "memory");
        guard.set("BACKPLANE_ENCRYPTION_KEY", "k");
        guard.set("BACKPLANE_PII_MASKING", "off");
        guard.set("BACKPLANE_RUNTIME_BASE_HOSTS", "App.Example.com, localhost,");

        let config = Config::from_env().unwrap();

        assert_eq!(config.storage, StorageBackend::Memory);
        assert!(!config.pii_masking);
        assert_eq!(config.base_hosts, vec!["app.example.com", "localhost"]);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear(&mut guard);
        guard.set("BACKPLANE_ENCRYPTION_KEY", "k");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("BACKPLANE_DATABASE_URL")));
        assert!(err.to_string().contains("BACKPLANE_DATABASE_URL"));
    }

    #[test]
    fn test_config_missing_encryption_key() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear(&mut guard);
        guard.set("BACKPLANE_STORAGE", "memory");
        guard.remove("BACKPLANE_ENCRYPTION_KEY");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("BACKPLANE_ENCRYPTION_KEY")));
    }

    #[test]
    fn test_config_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear(&mut guard);
        guard.set("BACKPLANE_STORAGE", "memory");
        guard.set("BACKPLANE_ENCRYPTION_KEY", "k");
        guard.set("BACKPLANE_HTTP_PORT", "not_a_number");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("BACKPLANE_HTTP_PORT", _))
        ));

        guard.set("BACKPLANE_HTTP_PORT", "9000");
        guard.set("BACKPLANE_PII_MASKING", "maybe");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("BACKPLANE_PII_MASKING", _))
        ));

        guard.set("BACKPLANE_PII_MASKING", "true");
        guard.set("BACKPLANE_STORAGE", "sqlite");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("BACKPLANE_STORAGE", _))
        ));
    }
}
