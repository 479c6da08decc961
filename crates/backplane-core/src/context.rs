// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service wiring.
//!
//! [`AppContext`] owns one instance of every service, connected the same
//! way for the server and for tests. The recorder gets the webhook service
//! and the critical-event notifier as dispatchers.

use std::sync::Arc;

use backplane_engine::{Engine, ExecutionHub, ExecutorRegistry};
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::AuthService;
use crate::billing::BillingService;
use crate::cache::RuntimeCache;
use crate::config::{Config, StorageBackend};
use crate::crypto::{AesGcmEncryptor, Encryptor};
use crate::error::{CoreError, Result};
use crate::events::{EventRecorder, types};
use crate::execution::ExecutionService;
use crate::migrations;
use crate::notify::CriticalEventNotifier;
use crate::persistence::{MemoryPersistence, Persistence, PostgresPersistence};
use crate::runtime::{HttpCaptchaVerifier, RuntimeService};
use crate::secrets::SecretService;
use crate::tenant_db::{DbRoleService, MySqlTenantAdmin, TenantDbAdmin, TenantDbService};
use crate::webhook::WebhookService;
use crate::workers::{ConnectorHealthWorker, RetentionWorker};
use crate::workspace::WorkspaceService;

/// Tenant database services, present when a tenant server is configured.
pub struct TenantServices {
    /// Admin connection to the tenant server.
    pub admin: Arc<dyn TenantDbAdmin>,
    /// Provisioning, backup and migrations.
    pub databases: Arc<TenantDbService>,
    /// Scoped database principals.
    pub roles: Arc<DbRoleService>,
}

/// Every long-lived service of the backplane.
pub struct AppContext {
    /// Loaded configuration.
    pub config: Config,
    /// Repository port.
    pub persistence: Arc<dyn Persistence>,
    /// Secret encryptor.
    pub encryptor: Arc<dyn Encryptor>,
    /// Event recorder with its dispatchers attached.
    pub recorder: Arc<EventRecorder>,
    /// Runtime cache.
    pub cache: Arc<RuntimeCache>,
    /// Quotas, usage and invoices.
    pub billing: Arc<BillingService>,
    /// Workflow runs.
    pub executions: Arc<ExecutionService>,
    /// Resolve, guard, describe and execute.
    pub runtime: Arc<RuntimeService>,
    /// Workspace lifecycle and policy.
    pub workspaces: Arc<WorkspaceService>,
    /// Webhook endpoints and deliveries.
    pub webhooks: Arc<WebhookService>,
    /// Critical-event fan-out.
    pub notifier: Arc<CriticalEventNotifier>,
    /// App-user auth.
    pub auth: Arc<AuthService>,
    /// Credential store.
    pub secrets: Arc<SecretService>,
    /// Tenant databases, if configured.
    pub tenant: Option<TenantServices>,
    shutdown: CancellationToken,
}

impl AppContext {
    /// Connects the configured storage backend and wires every service.
    ///
    /// For PostgreSQL the control-plane migrations run first.
    pub async fn connect(config: Config) -> Result<Self> {
        let persistence: Arc<dyn Persistence> = match config.storage {
            StorageBackend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or_else(|| CoreError::Internal("database URL not configured".into()))?;
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await
                    .map_err(|e| CoreError::Storage(format!("connect: {e}")))?;
                migrations::run_postgres(&pool)
                    .await
                    .map_err(|e| CoreError::Storage(format!("migrate: {e}")))?;
                info!("Control-plane schema verified");
                Arc::new(PostgresPersistence::new(pool))
            }
            StorageBackend::Memory => {
                warn!("Using in-memory storage; data is lost on restart");
                Arc::new(MemoryPersistence::new())
            }
        };
        let tenant_admin = config
            .tenant_db
            .as_ref()
            .map(|c| Arc::new(MySqlTenantAdmin::new(c)) as Arc<dyn TenantDbAdmin>);
        Self::build(config, persistence, tenant_admin)
    }

    /// Wires services over an existing store. Must run inside a Tokio runtime.
    pub fn build(
        config: Config,
        persistence: Arc<dyn Persistence>,
        tenant_admin: Option<Arc<dyn TenantDbAdmin>>,
    ) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let encryptor: Arc<dyn Encryptor> =
            Arc::new(AesGcmEncryptor::from_key_string(&config.encryption_key)?);
        let recorder = Arc::new(EventRecorder::new(
            Arc::clone(&persistence),
            config.pii_masking,
        ));
        let cache = Arc::new(RuntimeCache::new(&config.cache));

        let webhooks = Arc::new(WebhookService::new(
            Arc::clone(&persistence),
            Arc::clone(&encryptor),
            &recorder,
            shutdown.child_token(),
        ));
        let notifier = Arc::new(CriticalEventNotifier::from_config(
            Arc::clone(&persistence),
            config.smtp.as_ref(),
            config.twilio.as_ref(),
        ));
        recorder.add_dispatcher(webhooks.clone());
        recorder.add_dispatcher(notifier.clone());

        let billing = Arc::new(
            BillingService::new(Arc::clone(&persistence), Arc::clone(&recorder))
                .with_cache(Arc::clone(&cache)),
        );
        let engine = Arc::new(Engine::new(
            ExecutorRegistry::with_builtins(),
            config.engine.clone(),
        ));
        let executions = Arc::new(ExecutionService::new(
            Arc::clone(&persistence),
            engine,
            Arc::clone(&recorder),
            Arc::new(ExecutionHub::new()),
            shutdown.child_token(),
        ));

        let mut runtime = RuntimeService::new(
            Arc::clone(&persistence),
            Arc::clone(&cache),
            Arc::clone(&recorder),
            Arc::clone(&billing),
            Arc::clone(&executions),
            config.base_hosts.clone(),
        );
        if let Some(secret) = &config.captcha_secret {
            runtime = runtime.with_captcha(Arc::new(HttpCaptchaVerifier::new(
                secret.clone(),
                config.captcha_verify_url.clone(),
            )?));
        }

        let workspaces = Arc::new(WorkspaceService::new(
            Arc::clone(&persistence),
            Arc::clone(&cache),
            Arc::clone(&recorder),
            &config.retention,
        ));
        let auth = Arc::new(AuthService::new(
            Arc::clone(&persistence),
            Arc::clone(&recorder),
            config.jwt_secret.clone(),
        ));
        let secrets = Arc::new(SecretService::new(
            Arc::clone(&persistence),
            Arc::clone(&encryptor),
            Arc::clone(&recorder),
        ));

        let tenant = match (tenant_admin, config.tenant_db.clone()) {
            (Some(admin), Some(tenant_config)) => Some(TenantServices {
                databases: Arc::new(TenantDbService::new(
                    Arc::clone(&persistence),
                    Arc::clone(&admin),
                    Arc::clone(&encryptor),
                    Arc::clone(&recorder),
                    tenant_config,
                )),
                roles: Arc::new(DbRoleService::new(
                    Arc::clone(&persistence),
                    Arc::clone(&admin),
                    Arc::clone(&encryptor),
                    Arc::clone(&recorder),
                )),
                admin,
            }),
            _ => None,
        };

        info!(
            storage = ?config.storage,
            channels = ?notifier.channel_names(),
            tenant_db = tenant.is_some(),
            jwt = config.jwt_secret.is_some(),
            "Backplane services wired"
        );

        Ok(Self {
            runtime: Arc::new(runtime),
            config,
            persistence,
            encryptor,
            recorder,
            cache,
            billing,
            executions,
            workspaces,
            webhooks,
            notifier,
            auth,
            secrets,
            tenant,
            shutdown,
        })
    }

    /// Token cancelled by [`AppContext::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts the retention and connector health workers.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        let mut retention = RetentionWorker::new(
            Arc::clone(&self.persistence),
            self.config.retention.clone(),
            self.shutdown.child_token(),
        );
        if let Some(tenant) = &self.tenant {
            retention = retention.with_tenant_admin(Arc::clone(&tenant.admin));
        }
        let health = ConnectorHealthWorker::new(
            Arc::clone(&self.persistence),
            Arc::clone(&self.recorder),
            self.config.connector_health.clone(),
            self.shutdown.child_token(),
        );
        vec![
            tokio::spawn(async move { retention.run().await }),
            tokio::spawn(async move { health.run().await }),
        ]
    }

    /// Records startup.
    pub async fn announce_startup(&self) {
        let _ = self
            .recorder
            .record_system_event(types::SYSTEM_STARTUP, "backplane started", None)
            .await;
    }

    /// Cancels workers and in-flight work, then drains queued events.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.recorder.close().await;
        info!("Backplane services stopped");
    }
}
