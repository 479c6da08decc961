// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Maps a slug or a bound host onto a serving workspace.

use std::sync::Arc;

use tracing::debug;

use crate::cache::RuntimeCache;
use crate::error::{CoreError, Result};
use crate::model::AppStatus;
use crate::persistence::{Persistence, WorkspaceRecord};

/// Longest slug accepted.
pub const MAX_SLUG_LEN: usize = 100;

/// Alias status that still resolves.
pub const ALIAS_ACTIVE: &str = "active";

/// Lowercases, keeps the first comma-separated entry, strips the port and a
/// trailing dot.
pub fn normalize_host(raw: &str) -> Result<String> {
    let first = raw.split(',').next().unwrap_or_default().trim().to_lowercase();
    let host = if let Some(rest) = first.strip_prefix('[') {
        // [v6]:port
        rest.split(']').next().unwrap_or_default().to_string()
    } else if first.matches(':').count() == 1 {
        first.split(':').next().unwrap_or_default().to_string()
    } else {
        first
    };
    let host = host.trim().trim_end_matches('.').to_string();
    if host.is_empty() {
        return Err(CoreError::InvalidDomain);
    }
    Ok(host)
}

/// Trims and lowercases a slug; only `[a-z0-9-]` is allowed.
pub fn normalize_slug(raw: &str) -> Result<String> {
    let slug = raw.trim().to_lowercase();
    let valid = !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(CoreError::InvalidSlug);
    }
    Ok(slug)
}

fn ensure_serving(workspace: WorkspaceRecord) -> Result<WorkspaceRecord> {
    if workspace.deleted_at.is_some() {
        return Err(CoreError::WorkspaceNotFound);
    }
    if !AppStatus::parse(&workspace.app_status).is_serving() {
        return Err(CoreError::NotPublished);
    }
    Ok(workspace)
}

/// Workspace resolution over the runtime cache.
pub struct Resolver {
    persistence: Arc<dyn Persistence>,
    cache: Arc<RuntimeCache>,
    base_hosts: Vec<String>,
}

impl Resolver {
    /// `base_hosts` are platform domains whose first label is a slug
    /// (`demo.apps.example.com` resolves slug `demo`).
    pub fn new(
        persistence: Arc<dyn Persistence>,
        cache: Arc<RuntimeCache>,
        base_hosts: Vec<String>,
    ) -> Self {
        let base_hosts = base_hosts
            .iter()
            .filter_map(|h| normalize_host(h).ok())
            .collect();
        Self {
            persistence,
            cache,
            base_hosts,
        }
    }

    /// Current slug first, then active aliases. Retired aliases are not found.
    pub async fn resolve_by_slug(&self, raw: &str) -> Result<WorkspaceRecord> {
        let slug = normalize_slug(raw)?;
        if let Some(ws) = self.cache.workspace_by_slug(&self.persistence, &slug).await? {
            return ensure_serving(ws);
        }

        let alias = self
            .persistence
            .get_slug_alias(&slug)
            .await?
            .filter(|a| a.status == ALIAS_ACTIVE)
            .ok_or(CoreError::WorkspaceNotFound)?;
        let ws = self
            .cache
            .workspace_by_id(&self.persistence, alias.workspace_id)
            .await?
            .ok_or(CoreError::WorkspaceNotFound)?;
        debug!(alias = %slug, workspace_id = %ws.id, "Resolved workspace through slug alias");
        self.cache.remember_alias(&slug, &ws);
        ensure_serving(ws)
    }

    /// Custom domain binding, or a subdomain of a platform base host.
    pub async fn resolve_by_host(&self, raw: &str) -> Result<WorkspaceRecord> {
        let host = normalize_host(raw)?;
        if let Some(slug) = self.platform_subdomain(&host) {
            return self.resolve_by_slug(slug).await;
        }

        let domain = self
            .cache
            .domain_by_host(&self.persistence, &host)
            .await?
            .ok_or_else(|| CoreError::DomainNotFound(host.clone()))?;
        match domain.status.as_str() {
            "blocked" => return Err(CoreError::DomainBlocked(host)),
            "active" => {}
            _ => return Err(CoreError::DomainNotActive(host)),
        }
        let ws = self
            .cache
            .workspace_by_id(&self.persistence, domain.workspace_id)
            .await?
            .ok_or(CoreError::WorkspaceNotFound)?;
        ensure_serving(ws)
    }

    fn platform_subdomain<'h>(&self, host: &'h str) -> Option<&'h str> {
        self.base_hosts.iter().find_map(|base| {
            let label = host.strip_suffix(base.as_str())?.strip_suffix('.')?;
            (!label.is_empty() && !label.contains('.')).then_some(label)
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::cache::CacheConfig;
    use crate::persistence::{DomainRecord, MemoryPersistence, SlugAliasRecord};
    use crate::runtime::test_support::published_workspace;

    fn resolver(store: Arc<MemoryPersistence>) -> Resolver {
        Resolver::new(
            store,
            Arc::new(RuntimeCache::new(&CacheConfig::default())),
            vec!["Apps.Example.com".into()],
        )
    }

    fn domain(ws: Uuid, host: &str, status: &str) -> DomainRecord {
        let now = Utc::now();
        DomainRecord {
            id: Uuid::new_v4(),
            workspace_id: ws,
            domain: host.into(),
            status: status.into(),
            ssl_status: "pending".into(),
            verification_attempts: 0,
            last_verified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Shop.Example.COM:8443").unwrap(), "shop.example.com");
        assert_eq!(normalize_host("a.example.com., b.example.com").unwrap(), "a.example.com");
        assert_eq!(normalize_host("[::1]:80").unwrap(), "::1");
        assert_eq!(normalize_host(" : ").unwrap_err(), CoreError::InvalidDomain);
    }

    #[test]
    fn test_normalize_slug() {
        assert_eq!(normalize_slug("  Demo-1 ").unwrap(), "demo-1");
        assert!(normalize_slug("").is_err());
        assert!(normalize_slug("no/slash").is_err());
        assert!(normalize_slug(&"a".repeat(MAX_SLUG_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn test_slug_and_alias_resolution() {
        let store = Arc::new(MemoryPersistence::new());
        let ws = published_workspace("demo");
        store.create_workspace(&ws).await.unwrap();
        for (slug, status) in [("old-demo", "active"), ("older-demo", "retired")] {
            store
                .create_slug_alias(&SlugAliasRecord {
                    slug: slug.into(),
                    workspace_id: ws.id,
                    status: status.into(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let resolver = resolver(store);

        assert_eq!(resolver.resolve_by_slug("demo").await.unwrap().id, ws.id);
        assert_eq!(resolver.resolve_by_slug("old-demo").await.unwrap().id, ws.id);
        assert_eq!(
            resolver.resolve_by_slug("older-demo").await.unwrap_err(),
            CoreError::WorkspaceNotFound
        );
        assert_eq!(
            resolver.resolve_by_slug("nope").await.unwrap_err(),
            CoreError::WorkspaceNotFound
        );
    }

    #[tokio::test]
    async fn test_unpublished_workspace_is_refused() {
        let store = Arc::new(MemoryPersistence::new());
        let mut ws = published_workspace("draft-app");
        ws.app_status = "draft".into();
        store.create_workspace(&ws).await.unwrap();
        let resolver = resolver(store);
        assert_eq!(
            resolver.resolve_by_slug("draft-app").await.unwrap_err(),
            CoreError::NotPublished
        );
    }

    #[tokio::test]
    async fn test_host_resolution() {
        let store = Arc::new(MemoryPersistence::new());
        let ws = published_workspace("demo");
        store.create_workspace(&ws).await.unwrap();
        store.create_domain(&domain(ws.id, "shop.example.com", "active")).await.unwrap();
        store.create_domain(&domain(ws.id, "new.example.com", "pending")).await.unwrap();
        store.create_domain(&domain(ws.id, "bad.example.com", "blocked")).await.unwrap();
        let resolver = resolver(store);

        assert_eq!(resolver.resolve_by_host("SHOP.example.com:443").await.unwrap().id, ws.id);
        assert_eq!(resolver.resolve_by_host("demo.apps.example.com").await.unwrap().id, ws.id);
        let codes = [
            ("new.example.com", "DOMAIN_NOT_ACTIVE"),
            ("bad.example.com", "DOMAIN_BLOCKED"),
            ("missing.example.com", "DOMAIN_NOT_FOUND"),
            ("", "INVALID_DOMAIN"),
        ];
        for (host, code) in codes {
            let err = resolver.resolve_by_host(host).await.unwrap_err();
            assert_eq!(err.error_code(), code, "{host}");
        }
    }
}
