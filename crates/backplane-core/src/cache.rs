// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime lookup cache.
//!
//! Bounded TTL maps for workspace-by-id, workspace-by-slug, version-by-id and
//! domain-by-host. Misses are remembered for a shorter negative TTL. Concurrent
//! loads of one key share a single in-flight future.
//!
//! With caching disabled every call goes straight to the loader.

use std::env;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::persistence::{DomainRecord, Persistence, VersionRecord, WorkspaceRecord};

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether lookups are cached and coalesced.
    pub enabled: bool,
    /// Lifetime of workspace and domain hits.
    pub entry_ttl: Duration,
    /// Lifetime of version hits.
    pub version_ttl: Duration,
    /// Lifetime of remembered misses.
    pub negative_ttl: Duration,
    /// Entries per map before eviction.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            entry_ttl: Duration::from_secs(30),
            version_ttl: Duration::from_secs(60),
            negative_ttl: Duration::from_secs(10),
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    /// Reads `BACKPLANE_CACHE_ENABLED`, `BACKPLANE_CACHE_ENTRY_TTL_SECS`,
    /// `BACKPLANE_CACHE_VERSION_TTL_SECS`, `BACKPLANE_CACHE_NEGATIVE_TTL_SECS`
    /// and `BACKPLANE_CACHE_MAX_ENTRIES`. Unparseable values keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        Self {
            enabled: env::var("BACKPLANE_CACHE_ENABLED")
                .map(|v| !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "off" | "no"))
                .unwrap_or(defaults.enabled),
            entry_ttl: secs("BACKPLANE_CACHE_ENTRY_TTL_SECS", defaults.entry_ttl),
            version_ttl: secs("BACKPLANE_CACHE_VERSION_TTL_SECS", defaults.version_ttl),
            negative_ttl: secs("BACKPLANE_CACHE_NEGATIVE_TTL_SECS", defaults.negative_ttl),
            max_entries: env::var("BACKPLANE_CACHE_MAX_ENTRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_entries),
        }
    }
}

#[derive(Clone)]
struct Entry<V> {
    value: Option<V>,
    fetched_at: Instant,
}

type Pending<V> = Shared<BoxFuture<'static, Result<Option<V>>>>;

/// TTL map with negative caching and single-flight loads.
pub struct TtlCache<K, V> {
    name: &'static str,
    enabled: bool,
    ttl: Duration,
    negative_ttl: Duration,
    max_entries: usize,
    entries: DashMap<K, Entry<V>>,
    inflight: DashMap<K, Pending<V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache for one lookup.
    pub fn new(name: &'static str, config: &CacheConfig, ttl: Duration) -> Self {
        Self {
            name,
            enabled: config.enabled,
            ttl,
            negative_ttl: config.negative_ttl,
            max_entries: config.max_entries.max(1),
            entries: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    /// Fresh cached state: `Some(Some(v))` hit, `Some(None)` remembered miss,
    /// `None` unknown.
    pub fn peek(&self, key: &K) -> Option<Option<V>> {
        if !self.enabled {
            return None;
        }
        let expired = {
            let entry = self.entries.get(key)?;
            let ttl = if entry.value.is_some() {
                self.ttl
            } else {
                self.negative_ttl
            };
            if entry.fetched_at.elapsed() < ttl {
                return Some(entry.value.clone());
            }
            true
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Stores a hit (or a miss when `value` is `None`).
    pub fn put(&self, key: K, value: Option<V>) {
        if !self.enabled {
            return;
        }
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.evict();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drops one key.
    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Drops everything.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&self) {
        let now = Instant::now();
        let (ttl, neg) = (self.ttl, self.negative_ttl);
        self.entries.retain(|_, e| {
            let limit = if e.value.is_some() { ttl } else { neg };
            now.duration_since(e.fetched_at) < limit
        });
        if self.entries.len() < self.max_entries {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.fetched_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            debug!(cache = self.name, key = ?key, "Evicted oldest entry");
            self.entries.remove(&key);
        }
    }

    /// Returns the cached value or runs `load` once for all concurrent callers.
    ///
    /// Loader errors are returned to every waiter and are not cached.
    pub async fn get_or_load<F, Fut>(&self, key: K, load: F) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>> + Send + 'static,
    {
        if !self.enabled {
            return load().await;
        }
        if let Some(cached) = self.peek(&key) {
            return Ok(cached);
        }

        let pending = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| load().boxed().shared())
            .clone();
        let result = pending.clone().await;

        self.inflight
            .remove_if(&key, |_, current| current.ptr_eq(&pending));
        if let Ok(value) = &result {
            self.put(key, value.clone());
        }
        result
    }
}

/// The runtime's lookup caches.
pub struct RuntimeCache {
    /// Workspace by id.
    pub workspaces_by_id: TtlCache<Uuid, WorkspaceRecord>,
    /// Workspace by (normalized) slug, aliases included.
    pub workspaces_by_slug: TtlCache<String, WorkspaceRecord>,
    /// Version by id.
    pub versions: TtlCache<Uuid, VersionRecord>,
    /// Domain binding by normalized host.
    pub domains: TtlCache<String, DomainRecord>,
}

impl RuntimeCache {
    /// Creates all maps from one config.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            workspaces_by_id: TtlCache::new("workspace_by_id", config, config.entry_ttl),
            workspaces_by_slug: TtlCache::new("workspace_by_slug", config, config.entry_ttl),
            versions: TtlCache::new("version_by_id", config, config.version_ttl),
            domains: TtlCache::new("domain_by_host", config, config.entry_ttl),
        }
    }

    /// Workspace by id; soft-deleted rows count as missing.
    pub async fn workspace_by_id(
        &self,
        store: &Arc<dyn Persistence>,
        id: Uuid,
    ) -> Result<Option<WorkspaceRecord>> {
        let store = Arc::clone(store);
        let found = self
            .workspaces_by_id
            .get_or_load(id, move || async move {
                let ws = store.get_workspace(id).await.map_err(CoreError::from)?;
                Ok(ws.filter(|w| w.deleted_at.is_none()))
            })
            .await?;
        if let Some(ws) = &found {
            self.workspaces_by_slug.put(ws.slug.clone(), Some(ws.clone()));
        }
        Ok(found)
    }

    /// Workspace by its current slug (no alias fallback).
    pub async fn workspace_by_slug(
        &self,
        store: &Arc<dyn Persistence>,
        slug: &str,
    ) -> Result<Option<WorkspaceRecord>> {
        let store = Arc::clone(store);
        let key = slug.to_string();
        let found = self
            .workspaces_by_slug
            .get_or_load(key.clone(), move || async move {
                Ok(store.get_workspace_by_slug(&key).await?)
            })
            .await?;
        if let Some(ws) = &found {
            self.workspaces_by_id.put(ws.id, Some(ws.clone()));
        }
        Ok(found)
    }

    /// Remembers that `slug` (an alias) resolves to `workspace`.
    pub fn remember_alias(&self, slug: &str, workspace: &WorkspaceRecord) {
        self.workspaces_by_slug
            .put(slug.to_string(), Some(workspace.clone()));
        self.workspaces_by_id
            .put(workspace.id, Some(workspace.clone()));
    }

    /// Version by id.
    pub async fn version_by_id(
        &self,
        store: &Arc<dyn Persistence>,
        id: Uuid,
    ) -> Result<Option<VersionRecord>> {
        let store = Arc::clone(store);
        self.versions
            .get_or_load(id, move || async move { Ok(store.get_version(id).await?) })
            .await
    }

    /// Domain binding by normalized host.
    pub async fn domain_by_host(
        &self,
        store: &Arc<dyn Persistence>,
        host: &str,
    ) -> Result<Option<DomainRecord>> {
        let store = Arc::clone(store);
        let key = host.to_string();
        self.domains
            .get_or_load(key.clone(), move || async move {
                Ok(store.get_domain_by_host(&key).await?)
            })
            .await
    }

    /// Drops a workspace from both workspace maps. Alias entries expire on TTL.
    pub fn invalidate_workspace(&self, workspace: &WorkspaceRecord) {
        self.workspaces_by_id.invalidate(&workspace.id);
        self.workspaces_by_slug.invalidate(&workspace.slug);
    }

    /// Drops a slug, e.g. after an alias is retired.
    pub fn invalidate_slug(&self, slug: &str) {
        self.workspaces_by_slug.invalidate(&slug.to_string());
    }

    /// Drops a version.
    pub fn invalidate_version(&self, id: Uuid) {
        self.versions.invalidate(&id);
    }

    /// Drops a domain binding.
    pub fn invalidate_domain(&self, host: &str) {
        self.domains.invalidate(&host.to_string());
    }

    /// Drops everything.
    pub fn clear(&self) {
        self.workspaces_by_id.clear();
        self.workspaces_by_slug.clear();
        self.versions.clear();
        self.domains.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn cache(enabled: bool) -> TtlCache<String, u32> {
        let config = CacheConfig {
            enabled,
            max_entries: 2,
            ..Default::default()
        };
        TtlCache::new("test", &config, Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_coalesces_concurrent_loads() {
        let cache = Arc::new(cache(true));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("k".to_string(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Some(7))
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), Some(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_entries_expire_sooner() {
        let cache = cache(true);
        cache.put("missing".into(), None);
        cache.put("present".into(), Some(1));
        assert_eq!(cache.peek(&"missing".into()), Some(None));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.peek(&"missing".into()), None);
        assert_eq!(cache.peek(&"present".into()), Some(Some(1)));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(cache.peek(&"present".into()), None);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_loads() {
        let cache = cache(false);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            cache
                .get_or_load("k".into(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(1))
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = cache(true);
        let err = cache
            .get_or_load("k".into(), || async { Err(CoreError::Storage("down".into())) })
            .await;
        assert!(err.is_err());
        assert_eq!(cache.peek(&"k".into()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let cache = cache(true);
        cache.put("a".into(), Some(1));
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.put("b".into(), Some(2));
        cache.put("c".into(), Some(3));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.peek(&"a".into()), None);
        assert_eq!(cache.peek(&"c".into()), Some(Some(3)));
    }
}
