//! TTL cache in front of a permission store.
//!
//! ## Cache Invalidation
//!
//! - **TTL expiration**: entries older than the TTL are resolved again
//! - **Write invalidation**: grant, revoke and identity registration evict the
//!   affected identity before returning
//! - **Epoch guard**: a resolve that raced with a mutation does not repopulate
//!   the cache with the value it read before the mutation

use crate::PermissionStore;
use async_trait::async_trait;
use dashmap::DashMap;
use lookup_core::{BaseUriRecord, Capability, IdentityRecord, ResolvedPermissions, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    permissions: ResolvedPermissions,
    cached_at: Instant,
}

/// Caches resolved permissions per identity for a bounded time.
///
/// A TTL of zero disables caching; every call is then forwarded.
#[derive(Debug)]
pub struct CachedPermissionStore<S> {
    inner: S,
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    /// Bumped on every invalidation
    epoch: AtomicU64,
}

impl<S: PermissionStore> CachedPermissionStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            entries: DashMap::new(),
            ttl,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of cached identities, including expired entries not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict one identity.
    pub fn invalidate(&self, username: &str) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if self.entries.remove(username).is_some() {
            debug!(username = %username, "Invalidated cached permissions");
        }
    }

    /// Evict every identity.
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
    }

    fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    fn cached(&self, username: &str) -> Option<ResolvedPermissions> {
        let entry = self.entries.get(username)?;
        if entry.cached_at.elapsed() < self.ttl {
            Some(entry.permissions.clone())
        } else {
            None
        }
    }
}

#[async_trait]
impl<S: PermissionStore> PermissionStore for CachedPermissionStore<S> {
    async fn resolve(&self, username: &str) -> Result<ResolvedPermissions> {
        if !self.enabled() {
            return self.inner.resolve(username).await;
        }

        if let Some(permissions) = self.cached(username) {
            debug!(username = %username, "Permission cache hit");
            return Ok(permissions);
        }

        debug!(username = %username, "Permission cache miss");
        let epoch = self.epoch.load(Ordering::SeqCst);
        let permissions = self.inner.resolve(username).await?;

        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.entries.insert(
                username.to_string(),
                CacheEntry {
                    permissions: permissions.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        Ok(permissions)
    }

    async fn grant(&self, username: &str, base_uri: &str, capability: Capability) -> Result<bool> {
        let result = self.inner.grant(username, base_uri, capability).await;
        self.invalidate(username);
        result
    }

    async fn revoke(
        &self,
        username: &str,
        base_uri: &str,
        capability: Capability,
    ) -> Result<bool> {
        let result = self.inner.revoke(username, base_uri, capability).await;
        self.invalidate(username);
        result
    }

    async fn register_identity(&self, username: &str, is_admin: bool) -> Result<()> {
        let result = self.inner.register_identity(username, is_admin).await;
        self.invalidate(username);
        result
    }

    async fn register_base_uri(&self, base_uri: &str) -> Result<()> {
        self.inner.register_base_uri(base_uri).await
    }

    async fn base_uri_record(&self, base_uri: &str) -> Result<BaseUriRecord> {
        self.inner.base_uri_record(base_uri).await
    }

    async fn list_identities(&self) -> Result<Vec<IdentityRecord>> {
        self.inner.list_identities().await
    }

    async fn list_base_uris(&self) -> Result<Vec<BaseUriRecord>> {
        self.inner.list_base_uris().await
    }
}
