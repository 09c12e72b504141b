//! Lookup Permissions
//!
//! Access to the identity ↔ base URI relations that decide what an identity
//! may search or register.
//!
//! Three implementations of [`PermissionStore`] are provided:
//! - [`PermissionIndex`]: in-memory bidirectional index
//! - [`SqlitePermissionStore`]: persistent relations in SQLite
//! - [`CachedPermissionStore`]: TTL cache wrapping any other store
//!
//! Relations are only ever changed through [`PermissionStore::grant`] and
//! [`PermissionStore::revoke`], which update both directions of the relation
//! together.

use async_trait::async_trait;
use lookup_core::{
    BaseUriRecord, Capability, IdentityRecord, LookupError, ResolvedPermissions, Result,
};
use tracing::warn;

mod cache;
mod index;
mod sqlite;

pub use cache::CachedPermissionStore;
pub use index::PermissionIndex;
pub use sqlite::SqlitePermissionStore;

/// Convenience alias for trait objects.
pub type DynPermissionStore = dyn PermissionStore;

/// Read and relation-management access to permission records.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Resolve the permissions of an identity.
    ///
    /// Fails with `LookupError::NotFound` for unknown identities.
    async fn resolve(&self, username: &str) -> Result<ResolvedPermissions>;

    /// Add one (identity, base URI) tuple to the `capability` relation.
    ///
    /// Returns `false` if the tuple was already present.
    async fn grant(&self, username: &str, base_uri: &str, capability: Capability) -> Result<bool>;

    /// Remove one (identity, base URI) tuple from the `capability` relation.
    ///
    /// Returns `false` if the tuple was absent.
    async fn revoke(&self, username: &str, base_uri: &str, capability: Capability)
        -> Result<bool>;

    /// Create an identity, or update the admin flag of an existing one.
    async fn register_identity(&self, username: &str, is_admin: bool) -> Result<()>;

    /// Create a base URI. Registering an existing base URI is a no-op.
    async fn register_base_uri(&self, base_uri: &str) -> Result<()>;

    async fn identity_record(&self, username: &str) -> Result<IdentityRecord> {
        self.resolve(username).await.map(IdentityRecord::from)
    }

    async fn base_uri_record(&self, base_uri: &str) -> Result<BaseUriRecord>;

    /// All identities, sorted by username.
    async fn list_identities(&self) -> Result<Vec<IdentityRecord>>;

    /// All base URIs, sorted.
    async fn list_base_uris(&self) -> Result<Vec<BaseUriRecord>>;
}

/// Resolve permissions, treating an unknown identity as one without any.
///
/// Only `NotFound` is mapped; every other failure propagates so a broken
/// store is never mistaken for an empty permission set.
pub async fn resolve_or_empty<S>(store: &S, username: &str) -> Result<ResolvedPermissions>
where
    S: PermissionStore + ?Sized,
{
    match store.resolve(username).await {
        Ok(permissions) => Ok(permissions),
        Err(LookupError::NotFound(_)) => {
            warn!(username = %username, "Unknown identity, resolving to empty permissions");
            Ok(ResolvedPermissions::none(username))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_or_empty_unknown_identity() {
        let store = PermissionIndex::new();
        let perms = resolve_or_empty(&store, "ghost").await.unwrap();

        assert_eq!(perms, ResolvedPermissions::none("ghost"));
    }

    #[tokio::test]
    async fn test_resolve_or_empty_through_trait_object() {
        let store = PermissionIndex::new();
        store.register_identity("alice", false).await.unwrap();
        store.register_base_uri("s3://a").await.unwrap();
        store
            .grant("alice", "s3://a", Capability::Search)
            .await
            .unwrap();

        let dyn_store: &DynPermissionStore = &store;
        let perms = resolve_or_empty(dyn_store, "alice").await.unwrap();
        assert!(perms.search_base_uris.contains("s3://a"));
    }

    struct BrokenStore;

    #[async_trait]
    impl PermissionStore for BrokenStore {
        async fn resolve(&self, _username: &str) -> Result<ResolvedPermissions> {
            Err(LookupError::Other("connection refused".to_string()))
        }
        async fn grant(&self, _: &str, _: &str, _: Capability) -> Result<bool> {
            unreachable!()
        }
        async fn revoke(&self, _: &str, _: &str, _: Capability) -> Result<bool> {
            unreachable!()
        }
        async fn register_identity(&self, _: &str, _: bool) -> Result<()> {
            unreachable!()
        }
        async fn register_base_uri(&self, _: &str) -> Result<()> {
            unreachable!()
        }
        async fn base_uri_record(&self, _: &str) -> Result<BaseUriRecord> {
            unreachable!()
        }
        async fn list_identities(&self) -> Result<Vec<IdentityRecord>> {
            unreachable!()
        }
        async fn list_base_uris(&self) -> Result<Vec<BaseUriRecord>> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_resolve_or_empty_propagates_store_failure() {
        let err = resolve_or_empty(&BrokenStore, "alice").await.unwrap_err();
        assert!(matches!(err, LookupError::Other(_)));
    }
}
