//! In-memory bidirectional permission index.

use crate::PermissionStore;
use async_trait::async_trait;
use lookup_core::validation::{validate_base_uri, validate_username};
use lookup_core::{
    BaseUriRecord, Capability, IdentityRecord, LookupError, ResolvedPermissions, Result,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// One capability relation, stored from both sides.
#[derive(Debug, Default)]
struct Relation {
    by_identity: BTreeMap<String, BTreeSet<String>>,
    by_base_uri: BTreeMap<String, BTreeSet<String>>,
}

impl Relation {
    fn insert(&mut self, username: &str, base_uri: &str) -> bool {
        let added = self
            .by_identity
            .entry(username.to_string())
            .or_default()
            .insert(base_uri.to_string());
        self.by_base_uri
            .entry(base_uri.to_string())
            .or_default()
            .insert(username.to_string());
        added
    }

    fn remove(&mut self, username: &str, base_uri: &str) -> bool {
        let removed = self
            .by_identity
            .get_mut(username)
            .map(|uris| uris.remove(base_uri))
            .unwrap_or(false);
        if let Some(users) = self.by_base_uri.get_mut(base_uri) {
            users.remove(username);
        }
        removed
    }

    fn base_uris_of(&self, username: &str) -> BTreeSet<String> {
        self.by_identity.get(username).cloned().unwrap_or_default()
    }

    fn identities_on(&self, base_uri: &str) -> Vec<String> {
        self.by_base_uri
            .get(base_uri)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct IndexState {
    /// username -> is_admin
    identities: BTreeMap<String, bool>,
    base_uris: BTreeSet<String>,
    search: Relation,
    register: Relation,
}

impl IndexState {
    fn relation_mut(&mut self, capability: Capability) -> &mut Relation {
        match capability {
            Capability::Search => &mut self.search,
            Capability::Register => &mut self.register,
        }
    }

    fn ensure_tuple_entities(&self, username: &str, base_uri: &str) -> Result<()> {
        if !self.identities.contains_key(username) {
            return Err(LookupError::NotFound(format!("identity '{}'", username)));
        }
        if !self.base_uris.contains(base_uri) {
            return Err(LookupError::NotFound(format!("base URI '{}'", base_uri)));
        }
        Ok(())
    }

    fn resolve(&self, username: &str) -> Result<ResolvedPermissions> {
        let is_admin = *self
            .identities
            .get(username)
            .ok_or_else(|| LookupError::NotFound(format!("identity '{}'", username)))?;

        Ok(ResolvedPermissions {
            username: username.to_string(),
            is_admin,
            search_base_uris: self.search.base_uris_of(username),
            register_base_uris: self.register.base_uris_of(username),
        })
    }

    fn base_uri_record(&self, base_uri: &str) -> Result<BaseUriRecord> {
        if !self.base_uris.contains(base_uri) {
            return Err(LookupError::NotFound(format!("base URI '{}'", base_uri)));
        }

        Ok(BaseUriRecord {
            base_uri: base_uri.to_string(),
            users_with_search_permissions: self.search.identities_on(base_uri),
            users_with_register_permissions: self.register.identities_on(base_uri),
        })
    }
}

/// Bidirectional identity ↔ base URI index.
///
/// Both directions of every relation live behind one lock, so a grant or
/// revoke is visible from either side at the same instant. Concurrent grant
/// and revoke of the same tuple resolve last-writer-wins.
#[derive(Debug, Default)]
pub struct PermissionIndex {
    state: RwLock<IndexState>,
}

impl PermissionIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PermissionStore for PermissionIndex {
    async fn resolve(&self, username: &str) -> Result<ResolvedPermissions> {
        self.state.read().resolve(username)
    }

    async fn grant(&self, username: &str, base_uri: &str, capability: Capability) -> Result<bool> {
        let mut state = self.state.write();
        state.ensure_tuple_entities(username, base_uri)?;
        let changed = state.relation_mut(capability).insert(username, base_uri);

        if changed {
            info!(
                username = %username,
                base_uri = %base_uri,
                capability = %capability,
                "Granted permission"
            );
        }
        Ok(changed)
    }

    async fn revoke(
        &self,
        username: &str,
        base_uri: &str,
        capability: Capability,
    ) -> Result<bool> {
        let mut state = self.state.write();
        state.ensure_tuple_entities(username, base_uri)?;
        let changed = state.relation_mut(capability).remove(username, base_uri);

        if changed {
            info!(
                username = %username,
                base_uri = %base_uri,
                capability = %capability,
                "Revoked permission"
            );
        }
        Ok(changed)
    }

    async fn register_identity(&self, username: &str, is_admin: bool) -> Result<()> {
        validate_username(username)?;
        self.state
            .write()
            .identities
            .insert(username.to_string(), is_admin);
        Ok(())
    }

    async fn register_base_uri(&self, base_uri: &str) -> Result<()> {
        validate_base_uri(base_uri)?;
        self.state.write().base_uris.insert(base_uri.to_string());
        Ok(())
    }

    async fn base_uri_record(&self, base_uri: &str) -> Result<BaseUriRecord> {
        self.state.read().base_uri_record(base_uri)
    }

    async fn list_identities(&self) -> Result<Vec<IdentityRecord>> {
        let state = self.state.read();
        state
            .identities
            .keys()
            .map(|username| state.resolve(username).map(IdentityRecord::from))
            .collect()
    }

    async fn list_base_uris(&self) -> Result<Vec<BaseUriRecord>> {
        let state = self.state.read();
        state
            .base_uris
            .iter()
            .map(|base_uri| state.base_uri_record(base_uri))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> PermissionIndex {
        let index = PermissionIndex::new();
        index.register_identity("alice", false).await.unwrap();
        index.register_identity("root", true).await.unwrap();
        index.register_base_uri("s3://a").await.unwrap();
        index.register_base_uri("s3://b").await.unwrap();
        index
    }

    #[tokio::test]
    async fn test_grant_updates_both_sides() {
        let index = seeded().await;
        assert!(index
            .grant("alice", "s3://a", Capability::Search)
            .await
            .unwrap());

        let perms = index.resolve("alice").await.unwrap();
        assert!(perms.search_base_uris.contains("s3://a"));
        assert!(perms.register_base_uris.is_empty());

        let record = index.base_uri_record("s3://a").await.unwrap();
        assert_eq!(record.users_with_search_permissions, vec!["alice"]);
        assert!(record.users_with_register_permissions.is_empty());
    }

    #[tokio::test]
    async fn test_grant_and_revoke_are_idempotent() {
        let index = seeded().await;
        assert!(index
            .grant("alice", "s3://a", Capability::Register)
            .await
            .unwrap());
        assert!(!index
            .grant("alice", "s3://a", Capability::Register)
            .await
            .unwrap());

        assert!(index
            .revoke("alice", "s3://a", Capability::Register)
            .await
            .unwrap());
        assert!(!index
            .revoke("alice", "s3://a", Capability::Register)
            .await
            .unwrap());

        let record = index.base_uri_record("s3://a").await.unwrap();
        assert!(record.users_with_register_permissions.is_empty());
    }

    #[tokio::test]
    async fn test_grant_requires_registered_entities() {
        let index = seeded().await;

        let err = index
            .grant("mallory", "s3://a", Capability::Search)
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::NotFound(_)));

        let err = index
            .grant("alice", "s3://nowhere", Capability::Search)
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_register_identity_updates_admin_flag() {
        let index = seeded().await;
        assert!(!index.resolve("alice").await.unwrap().is_admin);

        index.register_identity("alice", true).await.unwrap();
        assert!(index.resolve("alice").await.unwrap().is_admin);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_input() {
        let index = PermissionIndex::new();
        assert!(matches!(
            index.register_identity("", false).await,
            Err(LookupError::ValidationError(_))
        ));
        assert!(matches!(
            index.register_base_uri("s3").await,
            Err(LookupError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_listings_are_sorted() {
        let index = seeded().await;
        index
            .grant("root", "s3://b", Capability::Search)
            .await
            .unwrap();
        index
            .grant("alice", "s3://b", Capability::Search)
            .await
            .unwrap();

        let identities = index.list_identities().await.unwrap();
        let names: Vec<_> = identities.iter().map(|r| r.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "root"]);
        assert!(identities[1].is_admin);

        let base_uris = index.list_base_uris().await.unwrap();
        assert_eq!(base_uris.len(), 2);
        assert_eq!(base_uris[1].base_uri, "s3://b");
        assert_eq!(
            base_uris[1].users_with_search_permissions,
            vec!["alice", "root"]
        );
    }
}
