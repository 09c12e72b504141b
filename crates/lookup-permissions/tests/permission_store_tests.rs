//! Permission Store Integration Tests
//!
//! Behavior shared by every permission store implementation: the in-memory
//! index, SQLite, and the TTL cache in front of either.
//!
//! Run with: `cargo test -p lookup-permissions --test permission_store_tests`

use lookup_core::{Capability, LookupError};
use lookup_permissions::{
    resolve_or_empty, CachedPermissionStore, PermissionIndex, PermissionStore,
    SqlitePermissionStore,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

// ============================================================================
// Shared Checks
// ============================================================================

async fn seed<S: PermissionStore + ?Sized>(store: &S) {
    store.register_identity("alice", false).await.unwrap();
    store.register_identity("bob", false).await.unwrap();
    store.register_identity("root", true).await.unwrap();
    for uri in ["s3://a", "s3://b", "azure://c"] {
        store.register_base_uri(uri).await.unwrap();
    }
}

async fn check_grant_then_revoke<S: PermissionStore + ?Sized>(store: &S) {
    seed(store).await;

    assert!(store
        .grant("alice", "s3://a", Capability::Search)
        .await
        .unwrap());
    store
        .grant("bob", "s3://a", Capability::Search)
        .await
        .unwrap();
    store
        .grant("alice", "azure://c", Capability::Register)
        .await
        .unwrap();

    let alice = store.identity_record("alice").await.unwrap();
    assert_eq!(alice.search_permissions_on_base_uris, vec!["s3://a"]);
    assert_eq!(alice.register_permissions_on_base_uris, vec!["azure://c"]);

    let a = store.base_uri_record("s3://a").await.unwrap();
    assert_eq!(a.users_with_search_permissions, vec!["alice", "bob"]);
    assert!(a.users_with_register_permissions.is_empty());

    assert!(store
        .revoke("alice", "s3://a", Capability::Search)
        .await
        .unwrap());

    let alice = store.resolve("alice").await.unwrap();
    assert!(!alice.search_base_uris.contains("s3://a"));
    assert!(alice.register_base_uris.contains("azure://c"));

    let a = store.base_uri_record("s3://a").await.unwrap();
    assert_eq!(a.users_with_search_permissions, vec!["bob"]);

    // Search and register are independent relations
    let c = store.base_uri_record("azure://c").await.unwrap();
    assert!(c.users_with_search_permissions.is_empty());
    assert_eq!(c.users_with_register_permissions, vec!["alice"]);
}

async fn check_unknown_entities<S: PermissionStore + ?Sized>(store: &S) {
    seed(store).await;

    assert!(matches!(
        store.resolve("ghost").await,
        Err(LookupError::NotFound(_))
    ));
    assert!(matches!(
        store.base_uri_record("gs://nope").await,
        Err(LookupError::NotFound(_))
    ));
    assert!(matches!(
        store.revoke("ghost", "s3://a", Capability::Search).await,
        Err(LookupError::NotFound(_))
    ));

    let empty = resolve_or_empty(store, "ghost").await.unwrap();
    assert!(!empty.is_admin);
    assert!(empty.search_base_uris.is_empty());
    assert!(empty.register_base_uris.is_empty());
}

async fn check_listings<S: PermissionStore + ?Sized>(store: &S) {
    seed(store).await;
    store
        .grant("root", "s3://b", Capability::Register)
        .await
        .unwrap();

    let identities = store.list_identities().await.unwrap();
    let names: Vec<_> = identities.iter().map(|r| r.username.clone()).collect();
    assert_eq!(names, vec!["alice", "bob", "root"]);

    let base_uris = store.list_base_uris().await.unwrap();
    let uris: Vec<_> = base_uris.iter().map(|r| r.base_uri.clone()).collect();
    assert_eq!(uris, vec!["azure://c", "s3://a", "s3://b"]);
    assert_eq!(base_uris[2].users_with_register_permissions, vec!["root"]);
}

// ============================================================================
// Implementations
// ============================================================================

#[tokio::test]
async fn test_index_behavior() {
    check_grant_then_revoke(&PermissionIndex::new()).await;
    check_unknown_entities(&PermissionIndex::new()).await;
    check_listings(&PermissionIndex::new()).await;
}

#[tokio::test]
async fn test_sqlite_behavior() {
    let dir = tempdir().unwrap();
    for (i, check) in ["grant", "unknown", "listings"].iter().enumerate() {
        let store = SqlitePermissionStore::open(dir.path().join(format!("perms-{}.db", i)))
            .await
            .unwrap();
        match *check {
            "grant" => check_grant_then_revoke(&store).await,
            "unknown" => check_unknown_entities(&store).await,
            _ => check_listings(&store).await,
        }
    }
}

#[tokio::test]
async fn test_cached_behavior() {
    let ttl = Duration::from_secs(60);
    check_grant_then_revoke(&CachedPermissionStore::new(PermissionIndex::new(), ttl)).await;
    check_unknown_entities(&CachedPermissionStore::new(PermissionIndex::new(), ttl)).await;
    check_listings(&CachedPermissionStore::new(PermissionIndex::new(), ttl)).await;
}

#[tokio::test]
async fn test_cached_sqlite_sees_grants_immediately() {
    let dir = tempdir().unwrap();
    let sqlite = SqlitePermissionStore::open(dir.path().join("perms.db"))
        .await
        .unwrap();
    let store = CachedPermissionStore::new(sqlite, Duration::from_secs(300));
    seed(&store).await;

    assert!(store
        .resolve("alice")
        .await
        .unwrap()
        .search_base_uris
        .is_empty());

    store
        .grant("alice", "s3://b", Capability::Search)
        .await
        .unwrap();
    assert!(store
        .resolve("alice")
        .await
        .unwrap()
        .search_base_uris
        .contains("s3://b"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_grants_keep_both_sides_consistent() {
    let store = Arc::new(PermissionIndex::new());
    store.register_base_uri("s3://shared").await.unwrap();

    let users: Vec<String> = (0..16).map(|i| format!("user{:02}", i)).collect();
    for user in &users {
        store.register_identity(user, false).await.unwrap();
    }

    let mut handles = Vec::new();
    for user in users.clone() {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .grant(&user, "s3://shared", Capability::Search)
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let record = store.base_uri_record("s3://shared").await.unwrap();
    assert_eq!(record.users_with_search_permissions, users);
    for user in &users {
        let perms = store.resolve(user).await.unwrap();
        assert!(perms.search_base_uris.contains("s3://shared"));
    }
}
