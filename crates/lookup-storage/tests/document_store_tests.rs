//! Document Store Integration Tests
//!
//! Drives the in-memory store through the `DocumentStore` trait object with
//! the filter and pipeline shapes the query layer produces.
//!
//! Run with: `cargo test -p lookup-storage --test document_store_tests`

use lookup_core::LookupError;
use lookup_storage::{DocumentStore, DynDocumentStore, FindOptions, InMemoryDocumentStore};
use serde_json::{json, Value};
use std::sync::Arc;

fn datasets() -> Vec<Value> {
    vec![
        json!({
            "uuid": "u-1", "base_uri": "s3://a", "creator_username": "alice",
            "name": "ocean temperatures", "tags": ["climate"]
        }),
        json!({
            "uuid": "u-2", "base_uri": "s3://b", "creator_username": "bob",
            "name": "ocean salinity", "tags": ["climate", "raw"]
        }),
        json!({
            "uuid": "u-3", "base_uri": "azure://c", "creator_username": "alice",
            "name": "forest cover", "tags": ["raw"]
        }),
    ]
}

fn store() -> Arc<DynDocumentStore> {
    let store = InMemoryDocumentStore::new();
    store.insert_many("datasets", datasets()).unwrap();
    Arc::new(store)
}

fn uuids(documents: &[Value]) -> Vec<&str> {
    documents
        .iter()
        .filter_map(|d| d["uuid"].as_str())
        .collect()
}

#[tokio::test]
async fn test_privilege_conjunct_bounds_raw_query() {
    let store = store();

    // A permissive raw fragment cannot widen the privilege conjunct
    let filter = json!({"$and": [
        {"base_uri": {"$in": ["s3://a"]}},
        {"$or": [{"base_uri": "s3://b"}, {"creator_username": "alice"}]}
    ]});
    let found = store
        .find("datasets", &filter, &FindOptions::default())
        .await
        .unwrap();
    assert_eq!(uuids(&found), vec!["u-1"]);
}

#[tokio::test]
async fn test_text_and_membership_filter() {
    let store = store();
    let filter = json!({"$and": [
        {"base_uri": {"$in": ["s3://a", "s3://b", "azure://c"]}},
        {"$text": {"$search": "ocean"}},
        {"tags": {"$in": ["raw"]}}
    ]});
    let found = store
        .find("datasets", &filter, &FindOptions::default())
        .await
        .unwrap();
    assert_eq!(uuids(&found), vec!["u-2"]);
}

#[tokio::test]
async fn test_aggregation_after_privilege_match() {
    let store = store();
    let pipeline = vec![
        json!({"$match": {"base_uri": {"$in": ["s3://a", "azure://c"]}}}),
        json!({"$unwind": "$tags"}),
        json!({"$match": {"tags": "raw"}}),
        json!({"$count": "n"}),
    ];
    let out = store.aggregate("datasets", &pipeline).await.unwrap();
    assert_eq!(out, vec![json!({"n": 1})]);
}

#[tokio::test]
async fn test_unsupported_stage_names_the_stage() {
    let store = store();
    let pipeline = vec![json!({"$match": {}}), json!({"$merge": "elsewhere"})];
    let err = store.aggregate("datasets", &pipeline).await.unwrap_err();

    assert!(matches!(err, LookupError::ExecutionFailure(_)));
    assert!(err.to_string().contains("$merge"));
}

#[tokio::test]
async fn test_view_replacement_visible_to_aggregations() {
    let store = store();
    assert!(!store.view_exists("dependencies").await.unwrap());

    store
        .replace_view(
            "dependencies",
            "datasets",
            vec![
                json!({"uuid": "u-2", "related_uuid": "u-1"}),
                json!({"uuid": "u-1", "related_uuid": "u-2"}),
            ],
        )
        .await
        .unwrap();
    assert!(store.view_exists("dependencies").await.unwrap());

    let out = store
        .aggregate(
            "dependencies",
            &[json!({"$match": {"uuid": "u-1"}}), json!({"$project": {"_id": 0}})],
        )
        .await
        .unwrap();
    assert_eq!(out, vec![json!({"uuid": "u-1", "related_uuid": "u-2"})]);
}
