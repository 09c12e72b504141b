//! Dependency view materialization.
//!
//! Each dataset names at most one parent through the configured dotted
//! paths. The view stores every parent link in both directions as
//! `{"uuid": <dataset>, "related_uuid": <neighbour>}`, which makes the lineage
//! graph traversable from either end.

use chrono::{DateTime, Utc};
use lookup_core::{DottedPath, LookupConfig, Result};
use lookup_storage::{DynDocumentStore, FindOptions};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Counters from one view build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewBuildStats {
    pub datasets_scanned: usize,
    pub datasets_with_parent: usize,
    /// Present but unusable values (non-string parents, missing dataset UUIDs)
    pub malformed_values: usize,
    pub entries: usize,
    pub built_at: DateTime<Utc>,
}

/// What a build request did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ViewBuildOutcome {
    /// The dependency view is disabled in configuration
    Disabled,
    /// The view already existed and no rebuild was forced
    Unchanged,
    Rebuilt(ViewBuildStats),
}

/// Result of looking for a parent UUID on one dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentExtraction {
    pub parent: Option<String>,
    /// Paths that held a value of the wrong type
    pub malformed: Vec<String>,
}

/// First configured path holding a non-empty string wins.
pub fn extract_parent(document: &Value, keys: &[DottedPath]) -> ParentExtraction {
    let mut extraction = ParentExtraction::default();

    for key in keys {
        match key.resolve(document) {
            Some(Value::String(uuid)) if !uuid.is_empty() => {
                extraction.parent = Some(uuid.clone());
                break;
            }
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            Some(_) => extraction.malformed.push(key.as_str().to_string()),
        }
    }
    extraction
}

/// Deduplicated, sorted view entries for `documents`, with build counters.
pub fn dependency_entries(
    documents: &[Value],
    keys: &[DottedPath],
) -> (Vec<Value>, ViewBuildStats) {
    let mut edges: BTreeSet<(String, String)> = BTreeSet::new();
    let mut stats = ViewBuildStats {
        datasets_scanned: documents.len(),
        datasets_with_parent: 0,
        malformed_values: 0,
        entries: 0,
        built_at: Utc::now(),
    };

    for document in documents {
        let extraction = extract_parent(document, keys);
        for path in &extraction.malformed {
            warn!(
                uuid = document.get("uuid").and_then(serde_json::Value::as_str).unwrap_or("<missing>"),
                path = %path,
                "Ignoring non-string dependency value"
            );
        }
        stats.malformed_values += extraction.malformed.len();

        let Some(parent) = extraction.parent else {
            continue;
        };

        let Some(child) = document
            .get("uuid")
            .and_then(Value::as_str)
            .filter(|uuid| !uuid.is_empty())
        else {
            warn!(parent = %parent, "Dataset with a parent has no uuid, skipping");
            stats.malformed_values += 1;
            continue;
        };

        stats.datasets_with_parent += 1;
        edges.insert((child.to_string(), parent.clone()));
        edges.insert((parent, child.to_string()));
    }

    let entries: Vec<Value> = edges
        .into_iter()
        .map(|(uuid, related)| json!({"uuid": uuid, "related_uuid": related}))
        .collect();
    stats.entries = entries.len();
    (entries, stats)
}

/// Builds the dependency view from the primary collection.
///
/// Builds are serialized; a non-forced build queued behind another one finds
/// the fresh view and returns `Unchanged`.
pub struct DependencyViewBuilder {
    store: Arc<DynDocumentStore>,
    config: Arc<LookupConfig>,
    build_lock: Mutex<()>,
}

impl DependencyViewBuilder {
    pub fn new(store: Arc<DynDocumentStore>, config: Arc<LookupConfig>) -> Self {
        Self {
            store,
            config,
            build_lock: Mutex::new(()),
        }
    }

    /// Build with the configured force flag.
    pub async fn build_configured(&self) -> Result<ViewBuildOutcome> {
        self.build(self.config.force_rebuild_dependency_view).await
    }

    /// Build the view. Without `force`, an existing view is left untouched.
    pub async fn build(&self, force: bool) -> Result<ViewBuildOutcome> {
        if !self.config.enable_dependency_view {
            debug!("Dependency view disabled, skipping build");
            return Ok(ViewBuildOutcome::Disabled);
        }

        let view = self.config.dependency_view.as_str();
        let collection = self.config.collection.as_str();
        let _guard = self.build_lock.lock().await;

        if !force && self.store.view_exists(view).await? {
            debug!(view = %view, "Dependency view exists, leaving it untouched");
            return Ok(ViewBuildOutcome::Unchanged);
        }

        let documents = self
            .store
            .find(collection, &json!({}), &FindOptions::default())
            .await?;
        let (entries, stats) = dependency_entries(&documents, &self.config.dependency_keys);

        self.store.replace_view(view, collection, entries).await?;

        info!(
            view = %view,
            source = %collection,
            forced = force,
            datasets = stats.datasets_scanned,
            with_parent = stats.datasets_with_parent,
            malformed = stats.malformed_values,
            entries = stats.entries,
            "Rebuilt dependency view"
        );
        Ok(ViewBuildOutcome::Rebuilt(stats))
    }
}
