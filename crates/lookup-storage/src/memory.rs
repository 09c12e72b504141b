//! In-memory document store.
//!
//! Each collection is an immutable `Arc<Vec<Value>>` snapshot. Readers clone
//! the `Arc` and evaluate without holding the lock; writers build a new
//! vector and swap it in, so a view replacement is atomic for readers.

use crate::pipeline::{self, sort_documents};
use crate::{matcher, DocumentStore, FindOptions};
use lookup_core::{LookupError, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct Collections {
    data: HashMap<String, Arc<Vec<Value>>>,
    /// view name -> source collection
    views: BTreeMap<String, String>,
}

/// Reference document store evaluating the MongoDB subset in
/// [`crate::matcher`] and [`crate::pipeline`].
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<Collections>,
    next_id: AtomicI64,
    unavailable: AtomicBool,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one document, assigning an integer `_id` if it has none.
    pub fn insert(&self, collection: &str, document: Value) -> Result<i64> {
        let ids = self.insert_many(collection, vec![document])?;
        ids.into_iter()
            .next()
            .ok_or_else(|| LookupError::Other("insert produced no id".to_string()))
    }

    /// Insert documents in one atomic append.
    pub fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<Vec<i64>> {
        let mut prepared = Vec::with_capacity(documents.len());
        let mut ids = Vec::with_capacity(documents.len());
        for document in documents {
            let (document, id) = self.with_id(document)?;
            prepared.push(document);
            ids.push(id);
        }

        let mut collections = self.collections.write();
        if collections.views.contains_key(collection) {
            return Err(LookupError::ExecutionFailure(format!(
                "cannot insert into view '{}'",
                collection
            )));
        }
        let current = collections
            .data
            .get(collection)
            .cloned()
            .unwrap_or_default();
        let mut next = Vec::with_capacity(current.len() + prepared.len());
        next.extend(current.iter().cloned());
        next.extend(prepared);
        collections
            .data
            .insert(collection.to_string(), Arc::new(next));
        Ok(ids)
    }

    fn with_id(&self, document: Value) -> Result<(Value, i64)> {
        let Value::Object(mut map) = document else {
            return Err(LookupError::ExecutionFailure(
                "documents must be JSON objects".to_string(),
            ));
        };

        let id = match map.get("_id").and_then(Value::as_i64) {
            Some(id) => id,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                map.insert("_id".to_string(), Value::from(id));
                id
            }
        };
        Ok((Value::Object(map), id))
    }

    /// Current snapshot of a collection or view. Missing names are empty.
    pub fn snapshot(&self, name: &str) -> Arc<Vec<Value>> {
        self.collections
            .read()
            .data
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Source collection of a view, if `name` is a view.
    pub fn view_source(&self, name: &str) -> Option<String> {
        self.collections.read().views.get(name).cloned()
    }

    /// Simulate a connectivity failure: every operation fails until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LookupError::ExecutionFailure(
                "document store unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn find_now(
        &self,
        collection: &str,
        filter: &Value,
        options: &FindOptions,
    ) -> Result<Vec<Value>> {
        self.check_available()?;
        let snapshot = self.snapshot(collection);

        let mut found = Vec::new();
        for document in snapshot.iter() {
            if matcher::matches(document, filter)? {
                found.push(document.clone());
            }
        }

        sort_documents(&mut found, &options.sort);
        let skip = options.skip.unwrap_or(0) as usize;
        let shaped = found.into_iter().skip(skip);
        Ok(match options.limit {
            Some(limit) => shaped.take(limit as usize).collect(),
            None => shaped.collect(),
        })
    }

    fn aggregate_now(&self, collection: &str, stages: &[Value]) -> Result<Vec<Value>> {
        self.check_available()?;
        let snapshot = self.snapshot(collection);
        let source = |name: &str| self.snapshot(name);
        pipeline::evaluate(snapshot.as_ref().clone(), stages, &source)
    }

    fn replace_view_now(&self, name: &str, source: &str, documents: Vec<Value>) -> Result<()> {
        self.check_available()?;

        // View documents are derived and stored verbatim, without `_id`
        if documents.iter().any(|document| !document.is_object()) {
            return Err(LookupError::ExecutionFailure(
                "documents must be JSON objects".to_string(),
            ));
        }
        let count = documents.len();

        let mut collections = self.collections.write();
        let is_view = collections.views.contains_key(name);
        if !is_view && collections.data.contains_key(name) {
            return Err(LookupError::ExecutionFailure(format!(
                "'{}' is a collection, not a view",
                name
            )));
        }
        collections
            .data
            .insert(name.to_string(), Arc::new(documents));
        collections
            .views
            .insert(name.to_string(), source.to_string());
        drop(collections);

        debug!(view = %name, source = %source, documents = count, "Replaced view");
        Ok(())
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn find<'a>(
        &'a self,
        collection: &'a str,
        filter: &'a Value,
        options: &'a FindOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'a>> {
        Box::pin(async move { self.find_now(collection, filter, options) })
    }

    fn aggregate<'a>(
        &'a self,
        collection: &'a str,
        pipeline: &'a [Value],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'a>> {
        Box::pin(async move { self.aggregate_now(collection, pipeline) })
    }

    fn view_exists<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.collections.read().views.contains_key(name))
        })
    }

    fn replace_view<'a>(
        &'a self,
        name: &'a str,
        source: &'a str,
        documents: Vec<Value>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { self.replace_view_now(name, source, documents) })
    }
}
