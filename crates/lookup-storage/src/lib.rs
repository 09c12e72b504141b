//! Lookup Storage
//!
//! Document store abstraction for dataset metadata and the derived
//! dependency view.
//!
//! Filters and pipelines are MongoDB-style JSON documents. Backends:
//! - [`InMemoryDocumentStore`]: snapshot-based reference store evaluating the
//!   MongoDB subset in [`matcher`] and [`pipeline`]

use lookup_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

pub mod matcher;
mod memory;
pub mod pipeline;

pub use memory::InMemoryDocumentStore;

/// Convenience alias for trait objects.
pub type DynDocumentStore = dyn DocumentStore;

/// Sort order for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// Parse MongoDB's `1` / `-1` notation.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.as_i64() {
            Some(1) => Some(SortDirection::Ascending),
            Some(-1) => Some(SortDirection::Descending),
            _ => None,
        }
    }
}

/// Caller-supplied shaping for `find`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Sort keys in priority order
    pub sort: Vec<(String, SortDirection)>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push((field.into(), direction));
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Backend abstraction for dataset metadata (async)
///
/// Store failures are reported as `LookupError::ExecutionFailure`.
///
/// # Manual Async Trait
///
/// Methods return `Pin<Box<dyn Future>>` with explicit `Send` bounds so the
/// trait stays object safe without the async-trait crate.
pub trait DocumentStore: Send + Sync {
    /// Documents of `collection` matching `filter`, shaped by `options`.
    ///
    /// A missing collection yields no documents.
    fn find<'a>(
        &'a self,
        collection: &'a str,
        filter: &'a Value,
        options: &'a FindOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'a>>;

    /// Run an aggregation pipeline over `collection`.
    fn aggregate<'a>(
        &'a self,
        collection: &'a str,
        pipeline: &'a [Value],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'a>>;

    fn view_exists<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Atomically replace the contents of view `name`, derived from `source`.
    ///
    /// Readers see either the previous contents or the new ones, never a mix.
    fn replace_view<'a>(
        &'a self,
        name: &'a str,
        source: &'a str,
        documents: Vec<Value>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sort_direction_from_value() {
        assert_eq!(
            SortDirection::from_value(&json!(1)),
            Some(SortDirection::Ascending)
        );
        assert_eq!(
            SortDirection::from_value(&json!(-1)),
            Some(SortDirection::Descending)
        );
        assert_eq!(SortDirection::from_value(&json!("asc")), None);
    }

    #[test]
    fn test_find_options_builder() {
        let options = FindOptions::new()
            .sort_by("name", SortDirection::Ascending)
            .skip(5)
            .limit(10);

        assert_eq!(options.sort.len(), 1);
        assert_eq!(options.skip, Some(5));
        assert_eq!(options.limit, Some(10));
    }
}
