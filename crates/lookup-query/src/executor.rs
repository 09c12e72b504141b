//! Execution of compiled queries against the document store.
//!
//! Every store call races the caller's cancellation token and the configured
//! timeout. Whichever fires first wins and the call yields
//! `LookupError::ExecutionFailure` with no partial results.

use crate::compiler::CompiledQuery;
use lookup_core::{LookupError, Result};
use lookup_storage::{DynDocumentStore, FindOptions};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Store-internal key removed from every result document.
pub const INTERNAL_ID_KEY: &str = "_id";

/// Runs filters and pipelines with cancellation and timeout.
#[derive(Clone)]
pub struct QueryExecutor {
    store: Arc<DynDocumentStore>,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(store: Arc<DynDocumentStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute a compiled query and shape its results.
    ///
    /// `options` applies to `find` only; pipelines carry their own shaping.
    pub async fn execute(
        &self,
        collection: &str,
        compiled: &CompiledQuery,
        options: &FindOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>> {
        let documents = match compiled {
            CompiledQuery::Find { filter } => {
                self.find(collection, filter, options, cancel).await?
            }
            CompiledQuery::Aggregate { pipeline } => {
                self.aggregate(collection, pipeline, cancel).await?
            }
        };
        Ok(shape_results(documents))
    }

    /// Unshaped `find`.
    pub async fn find(
        &self,
        collection: &str,
        filter: &Value,
        options: &FindOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>> {
        self.guarded("find", collection, self.store.find(collection, filter, options), cancel)
            .await
    }

    /// Unshaped `aggregate`.
    pub async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>> {
        self.guarded(
            "aggregate",
            collection,
            self.store.aggregate(collection, pipeline),
            cancel,
        )
        .await
    }

    async fn guarded<F>(
        &self,
        operation: &str,
        collection: &str,
        call: F,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>>
    where
        F: Future<Output = Result<Vec<Value>>>,
    {
        if cancel.is_cancelled() {
            return Err(cancelled(operation));
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled(operation)),
            outcome = tokio::time::timeout(self.timeout, call) => match outcome {
                Ok(result) => result.map_err(into_execution_failure),
                Err(_) => Err(LookupError::ExecutionFailure(format!(
                    "{} on '{}' timed out after {:?}",
                    operation, collection, self.timeout
                ))),
            },
        };

        match &result {
            Ok(documents) => debug!(
                operation = %operation,
                collection = %collection,
                documents = documents.len(),
                "Store call completed"
            ),
            Err(e) => warn!(
                operation = %operation,
                collection = %collection,
                error = %e,
                "Store call failed"
            ),
        }
        result
    }
}

fn cancelled(operation: &str) -> LookupError {
    LookupError::ExecutionFailure(format!("{} cancelled", operation))
}

fn into_execution_failure(error: LookupError) -> LookupError {
    match error {
        LookupError::ExecutionFailure(_) => error,
        other => LookupError::ExecutionFailure(other.to_string()),
    }
}

/// Strip the store-internal `_id` from top-level result documents.
pub fn shape_results(documents: Vec<Value>) -> Vec<Value> {
    documents
        .into_iter()
        .map(|mut document| {
            if let Value::Object(map) = &mut document {
                map.remove(INTERNAL_ID_KEY);
            }
            document
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookup_storage::{DocumentStore, InMemoryDocumentStore};
    use serde_json::json;
    use std::pin::Pin;

    /// Store whose calls never complete.
    struct StalledStore;

    impl DocumentStore for StalledStore {
        fn find<'a>(
            &'a self,
            _collection: &'a str,
            _filter: &'a Value,
            _options: &'a FindOptions,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'a>> {
            Box::pin(std::future::pending::<Result<Vec<Value>>>())
        }

        fn aggregate<'a>(
            &'a self,
            _collection: &'a str,
            _pipeline: &'a [Value],
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'a>> {
            Box::pin(std::future::pending::<Result<Vec<Value>>>())
        }

        fn view_exists<'a>(
            &'a self,
            _name: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
            Box::pin(std::future::pending::<Result<bool>>())
        }

        fn replace_view<'a>(
            &'a self,
            _name: &'a str,
            _source: &'a str,
            _documents: Vec<Value>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(std::future::pending::<Result<()>>())
        }
    }

    fn memory_store() -> Arc<DynDocumentStore> {
        let store = InMemoryDocumentStore::new();
        store
            .insert_many(
                "datasets",
                vec![
                    json!({"uuid": "u-1", "base_uri": "s3://a"}),
                    json!({"uuid": "u-2", "base_uri": "s3://b"}),
                ],
            )
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_execute_find_strips_internal_id() {
        let executor = QueryExecutor::new(memory_store(), Duration::from_secs(5));
        let compiled = CompiledQuery::Find {
            filter: json!({"base_uri": {"$in": ["s3://a"]}}),
        };

        let out = executor
            .execute("datasets", &compiled, &FindOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"uuid": "u-1", "base_uri": "s3://a"})]);
    }

    #[tokio::test]
    async fn test_already_cancelled_token() {
        let executor = QueryExecutor::new(memory_store(), Duration::from_secs(5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor
            .execute(
                "datasets",
                &CompiledQuery::Find { filter: json!({}) },
                &FindOptions::default(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::ExecutionFailure(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancellation_during_execution() {
        let executor = QueryExecutor::new(Arc::new(StalledStore), Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = executor
            .find("datasets", &json!({}), &FindOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let executor = QueryExecutor::new(Arc::new(StalledStore), Duration::from_millis(20));

        let err = executor
            .aggregate("datasets", &[json!({"$match": {}})], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::ExecutionFailure(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_store_errors_become_execution_failures() {
        let executor = QueryExecutor::new(memory_store(), Duration::from_secs(5));
        let err = executor
            .aggregate("datasets", &[json!({"$out": "x"})], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_shape_results_keeps_nested_ids() {
        let shaped = shape_results(vec![json!({"_id": 1, "uuid": "a", "meta": {"_id": 7}})]);
        assert_eq!(shaped, vec![json!({"uuid": "a", "meta": {"_id": 7}})]);
    }
}
