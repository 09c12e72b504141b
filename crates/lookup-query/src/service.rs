//! Lookup service facade.
//!
//! Request flow: normalize, resolve permissions (fail closed), inject the
//! privilege constraint, compile, execute, shape.

use crate::compiler::{self, CompiledQuery};
use crate::dependency::{DependencyViewBuilder, ViewBuildOutcome};
use crate::executor::{shape_results, QueryExecutor};
use crate::normalizer::QueryNormalizer;
use crate::privilege::{BaseUriConstraint, PrivilegeInjector};
use lookup_core::validation::validate_dataset_info;
use lookup_core::{LookupConfig, LookupError, QuerySpec, ResolvedPermissions, Result};
use lookup_permissions::{
    resolve_or_empty, CachedPermissionStore, DynPermissionStore, SqlitePermissionStore,
};
use lookup_storage::{DynDocumentStore, FindOptions};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Open the SQLite permission store named in `config`, behind a TTL cache
/// unless the TTL is zero.
pub async fn open_permission_store(config: &LookupConfig) -> Result<Arc<DynPermissionStore>> {
    let sqlite = SqlitePermissionStore::open(&config.permissions_db_path).await?;

    if config.permission_cache_ttl.is_zero() {
        debug!("Permission cache disabled");
        return Ok(Arc::new(sqlite));
    }

    debug!(
        ttl_secs = config.permission_cache_ttl.as_secs(),
        "Permission cache enabled"
    );
    Ok(Arc::new(CachedPermissionStore::new(
        sqlite,
        config.permission_cache_ttl,
    )))
}

/// Authorization-aware search over the dataset collection.
pub struct LookupService {
    config: Arc<LookupConfig>,
    permissions: Arc<DynPermissionStore>,
    normalizer: QueryNormalizer,
    injector: PrivilegeInjector,
    executor: QueryExecutor,
    view_builder: DependencyViewBuilder,
}

impl LookupService {
    /// Wire the service. The configuration is validated first.
    pub fn new(
        config: LookupConfig,
        permissions: Arc<DynPermissionStore>,
        store: Arc<DynDocumentStore>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        info!(config = %config.summary(), "Initializing lookup service");

        Ok(Self {
            normalizer: QueryNormalizer::new(Arc::clone(&config.query_keys)),
            injector: PrivilegeInjector::new(),
            executor: QueryExecutor::new(Arc::clone(&store), config.query_timeout),
            view_builder: DependencyViewBuilder::new(store, Arc::clone(&config)),
            permissions,
            config,
        })
    }

    pub fn config(&self) -> &LookupConfig {
        &self.config
    }

    pub fn permissions(&self) -> &Arc<DynPermissionStore> {
        &self.permissions
    }

    /// Resolve permissions, racing the caller's cancellation token.
    async fn resolve(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedPermissions> {
        if cancel.is_cancelled() {
            return Err(LookupError::ExecutionFailure(
                "permission resolution cancelled".to_string(),
            ));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LookupError::ExecutionFailure(
                "permission resolution cancelled".to_string(),
            )),
            resolved = resolve_or_empty(self.permissions.as_ref(), username) => resolved,
        }
    }

    async fn prepare(
        &self,
        username: &str,
        request: &Value,
        cancel: &CancellationToken,
    ) -> Result<(QuerySpec, BaseUriConstraint)> {
        let spec = self.normalizer.normalize(request)?;
        let permissions = self.resolve(username, cancel).await?;
        let constraint = self.injector.search_constraint(&permissions, &spec);
        Ok((spec, constraint))
    }

    /// Compile a request without executing it.
    pub async fn compile(&self, username: &str, request: &Value) -> Result<CompiledQuery> {
        let (spec, constraint) = self
            .prepare(username, request, &CancellationToken::new())
            .await?;
        Ok(compiler::compile(&constraint, &spec))
    }

    /// Search the dataset collection on behalf of `username`.
    ///
    /// A request carrying `aggregation` runs as a pipeline and ignores
    /// `options`.
    pub async fn search(
        &self,
        username: &str,
        request: &Value,
        options: &FindOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>> {
        let (spec, constraint) = self.prepare(username, request, cancel).await?;

        if constraint.is_empty() {
            debug!(username = %username, "Empty effective base URI set, skipping store");
            return Ok(Vec::new());
        }

        let compiled = compiler::compile(&constraint, &spec);
        debug!(username = %username, compiled = ?compiled, "Compiled search");

        self.executor
            .execute(&self.config.collection, &compiled, options, cancel)
            .await
    }

    /// Datasets connected to `uuid` through the dependency view that
    /// `username` may see, including `uuid` itself.
    ///
    /// An unknown or invisible root yields an empty result.
    ///
    /// # Security
    ///
    /// Privileges gate the root and the returned datasets, not the walk
    /// itself. The traversal passes through datasets the caller cannot see,
    /// so two visible datasets linked only through a hidden one are both
    /// returned, which reveals that they are related.
    pub async fn dependency_graph(
        &self,
        username: &str,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>> {
        if !self.config.enable_dependency_view {
            return Err(LookupError::InvalidQuery(
                "dependency view is disabled".to_string(),
            ));
        }

        let (_, constraint) = self
            .prepare(username, &Value::Object(Default::default()), cancel)
            .await?;
        if constraint.is_empty() {
            return Ok(Vec::new());
        }

        let traversal =
            compiler::compile_traversal(&constraint, uuid, &self.config.dependency_view);
        let collection = self.config.collection.as_str();

        let root = self
            .executor
            .find(collection, &traversal.gate_filter, &FindOptions::new().limit(1), cancel)
            .await?;
        if root.is_empty() {
            debug!(username = %username, uuid = %uuid, "Dependency root not visible");
            return Ok(Vec::new());
        }

        let view_output = self
            .executor
            .aggregate(&traversal.view, &traversal.view_pipeline, cancel)
            .await?;
        let reachable = traversal.reachable_uuids(&view_output);

        let datasets = self
            .executor
            .find(
                collection,
                &traversal.fetch_filter(&reachable),
                &FindOptions::default(),
                cancel,
            )
            .await?;

        debug!(
            username = %username,
            uuid = %uuid,
            reachable = reachable.len(),
            visible = datasets.len(),
            "Resolved dependency graph"
        );
        Ok(shape_results(datasets))
    }

    /// Rebuild the dependency view.
    pub async fn rebuild_dependency_view(&self, force: bool) -> Result<ViewBuildOutcome> {
        self.view_builder.build(force).await
    }

    /// Build the dependency view as configured (startup hook).
    pub async fn initialize_dependency_view(&self) -> Result<ViewBuildOutcome> {
        self.view_builder.build_configured().await
    }

    /// Whether `username` may register datasets under `base_uri`.
    /// Unknown identities may not.
    pub async fn can_register(&self, username: &str, base_uri: &str) -> Result<bool> {
        let permissions = resolve_or_empty(self.permissions.as_ref(), username).await?;
        Ok(self.injector.can_register(&permissions, base_uri))
    }

    /// Check the minimum dataset record accepted for registration.
    pub fn validate_dataset_info(&self, info: &Value) -> Result<()> {
        validate_dataset_info(info)
    }
}
