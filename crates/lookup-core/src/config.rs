//! Service configuration.
//!
//! Configuration is read once at startup, validated, and then shared
//! read-only (`Arc`) with the components that need it. Malformed query-key or
//! dependency-key settings fail initialization with
//! [`LookupError::ConfigurationError`] instead of degrading at request time.
//!
//! ## Environment
//!
//! - `LOOKUP_PERMISSIONS_DB`: path to the permission SQLite database (secret)
//! - `LOOKUP_MONGO_COLLECTION`: dataset collection (default: `datasets`)
//! - `LOOKUP_MONGO_DEPENDENCY_VIEW`: dependency view name (default: `dependencies`)
//! - `LOOKUP_ALLOW_DIRECT_AGGREGATION`: accept raw aggregation pipelines
//! - `LOOKUP_QUERY_DICT_VALID_KEYS`: JSON list of accepted query keys
//! - `LOOKUP_QUERY_DICT_LIST_KEYS`: JSON list of list-typed query keys
//! - `LOOKUP_ENABLE_DEPENDENCY_VIEW`: maintain the dependency view
//! - `LOOKUP_FORCE_REBUILD_DEPENDENCY_VIEW`: recreate the view on every build
//! - `LOOKUP_DEPENDENCY_KEYS`: JSON list (or one plain key) of dotted parent-UUID paths
//! - `LOOKUP_PERMISSION_CACHE_TTL_SECS`: permission cache TTL (default: 60, 0 to disable)
//! - `LOOKUP_QUERY_TIMEOUT_SECS`: store execution timeout (default: 30)
//!
//! Boolean values are true for `true`, `1`, `y`, `yes` and `on`.

use crate::{LookupError, QueryKey, Result};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const DEFAULT_PERMISSIONS_DB: &str = "lookup_permissions.db";
const DEFAULT_COLLECTION: &str = "datasets";
const DEFAULT_DEPENDENCY_VIEW: &str = "dependencies";
const DEFAULT_PERMISSION_CACHE_TTL_SECS: u64 = 60;
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

const DEFAULT_VALID_KEYS: [QueryKey; 5] = [
    QueryKey::FreeText,
    QueryKey::CreatorUsernames,
    QueryKey::BaseUris,
    QueryKey::Uuids,
    QueryKey::Tags,
];

const DEFAULT_LIST_KEYS: [QueryKey; 3] = [
    QueryKey::CreatorUsernames,
    QueryKey::BaseUris,
    QueryKey::Tags,
];

const DEFAULT_DEPENDENCY_KEYS: [&str; 2] = [
    "readme.derived_from.uuid",
    "annotations.source_dataset_uuid",
];

/// A validated dotted path into a JSON document (e.g. `readme.derived_from.uuid`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DottedPath {
    raw: String,
    segments: Vec<String>,
}

impl DottedPath {
    /// Parse a dotted path, rejecting empty paths and empty segments.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(LookupError::ConfigurationError(
                "dependency key cannot be empty".to_string(),
            ));
        }

        let segments: Vec<String> = trimmed.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(LookupError::ConfigurationError(format!(
                "dependency key '{}' contains an empty segment",
                trimmed
            )));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Follow the path through nested objects.
    pub fn resolve<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(document, |current, segment| current.get(segment.as_str()))
    }
}

impl fmt::Display for DottedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Immutable allow-list of query keys plus the list-typed subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKeyPolicy {
    allowed: BTreeSet<QueryKey>,
    list_keys: BTreeSet<QueryKey>,
    allow_direct_aggregation: bool,
}

impl Default for QueryKeyPolicy {
    fn default() -> Self {
        Self {
            allowed: DEFAULT_VALID_KEYS.into_iter().collect(),
            list_keys: DEFAULT_LIST_KEYS.into_iter().collect(),
            allow_direct_aggregation: false,
        }
    }
}

impl QueryKeyPolicy {
    /// Build a policy from configured key names.
    ///
    /// # Errors
    ///
    /// Returns `LookupError::ConfigurationError` if:
    /// - a key is not a known query key
    /// - a list-typed key cannot carry list values (`free_text`, `query`)
    ///
    /// List-typed keys missing from the allow-list are dropped with a warning.
    pub fn new<A, L, S, T>(
        allowed: A,
        list_keys: L,
        allow_direct_aggregation: bool,
    ) -> Result<Self>
    where
        A: IntoIterator<Item = S>,
        L: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let allowed = allowed
            .into_iter()
            .map(|name| parse_key(name.as_ref(), "allow-list"))
            .collect::<Result<BTreeSet<_>>>()?;

        let configured = list_keys
            .into_iter()
            .map(|name| parse_key(name.as_ref(), "list-typed keys"))
            .collect::<Result<BTreeSet<_>>>()?;

        let mut list_keys = BTreeSet::new();
        for key in configured {
            if !key.is_list_capable() {
                return Err(LookupError::ConfigurationError(format!(
                    "query key '{}' cannot be list-typed",
                    key
                )));
            }
            if !allowed.contains(&key) {
                warn!(key = %key, "Dropping list-typed query key outside the allow-list");
                continue;
            }
            list_keys.insert(key);
        }

        Ok(Self {
            allowed,
            list_keys,
            allow_direct_aggregation,
        })
    }

    pub fn is_allowed(&self, key: QueryKey) -> bool {
        self.allowed.contains(&key)
    }

    pub fn is_list_typed(&self, key: QueryKey) -> bool {
        self.list_keys.contains(&key)
    }

    /// Raw `query` fragments are accepted only when `query` is allow-listed.
    pub fn allows_raw_query(&self) -> bool {
        self.allowed.contains(&QueryKey::Query)
    }

    pub fn allows_direct_aggregation(&self) -> bool {
        self.allow_direct_aggregation
    }

    pub fn allowed_keys(&self) -> impl Iterator<Item = QueryKey> + '_ {
        self.allowed.iter().copied()
    }

    pub fn list_keys(&self) -> impl Iterator<Item = QueryKey> + '_ {
        self.list_keys.iter().copied()
    }
}

fn parse_key(name: &str, setting: &str) -> Result<QueryKey> {
    name.parse::<QueryKey>().map_err(|_| {
        LookupError::ConfigurationError(format!("unknown query key '{}' in {}", name, setting))
    })
}

/// Configuration consumed read-only by the lookup core.
///
/// # Security
///
/// The `Debug` implementation masks the permission database path.
#[derive(Clone)]
pub struct LookupConfig {
    /// Path to the permission SQLite database
    pub permissions_db_path: String,
    /// Primary dataset collection
    pub collection: String,
    /// Name of the materialized dependency view
    pub dependency_view: String,
    /// Validated query allow-list, list-typed keys and aggregation flag
    pub query_keys: Arc<QueryKeyPolicy>,
    pub enable_dependency_view: bool,
    pub force_rebuild_dependency_view: bool,
    /// Parent-UUID locations, highest priority first
    pub dependency_keys: Vec<DottedPath>,
    /// Permission cache TTL (zero disables the cache)
    pub permission_cache_ttl: Duration,
    /// Upper bound on a single store execution
    pub query_timeout: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            permissions_db_path: DEFAULT_PERMISSIONS_DB.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            dependency_view: DEFAULT_DEPENDENCY_VIEW.to_string(),
            query_keys: Arc::new(QueryKeyPolicy::default()),
            enable_dependency_view: false,
            force_rebuild_dependency_view: false,
            dependency_keys: default_dependency_keys(),
            permission_cache_ttl: Duration::from_secs(DEFAULT_PERMISSION_CACHE_TTL_SECS),
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
        }
    }
}

impl fmt::Debug for LookupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupConfig")
            .field("permissions_db_path", &"***REDACTED***")
            .field("collection", &self.collection)
            .field("dependency_view", &self.dependency_view)
            .field("query_keys", &self.query_keys)
            .field("enable_dependency_view", &self.enable_dependency_view)
            .field(
                "force_rebuild_dependency_view",
                &self.force_rebuild_dependency_view,
            )
            .field("dependency_keys", &self.dependency_keys)
            .field("permission_cache_ttl", &self.permission_cache_ttl)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

fn default_dependency_keys() -> Vec<DottedPath> {
    DEFAULT_DEPENDENCY_KEYS
        .iter()
        .map(|key| DottedPath {
            raw: key.to_string(),
            segments: key.split('.').map(str::to_string).collect(),
        })
        .collect()
}

impl LookupConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary variable source.
    ///
    /// Unset variables fall back to their defaults.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let allow_direct_aggregation = parse_flag(var("LOOKUP_ALLOW_DIRECT_AGGREGATION"));

        let valid_keys = match var("LOOKUP_QUERY_DICT_VALID_KEYS") {
            Some(raw) => parse_string_list(&raw, "LOOKUP_QUERY_DICT_VALID_KEYS")?,
            None => DEFAULT_VALID_KEYS
                .iter()
                .map(|k| k.as_str().to_string())
                .collect(),
        };

        let list_keys = match var("LOOKUP_QUERY_DICT_LIST_KEYS") {
            Some(raw) => parse_string_list(&raw, "LOOKUP_QUERY_DICT_LIST_KEYS")?,
            None => DEFAULT_LIST_KEYS
                .iter()
                .map(|k| k.as_str().to_string())
                .collect(),
        };

        let query_keys = QueryKeyPolicy::new(valid_keys, list_keys, allow_direct_aggregation)?;

        let dependency_keys = match var("LOOKUP_DEPENDENCY_KEYS") {
            Some(raw) if !raw.trim().is_empty() => parse_dependency_keys(&raw)?,
            _ => defaults.dependency_keys,
        };

        let config = Self {
            permissions_db_path: var("LOOKUP_PERMISSIONS_DB")
                .unwrap_or(defaults.permissions_db_path),
            collection: var("LOOKUP_MONGO_COLLECTION").unwrap_or(defaults.collection),
            dependency_view: var("LOOKUP_MONGO_DEPENDENCY_VIEW")
                .unwrap_or(defaults.dependency_view),
            query_keys: Arc::new(query_keys),
            enable_dependency_view: parse_flag(var("LOOKUP_ENABLE_DEPENDENCY_VIEW")),
            force_rebuild_dependency_view: parse_flag(var(
                "LOOKUP_FORCE_REBUILD_DEPENDENCY_VIEW",
            )),
            dependency_keys,
            permission_cache_ttl: parse_secs(
                var("LOOKUP_PERMISSION_CACHE_TTL_SECS"),
                DEFAULT_PERMISSION_CACHE_TTL_SECS,
            ),
            query_timeout: parse_secs(
                var("LOOKUP_QUERY_TIMEOUT_SECS"),
                DEFAULT_QUERY_TIMEOUT_SECS,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.collection.trim().is_empty() {
            return Err(LookupError::ConfigurationError(
                "collection name cannot be empty".to_string(),
            ));
        }

        if self.dependency_view.trim().is_empty() {
            return Err(LookupError::ConfigurationError(
                "dependency view name cannot be empty".to_string(),
            ));
        }

        if self.collection == self.dependency_view {
            return Err(LookupError::ConfigurationError(format!(
                "dependency view '{}' cannot share its name with the dataset collection",
                self.dependency_view
            )));
        }

        if self.enable_dependency_view && self.dependency_keys.is_empty() {
            return Err(LookupError::ConfigurationError(
                "at least one dependency key is required when the dependency view is enabled"
                    .to_string(),
            ));
        }

        if self.query_timeout.is_zero() {
            return Err(LookupError::ConfigurationError(
                "query timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn allow_direct_aggregation(&self) -> bool {
        self.query_keys.allows_direct_aggregation()
    }

    /// Public view of the configuration, without the permission database path.
    pub fn summary(&self) -> Value {
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "collection": self.collection,
            "dependency_view": self.dependency_view,
            "allow_direct_aggregation": self.allow_direct_aggregation(),
            "query_dict_valid_keys": self
                .query_keys
                .allowed_keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>(),
            "query_dict_list_keys": self
                .query_keys
                .list_keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>(),
            "enable_dependency_view": self.enable_dependency_view,
            "force_rebuild_dependency_view": self.force_rebuild_dependency_view,
            "dependency_keys": self
                .dependency_keys
                .iter()
                .map(DottedPath::as_str)
                .collect::<Vec<_>>(),
            "permission_cache_ttl_secs": self.permission_cache_ttl.as_secs(),
            "query_timeout_secs": self.query_timeout.as_secs(),
        })
    }
}

fn parse_flag(raw: Option<String>) -> bool {
    raw.map(|v| {
        matches!(
            v.trim().to_lowercase().as_str(),
            "true" | "1" | "y" | "yes" | "on"
        )
    })
    .unwrap_or(false)
}

fn parse_secs(raw: Option<String>, default: u64) -> Duration {
    let secs = raw
        .as_deref()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or_else(|| {
            if let Some(raw) = raw.as_deref() {
                warn!(value = %raw, default, "Ignoring unparsable duration setting");
            }
            default
        });
    Duration::from_secs(secs)
}

fn parse_string_list(raw: &str, var: &str) -> Result<Vec<String>> {
    let parsed: Value = serde_json::from_str(raw).map_err(|_| {
        LookupError::ConfigurationError(format!("{} must be a JSON-parsable list", var))
    })?;

    let items = parsed.as_array().ok_or_else(|| {
        LookupError::ConfigurationError(format!("{} must be a JSON-parsable list", var))
    })?;

    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                LookupError::ConfigurationError(format!("{} must only contain strings", var))
            })
        })
        .collect()
}

fn parse_dependency_keys(raw: &str) -> Result<Vec<DottedPath>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| {
                        LookupError::ConfigurationError(
                            "LOOKUP_DEPENDENCY_KEYS must only contain strings".to_string(),
                        )
                    })
                    .and_then(DottedPath::parse)
            })
            .collect(),
        Ok(Value::String(key)) => Ok(vec![DottedPath::parse(&key)?]),
        Ok(_) => Err(LookupError::ConfigurationError(
            "LOOKUP_DEPENDENCY_KEYS must be a key or a JSON list of keys".to_string(),
        )),
        // Not JSON: a single plain key
        Err(_) => Ok(vec![DottedPath::parse(raw)?]),
    }
}
