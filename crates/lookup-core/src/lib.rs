//! Lookup Core
//!
//! Core types, errors, configuration and the SQLite permission schema for the
//! dataset lookup service.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

pub mod config;
pub mod validation;

pub use config::{DottedPath, LookupConfig, QueryKeyPolicy};

/// Key under which clients submit a raw aggregation pipeline.
///
/// It is never part of the query allow-list; it is accepted only when direct
/// aggregation is enabled in the configuration.
pub const AGGREGATION_KEY: &str = "aggregation";

/// Capability an identity can hold on a base URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// May search datasets stored under the base URI
    Search,
    /// May register datasets stored under the base URI
    Register,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Search => "search",
            Capability::Register => "register",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = LookupError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "search" => Ok(Capability::Search),
            "register" => Ok(Capability::Register),
            _ => Err(LookupError::ValidationError(format!(
                "Unknown capability: {}",
                s
            ))),
        }
    }
}

/// Permissions of one identity as seen at request time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPermissions {
    pub username: String,
    /// Admins bypass every base URI restriction
    pub is_admin: bool,
    pub search_base_uris: BTreeSet<String>,
    pub register_base_uris: BTreeSet<String>,
}

impl ResolvedPermissions {
    /// Zero-permission view used when an identity cannot be resolved.
    pub fn none(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_admin: false,
            search_base_uris: BTreeSet::new(),
            register_base_uris: BTreeSet::new(),
        }
    }

    /// Base URIs on which the identity holds `capability`.
    pub fn base_uris(&self, capability: Capability) -> &BTreeSet<String> {
        match capability {
            Capability::Search => &self.search_base_uris,
            Capability::Register => &self.register_base_uris,
        }
    }
}

/// Display form of an identity for admin listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub username: String,
    pub is_admin: bool,
    pub search_permissions_on_base_uris: Vec<String>,
    pub register_permissions_on_base_uris: Vec<String>,
}

impl From<ResolvedPermissions> for IdentityRecord {
    fn from(perms: ResolvedPermissions) -> Self {
        Self {
            username: perms.username,
            is_admin: perms.is_admin,
            search_permissions_on_base_uris: perms.search_base_uris.into_iter().collect(),
            register_permissions_on_base_uris: perms.register_base_uris.into_iter().collect(),
        }
    }
}

/// Display form of a base URI for admin listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseUriRecord {
    pub base_uri: String,
    pub users_with_search_permissions: Vec<String>,
    pub users_with_register_permissions: Vec<String>,
}

/// Query keys a client may be allowed to submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKey {
    FreeText,
    CreatorUsernames,
    BaseUris,
    Uuids,
    Tags,
    /// Raw, store-native filter fragment
    Query,
}

impl QueryKey {
    pub const ALL: [QueryKey; 6] = [
        QueryKey::FreeText,
        QueryKey::CreatorUsernames,
        QueryKey::BaseUris,
        QueryKey::Uuids,
        QueryKey::Tags,
        QueryKey::Query,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKey::FreeText => "free_text",
            QueryKey::CreatorUsernames => "creator_usernames",
            QueryKey::BaseUris => "base_uris",
            QueryKey::Uuids => "uuids",
            QueryKey::Tags => "tags",
            QueryKey::Query => "query",
        }
    }

    /// Whether the key carries string values that may be list-typed.
    pub fn is_list_capable(&self) -> bool {
        matches!(
            self,
            QueryKey::CreatorUsernames | QueryKey::BaseUris | QueryKey::Uuids | QueryKey::Tags
        )
    }

    /// Dataset document field matched by a membership key.
    pub fn document_field(&self) -> Option<&'static str> {
        match self {
            QueryKey::CreatorUsernames => Some("creator_username"),
            QueryKey::BaseUris => Some("base_uri"),
            QueryKey::Uuids => Some("uuid"),
            QueryKey::Tags => Some("tags"),
            QueryKey::FreeText | QueryKey::Query => None,
        }
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueryKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        QueryKey::ALL
            .iter()
            .copied()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| format!("unknown query key: {}", s))
    }
}

/// A normalized, per-request search request.
///
/// List fields are `None` when the client did not supply the key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuerySpec {
    pub free_text: Option<String>,
    pub creator_usernames: Option<Vec<String>>,
    pub base_uris: Option<Vec<String>>,
    pub uuids: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub query: Option<Map<String, Value>>,
    pub aggregation: Option<Vec<Value>>,
}

impl QuerySpec {
    /// Values supplied for a membership key, if any.
    pub fn list(&self, key: QueryKey) -> Option<&[String]> {
        match key {
            QueryKey::CreatorUsernames => self.creator_usernames.as_deref(),
            QueryKey::BaseUris => self.base_uris.as_deref(),
            QueryKey::Uuids => self.uuids.as_deref(),
            QueryKey::Tags => self.tags.as_deref(),
            QueryKey::FreeText | QueryKey::Query => None,
        }
    }

    /// Set the values of a membership key. Other keys are ignored.
    pub fn set_list(&mut self, key: QueryKey, values: Vec<String>) {
        match key {
            QueryKey::CreatorUsernames => self.creator_usernames = Some(values),
            QueryKey::BaseUris => self.base_uris = Some(values),
            QueryKey::Uuids => self.uuids = Some(values),
            QueryKey::Tags => self.tags = Some(values),
            QueryKey::FreeText | QueryKey::Query => {}
        }
    }

    /// Base URIs the client asked for. An empty list counts as not asked.
    pub fn requested_base_uris(&self) -> Option<&[String]> {
        self.base_uris.as_deref().filter(|uris| !uris.is_empty())
    }
}

/// Errors that can occur in lookup operations
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Execution failure: {0}")]
    ExecutionFailure(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl LookupError {
    /// Returns true if the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LookupError::ExecutionFailure(_))
    }
}

impl From<serde_json::Error> for LookupError {
    fn from(err: serde_json::Error) -> Self {
        LookupError::SerializationError(err.to_string())
    }
}

/// Result type for lookup operations
pub type Result<T> = std::result::Result<T, LookupError>;

/// Initialize the SQLite schema for permission relations
///
/// Creates all necessary tables if they don't exist:
/// - `users`: identities and their admin flag
/// - `base_uris`: storage locations
/// - `search_permissions`: (user, base URI) pairs with search capability
/// - `register_permissions`: (user, base URI) pairs with register capability
pub fn init_permission_schema(conn: &rusqlite::Connection) -> Result<()> {
    let ddl = r#"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS users (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      username TEXT UNIQUE NOT NULL CHECK (length(username) BETWEEN 1 AND 64),
      is_admin INTEGER NOT NULL DEFAULT 0,
      created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS base_uris (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      base_uri TEXT UNIQUE NOT NULL CHECK (length(base_uri) BETWEEN 3 AND 255),
      created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS search_permissions (
      user_id INTEGER NOT NULL,
      base_uri_id INTEGER NOT NULL,
      PRIMARY KEY (user_id, base_uri_id),
      FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
      FOREIGN KEY (base_uri_id) REFERENCES base_uris(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_search_permissions_base_uri ON search_permissions(base_uri_id);

    CREATE TABLE IF NOT EXISTS register_permissions (
      user_id INTEGER NOT NULL,
      base_uri_id INTEGER NOT NULL,
      PRIMARY KEY (user_id, base_uri_id),
      FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
      FOREIGN KEY (base_uri_id) REFERENCES base_uris(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_register_permissions_base_uri ON register_permissions(base_uri_id);
    "#;

    conn.execute_batch(ddl)?;
    Ok(())
}
