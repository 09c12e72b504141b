//! SQLite-backed permission store.
//!
//! Each capability relation is a join table with a composite primary key, so
//! a tuple is a single row and both directions are answered by the same row.
//!
//! # Safety
//!
//! `rusqlite::Connection` is never held across `.await` points. Every
//! operation opens its own connection inside `tokio::task::spawn_blocking`.

use crate::PermissionStore;
use async_trait::async_trait;
use lookup_core::validation::{validate_base_uri, validate_username};
use lookup_core::{
    init_permission_schema, BaseUriRecord, Capability, IdentityRecord, LookupError,
    ResolvedPermissions, Result,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn relation_table(capability: Capability) -> &'static str {
    match capability {
        Capability::Search => "search_permissions",
        Capability::Register => "register_permissions",
    }
}

/// Permission store persisted in a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqlitePermissionStore {
    db_path: PathBuf,
}

impl SqlitePermissionStore {
    /// Open (and if needed initialize) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let store = Self { db_path };

        store
            .with_connection(|conn| {
                init_permission_schema(conn)?;
                Ok(())
            })
            .await?;

        debug!(path = %store.db_path.display(), "Opened permission database");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::connect(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| LookupError::Other(format!("Task join error: {}", e)))?
    }

    async fn change_relation(
        &self,
        username: &str,
        base_uri: &str,
        capability: Capability,
        grant: bool,
    ) -> Result<bool> {
        let username_owned = username.to_string();
        let base_uri_owned = base_uri.to_string();

        let changed = self
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let user_id = user_id(&tx, &username_owned)?;
                let base_uri_id = base_uri_id(&tx, &base_uri_owned)?;

                let sql = if grant {
                    format!(
                        "INSERT OR IGNORE INTO {} (user_id, base_uri_id) VALUES (?1, ?2)",
                        relation_table(capability)
                    )
                } else {
                    format!(
                        "DELETE FROM {} WHERE user_id = ?1 AND base_uri_id = ?2",
                        relation_table(capability)
                    )
                };
                let rows = tx.execute(&sql, params![user_id, base_uri_id])?;
                tx.commit()?;
                Ok(rows > 0)
            })
            .await?;

        if changed {
            info!(
                username = %username,
                base_uri = %base_uri,
                capability = %capability,
                action = if grant { "grant" } else { "revoke" },
                "Permission relation changed"
            );
        }
        Ok(changed)
    }
}

fn user_id(conn: &Connection, username: &str) -> Result<i64> {
    conn.query_row(
        "SELECT id FROM users WHERE username = ?1",
        [username],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| LookupError::NotFound(format!("identity '{}'", username)))
}

fn base_uri_id(conn: &Connection, base_uri: &str) -> Result<i64> {
    conn.query_row(
        "SELECT id FROM base_uris WHERE base_uri = ?1",
        [base_uri],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| LookupError::NotFound(format!("base URI '{}'", base_uri)))
}

fn load_permissions(conn: &Connection, username: &str) -> Result<ResolvedPermissions> {
    let (id, is_admin): (i64, bool) = conn
        .query_row(
            "SELECT id, is_admin FROM users WHERE username = ?1",
            [username],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| LookupError::NotFound(format!("identity '{}'", username)))?;

    let base_uris_for = |capability: Capability| -> Result<BTreeSet<String>> {
        let sql = format!(
            "SELECT b.base_uri FROM {} p JOIN base_uris b ON b.id = p.base_uri_id WHERE p.user_id = ?1",
            relation_table(capability)
        );
        let mut stmt = conn.prepare(&sql)?;
        let uris = stmt
            .query_map([id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<BTreeSet<_>, _>>()?;
        Ok(uris)
    };

    Ok(ResolvedPermissions {
        username: username.to_string(),
        is_admin,
        search_base_uris: base_uris_for(Capability::Search)?,
        register_base_uris: base_uris_for(Capability::Register)?,
    })
}

fn load_base_uri_record(conn: &Connection, base_uri: &str) -> Result<BaseUriRecord> {
    let id = base_uri_id(conn, base_uri)?;

    let users_for = |capability: Capability| -> Result<Vec<String>> {
        let sql = format!(
            "SELECT u.username FROM {} p JOIN users u ON u.id = p.user_id WHERE p.base_uri_id = ?1 ORDER BY u.username",
            relation_table(capability)
        );
        let mut stmt = conn.prepare(&sql)?;
        let users = stmt
            .query_map([id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    };

    Ok(BaseUriRecord {
        base_uri: base_uri.to_string(),
        users_with_search_permissions: users_for(Capability::Search)?,
        users_with_register_permissions: users_for(Capability::Register)?,
    })
}

fn ordered_column(conn: &Connection, sql: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let values = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(values)
}

#[async_trait]
impl PermissionStore for SqlitePermissionStore {
    async fn resolve(&self, username: &str) -> Result<ResolvedPermissions> {
        let username = username.to_string();
        self.with_connection(move |conn| load_permissions(conn, &username))
            .await
    }

    async fn grant(&self, username: &str, base_uri: &str, capability: Capability) -> Result<bool> {
        self.change_relation(username, base_uri, capability, true)
            .await
    }

    async fn revoke(
        &self,
        username: &str,
        base_uri: &str,
        capability: Capability,
    ) -> Result<bool> {
        self.change_relation(username, base_uri, capability, false)
            .await
    }

    async fn register_identity(&self, username: &str, is_admin: bool) -> Result<()> {
        validate_username(username)?;
        let username = username.to_string();

        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO users (username, is_admin) VALUES (?1, ?2)
                 ON CONFLICT(username) DO UPDATE SET is_admin = excluded.is_admin",
                params![username, is_admin],
            )?;
            Ok(())
        })
        .await
    }

    async fn register_base_uri(&self, base_uri: &str) -> Result<()> {
        validate_base_uri(base_uri)?;
        let base_uri = base_uri.to_string();

        self.with_connection(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO base_uris (base_uri) VALUES (?1)",
                [base_uri],
            )?;
            Ok(())
        })
        .await
    }

    async fn base_uri_record(&self, base_uri: &str) -> Result<BaseUriRecord> {
        let base_uri = base_uri.to_string();
        self.with_connection(move |conn| load_base_uri_record(conn, &base_uri))
            .await
    }

    async fn list_identities(&self) -> Result<Vec<IdentityRecord>> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let usernames = ordered_column(&tx, "SELECT username FROM users ORDER BY username")?;
            let records = usernames
                .iter()
                .map(|username| load_permissions(&tx, username).map(IdentityRecord::from))
                .collect::<Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn list_base_uris(&self) -> Result<Vec<BaseUriRecord>> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let base_uris =
                ordered_column(&tx, "SELECT base_uri FROM base_uris ORDER BY base_uri")?;
            let records = base_uris
                .iter()
                .map(|base_uri| load_base_uri_record(&tx, base_uri))
                .collect::<Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }
}
