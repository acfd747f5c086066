use std::{env, path::Path, sync::Arc};

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use thiserror::Error;

const AUTH_TOKEN_VAR: &str = "LIBSQL_AUTH_TOKEN";
const BUSY_TIMEOUT_MS: i64 = 5000;

/// Cloneable handle to the sync store. Each caller opens its own connection,
/// so accounts syncing in parallel never share one.
#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to open sync store at {location}: {source}")]
    Build {
        location: String,
        source: libsql::Error,
    },
    #[error("failed to open connection: {0}")]
    Connect(libsql::Error),
    #[error("failed to execute statement: {0}")]
    Statement(libsql::Error),
    #[error("remote sync store {0} needs LIBSQL_AUTH_TOKEN")]
    MissingAuthToken(String),
}

/// Where the sync store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreLocation {
    Local(String),
    Remote { url: String, auth_token: String },
}

impl StoreLocation {
    fn resolve(database_path: &Path) -> Result<Self, DbError> {
        let location = database_path.to_string_lossy().to_string();
        if !is_remote(&location) {
            return Ok(Self::Local(location));
        }
        // A blank token is what an unset `env:` marker leaves behind.
        match env::var(AUTH_TOKEN_VAR) {
            Ok(token) if !token.trim().is_empty() => Ok(Self::Remote {
                url: location,
                auth_token: token,
            }),
            _ => Err(DbError::MissingAuthToken(location)),
        }
    }
}

impl Database {
    /// Open the store. Local files are switched to WAL so readers keep going
    /// while one account's ingest holds the write lock.
    pub async fn new(database_path: &Path) -> Result<Self, DbError> {
        let location = StoreLocation::resolve(database_path)?;
        let built = match &location {
            StoreLocation::Local(path) => Builder::new_local(path).build().await,
            StoreLocation::Remote { url, auth_token } => {
                Builder::new_remote(url.clone(), auth_token.clone())
                    .build()
                    .await
            }
        };
        let inner = built.map_err(|source| DbError::Build {
            location: database_path.display().to_string(),
            source,
        })?;

        let db = Self {
            inner: Arc::new(inner),
        };
        if matches!(location, StoreLocation::Local(_)) {
            let conn = db.connection().await?;
            query_first(&conn, "PRAGMA journal_mode = WAL").await?;
        }
        Ok(db)
    }

    /// Opens a connection with foreign keys enforced and a busy timeout long
    /// enough for another account's transaction to finish.
    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(DbError::Statement)?;
        query_first(&conn, &format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")).await?;
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        query_first(&conn, "SELECT 1").await
    }
}

/// Runs a statement that answers with a row and drains the first one.
async fn query_first(conn: &Connection, sql: &str) -> Result<(), DbError> {
    let mut rows = conn.query(sql, ()).await.map_err(DbError::Statement)?;
    rows.next().await.map_err(DbError::Statement)?;
    Ok(())
}

fn is_remote(path: &str) -> bool {
    ["libsql://", "http://", "https://"]
        .iter()
        .any(|scheme| path.starts_with(scheme))
}
