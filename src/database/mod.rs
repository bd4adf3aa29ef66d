//! Database layer for the media pipeline
//!
//! This module provides:
//! 1. A pooled SQLite connection layer with separate read/write sides
//! 2. Schema creation and version tracking
//! 3. Small helpers shared by every store (timestamps, JSON columns)

mod connection_pool;
pub mod schema;

#[cfg(test)]
mod tests;

pub use connection_pool::{
    DatabasePool, PoolConfig, PoolError, PoolResult, PoolStats, PooledConnectionGuard, init_database_pool,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Implements `as_str`, `Display`, `FromStr` and SQLite TEXT conversion for a
/// fieldless enum stored by name.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($ty), other)),
                }
            }
        }

        impl rusqlite::types::ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $ty {
            fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| rusqlite::types::FromSqlError::Other(e.into()))
            }
        }
    };
}

pub(crate) use text_enum;

/// Free-form JSON object stored in TEXT columns (details, checkpoints, metadata).
pub type JsonMap = Map<String, Value>;

/// Shared handle used by every store in the crate.
pub struct Database {
    pool: Arc<DatabasePool>,
    db_path: PathBuf,
}

impl Database {
    pub async fn new(db_path: impl AsRef<Path>, config: PoolConfig) -> DatabaseResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        let pool = init_database_pool(&db_path, Some(config)).await?;
        schema::initialize_schema(&pool).await?;

        info!("Database initialized: {}", db_path.display());
        Ok(Self { pool, db_path })
    }

    /// Run a closure against a pooled read connection.
    pub async fn read<T, F>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self.pool.get_read_connection().await?;
        Ok(f(guard.connection())?)
    }

    /// Run a closure against the pooled write connection.
    pub async fn write<T, F>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self.pool.get_write_connection().await?;
        Ok(f(guard.connection())?)
    }

    /// Run a closure inside a write transaction; rolled back when the closure fails.
    pub async fn transaction<T, F>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self.pool.get_write_connection().await?;
        let tx = guard.connection().unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Flush the WAL into the main file so a plain file copy is consistent.
    pub async fn checkpoint_wal(&self) -> DatabaseResult<()> {
        self.write(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        })
        .await
    }

    pub fn pool(&self) -> &Arc<DatabasePool> {
        &self.pool
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.get_stats()
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        info!("Database shutdown complete");
    }
}

pub async fn init_database(db_path: impl AsRef<Path>, config: PoolConfig) -> DatabaseResult<Arc<Database>> {
    Ok(Arc::new(Database::new(db_path, config).await?))
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn json_text(map: &JsonMap) -> String {
    Value::Object(map.clone()).to_string()
}

/// Unwrap a `json!({...})` literal into its map; non-objects become empty.
pub fn json_object(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}

pub fn get_setting(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM app_settings WHERE key = ?1", [key], |row| row.get(0))
        .optional()
}

pub fn put_setting(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![key, value, now()],
    )?;
    Ok(())
}

pub fn delete_setting(conn: &Connection, key: &str) -> rusqlite::Result<bool> {
    Ok(conn.execute("DELETE FROM app_settings WHERE key = ?1", [key])? > 0)
}

/// Parse a TEXT column holding a JSON object; anything else reads as empty.
pub fn json_map(raw: Option<String>) -> JsonMap {
    raw.and_then(|text| match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    })
    .unwrap_or_default()
}

#[cfg(test)]
pub(crate) async fn test_database(dir: &Path) -> Arc<Database> {
    init_database(dir.join("pipeline.db"), PoolConfig::default())
        .await
        .unwrap()
}
