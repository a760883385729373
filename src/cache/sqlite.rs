//! SQLite-backed durable store.
//!
//! Keeps every derivative in a single `derivatives` table next to the
//! catalog database. rusqlite is blocking, so every call hops onto
//! `spawn_blocking` with the connection behind a mutex.

use super::durable::DurableStore;
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Default database location:
/// - Linux: ~/.local/share/raw-thumbnailer/derivatives.db
/// - macOS: ~/Library/Application Support/raw-thumbnailer/derivatives.db
/// - Windows: %APPDATA%\raw-thumbnailer\derivatives.db
pub fn default_db_path() -> Option<PathBuf> {
    let mut path = dirs::data_dir().or_else(dirs::home_dir)?;
    path.push("raw-thumbnailer");
    path.push("derivatives.db");
    Some(path)
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create the database at `path` and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    /// Private in-memory database; contents vanish with the store.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self, StorageError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Number of stored derivatives
    pub async fn entry_count(&self) -> Result<usize, StorageError> {
        self.run(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM derivatives", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StorageError::Task("sqlite connection lock poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS derivatives (
            key             TEXT PRIMARY KEY,
            bytes           BLOB NOT NULL,
            updated_at      INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_string();
        self.run(move |conn| {
            let bytes = conn
                .query_row(
                    "SELECT bytes FROM derivatives WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(bytes)
        })
        .await
    }

    async fn set(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let key = key.to_string();
        let bytes = bytes.to_vec();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO derivatives (key, bytes, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET bytes = excluded.bytes, updated_at = excluded.updated_at",
                params![key, bytes, Utc::now().timestamp()],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = key.to_string();
        self.run(move |conn| {
            conn.execute("DELETE FROM derivatives WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.run(|conn| {
            conn.execute("DELETE FROM derivatives", [])?;
            Ok(())
        })
        .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}
