use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::ffi::ErrorCode;
use rusqlite::{Connection, Error as SqliteError, OpenFlags, OptionalExtension};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};

pub struct StoreBootstrap {
    pub store: LocalStore,
    pub path: PathBuf,
    pub recovered: bool,
}

/// Opens (or creates) the durable key/value file under `data_dir`.
///
/// A file that SQLite refuses to read as a database is discarded together
/// with its WAL siblings and recreated empty.
pub fn bootstrap<P: AsRef<Path>>(data_dir: P, store_file: &str) -> AppResult<StoreBootstrap> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(store_file);

    match open_connection(&path) {
        Ok(connection) => {
            info!(
                target: "intake_store",
                path = %path.display(),
                "local store opened"
            );
            Ok(StoreBootstrap {
                store: LocalStore::from_connection(connection),
                path,
                recovered: false,
            })
        }
        Err(AppError::Database(err)) if should_attempt_recovery(&err, &path) => {
            warn!(
                target: "intake_store",
                path = %path.display(),
                error = %err,
                "local store unreadable, recreating"
            );
            recover_store(&path)?;
            let connection = open_connection(&path)?;
            Ok(StoreBootstrap {
                store: LocalStore::from_connection(connection),
                path,
                recovered: true,
            })
        }
        Err(err) => Err(err),
    }
}

fn open_connection(path: &Path) -> AppResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(path, flags)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        "#,
    )?;
    run_migrations(&connection)?;
    Ok(connection)
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS local_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );
        "#,
    )?;
    Ok(())
}

fn should_attempt_recovery(err: &SqliteError, path: &Path) -> bool {
    if !path.exists() {
        return false;
    }

    match err {
        SqliteError::SqliteFailure(code, message) => {
            matches!(code.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
                || message
                    .as_deref()
                    .map(|msg| msg.contains("database disk image is malformed"))
                    .unwrap_or(false)
        }
        _ => false,
    }
}

fn recover_store(path: &Path) -> AppResult<()> {
    remove_if_exists(path)?;
    remove_if_exists(&sibling_path(path, "-wal"))?;
    remove_if_exists(&sibling_path(path, "-shm"))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> AppResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::Io(err)),
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{file_name}{suffix}"))
}

/// Client-local durable key/value namespace. Writes are last-write-wins per
/// key; there is no grouping across keys.
#[derive(Clone)]
pub struct LocalStore {
    backend: StoreBackend,
}

#[derive(Clone)]
enum StoreBackend {
    Sqlite(Arc<Mutex<Connection>>),
    Memory(Arc<Mutex<HashMap<String, String>>>),
}

impl LocalStore {
    fn from_connection(connection: Connection) -> Self {
        Self {
            backend: StoreBackend::Sqlite(Arc::new(Mutex::new(connection))),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: StoreBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn get(&self, key: &str) -> AppResult<Option<String>> {
        match &self.backend {
            StoreBackend::Sqlite(conn) => conn
                .lock()
                .query_row(
                    "SELECT value FROM local_store WHERE key = ?1",
                    [key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(AppError::from),
            StoreBackend::Memory(map) => Ok(map.lock().get(key).cloned()),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> AppResult<()> {
        match &self.backend {
            StoreBackend::Sqlite(conn) => {
                conn.lock().execute(
                    "INSERT INTO local_store (key, value, updated_at)
                    VALUES (?1, ?2, DATETIME('now'))
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = DATETIME('now')",
                    (key, value),
                )?;
                Ok(())
            }
            StoreBackend::Memory(map) => {
                map.lock().insert(key.to_string(), value.to_string());
                Ok(())
            }
        }
    }

    pub fn remove(&self, key: &str) -> AppResult<()> {
        match &self.backend {
            StoreBackend::Sqlite(conn) => {
                conn.lock()
                    .execute("DELETE FROM local_store WHERE key = ?1", [key])?;
                Ok(())
            }
            StoreBackend::Memory(map) => {
                map.lock().remove(key);
                Ok(())
            }
        }
    }

    pub fn contains(&self, key: &str) -> AppResult<bool> {
        self.get(key).map(|value| value.is_some())
    }
}
