//! Local SQLite database for one client profile.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations and the
//! `kv_store` table behind [`KvStore`].

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::store::KvStore;

pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/ledger.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> LedgerResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| LedgerError::Persistence(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("ledger.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// In-memory database with the full schema (tests, dry runs).
pub fn init_in_memory() -> LedgerResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_configure(path: &Path) -> LedgerResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: key-value store for slices, settings and the offline queue.
fn migrate_v1(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        LedgerError::Storage(e)
    })?;

    info!("Applied migration v1 (kv_store)");
    Ok(())
}

/// Migration v2: flush journal so diagnostics can show when state last
/// reached disk and which writes failed.
fn migrate_v2(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS flush_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slices TEXT NOT NULL,
            ok INTEGER NOT NULL,
            error TEXT,
            flushed_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_flush_log_flushed_at ON flush_log(flushed_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        LedgerError::Storage(e)
    })?;

    info!("Applied migration v2 (flush_log)");
    Ok(())
}

impl DbState {
    fn lock(&self) -> LedgerResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LedgerError::Persistence(e.to_string()))
    }

    /// `(flushed_at, ok)` of the newest journal row.
    pub fn last_flush(&self) -> LedgerResult<Option<(String, bool)>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT flushed_at, ok FROM flush_log ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i32>(1)? != 0)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn schema_version(&self) -> i32 {
        self.lock()
            .ok()
            .and_then(|conn| {
                conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                    row.get(0)
                })
                .ok()
            })
            .unwrap_or(0)
    }
}

impl KvStore for DbState {
    fn get(&self, key: &str) -> LedgerResult<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> LedgerResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> LedgerResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Append a row to the flush journal, keeping the newest 200.
    fn record_flush(&self, slices: &str, error: Option<&str>) -> LedgerResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO flush_log (slices, ok, error) VALUES (?1, ?2, ?3)",
            params![slices, error.is_none() as i32, error],
        )?;
        conn.execute(
            "DELETE FROM flush_log WHERE id NOT IN (
                SELECT id FROM flush_log ORDER BY id DESC LIMIT 200
            )",
            [],
        )?;
        Ok(())
    }
}
