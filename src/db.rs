//! Local SQLite database layer for the sync engine.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! and the shared connection state every other module goes through.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{StoreError, StoreResult};

/// Shared database connection. The only cross-component mutable resource.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection. Never hold the guard across an `.await`.
    pub fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/pos-sync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> StoreResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| StoreError::Corrupt(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("pos-sync.db");
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

/// Open a migrated in-memory database (tests and demo terminals).
pub fn open_in_memory() -> StoreResult<DbState> {
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

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> StoreResult<()> {
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
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

fn apply(conn: &Connection, version: i32, sql: &str) -> StoreResult<()> {
    conn.execute_batch(sql).map_err(|e| {
        error!("Migration v{version} failed: {e}");
        StoreError::Sqlite(e)
    })
}

/// Migration v1: settings and replicated catalog collections.
fn migrate_v1(conn: &Connection) -> StoreResult<()> {
    apply(
        conn,
        1,
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY(setting_category, setting_key)
        );

        -- catalog collections: one JSON document per id
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS packages (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS dining_tables (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT ''
        );

        -- replication cursors
        CREATE TABLE IF NOT EXISTS sync_cursors (
            collection TEXT PRIMARY KEY,
            cursor_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    info!("Applied migration v1 (settings + catalog collections)");
    Ok(())
}

/// Migration v2: session/order collections and the mutation queue.
fn migrate_v2(conn: &Connection) -> StoreResult<()> {
    apply(
        conn,
        2,
        "
        CREATE TABLE IF NOT EXISTS order_sessions (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT ''
        );

        -- mutation_queue (append-only, drained FIFO)
        CREATE TABLE IF NOT EXISTS mutation_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mutation_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'failed', 'synced')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT,
            error TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_mutation_queue_status ON mutation_queue(status);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;
    info!("Applied migration v2 (sessions, orders, mutation_queue)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> StoreResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v3: retry backoff scheduling and stock conflict records.
fn migrate_v3(conn: &Connection) -> StoreResult<()> {
    if !column_exists(conn, "mutation_queue", "next_retry_at")? {
        conn.execute_batch("ALTER TABLE mutation_queue ADD COLUMN next_retry_at TEXT;")?;
    }

    apply(
        conn,
        3,
        "
        CREATE INDEX IF NOT EXISTS idx_mutation_queue_status_next_retry
            ON mutation_queue(status, next_retry_at);

        -- stock_conflicts (server accepted a sale it had no stock for)
        CREATE TABLE IF NOT EXISTS stock_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue_entry_id INTEGER,
            mutation_type TEXT NOT NULL,
            product_id TEXT NOT NULL,
            requested INTEGER NOT NULL,
            available INTEGER NOT NULL,
            detected_at TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            resolved_at TEXT,
            note TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_stock_conflicts_resolved
            ON stock_conflicts(resolved);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )?;
    info!("Applied migration v3 (queue backoff + stock_conflicts)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> StoreResult<Option<String>> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| crate::error::map_sql_error("local_settings", e))
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| crate::error::map_sql_error("local_settings", e))?;
    Ok(())
}

/// Delete a single setting. Succeeds if it does not exist.
pub fn delete_setting(conn: &Connection, category: &str, key: &str) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
    )
    .map_err(|e| crate::error::map_sql_error("local_settings", e))?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory migrated database for unit tests.
#[cfg(test)]
pub fn test_db() -> DbState {
    open_in_memory().expect("open in-memory db")
}

// ===========================================================================
// Tests
// ===========================================================================
