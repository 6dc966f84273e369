//! Collection-level contract over the local SQLite database.
//!
//! Every collection is a table of `(id, data, updated_at)` rows where `data`
//! is the record's JSON document. Writes are atomic per call: multi-record
//! and multi-collection writes run inside one IMMEDIATE transaction.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::db::DbState;
use crate::error::{map_sql_error, StoreError, StoreResult};
use crate::models::Record;

/// Named collections held by the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Products,
    Categories,
    Packages,
    DiningTables,
    Sessions,
    Orders,
}

impl Collection {
    /// Collections replicated from the catalog endpoints.
    pub const CATALOG: [Collection; 4] = [
        Collection::Products,
        Collection::Categories,
        Collection::Packages,
        Collection::DiningTables,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            Collection::Products => "products",
            Collection::Categories => "categories",
            Collection::Packages => "packages",
            Collection::DiningTables => "dining_tables",
            Collection::Sessions => "order_sessions",
            Collection::Orders => "orders",
        }
    }

    /// Name used by the admin API and in sync cursors.
    pub fn api_name(self) -> &'static str {
        match self {
            Collection::Products => "products",
            Collection::Categories => "categories",
            Collection::Packages => "packages",
            Collection::DiningTables => "tables",
            Collection::Sessions => "orderSessions",
            Collection::Orders => "orders",
        }
    }
}

/// One write in a [`transactional_write`] batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Upsert {
        collection: Collection,
        id: String,
        data: Value,
        updated_at: String,
    },
    Delete {
        collection: Collection,
        id: String,
    },
}

impl StoreOp {
    pub fn upsert<R: Record>(record: &R) -> StoreResult<Self> {
        Ok(StoreOp::Upsert {
            collection: R::COLLECTION,
            id: record.id().to_string(),
            data: serde_json::to_value(record)?,
            updated_at: record.updated_at().to_string(),
        })
    }

    pub fn delete(collection: Collection, id: impl Into<String>) -> Self {
        StoreOp::Delete {
            collection,
            id: id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside an open transaction)
// ---------------------------------------------------------------------------

fn upsert_raw(
    conn: &Connection,
    collection: Collection,
    id: &str,
    data: &Value,
    updated_at: &str,
) -> StoreResult<()> {
    let table = collection.table_name();
    let json = serde_json::to_string(data)?;
    conn.execute(
        &format!(
            "INSERT INTO {table} (id, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at"
        ),
        params![id, json, updated_at],
    )
    .map_err(|e| map_sql_error(table, e))?;
    Ok(())
}

fn decode<R: Record>(collection: Collection, id: &str, raw: &str) -> StoreResult<R> {
    serde_json::from_str(raw).map_err(|e| {
        StoreError::Corrupt(format!("{}[{id}]: {e}", collection.table_name()))
    })
}

/// Insert or replace one record.
pub fn upsert_in<R: Record>(conn: &Connection, record: &R) -> StoreResult<()> {
    let data = serde_json::to_value(record)?;
    upsert_raw(conn, R::COLLECTION, record.id(), &data, record.updated_at())
}

/// Delete one record. Returns `true` if a row was removed.
pub fn delete_in(conn: &Connection, collection: Collection, id: &str) -> StoreResult<bool> {
    let table = collection.table_name();
    let removed = conn
        .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])
        .map_err(|e| map_sql_error(table, e))?;
    Ok(removed > 0)
}

pub fn get_in<R: Record>(conn: &Connection, id: &str) -> StoreResult<Option<R>> {
    let table = R::COLLECTION.table_name();
    let raw: Option<String> = conn
        .query_row(
            &format!("SELECT data FROM {table} WHERE id = ?1"),
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| map_sql_error(table, e))?;
    raw.map(|s| decode(R::COLLECTION, id, &s)).transpose()
}

pub fn read_all_in<R: Record>(conn: &Connection) -> StoreResult<Vec<R>> {
    let table = R::COLLECTION.table_name();
    let mut stmt = conn
        .prepare(&format!("SELECT id, data FROM {table} ORDER BY rowid ASC"))
        .map_err(|e| map_sql_error(table, e))?;
    let rows: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| map_sql_error(table, e))?
        .collect::<Result<_, _>>()?;
    rows.iter()
        .map(|(id, raw)| decode(R::COLLECTION, id, raw))
        .collect()
}

pub fn apply_ops_in(conn: &Connection, ops: &[StoreOp]) -> StoreResult<()> {
    for op in ops {
        match op {
            StoreOp::Upsert {
                collection,
                id,
                data,
                updated_at,
            } => upsert_raw(conn, *collection, id, data, updated_at)?,
            StoreOp::Delete { collection, id } => {
                delete_in(conn, *collection, id)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Run `f` inside one IMMEDIATE transaction. Any error rolls back every
/// write made by `f`.
pub fn with_transaction<T, E>(
    db: &DbState,
    f: impl FnOnce(&Connection) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<StoreError>,
{
    let mut conn = db.lock()?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(StoreError::from)?;
    let out = f(&tx)?;
    tx.commit().map_err(StoreError::from)?;
    Ok(out)
}

/// Insert or replace every record of one collection atomically.
pub fn bulk_upsert<R: Record>(db: &DbState, records: &[R]) -> StoreResult<usize> {
    if records.is_empty() {
        return Ok(0);
    }
    with_transaction(db, |conn| {
        for record in records {
            upsert_in(conn, record)?;
        }
        Ok::<_, StoreError>(())
    })?;
    debug!(
        collection = R::COLLECTION.table_name(),
        count = records.len(),
        "bulk upsert committed"
    );
    Ok(records.len())
}

pub fn read_all<R: Record>(db: &DbState) -> StoreResult<Vec<R>> {
    let conn = db.lock()?;
    read_all_in(&conn)
}

pub fn get_by_id<R: Record>(db: &DbState, id: &str) -> StoreResult<Option<R>> {
    let conn = db.lock()?;
    get_in(&conn, id)
}

/// Apply upserts and deletes across one or more collections atomically.
pub fn transactional_write(db: &DbState, ops: &[StoreOp]) -> StoreResult<()> {
    with_transaction(db, |conn| apply_ops_in(conn, ops))
}

pub fn get_sync_cursor(db: &DbState, collection: Collection) -> StoreResult<Option<String>> {
    let conn = db.lock()?;
    conn.query_row(
        "SELECT cursor_value FROM sync_cursors WHERE collection = ?1",
        params![collection.api_name()],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| map_sql_error("sync_cursors", e))
}

pub fn set_sync_cursor(db: &DbState, collection: Collection, value: &str) -> StoreResult<()> {
    let conn = db.lock()?;
    set_sync_cursor_in(&conn, collection, value)
}

/// Advance a cursor inside the caller's transaction.
pub fn set_sync_cursor_in(conn: &Connection, collection: Collection, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sync_cursors (collection, cursor_value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(collection) DO UPDATE SET
            cursor_value = excluded.cursor_value,
            updated_at = excluded.updated_at",
        params![collection.api_name(), value],
    )
    .map_err(|e| map_sql_error("sync_cursors", e))?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
