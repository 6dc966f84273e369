//! Durable mutation queue.
//!
//! Every state-changing cashier action is written here as a replayable
//! envelope before any network attempt. Entries are drained FIFO by the sync
//! processor; successful entries are deleted, exhausted ones are parked as
//! `failed` until an operator retries them.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::db::DbState;
use crate::error::{map_sql_error, StoreError, StoreResult};
use crate::models::TableStatus;
use crate::store::Collection;

/// Attempts before an entry is parked as `failed`.
pub const MAX_RETRIES: i64 = 3;

/// Known mutation types.
pub mod mutation_types {
    pub const SESSION_CREATE: &str = "orderSessions.create";
    pub const SESSION_CLOSE: &str = "orderSessions.close";
    pub const ORDER_CREATE: &str = "orders.create";
    pub const TABLE_STATUS: &str = "tables.updateStatus";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Patch,
    Put,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Put => "PUT",
        }
    }
}

/// A local record referenced by an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub collection: Collection,
    pub id: String,
    /// Table status this call asserts; confirmed only while it is still the
    /// local assertion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TableStatus>,
}

/// Serializable description of one request, replayable at any later time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEnvelope {
    pub endpoint: String,
    pub method: HttpMethod,
    pub body: Value,
    pub created_at: String,
    /// Temporary identity this call creates on the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creates: Option<EntityRef>,
    /// Local records settled once this call lands: `pending_sync` clears on
    /// sessions and orders, a table's local status becomes its confirmed one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub touches: Vec<EntityRef>,
    /// Temporary ids that must be swapped for real ones before replay.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl MutationEnvelope {
    pub fn new(method: HttpMethod, endpoint: impl Into<String>, body: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            body,
            created_at: Utc::now().to_rfc3339(),
            creates: None,
            touches: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn creating(mut self, collection: Collection, temp_id: impl Into<String>) -> Self {
        self.creates = Some(EntityRef {
            collection,
            id: temp_id.into(),
            status: None,
        });
        self
    }

    pub fn touching(mut self, collection: Collection, id: impl Into<String>) -> Self {
        self.touches.push(EntityRef {
            collection,
            id: id.into(),
            status: None,
        });
        self
    }

    /// Touch a table, carrying the status this call asserts.
    pub fn touching_table(mut self, table_id: impl Into<String>, status: TableStatus) -> Self {
        self.touches.push(EntityRef {
            collection: Collection::DiningTables,
            id: table_id.into(),
            status: Some(status),
        });
        self
    }

    pub fn depending_on(mut self, temp_id: impl Into<String>) -> Self {
        let temp_id = temp_id.into();
        if !self.depends_on.contains(&temp_id) {
            self.depends_on.push(temp_id);
        }
        self
    }

    /// Replace every reference to `from` with `to`: endpoint path segments,
    /// string values in the body, and the declared refs. Returns `true` if
    /// anything changed.
    pub fn rewrite_id(&mut self, from: &str, to: &str) -> bool {
        let mut changed = false;

        if self.endpoint.split('/').any(|seg| seg == from) {
            self.endpoint = self
                .endpoint
                .split('/')
                .map(|seg| if seg == from { to } else { seg })
                .collect::<Vec<_>>()
                .join("/");
            changed = true;
        }

        changed |= rewrite_json_strings(&mut self.body, from, to);

        for entity in self.creates.iter_mut().chain(self.touches.iter_mut()) {
            if entity.id == from {
                entity.id = to.to_string();
                changed = true;
            }
        }

        let before = self.depends_on.len();
        self.depends_on.retain(|id| id != from);
        changed |= before != self.depends_on.len();

        changed
    }
}

fn rewrite_json_strings(value: &mut Value, from: &str, to: &str) -> bool {
    match value {
        Value::String(s) if s == from => {
            *s = to.to_string();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |acc, v| rewrite_json_strings(v, from, to) | acc),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |acc, v| rewrite_json_strings(v, from, to) | acc),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Failed,
    Synced,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Failed => "failed",
            QueueStatus::Synced => "synced",
        }
    }

    fn parse(raw: &str) -> StoreResult<Self> {
        match raw {
            "pending" => Ok(QueueStatus::Pending),
            "failed" => Ok(QueueStatus::Failed),
            "synced" => Ok(QueueStatus::Synced),
            other => Err(StoreError::Corrupt(format!("queue status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub mutation_type: String,
    pub payload: MutationEnvelope,
    pub status: QueueStatus,
    pub retry_count: i64,
    pub last_attempt_at: Option<String>,
    pub error: Option<String>,
    pub next_retry_at: Option<String>,
}

/// The queued entry that will create a temporary id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCreate {
    pub queue_id: i64,
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: i64,
    pub failed: i64,
}

const ENTRY_COLUMNS: &str =
    "id, mutation_type, payload, status, retry_count, last_attempt_at, error, next_retry_at";

type RawEntry = (
    i64,
    String,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode(raw: RawEntry) -> StoreResult<QueueEntry> {
    let (id, mutation_type, payload, status, retry_count, last_attempt_at, error, next_retry_at) =
        raw;
    let payload: MutationEnvelope = serde_json::from_str(&payload)
        .map_err(|e| StoreError::Corrupt(format!("mutation_queue[{id}] payload: {e}")))?;
    Ok(QueueEntry {
        id,
        mutation_type,
        payload,
        status: QueueStatus::parse(&status)?,
        retry_count,
        last_attempt_at,
        error,
        next_retry_at,
    })
}

fn query_entries(
    conn: &Connection,
    where_clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> StoreResult<Vec<QueueEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM mutation_queue WHERE {where_clause}");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| map_sql_error("mutation_queue", e))?;
    let raws: Vec<RawEntry> = stmt
        .query_map(params, read_raw)
        .map_err(|e| map_sql_error("mutation_queue", e))?
        .collect::<Result<_, _>>()?;
    raws.into_iter().map(decode).collect()
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

/// Append an entry inside the caller's transaction.
pub fn enqueue_in(
    conn: &Connection,
    mutation_type: &str,
    envelope: &MutationEnvelope,
) -> StoreResult<i64> {
    let payload = serde_json::to_string(envelope)?;
    conn.execute(
        "INSERT INTO mutation_queue (mutation_type, payload, status, retry_count, created_at)
         VALUES (?1, ?2, 'pending', 0, ?3)",
        params![mutation_type, payload, envelope.created_at],
    )
    .map_err(|e| map_sql_error("mutation_queue", e))?;
    let id = conn.last_insert_rowid();
    debug!(queue_id = id, mutation_type, endpoint = %envelope.endpoint, "Mutation enqueued");
    Ok(id)
}

/// Durably append an entry. Returns once the write is committed.
pub fn enqueue(db: &DbState, mutation_type: &str, envelope: &MutationEnvelope) -> StoreResult<i64> {
    let conn = db.lock()?;
    enqueue_in(&conn, mutation_type, envelope)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Up to `limit` pending entries due at `now`, in enqueue order.
pub fn fetch_pending(db: &DbState, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<QueueEntry>> {
    fetch_pending_after(db, 0, limit, now)
}

/// Like [`fetch_pending`], starting after queue id `after_id`.
pub fn fetch_pending_after(
    db: &DbState,
    after_id: i64,
    limit: usize,
    now: DateTime<Utc>,
) -> StoreResult<Vec<QueueEntry>> {
    let conn = db.lock()?;
    let now = now.to_rfc3339();
    let limit = limit as i64;
    query_entries(
        &conn,
        "status = 'pending'
           AND id > ?1
           AND (next_retry_at IS NULL OR julianday(next_retry_at) <= julianday(?2))
         ORDER BY id ASC
         LIMIT ?3",
        params![after_id, now, limit],
    )
}

pub fn get_entry(db: &DbState, id: i64) -> StoreResult<Option<QueueEntry>> {
    let conn = db.lock()?;
    let raw = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM mutation_queue WHERE id = ?1"),
            params![id],
            read_raw,
        )
        .optional()
        .map_err(|e| map_sql_error("mutation_queue", e))?;
    raw.map(decode).transpose()
}

pub fn list_by_status(db: &DbState, status: QueueStatus) -> StoreResult<Vec<QueueEntry>> {
    let conn = db.lock()?;
    let status = status.as_str();
    query_entries(&conn, "status = ?1 ORDER BY id ASC", params![status])
}

pub fn counts(db: &DbState) -> StoreResult<QueueCounts> {
    let conn = db.lock()?;
    let count = |status: &str| -> StoreResult<i64> {
        conn.query_row(
            "SELECT COUNT(*) FROM mutation_queue WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )
        .map_err(|e| map_sql_error("mutation_queue", e))
    };
    Ok(QueueCounts {
        pending: count("pending")?,
        failed: count("failed")?,
    })
}

/// Temporary ids whose creating entry is still queued (pending or failed),
/// with that entry.
pub fn unresolved_temp_ids(db: &DbState) -> StoreResult<HashMap<String, PendingCreate>> {
    let conn = db.lock()?;
    let entries = query_entries(&conn, "status IN ('pending', 'failed')", &[])?;
    Ok(entries
        .into_iter()
        .filter_map(|e| {
            let created = e.payload.creates?;
            Some((
                created.id,
                PendingCreate {
                    queue_id: e.id,
                    status: e.status,
                },
            ))
        })
        .collect())
}

/// Ids of `collection` records touched by a still-queued entry.
pub fn queued_touches_in(conn: &Connection, collection: Collection) -> StoreResult<HashSet<String>> {
    let entries = query_entries(conn, "status IN ('pending', 'failed')", &[])?;
    Ok(entries
        .into_iter()
        .flat_map(|e| e.payload.touches)
        .filter(|t| t.collection == collection)
        .map(|t| t.id)
        .collect())
}

// ---------------------------------------------------------------------------
// State transitions
// ---------------------------------------------------------------------------

/// Record an attempt: bump `retry_count` and stamp `last_attempt_at`.
/// Returns the new retry count.
pub fn mark_attempt(db: &DbState, id: i64) -> StoreResult<i64> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE mutation_queue
         SET retry_count = retry_count + 1, last_attempt_at = ?1
         WHERE id = ?2",
        params![now, id],
    )
    .map_err(|e| map_sql_error("mutation_queue", e))?;
    conn.query_row(
        "SELECT retry_count FROM mutation_queue WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| map_sql_error("mutation_queue", e))?
    .ok_or_else(|| StoreError::NotFound(format!("mutation_queue[{id}]")))
}

/// Remove a replayed entry inside the caller's transaction.
pub fn remove_in(conn: &Connection, id: i64) -> StoreResult<()> {
    conn.execute("DELETE FROM mutation_queue WHERE id = ?1", params![id])
        .map_err(|e| map_sql_error("mutation_queue", e))?;
    Ok(())
}

/// Keep an entry pending for a later drain cycle.
pub fn schedule_retry(
    db: &DbState,
    id: i64,
    error: &str,
    next_retry_at: Option<DateTime<Utc>>,
) -> StoreResult<()> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE mutation_queue
         SET status = 'pending', error = ?1, next_retry_at = ?2
         WHERE id = ?3",
        params![error, next_retry_at.map(|t| t.to_rfc3339()), id],
    )
    .map_err(|e| map_sql_error("mutation_queue", e))?;
    Ok(())
}

/// Park an entry until an operator retries it.
pub fn mark_failed(db: &DbState, id: i64, error: &str) -> StoreResult<()> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE mutation_queue
         SET status = 'failed', error = ?1, next_retry_at = NULL
         WHERE id = ?2",
        params![error, id],
    )
    .map_err(|e| map_sql_error("mutation_queue", e))?;
    Ok(())
}

/// Reset every failed entry to pending with a fresh retry budget.
pub fn reset_failed(db: &DbState) -> StoreResult<usize> {
    let conn = db.lock()?;
    let reset = conn
        .execute(
            "UPDATE mutation_queue
             SET status = 'pending', retry_count = 0, error = NULL, next_retry_at = NULL
             WHERE status = 'failed'",
            [],
        )
        .map_err(|e| map_sql_error("mutation_queue", e))?;
    if reset > 0 {
        info!(reset, "Failed mutations reset to pending");
    }
    Ok(reset)
}

/// Rewrite still-queued envelopes that reference `from` to use `to`.
pub fn rewrite_temp_id_in(conn: &Connection, from: &str, to: &str) -> StoreResult<usize> {
    let entries = query_entries(conn, "status IN ('pending', 'failed') ORDER BY id ASC", &[])?;
    let mut rewritten = 0;
    for mut entry in entries {
        if entry.payload.rewrite_id(from, to) {
            let payload = serde_json::to_string(&entry.payload)?;
            conn.execute(
                "UPDATE mutation_queue SET payload = ?1 WHERE id = ?2",
                params![payload, entry.id],
            )
            .map_err(|e| map_sql_error("mutation_queue", e))?;
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

// ===========================================================================
// Tests
// ===========================================================================
