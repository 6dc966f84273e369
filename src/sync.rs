//! Mutation sync processor.
//!
//! Drains the mutation queue against the remote backend: FIFO, one replay at
//! a time, at most one cycle in flight. Successful creates swap temporary ids
//! for server ids across local records and still-queued envelopes; failures
//! are retried with exponential backoff until parked as `failed`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cart::{self, Cart};
use crate::config::SyncConfig;
use crate::db::{self, DbState};
use crate::error::{map_sql_error, ApiError, StoreError, StoreResult};
use crate::models::{DiningTable, Order, OrderStatus, Session, SessionStatus};
use crate::queue::{self, EntityRef, PendingCreate, QueueEntry, QueueStatus, MAX_RETRIES};
use crate::reconciler;
use crate::stock::Shortfall;
use crate::store::{self, Collection};
use crate::telemetry::{SyncTelemetry, TelemetryHub};
use crate::{value_i64, value_str};

const STATE_CATEGORY: &str = "sync_state";
const LAST_SYNC_KEY: &str = "last_sync_at";

/// Source recorded on conflicts found while re-reserving the cart.
pub const CART_RESTORE_SOURCE: &str = "cart.restore";

/// Batch and retry parameters of a drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Replays attempted per cycle.
    pub batch_size: usize,
    pub max_retries: i64,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = if seed < 0 { -seed } else { seed };
    (positive % 700) + 50
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempts` failures:
    /// `base × 2^(attempts − 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempts: i64) -> Duration {
        let exponent = attempts.clamp(1, 16) as u32 - 1;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// `None` when retries are immediate (zero base delay).
    fn next_retry_at(&self, attempts: i64, seed: i64) -> Option<chrono::DateTime<Utc>> {
        if self.base_delay.is_zero() {
            return None;
        }
        let delay_ms = self.backoff(attempts).as_millis() as i64 + deterministic_jitter_ms(seed);
        Some(Utc::now() + ChronoDuration::milliseconds(delay_ms))
    }
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Another cycle was already running; nothing was done.
    pub already_running: bool,
    pub attempted: usize,
    pub synced: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Entries left waiting on an unsynced temporary id.
    pub waiting: usize,
    pub conflicts: usize,
    /// Units per product of held orders the server accepted this cycle.
    pub sold: BTreeMap<String, u32>,
}

impl DrainReport {
    pub fn skipped() -> Self {
        Self {
            already_running: true,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Stock conflicts
// ---------------------------------------------------------------------------

/// A sale the server accepted without the stock to cover it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockConflict {
    pub id: i64,
    /// `None` for shortfalls found while re-reserving the cart.
    pub queue_entry_id: Option<i64>,
    pub mutation_type: String,
    pub product_id: String,
    pub requested: i64,
    pub available: i64,
    pub detected_at: String,
    pub resolved: bool,
    pub resolved_at: Option<String>,
    pub note: Option<String>,
}

/// `(product_id, requested, available)` triples reported by the server.
pub(crate) fn parse_stock_conflicts(body: &Value) -> Vec<(String, i64, i64)> {
    let list = ["stock_conflicts", "stockConflicts"]
        .iter()
        .find_map(|k| {
            body.get(*k)
                .or_else(|| body.get("data").and_then(|d| d.get(*k)))
        })
        .and_then(Value::as_array);
    let Some(list) = list else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|c| {
            let product_id = value_str(c, &["product_id", "productId"])?;
            let requested = value_i64(c, &["requested", "requested_quantity", "requestedQuantity"])
                .unwrap_or(0);
            let available = value_i64(c, &["available", "available_quantity", "availableQuantity"])
                .unwrap_or(0);
            Some((product_id, requested, available))
        })
        .collect()
}

fn record_conflicts_in(
    conn: &Connection,
    entry: &QueueEntry,
    conflicts: &[(String, i64, i64)],
) -> StoreResult<()> {
    let now = Utc::now().to_rfc3339();
    for (product_id, requested, available) in conflicts {
        conn.execute(
            "INSERT INTO stock_conflicts
                (queue_entry_id, mutation_type, product_id, requested, available, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![entry.id, entry.mutation_type, product_id, requested, available, now],
        )
        .map_err(|e| map_sql_error("stock_conflicts", e))?;
        warn!(
            queue_id = entry.id,
            product_id = %product_id,
            requested,
            available,
            "Server reported stock conflict, flagged for review"
        );
    }
    Ok(())
}

/// Record cart holds that a new stock baseline could not cover.
pub fn record_restore_shortfalls(db: &DbState, shortfalls: &[Shortfall]) -> StoreResult<()> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();
    for short in shortfalls {
        conn.execute(
            "INSERT INTO stock_conflicts
                (queue_entry_id, mutation_type, product_id, requested, available, detected_at)
             VALUES (NULL, ?1, ?2, ?3, ?4, ?5)",
            params![
                CART_RESTORE_SOURCE,
                short.product_id,
                short.requested,
                short.available,
                now
            ],
        )
        .map_err(|e| map_sql_error("stock_conflicts", e))?;
    }
    Ok(())
}

pub fn list_open_conflicts(db: &DbState) -> StoreResult<Vec<StockConflict>> {
    let conn = db.lock()?;
    let mut stmt = conn
        .prepare(
            "SELECT id, queue_entry_id, mutation_type, product_id, requested, available,
                    detected_at, resolved, resolved_at, note
             FROM stock_conflicts WHERE resolved = 0 ORDER BY id ASC",
        )
        .map_err(|e| map_sql_error("stock_conflicts", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(StockConflict {
                id: row.get(0)?,
                queue_entry_id: row.get(1)?,
                mutation_type: row.get(2)?,
                product_id: row.get(3)?,
                requested: row.get(4)?,
                available: row.get(5)?,
                detected_at: row.get(6)?,
                resolved: row.get::<_, i64>(7)? != 0,
                resolved_at: row.get(8)?,
                note: row.get(9)?,
            })
        })
        .map_err(|e| map_sql_error("stock_conflicts", e))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Mark a conflict reviewed. Returns `false` if it was unknown or already
/// resolved.
pub fn resolve_conflict(db: &DbState, id: i64, note: Option<&str>) -> StoreResult<bool> {
    let conn = db.lock()?;
    let updated = conn
        .execute(
            "UPDATE stock_conflicts SET resolved = 1, resolved_at = ?1, note = ?2
             WHERE id = ?3 AND resolved = 0",
            params![Utc::now().to_rfc3339(), note, id],
        )
        .map_err(|e| map_sql_error("stock_conflicts", e))?;
    if updated > 0 {
        info!(conflict_id = id, "Stock conflict resolved");
    }
    Ok(updated > 0)
}

fn open_conflict_count(db: &DbState) -> StoreResult<i64> {
    let conn = db.lock()?;
    conn.query_row(
        "SELECT COUNT(*) FROM stock_conflicts WHERE resolved = 0",
        [],
        |row| row.get(0),
    )
    .map_err(|e| map_sql_error("stock_conflicts", e))
}

// ---------------------------------------------------------------------------
// Id-swap reconciliation
// ---------------------------------------------------------------------------

/// Server id of a created record, looked up in the usual response shapes.
pub(crate) fn extract_server_id(body: &Value, collection: Collection) -> Option<String> {
    let nested_key = match collection {
        Collection::Sessions => "session",
        Collection::Orders => "order",
        _ => "record",
    };
    let id_keys: &[&str] = match collection {
        Collection::Sessions => &["id", "session_id", "sessionId"],
        Collection::Orders => &["id", "order_id", "orderId"],
        _ => &["id"],
    };
    let lookup = |v: &Value| {
        value_str(v, id_keys).or_else(|| value_i64(v, id_keys).map(|n| n.to_string()))
    };
    let data = body.get("data");
    data.and_then(|d| d.get(nested_key))
        .and_then(lookup)
        .or_else(|| body.get(nested_key).and_then(lookup))
        .or_else(|| data.and_then(lookup))
        .or_else(|| lookup(body))
}

/// Rewrite every local reference to `from` as `to` inside the caller's
/// transaction. Swapping an id that no longer exists is a no-op.
pub(crate) fn swap_ids_in(
    conn: &Connection,
    collection: Collection,
    from: &str,
    to: &str,
) -> StoreResult<()> {
    let now = Utc::now().to_rfc3339();
    match collection {
        Collection::Sessions => {
            if let Some(mut session) = store::get_in::<Session>(conn, from)? {
                store::delete_in(conn, Collection::Sessions, from)?;
                session.id = to.to_string();
                session.is_temporary = false;
                session.updated_at = now.clone();
                store::upsert_in(conn, &session)?;
            }
            for mut order in store::read_all_in::<Order>(conn)? {
                if order.session_id == from {
                    order.session_id = to.to_string();
                    order.updated_at = now.clone();
                    store::upsert_in(conn, &order)?;
                }
            }
            let mut cart = Cart::load_in(conn)?;
            if cart.rename_session(from, to) {
                cart.save_in(conn)?;
            }
        }
        Collection::Orders => {
            if let Some(mut order) = store::get_in::<Order>(conn, from)? {
                store::delete_in(conn, Collection::Orders, from)?;
                order.id = to.to_string();
                order.is_temporary = false;
                order.updated_at = now;
                store::upsert_in(conn, &order)?;
            }
            let mut cart = Cart::load_in(conn)?;
            if cart.rename_order(from, to) {
                cart.save_in(conn)?;
            }
        }
        other => {
            debug!(collection = other.api_name(), "No local id swap for collection");
        }
    }
    let rewritten = queue::rewrite_temp_id_in(conn, from, to)?;
    debug!(
        collection = collection.api_name(),
        from,
        to,
        rewritten,
        "Temporary id swapped"
    );
    Ok(())
}

/// Settle a record referenced by a replayed envelope. Returns the units a
/// settled order booked as sold.
fn settle_touched_in(conn: &Connection, touched: &EntityRef) -> StoreResult<BTreeMap<String, u32>> {
    let now = Utc::now().to_rfc3339();
    let mut sold = BTreeMap::new();
    match touched.collection {
        Collection::Sessions => {
            if let Some(mut session) = store::get_in::<Session>(conn, &touched.id)? {
                session.pending_sync = false;
                if session.status == SessionStatus::PendingSync {
                    session.status = SessionStatus::Open;
                }
                session.updated_at = now;
                store::upsert_in(conn, &session)?;
            }
        }
        Collection::Orders => {
            if let Some(mut order) = store::get_in::<Order>(conn, &touched.id)? {
                order.pending_sync = false;
                if order.status == OrderStatus::Draft {
                    order.status = OrderStatus::Confirmed;
                }
                order.updated_at = now;
                store::upsert_in(conn, &order)?;
            }
            sold = cart::settle_order_in(conn, &touched.id)?;
        }
        Collection::DiningTables => {
            let Some(status) = touched.status else {
                return Ok(sold);
            };
            if let Some(mut table) = store::get_in::<DiningTable>(conn, &touched.id)? {
                reconciler::acknowledge_table_status(&mut table, status);
                table.updated_at = now;
                store::upsert_in(conn, &table)?;
            }
        }
        _ => {}
    }
    Ok(sold)
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Clears the `syncing` flag on drop, including on early return.
struct SyncingGuard<'a>(&'a AtomicBool);

impl<'a> SyncingGuard<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            .map(|_| SyncingGuard(flag))
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Replayed {
    Synced {
        conflicts: usize,
        sold: BTreeMap<String, u32>,
    },
    Retrying,
    Failed,
}

pub struct SyncProcessor {
    db: Arc<DbState>,
    backend: Arc<dyn crate::api::RemoteBackend>,
    telemetry: TelemetryHub,
    policy: RetryPolicy,
    syncing: AtomicBool,
}

impl SyncProcessor {
    pub fn new(
        db: Arc<DbState>,
        backend: Arc<dyn crate::api::RemoteBackend>,
        telemetry: TelemetryHub,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            db,
            backend,
            telemetry,
            policy,
            syncing: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn telemetry(&self) -> &TelemetryHub {
        &self.telemetry
    }

    /// Current counts plus the in-flight flag.
    pub fn snapshot(&self) -> StoreResult<SyncTelemetry> {
        let counts = queue::counts(&self.db)?;
        let conflict_count = open_conflict_count(&self.db)?;
        let last_sync_at = {
            let conn = self.db.lock()?;
            db::get_setting(&conn, STATE_CATEGORY, LAST_SYNC_KEY)?
        };
        Ok(SyncTelemetry {
            syncing: self.is_syncing(),
            pending_count: counts.pending,
            failed_count: counts.failed,
            conflict_count,
            last_sync_at,
        })
    }

    fn publish(&self) {
        match self.snapshot() {
            Ok(snapshot) => self.telemetry.publish(snapshot),
            Err(e) => warn!(error = %e, "Failed to build sync telemetry"),
        }
    }

    /// Run one drain cycle. Returns [`DrainReport::skipped`] if a cycle is
    /// already running.
    pub async fn process_pending(&self) -> Result<DrainReport, StoreError> {
        let Some(guard) = SyncingGuard::claim(&self.syncing) else {
            debug!("Sync cycle already running, skipping");
            return Ok(DrainReport::skipped());
        };
        self.publish();

        let result = self.drain().await;
        drop(guard);

        match &result {
            Ok(report) if report.attempted > 0 => info!(
                attempted = report.attempted,
                synced = report.synced,
                retrying = report.retrying,
                failed = report.failed,
                waiting = report.waiting,
                conflicts = report.conflicts,
                "Sync cycle complete"
            ),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Sync cycle aborted on local store error"),
        }
        self.publish();
        result
    }

    /// Reset every failed entry to pending with a fresh retry budget, then
    /// drain.
    pub async fn retry_failed(&self) -> Result<DrainReport, StoreError> {
        queue::reset_failed(&self.db)?;
        self.process_pending().await
    }

    /// Replay up to `batch_size` due entries. Entries waiting on an unsynced
    /// creator are skipped without using a slot; entries whose creator is
    /// parked as `failed` are parked with it.
    async fn drain(&self) -> Result<DrainReport, StoreError> {
        let mut report = DrainReport::default();
        let now = Utc::now();
        let batch_size = self.policy.batch_size;
        let mut creators = queue::unresolved_temp_ids(&self.db)?;
        let mut after_id = 0;

        'pages: while report.attempted < batch_size {
            let page = queue::fetch_pending_after(&self.db, after_id, batch_size, now)?;
            if page.is_empty() {
                break;
            }
            for stale in page {
                if report.attempted >= batch_size {
                    break 'pages;
                }
                after_id = stale.id;
                // Earlier swaps in this cycle may have rewritten the payload.
                let Some(entry) = queue::get_entry(&self.db, stale.id)? else {
                    continue;
                };
                let blocker = entry
                    .payload
                    .depends_on
                    .iter()
                    .find_map(|id| creators.get(id).map(|c| (id.clone(), *c)));
                match blocker {
                    Some((temp_id, creator)) if creator.status == QueueStatus::Failed => {
                        let message = format!(
                            "blocked by failed mutation {} creating {temp_id}",
                            creator.queue_id
                        );
                        queue::mark_failed(&self.db, entry.id, &message)?;
                        warn!(
                            queue_id = entry.id,
                            blocked_by = creator.queue_id,
                            mutation_type = %entry.mutation_type,
                            "Mutation parked behind failed dependency"
                        );
                        report.failed += 1;
                        Self::park_created(&mut creators, &entry);
                        continue;
                    }
                    Some((temp_id, _)) => {
                        debug!(queue_id = entry.id, waiting_on = %temp_id, "Mutation waiting on unsynced dependency");
                        report.waiting += 1;
                        continue;
                    }
                    None => {}
                }

                report.attempted += 1;
                match self.replay_entry(&entry).await? {
                    Replayed::Synced { conflicts, sold } => {
                        report.synced += 1;
                        report.conflicts += conflicts;
                        for (product_id, qty) in sold {
                            *report.sold.entry(product_id).or_insert(0) += qty;
                        }
                        if let Some(created) = &entry.payload.creates {
                            creators.remove(&created.id);
                        }
                    }
                    Replayed::Retrying => report.retrying += 1,
                    Replayed::Failed => {
                        report.failed += 1;
                        Self::park_created(&mut creators, &entry);
                    }
                }
            }
        }

        if report.synced > 0 {
            let conn = self.db.lock()?;
            db::set_setting(&conn, STATE_CATEGORY, LAST_SYNC_KEY, &Utc::now().to_rfc3339())?;
        }
        Ok(report)
    }

    /// Note that `entry`'s created id now belongs to a failed entry.
    fn park_created(creators: &mut HashMap<String, PendingCreate>, entry: &QueueEntry) {
        if let Some(created) = &entry.payload.creates {
            creators.insert(
                created.id.clone(),
                PendingCreate {
                    queue_id: entry.id,
                    status: QueueStatus::Failed,
                },
            );
        }
    }

    /// The backend bounds each request with its own timeout; a dispatched
    /// replay is never cancelled here.
    async fn replay_entry(&self, entry: &QueueEntry) -> Result<Replayed, StoreError> {
        let attempts = queue::mark_attempt(&self.db, entry.id)?;
        let result = self.backend.replay(&entry.payload).await;

        match result {
            Ok(body) => {
                let (conflicts, sold) = self.settle_success(entry, &body)?;
                Ok(Replayed::Synced { conflicts, sold })
            }
            // A 409 carrying stock conflicts means the server accepted the sale
            // but flagged it; it is settled like a success.
            Err(ApiError::Status {
                status: 409,
                body: Some(body),
                ..
            }) if !parse_stock_conflicts(&body).is_empty() => {
                let (conflicts, sold) = self.settle_success(entry, &body)?;
                Ok(Replayed::Synced { conflicts, sold })
            }
            Err(e) => {
                let message = e.to_string();
                if e.is_retryable() && attempts < self.policy.max_retries {
                    let next = self.policy.next_retry_at(attempts, entry.id);
                    queue::schedule_retry(&self.db, entry.id, &message, next)?;
                    warn!(
                        queue_id = entry.id,
                        mutation_type = %entry.mutation_type,
                        attempts,
                        error = %message,
                        "Mutation replay failed, will retry"
                    );
                    Ok(Replayed::Retrying)
                } else {
                    queue::mark_failed(&self.db, entry.id, &message)?;
                    error!(
                        queue_id = entry.id,
                        mutation_type = %entry.mutation_type,
                        attempts,
                        error = %message,
                        "Mutation replay failed permanently"
                    );
                    Ok(Replayed::Failed)
                }
            }
        }
    }

    /// Remove the entry and reconcile local records in one transaction.
    /// Returns the number of stock conflicts recorded and the units sold.
    fn settle_success(
        &self,
        entry: &QueueEntry,
        body: &Value,
    ) -> StoreResult<(usize, BTreeMap<String, u32>)> {
        let conflicts = parse_stock_conflicts(body);
        let mut payload = entry.payload.clone();

        let swap = match &payload.creates {
            Some(created) => match extract_server_id(body, created.collection) {
                Some(server_id) if server_id != created.id => {
                    Some((created.collection, created.id.clone(), server_id))
                }
                Some(_) => None,
                None => {
                    warn!(
                        queue_id = entry.id,
                        temp_id = %created.id,
                        "Create accepted without a server id, keeping local id"
                    );
                    None
                }
            },
            None => None,
        };
        if let Some((_, from, to)) = &swap {
            payload.rewrite_id(from, to);
        }

        let sold = store::with_transaction(&self.db, |conn| {
            queue::remove_in(conn, entry.id)?;
            if let Some((collection, from, to)) = &swap {
                swap_ids_in(conn, *collection, from, to)?;
            }
            let mut sold: BTreeMap<String, u32> = BTreeMap::new();
            for touched in &payload.touches {
                for (product_id, qty) in settle_touched_in(conn, touched)? {
                    *sold.entry(product_id).or_insert(0) += qty;
                }
            }
            record_conflicts_in(conn, entry, &conflicts)?;
            Ok::<_, StoreError>(sold)
        })?;

        debug!(
            queue_id = entry.id,
            mutation_type = %entry.mutation_type,
            "Mutation replayed"
        );
        Ok((conflicts.len(), sold))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::CartLine;
    use crate::db::test_db;
    use crate::models::{Asserted, LineKind, Product, TableStatus};
    use crate::queue::{mutation_types, HttpMethod, MutationEnvelope};
    use crate::test_support::ScriptedBackend;
    use serde_json::json;
    use std::sync::Mutex;

    fn immediate() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn processor(backend: &Arc<ScriptedBackend>) -> (Arc<DbState>, SyncProcessor) {
        let db = Arc::new(test_db());
        let engine = SyncProcessor::new(db.clone(), backend.clone(), TelemetryHub::new(), immediate());
        (db, engine)
    }

    fn temp_session(id: &str, table: &str) -> Session {
        Session {
            id: id.into(),
            is_temporary: true,
            table_id: table.into(),
            customer_id: None,
            status: SessionStatus::PendingSync,
            total: 0.0,
            pending_sync: true,
            payment_method: None,
            opened_at: "2026-03-01T10:00:00Z".into(),
            updated_at: "2026-03-01T10:00:00Z".into(),
        }
    }

    fn temp_order(id: &str, session: &str) -> Order {
        Order {
            id: id.into(),
            is_temporary: true,
            session_id: session.into(),
            status: OrderStatus::Draft,
            lines: vec![],
            total: 8.0,
            payment_method: None,
            pending_sync: true,
            created_at: "2026-03-01T10:01:00Z".into(),
            updated_at: "2026-03-01T10:01:00Z".into(),
        }
    }

    fn session_create(temp: &str) -> MutationEnvelope {
        MutationEnvelope::new(HttpMethod::Post, "/api/pos/order-sessions", json!({ "table_id": "t1" }))
            .creating(Collection::Sessions, temp)
            .touching(Collection::Sessions, temp)
    }

    fn order_create(temp: &str, session: &str) -> MutationEnvelope {
        MutationEnvelope::new(
            HttpMethod::Post,
            format!("/api/pos/order-sessions/{session}/orders"),
            json!({ "session_id": session, "lines": [] }),
        )
        .creating(Collection::Orders, temp)
        .touching(Collection::Orders, temp)
        .depending_on(session)
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(3), Duration::from_secs(20));
        assert_eq!(policy.backoff(12), Duration::from_secs(300));
        assert!(immediate().next_retry_at(1, 7).is_none());
        assert!(policy.next_retry_at(1, 7).unwrap() > Utc::now());
    }

    #[test]
    fn test_extract_server_id_shapes() {
        assert_eq!(
            extract_server_id(&json!({ "id": "s-1" }), Collection::Sessions).as_deref(),
            Some("s-1")
        );
        assert_eq!(
            extract_server_id(&json!({ "data": { "session": { "id": 42 } } }), Collection::Sessions)
                .as_deref(),
            Some("42")
        );
        assert_eq!(
            extract_server_id(&json!({ "order": { "order_id": "o-9" } }), Collection::Orders)
                .as_deref(),
            Some("o-9")
        );
        assert_eq!(extract_server_id(&json!({ "ok": true }), Collection::Orders), None);
    }

    #[tokio::test]
    async fn test_id_swap_rewrites_records_and_queued_envelopes() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.respond(Ok(json!({ "data": { "session": { "id": "srv-s1" } } })));
        backend.respond(Ok(json!({ "id": "srv-o1" })));
        let (db, engine) = processor(&backend);

        store::bulk_upsert(&db, &[temp_session("tmp-s1", "t1")]).unwrap();
        store::bulk_upsert(&db, &[temp_order("tmp-o1", "tmp-s1")]).unwrap();
        queue::enqueue(&db, mutation_types::SESSION_CREATE, &session_create("tmp-s1")).unwrap();
        queue::enqueue(&db, mutation_types::ORDER_CREATE, &order_create("tmp-o1", "tmp-s1")).unwrap();

        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.waiting, 0);

        // the order was replayed against the server id, never the temp id
        let replayed = backend.replayed();
        assert_eq!(replayed[1].endpoint, "/api/pos/order-sessions/srv-s1/orders");
        assert_eq!(replayed[1].body["session_id"], "srv-s1");

        assert!(store::get_by_id::<Session>(&db, "tmp-s1").unwrap().is_none());
        let session = store::get_by_id::<Session>(&db, "srv-s1").unwrap().unwrap();
        assert!(!session.is_temporary);
        assert!(!session.pending_sync);
        assert_eq!(session.status, SessionStatus::Open);

        assert!(store::get_by_id::<Order>(&db, "tmp-o1").unwrap().is_none());
        let order = store::get_by_id::<Order>(&db, "srv-o1").unwrap().unwrap();
        assert_eq!(order.session_id, "srv-s1");
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert!(!order.pending_sync);
        assert_eq!(store::read_all::<Order>(&db).unwrap().len(), 1);

        // swapping again is a no-op
        store::with_transaction(&db, |conn| swap_ids_in(conn, Collection::Sessions, "tmp-s1", "srv-s1"))
            .unwrap();
        assert_eq!(store::read_all::<Session>(&db).unwrap().len(), 1);
        assert!(engine.snapshot().unwrap().last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_dependent_entry_waits_without_consuming_retries() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.respond(Err(ApiError::Network("offline".into())));
        let (db, engine) = processor(&backend);

        queue::enqueue(&db, mutation_types::SESSION_CREATE, &session_create("tmp-s1")).unwrap();
        let order = queue::enqueue(&db, mutation_types::ORDER_CREATE, &order_create("tmp-o1", "tmp-s1"))
            .unwrap();

        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.retrying, 1);
        assert_eq!(report.waiting, 1);
        assert_eq!(queue::get_entry(&db, order).unwrap().unwrap().retry_count, 0);
        assert_eq!(backend.replayed().len(), 1);

        // next cycle: session lands, order follows with the server id
        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(queue::counts(&db).unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_park_entry_then_manual_retry() {
        let backend = Arc::new(ScriptedBackend::default());
        for _ in 0..3 {
            backend.respond(Err(ApiError::Status {
                status: 503,
                message: "Admin dashboard server error".into(),
                body: None,
            }));
        }
        let (db, engine) = processor(&backend);
        let id = queue::enqueue(
            &db,
            mutation_types::TABLE_STATUS,
            &MutationEnvelope::new(HttpMethod::Patch, "/api/pos/tables/t1", json!({ "status": "cleaning" })),
        )
        .unwrap();

        for cycle in 1..=3 {
            engine.process_pending().await.unwrap();
            let entry = queue::get_entry(&db, id).unwrap().unwrap();
            assert_eq!(entry.retry_count, cycle);
        }
        let entry = queue::get_entry(&db, id).unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.retry_count, 3);
        assert!(entry.error.as_deref().unwrap().contains("503"));

        // a fourth cycle leaves a failed entry alone
        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.attempted, 0);

        queue::reset_failed(&db).unwrap();
        let entry = queue::get_entry(&db, id).unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.retry_count, 0);

        let report = engine.retry_failed().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(queue::get_entry(&db, id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_retryable_rejection_fails_immediately_and_does_not_block() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.respond(Err(ApiError::Status {
            status: 422,
            message: "Validation failed".into(),
            body: None,
        }));
        let (db, engine) = processor(&backend);
        let env = |t: &str| MutationEnvelope::new(HttpMethod::Patch, format!("/api/pos/tables/{t}"), json!({}));
        let bad = queue::enqueue(&db, mutation_types::TABLE_STATUS, &env("t1")).unwrap();
        let good = queue::enqueue(&db, mutation_types::TABLE_STATUS, &env("t2")).unwrap();

        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.synced, 1);
        let bad = queue::get_entry(&db, bad).unwrap().unwrap();
        assert_eq!(bad.status, QueueStatus::Failed);
        assert_eq!(bad.retry_count, 1);
        assert!(queue::get_entry(&db, good).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stock_conflicts_are_recorded_and_entry_settles() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.respond(Ok(json!({
            "id": "srv-o1",
            "stock_conflicts": [{ "product_id": "lager", "requested": 2, "available": 0 }]
        })));
        backend.respond(Err(ApiError::Status {
            status: 409,
            message: "Conflict".into(),
            body: Some(json!({ "stockConflicts": [{ "productId": "stout", "requested": 1, "available": 0 }] })),
        }));
        let (db, engine) = processor(&backend);
        store::bulk_upsert(&db, &[temp_order("tmp-o1", "s1"), temp_order("tmp-o2", "s1")]).unwrap();
        let env = |o: &str| {
            MutationEnvelope::new(HttpMethod::Post, "/api/pos/order-sessions/s1/orders", json!({}))
                .creating(Collection::Orders, o)
                .touching(Collection::Orders, o)
        };
        queue::enqueue(&db, mutation_types::ORDER_CREATE, &env("tmp-o1")).unwrap();
        queue::enqueue(&db, mutation_types::ORDER_CREATE, &env("tmp-o2")).unwrap();

        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.conflicts, 2);
        assert_eq!(queue::counts(&db).unwrap().pending, 0);

        let open = list_open_conflicts(&db).unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].product_id, "lager");
        assert_eq!((open[0].requested, open[0].available), (2, 0));
        assert_eq!(open[1].product_id, "stout");
        assert_eq!(engine.snapshot().unwrap().conflict_count, 2);

        assert!(resolve_conflict(&db, open[0].id, Some("recounted")).unwrap());
        assert!(!resolve_conflict(&db, open[0].id, None).unwrap());
        assert_eq!(list_open_conflicts(&db).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_table_touch_confirms_local_assertion() {
        let backend = Arc::new(ScriptedBackend::default());
        let (db, engine) = processor(&backend);
        let mut table = DiningTable {
            id: "t1".into(),
            name: "Table 1".into(),
            status: crate::models::Asserted::confirmed(crate::models::TableStatus::Occupied),
            updated_at: String::new(),
        };
        table.status.assert_local(crate::models::TableStatus::Available);
        store::bulk_upsert(&db, &[table]).unwrap();
        queue::enqueue(
            &db,
            mutation_types::TABLE_STATUS,
            &MutationEnvelope::new(HttpMethod::Patch, "/api/pos/tables/t1", json!({ "status": "available" }))
                .touching_table("t1", TableStatus::Available),
        )
        .unwrap();

        engine.process_pending().await.unwrap();
        let table = store::get_by_id::<DiningTable>(&db, "t1").unwrap().unwrap();
        assert_eq!(table.status.local, None);
        assert_eq!(table.status.confirmed, Some(TableStatus::Available));
    }

    #[tokio::test]
    async fn test_table_keeps_newer_assertion_when_older_touch_settles() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.respond(Ok(json!({ "id": "srv-s1" })));
        backend.respond(Err(ApiError::Status {
            status: 422,
            message: "Session already closed".into(),
            body: None,
        }));
        let (db, engine) = processor(&backend);
        let mut table = DiningTable {
            id: "t1".into(),
            name: "Table 1".into(),
            status: Asserted::confirmed(TableStatus::Available),
            updated_at: String::new(),
        };
        table.status.assert_local(TableStatus::Available);
        store::bulk_upsert(&db, &[table]).unwrap();

        // tab opened then closed offline; the table is locally available again
        queue::enqueue(
            &db,
            mutation_types::SESSION_CREATE,
            &session_create("tmp-s1").touching_table("t1", TableStatus::Occupied),
        )
        .unwrap();
        let close = queue::enqueue(
            &db,
            mutation_types::SESSION_CLOSE,
            &MutationEnvelope::new(HttpMethod::Post, "/api/pos/order-sessions/tmp-s1/close", json!({}))
                .touching(Collection::Sessions, "tmp-s1")
                .touching_table("t1", TableStatus::Available)
                .depending_on("tmp-s1"),
        )
        .unwrap();

        let report = engine.process_pending().await.unwrap();
        assert_eq!((report.synced, report.failed), (1, 1));
        assert_eq!(queue::get_entry(&db, close).unwrap().unwrap().status, QueueStatus::Failed);

        let table = store::get_by_id::<DiningTable>(&db, "t1").unwrap().unwrap();
        assert_eq!(table.status.confirmed, Some(TableStatus::Occupied));
        assert_eq!(table.status.local, Some(TableStatus::Available));
        assert_eq!(table.status.effective(), Some(&TableStatus::Available));
    }

    #[tokio::test]
    async fn test_waiting_entries_do_not_starve_the_batch() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.respond(Err(ApiError::Network("offline".into())));
        let db = Arc::new(test_db());
        let engine = SyncProcessor::new(
            db.clone(),
            backend.clone(),
            TelemetryHub::new(),
            RetryPolicy {
                batch_size: 3,
                ..immediate()
            },
        );
        let table = |t: &str| MutationEnvelope::new(HttpMethod::Patch, format!("/api/pos/tables/{t}"), json!({}));

        queue::enqueue(&db, mutation_types::SESSION_CREATE, &session_create("tmp-s1")).unwrap();
        for n in 1..=4 {
            let order = format!("tmp-o{n}");
            queue::enqueue(&db, mutation_types::ORDER_CREATE, &order_create(&order, "tmp-s1")).unwrap();
        }
        let independent = queue::enqueue(&db, mutation_types::TABLE_STATUS, &table("t9")).unwrap();

        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.retrying, 1);
        assert_eq!(report.waiting, 4);
        assert_eq!(report.synced, 1);
        assert!(queue::get_entry(&db, independent).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dependents_of_failed_create_are_parked_then_revived() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.respond(Err(ApiError::Status {
            status: 422,
            message: "Table unavailable".into(),
            body: None,
        }));
        let db = Arc::new(test_db());
        let engine = SyncProcessor::new(
            db.clone(),
            backend.clone(),
            TelemetryHub::new(),
            RetryPolicy {
                batch_size: 3,
                ..immediate()
            },
        );
        let session = queue::enqueue(&db, mutation_types::SESSION_CREATE, &session_create("tmp-s1")).unwrap();
        let mut orders = Vec::new();
        for n in 1..=3 {
            let order = format!("tmp-o{n}");
            orders.push(queue::enqueue(&db, mutation_types::ORDER_CREATE, &order_create(&order, "tmp-s1")).unwrap());
        }
        let independent = queue::enqueue(
            &db,
            mutation_types::TABLE_STATUS,
            &MutationEnvelope::new(HttpMethod::Patch, "/api/pos/tables/t9", json!({})),
        )
        .unwrap();

        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 4);
        assert_eq!(report.waiting, 0);
        assert!(queue::get_entry(&db, independent).unwrap().is_none());
        for id in &orders {
            let entry = queue::get_entry(&db, *id).unwrap().unwrap();
            assert_eq!(entry.status, QueueStatus::Failed);
            assert_eq!(entry.retry_count, 0);
            let error = entry.error.unwrap();
            assert!(error.contains("blocked by failed mutation"));
            assert!(error.contains("tmp-s1"));
        }
        // nothing was sent for the parked orders
        assert_eq!(backend.replayed().len(), 2);

        let report = engine.retry_failed().await.unwrap();
        assert_eq!(report.synced, 3);
        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(queue::get_entry(&db, session).unwrap().is_none());
        assert_eq!(queue::counts(&db).unwrap().pending, 0);
        assert_eq!(queue::counts(&db).unwrap().failed, 0);
    }

    #[tokio::test]
    async fn test_settled_order_reports_units_sold() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.respond(Ok(json!({ "id": "srv-o1" })));
        let (db, engine) = processor(&backend);
        store::bulk_upsert(
            &db,
            &[Product {
                id: "ipa".into(),
                name: "IPA".into(),
                stock: 10,
                price: 6.0,
                tier_price: None,
                category_id: None,
                active: true,
                updated_at: String::new(),
            }],
        )
        .unwrap();
        store::bulk_upsert(&db, &[temp_order("tmp-o1", "s1")]).unwrap();
        let mut cart = Cart::default();
        cart.hold(
            "s1",
            "tmp-o1",
            &[CartLine {
                kind: LineKind::Product,
                item_id: "ipa".into(),
                quantity: 2,
                unit_price: 6.0,
            }],
        );
        cart.save(&db).unwrap();
        queue::enqueue(
            &db,
            mutation_types::ORDER_CREATE,
            &MutationEnvelope::new(HttpMethod::Post, "/api/pos/order-sessions/s1/orders", json!({}))
                .creating(Collection::Orders, "tmp-o1")
                .touching(Collection::Orders, "tmp-o1"),
        )
        .unwrap();

        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.sold.get("ipa"), Some(&2));
        assert!(Cart::load(&db).unwrap().ordered.is_empty());
        let product = store::get_by_id::<Product>(&db, "ipa").unwrap().unwrap();
        assert_eq!(product.stock, 8);
    }

    #[tokio::test]
    async fn test_single_cycle_in_flight_and_telemetry_published() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.hold();
        let (db, engine) = processor(&backend);
        let engine = Arc::new(engine);
        queue::enqueue(
            &db,
            mutation_types::TABLE_STATUS,
            &MutationEnvelope::new(HttpMethod::Patch, "/api/pos/tables/t1", json!({})),
        )
        .unwrap();

        let seen: Arc<Mutex<Vec<SyncTelemetry>>> = Arc::default();
        let _sub = {
            let seen = seen.clone();
            engine.telemetry().subscribe(move |t| seen.lock().unwrap().push(t.clone()))
        };

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.process_pending().await })
        };
        backend.started.notified().await;
        assert!(engine.is_syncing());
        assert_eq!(engine.process_pending().await.unwrap(), DrainReport::skipped());

        backend.release.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert!(!engine.is_syncing());

        let seen = seen.lock().unwrap();
        assert!(seen.first().unwrap().syncing);
        let last = seen.last().unwrap();
        assert!(!last.syncing);
        assert_eq!(last.pending_count, 0);
    }

    #[tokio::test]
    async fn test_backend_timeout_is_retryable() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.respond(Err(ApiError::Timeout(20)));
        let (db, engine) = processor(&backend);
        let id = queue::enqueue(
            &db,
            mutation_types::TABLE_STATUS,
            &MutationEnvelope::new(HttpMethod::Patch, "/api/pos/tables/t1", json!({})),
        )
        .unwrap();

        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.retrying, 1);
        let entry = queue::get_entry(&db, id).unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert!(entry.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_restore_shortfalls_are_listed_without_entry() {
        let db = test_db();
        record_restore_shortfalls(
            &db,
            &[Shortfall {
                product_id: "beer".into(),
                requested: 5,
                available: 4,
            }],
        )
        .unwrap();
        let open = list_open_conflicts(&db).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].queue_entry_id, None);
        assert_eq!(open[0].mutation_type, CART_RESTORE_SOURCE);
        assert_eq!((open[0].requested, open[0].available), (5, 4));
    }
}
