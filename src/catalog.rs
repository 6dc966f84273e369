//! Catalog replication.
//!
//! Pulls incremental deltas of the server-owned collections (products,
//! categories, packages, dining tables) and merges them into the local store,
//! advancing a per-collection `updated_at` cursor. A failed fetch leaves local
//! records untouched.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::DateTime;
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::db::DbState;
use crate::queue;
use crate::reconciler;
use crate::error::{ApiError, CatalogError, StoreResult};
use crate::models::{
    Asserted, Category, DiningTable, Package, PackageItem, Product, TableStatus,
};
use crate::store::{self, Collection};
use crate::{value_f64, value_i64, value_str};

/// Raw records changed since a cursor, as returned by the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogDelta {
    pub records: Vec<Value>,
    /// Server-reported maximum `updated_at` of the delta, when provided.
    pub max_updated_at: Option<String>,
}

/// Source of catalog deltas.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_delta(
        &self,
        collection: Collection,
        since: Option<&str>,
    ) -> Result<CatalogDelta, ApiError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// Another replication of the same collection was already running.
    Coalesced,
    Synced {
        /// Records written or removed.
        applied: usize,
        cursor: Option<String>,
    },
}

impl ReplicationOutcome {
    pub fn applied(&self) -> usize {
        match self {
            ReplicationOutcome::Synced { applied, .. } => *applied,
            ReplicationOutcome::Coalesced => 0,
        }
    }
}

/// Result of one pass over every catalog collection.
#[derive(Debug, Clone, Default)]
pub struct ReplicationSummary {
    pub changed: Vec<Collection>,
    pub failed: Vec<(Collection, String)>,
}

impl ReplicationSummary {
    /// `true` when products or packages changed and the stock baseline must
    /// be re-seeded.
    pub fn stock_baseline_changed(&self) -> bool {
        self.changed
            .iter()
            .any(|c| matches!(c, Collection::Products | Collection::Packages))
    }
}

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

fn loose_id(v: &Value, keys: &[&str]) -> Option<String> {
    value_str(v, keys).or_else(|| value_i64(v, keys).map(|n| n.to_string()))
}

fn loose_f64(v: &Value, keys: &[&str]) -> Option<f64> {
    value_f64(v, keys).or_else(|| value_str(v, keys).and_then(|s| s.parse().ok()))
}

fn loose_i64(v: &Value, keys: &[&str]) -> Option<i64> {
    value_i64(v, keys)
        .or_else(|| value_f64(v, keys).map(|n| n.trunc() as i64))
        .or_else(|| value_str(v, keys).and_then(|s| s.parse().ok()))
}

fn loose_bool(v: &Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        match v.get(*key) {
            Some(Value::Bool(b)) => return Some(*b),
            Some(Value::Number(n)) => return n.as_i64().map(|n| n != 0),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => return Some(true),
                "false" | "0" | "no" => return Some(false),
                _ => {}
            },
            _ => {}
        }
    }
    None
}

fn updated_at_of(v: &Value) -> String {
    value_str(v, &["updated_at", "updatedAt"]).unwrap_or_default()
}

/// Server rows flagged as removed.
fn is_tombstone(v: &Value) -> bool {
    loose_bool(v, &["is_deleted", "isDeleted", "deleted"]).unwrap_or(false)
        || value_str(v, &["deleted_at", "deletedAt"]).is_some()
}

pub(crate) fn normalize_product(v: &Value) -> Option<Product> {
    Some(Product {
        id: loose_id(v, &["id", "product_id", "productId"])?,
        name: value_str(v, &["name", "title"]).unwrap_or_default(),
        stock: loose_i64(v, &["stock", "stock_quantity", "stockQuantity", "quantity"]).unwrap_or(0),
        price: loose_f64(v, &["price", "base_price", "basePrice"]).unwrap_or(0.0),
        tier_price: loose_f64(v, &["tier_price", "tierPrice"]),
        category_id: loose_id(v, &["category_id", "categoryId"]),
        active: loose_bool(v, &["active", "is_active", "isActive"]).unwrap_or(true),
        updated_at: updated_at_of(v),
    })
}

pub(crate) fn normalize_category(v: &Value) -> Option<Category> {
    Some(Category {
        id: loose_id(v, &["id", "category_id", "categoryId"])?,
        name: value_str(v, &["name", "title"]).unwrap_or_default(),
        sort_order: loose_i64(v, &["sort_order", "sortOrder", "display_order", "displayOrder"])
            .unwrap_or(0),
        updated_at: updated_at_of(v),
    })
}

fn normalize_package_item(v: &Value) -> Option<PackageItem> {
    let product_id = loose_id(v, &["product_id", "productId"])
        .or_else(|| v.get("product").and_then(|p| loose_id(p, &["id"])))?;
    let quantity = loose_i64(v, &["quantity", "qty"]).unwrap_or(1);
    let quantity = u32::try_from(quantity).ok().filter(|q| *q > 0)?;
    Some(PackageItem {
        product_id,
        quantity,
    })
}

pub(crate) fn normalize_package(v: &Value) -> Option<Package> {
    let items = ["items", "components", "package_items", "packageItems"]
        .iter()
        .find_map(|k| v.get(*k).and_then(Value::as_array))
        .map(|arr| arr.iter().filter_map(normalize_package_item).collect())
        .unwrap_or_default();
    Some(Package {
        id: loose_id(v, &["id", "package_id", "packageId"])?,
        name: value_str(v, &["name", "title"]).unwrap_or_default(),
        price: loose_f64(v, &["price"]).unwrap_or(0.0),
        items,
        updated_at: updated_at_of(v),
    })
}

/// Server-side table status becomes the confirmed status. The local
/// assertion of `existing` survives only with `keep_local`, i.e. while a
/// queued mutation still carries it to the server.
pub(crate) fn normalize_table(
    v: &Value,
    existing: Option<&DiningTable>,
    keep_local: bool,
) -> Option<DiningTable> {
    let id = loose_id(v, &["id", "table_id", "tableId"])?;
    let name = value_str(v, &["name", "label"])
        .or_else(|| loose_id(v, &["table_number", "tableNumber"]).map(|n| format!("Table {n}")))
        .unwrap_or_else(|| id.clone());
    let confirmed = value_str(v, &["status"])
        .and_then(|s| TableStatus::parse(&s))
        .unwrap_or(TableStatus::Available);
    let mut table = DiningTable {
        id,
        name,
        status: Asserted {
            local: existing.and_then(|t| t.status.local),
            confirmed: None,
        },
        updated_at: updated_at_of(v),
    };
    if keep_local {
        table.status.confirmed = Some(confirmed);
    } else {
        reconciler::confirm_from_server(&mut table, confirmed);
    }
    Some(table)
}

/// Latest of the given timestamps. RFC 3339 values compare by instant,
/// anything else lexically.
pub(crate) fn max_timestamp<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut best: Option<&str> = None;
    for candidate in values.into_iter().filter(|s| !s.is_empty()) {
        best = match best {
            None => Some(candidate),
            Some(current) => {
                let later = match (
                    DateTime::parse_from_rfc3339(candidate),
                    DateTime::parse_from_rfc3339(current),
                ) {
                    (Ok(a), Ok(b)) => a > b,
                    _ => candidate > current,
                };
                Some(if later { candidate } else { current })
            }
        };
    }
    best.map(str::to_string)
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Write one delta inside the caller's transaction. Returns the number of
/// records written or removed.
fn merge_delta(conn: &Connection, collection: Collection, records: &[Value]) -> StoreResult<usize> {
    let queued_tables = match collection {
        Collection::DiningTables => queue::queued_touches_in(conn, Collection::DiningTables)?,
        _ => HashSet::new(),
    };
    let mut applied = 0;
    for raw in records {
        if is_tombstone(raw) {
            if let Some(id) = loose_id(raw, &["id"]) {
                if store::delete_in(conn, collection, &id)? {
                    applied += 1;
                }
            }
            continue;
        }

        let written = match collection {
            Collection::Products => normalize_product(raw)
                .map(|r| store::upsert_in(conn, &r))
                .transpose()?,
            Collection::Categories => normalize_category(raw)
                .map(|r| store::upsert_in(conn, &r))
                .transpose()?,
            Collection::Packages => normalize_package(raw)
                .map(|r| store::upsert_in(conn, &r))
                .transpose()?,
            Collection::DiningTables => {
                let (existing, queued) = match loose_id(raw, &["id", "table_id", "tableId"]) {
                    Some(id) => (store::get_in::<DiningTable>(conn, &id)?, queued_tables.contains(&id)),
                    None => (None, false),
                };
                normalize_table(raw, existing.as_ref(), queued)
                    .map(|r| store::upsert_in(conn, &r))
                    .transpose()?
            }
            Collection::Sessions | Collection::Orders => None,
        };

        match written {
            Some(()) => applied += 1,
            None => warn!(
                collection = collection.api_name(),
                record = %raw,
                "Skipping catalog record without an id"
            ),
        }
    }
    Ok(applied)
}

// ---------------------------------------------------------------------------
// Replicator
// ---------------------------------------------------------------------------

/// Releases a collection's in-flight slot on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Collection>>,
    collection: Collection,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.collection);
    }
}

pub struct CatalogReplicator {
    db: Arc<DbState>,
    source: Arc<dyn CatalogSource>,
    in_flight: Mutex<HashSet<Collection>>,
}

impl CatalogReplicator {
    pub fn new(db: Arc<DbState>, source: Arc<dyn CatalogSource>) -> Self {
        Self {
            db,
            source,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, collection: Collection) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(collection) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            collection,
        })
    }

    /// Fetch and merge one collection's delta since its cursor.
    pub async fn replicate(&self, collection: Collection) -> Result<ReplicationOutcome, CatalogError> {
        if !Collection::CATALOG.contains(&collection) {
            return Err(CatalogError::NotCatalog(collection));
        }
        let Some(_guard) = self.claim(collection) else {
            debug!(collection = collection.api_name(), "Catalog replication already running");
            return Ok(ReplicationOutcome::Coalesced);
        };

        let cursor = store::get_sync_cursor(&self.db, collection)?;
        let delta = self
            .source
            .fetch_delta(collection, cursor.as_deref())
            .await?;

        if delta.records.is_empty() {
            debug!(collection = collection.api_name(), "Catalog delta empty");
            return Ok(ReplicationOutcome::Synced {
                applied: 0,
                cursor,
            });
        }

        let observed = max_timestamp(
            delta
                .records
                .iter()
                .filter_map(|r| r.get("updated_at").or_else(|| r.get("updatedAt")))
                .filter_map(Value::as_str),
        );
        let next_cursor = max_timestamp(
            [
                delta.max_updated_at.as_deref(),
                observed.as_deref(),
                cursor.as_deref(),
            ]
            .into_iter()
            .flatten(),
        );

        let merged = store::with_transaction(&self.db, |conn| {
            let applied = merge_delta(conn, collection, &delta.records)?;
            if let Some(next) = next_cursor.as_deref() {
                store::set_sync_cursor_in(conn, collection, next)?;
            }
            Ok::<_, crate::error::StoreError>(applied)
        });
        let applied = match merged {
            Ok(applied) => applied,
            Err(e) if e.is_schema() => {
                warn!(collection = collection.api_name(), error = %e, "Catalog collection missing locally");
                return Ok(ReplicationOutcome::Synced {
                    applied: 0,
                    cursor,
                });
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            collection = collection.api_name(),
            applied,
            cursor = next_cursor.as_deref().unwrap_or(""),
            "Catalog delta merged"
        );
        Ok(ReplicationOutcome::Synced {
            applied,
            cursor: next_cursor,
        })
    }

    /// Replicate every catalog collection. A failure on one collection does
    /// not stop the others.
    pub async fn replicate_all(&self) -> ReplicationSummary {
        let mut summary = ReplicationSummary::default();
        for collection in Collection::CATALOG {
            match self.replicate(collection).await {
                Ok(outcome) if outcome.applied() > 0 => summary.changed.push(collection),
                Ok(_) => {}
                Err(e) => {
                    warn!(collection = collection.api_name(), error = %e, "Catalog replication failed");
                    summary.failed.push((collection, e.to_string()));
                }
            }
        }
        summary
    }
}

// ===========================================================================
// Tests
// ===========================================================================
