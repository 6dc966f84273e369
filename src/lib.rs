//! The Small POS - offline-first tab and mutation sync engine.
//!
//! Cashier actions commit locally (SQLite) and enqueue a mutation envelope;
//! the sync processor replays the queue against the admin dashboard when
//! the network allows, swapping temporary ids for server ids as creates
//! are accepted. The catalog replicates the other way, incrementally by
//! `updated_at` cursor.

pub mod api;
pub mod cart;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod queue;
pub mod reconciler;
pub mod runtime;
pub mod stock;
pub mod store;
pub mod sync;
pub mod tabs;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use api::{HttpBackend, RemoteBackend};
pub use cart::{Cart, CartLine};
pub use catalog::{CatalogReplicator, CatalogSource};
pub use config::SyncConfig;
pub use db::DbState;
pub use error::{ApiError, CatalogError, ConfigError, StockError, StoreError, TabError};
pub use logging::init_tracing;
pub use runtime::Runtime;
pub use stock::StockTracker;
pub use sync::{DrainReport, RetryPolicy, SyncProcessor};
pub use telemetry::{Subscription, SyncTelemetry, TelemetryHub};

// ---------------------------------------------------------------------------
// JSON field helpers
// ---------------------------------------------------------------------------

/// First non-blank string among `keys`.
pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_f64()) {
            return Some(n);
        }
    }
    None
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_i64()) {
            return Some(n);
        }
    }
    None
}
