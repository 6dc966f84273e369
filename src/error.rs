//! Error types for the sync engine.
//!
//! Local store failures are fatal to the cashier action that caused them;
//! stock rejections are raised synchronously before anything is queued;
//! API errors are classified as retryable or not by the sync processor.

use thiserror::Error;

use crate::store::Collection;

/// Local durable store error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure (disk full, locked, corrupt).
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The collection's table does not exist in this database.
    #[error("store schema error: collection '{0}' is not available")]
    Schema(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// `true` for a missing collection, which callers may treat as a no-op.
    pub fn is_schema(&self) -> bool {
        matches!(self, StoreError::Schema(_))
    }
}

/// Map a rusqlite error raised while touching `collection`, turning a missing
/// table into [`StoreError::Schema`].
pub(crate) fn map_sql_error(collection: &str, err: rusqlite::Error) -> StoreError {
    if err.to_string().to_lowercase().contains("no such table") {
        StoreError::Schema(collection.to_string())
    } else {
        StoreError::Sqlite(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Stock reservation rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StockError {
    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    Insufficient {
        product_id: String,
        requested: u32,
        available: u32,
    },

    #[error("product {0} is not tracked")]
    UnknownProduct(String),

    #[error("package {0} components are not loaded")]
    PackageNotLoaded(String),
}

/// Remote backend error.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("{message} (HTTP {status})")]
    Status {
        status: u16,
        message: String,
        body: Option<serde_json::Value>,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// Transient failures are retried; server rejections other than
    /// timeouts and backpressure are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Timeout(_) => true,
            ApiError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            ApiError::InvalidResponse(_) => true,
            ApiError::InvalidRequest(_) => false,
        }
    }
}

/// Catalog replication failure for one collection. Local records are left
/// as they were.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog fetch failed: {0}")]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0:?} is not replicated from the catalog")]
    NotCatalog(Collection),
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error raised by a cashier action (open tab, add order, close tab).
#[derive(Debug, Error)]
pub enum TabError {
    #[error(transparent)]
    Stock(#[from] StockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("table {0} already has an open tab")]
    TableBusy(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),
}

impl From<rusqlite::Error> for TabError {
    fn from(err: rusqlite::Error) -> Self {
        TabError::Store(StoreError::Sqlite(err))
    }
}

impl From<serde_json::Error> for TabError {
    fn from(err: serde_json::Error) -> Self {
        TabError::Store(StoreError::Serialization(err))
    }
}
