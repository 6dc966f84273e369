//! Domain records stored in the local collections.
//!
//! Catalog records (products, categories, packages, tables) are owned by
//! replication. Sessions and orders are created locally first and carry an
//! explicit `is_temporary` flag until the server assigns their real id.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::store::Collection;

/// A record stored as one JSON document in a named collection.
pub trait Record: Serialize + DeserializeOwned {
    const COLLECTION: Collection;

    fn id(&self) -> &str;

    fn updated_at(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Two-phase values
// ---------------------------------------------------------------------------

/// A value asserted locally (optimistically) and later confirmed by the
/// server. The local assertion wins until the server confirms a value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asserted<T> {
    pub local: Option<T>,
    pub confirmed: Option<T>,
}

impl<T: Clone + PartialEq> Asserted<T> {
    pub fn confirmed(value: T) -> Self {
        Self {
            local: None,
            confirmed: Some(value),
        }
    }

    /// The value the terminal should display.
    pub fn effective(&self) -> Option<&T> {
        self.local.as_ref().or(self.confirmed.as_ref())
    }

    pub fn assert_local(&mut self, value: T) {
        self.local = Some(value);
    }

    /// Record a server-confirmed value. The server is authoritative once it
    /// speaks, so the local assertion is dropped.
    pub fn confirm(&mut self, value: T) {
        self.confirmed = Some(value);
        self.local = None;
    }

    /// The server accepted `value`. The local assertion clears only if it
    /// still equals `value`; a later, different assertion stays pending.
    pub fn acknowledge(&mut self, value: T) {
        if self.local.as_ref() == Some(&value) {
            self.local = None;
        }
        self.confirmed = Some(value);
    }

    /// `true` while a local assertion disagrees with the confirmed value.
    pub fn is_diverged(&self) -> bool {
        match (&self.local, &self.confirmed) {
            (Some(local), Some(confirmed)) => local != confirmed,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    /// Baseline stock as last replicated from the server.
    pub stock: i64,
    pub price: f64,
    #[serde(default)]
    pub tier_price: Option<f64>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageItem {
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub items: Vec<PackageItem>,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Available,
    Occupied,
    Reserved,
    Cleaning,
}

impl TableStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "available" | "free" => Some(TableStatus::Available),
            "occupied" => Some(TableStatus::Occupied),
            "reserved" => Some(TableStatus::Reserved),
            "cleaning" => Some(TableStatus::Cleaning),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiningTable {
    pub id: String,
    pub name: String,
    pub status: Asserted<TableStatus>,
    #[serde(default)]
    pub updated_at: String,
}

impl DiningTable {
    pub fn effective_status(&self) -> TableStatus {
        self.status
            .effective()
            .copied()
            .unwrap_or(TableStatus::Available)
    }
}

// ---------------------------------------------------------------------------
// Sessions and orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    PendingSync,
    Closed,
}

/// A tab: the running, unsettled order context of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub is_temporary: bool,
    pub table_id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub status: SessionStatus,
    pub total: f64,
    pub pending_sync: bool,
    #[serde(default)]
    pub payment_method: Option<String>,
    pub opened_at: String,
    pub updated_at: String,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status != SessionStatus::Closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    Confirmed,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Product,
    Package,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub kind: LineKind,
    pub item_id: String,
    pub quantity: u32,
    pub unit_price: f64,
}

impl OrderLine {
    pub fn line_total(&self) -> f64 {
        self.unit_price * self.quantity as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub is_temporary: bool,
    pub session_id: String,
    pub status: OrderStatus,
    pub lines: Vec<OrderLine>,
    pub total: f64,
    #[serde(default)]
    pub payment_method: Option<String>,
    pub pending_sync: bool,
    pub created_at: String,
    pub updated_at: String,
}

fn default_true() -> bool {
    true
}

macro_rules! impl_record {
    ($ty:ty, $collection:expr) => {
        impl Record for $ty {
            const COLLECTION: Collection = $collection;

            fn id(&self) -> &str {
                &self.id
            }

            fn updated_at(&self) -> &str {
                &self.updated_at
            }
        }
    };
}

impl_record!(Product, Collection::Products);
impl_record!(Category, Collection::Categories);
impl_record!(Package, Collection::Packages);
impl_record!(DiningTable, Collection::DiningTables);
impl_record!(Session, Collection::Sessions);
impl_record!(Order, Collection::Orders);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asserted_local_wins_until_confirmed() {
        let mut status = Asserted::confirmed(TableStatus::Occupied);
        assert_eq!(status.effective(), Some(&TableStatus::Occupied));
        assert!(!status.is_diverged());

        status.assert_local(TableStatus::Available);
        assert_eq!(status.effective(), Some(&TableStatus::Available));
        assert!(status.is_diverged());

        status.confirm(TableStatus::Occupied);
        assert_eq!(status.effective(), Some(&TableStatus::Occupied));
        assert_eq!(status.local, None);
    }

    #[test]
    fn test_acknowledge_keeps_a_later_assertion() {
        let mut status = Asserted::confirmed(TableStatus::Available);
        status.assert_local(TableStatus::Occupied);
        status.assert_local(TableStatus::Available);
        status.acknowledge(TableStatus::Occupied);
        assert_eq!(status.confirmed, Some(TableStatus::Occupied));
        assert_eq!(status.local, Some(TableStatus::Available));

        status.acknowledge(TableStatus::Available);
        assert_eq!(status.local, None);
        assert_eq!(status.effective(), Some(&TableStatus::Available));
    }

    #[test]
    fn test_table_without_status_fields_deserializes() {
        let table: DiningTable = serde_json::from_value(serde_json::json!({
            "id": "t1", "name": "Table 1", "status": {}
        }))
        .unwrap();
        assert_eq!(table.status, Asserted { local: None, confirmed: None });
        assert_eq!(table.effective_status(), TableStatus::Available);
    }

    #[test]
    fn test_table_status_parse_accepts_server_spellings() {
        assert_eq!(TableStatus::parse(" Available "), Some(TableStatus::Available));
        assert_eq!(TableStatus::parse("free"), Some(TableStatus::Available));
        assert_eq!(TableStatus::parse("CLEANING"), Some(TableStatus::Cleaning));
        assert_eq!(TableStatus::parse("broken"), None);
    }

    #[test]
    fn test_product_defaults_when_fields_missing() {
        let product: Product = serde_json::from_value(serde_json::json!({
            "id": "p1", "name": "Lager", "stock": 12, "price": 4.5
        }))
        .unwrap();
        assert!(product.active);
        assert_eq!(product.category_id, None);
        assert_eq!(product.updated_at, "");
    }
}
