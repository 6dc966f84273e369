//! In-memory stock reservation ledger.
//!
//! The baseline comes from the replicated catalog; reservations are the
//! holds made by the active cart before anything reaches the server.
//! `available = baseline - reserved`, and `reserved` never exceeds
//! `baseline` for any product.
//!
//! The tracker is owned by one cashier session and mutated synchronously.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::error::StockError;
use crate::models::{LineKind, Package, Product};

/// A line to re-reserve after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationLine {
    pub kind: LineKind,
    pub item_id: String,
    pub quantity: u32,
}

/// A product whose persisted holds exceed its new baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortfall {
    pub product_id: String,
    pub requested: u32,
    pub available: u32,
}

/// Result of replaying a persisted cart into a fresh tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Every line was re-reserved.
    Restored { lines: usize },
    /// Every line was re-reserved, but the listed products could only be
    /// held up to their baseline.
    Clamped {
        lines: usize,
        shortfalls: Vec<Shortfall>,
    },
    /// Some referenced products or packages are not tracked yet; nothing was
    /// reserved.
    Deferred { missing: Vec<String> },
}

#[derive(Debug, Default)]
pub struct StockTracker {
    baseline: HashMap<String, u32>,
    reserved: HashMap<String, u32>,
}

impl StockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the baseline from the catalog and clear every reservation.
    /// Inactive products and negative server stock are tracked as zero.
    pub fn initialize_stock(&mut self, catalog: &[Product]) {
        self.baseline = catalog
            .iter()
            .map(|p| {
                let qty = if p.active { p.stock.max(0) } else { 0 };
                (p.id.clone(), u32::try_from(qty).unwrap_or(u32::MAX))
            })
            .collect();
        self.reserved.clear();
        info!(products = self.baseline.len(), "Stock baseline initialized");
    }

    pub fn is_tracked(&self, product_id: &str) -> bool {
        self.baseline.contains_key(product_id)
    }

    pub fn reserved(&self, product_id: &str) -> u32 {
        self.reserved.get(product_id).copied().unwrap_or(0)
    }

    /// Stock shown to the cashier: baseline minus active reservations.
    pub fn get_current_stock(&self, product_id: &str) -> u32 {
        let baseline = self.baseline.get(product_id).copied().unwrap_or(0);
        baseline.saturating_sub(self.reserved(product_id))
    }

    pub fn has_stock(&self, product_id: &str, qty: u32) -> bool {
        self.is_tracked(product_id) && self.get_current_stock(product_id) >= qty
    }

    pub fn reserve_stock(&mut self, product_id: &str, qty: u32) -> Result<(), StockError> {
        self.check(product_id, qty)?;
        *self.reserved.entry(product_id.to_string()).or_insert(0) += qty;
        debug!(product_id, qty, "Stock reserved");
        Ok(())
    }

    /// Release a hold. Releasing more than is reserved floors at zero.
    pub fn release_stock(&mut self, product_id: &str, qty: u32) {
        if let Some(held) = self.reserved.get_mut(product_id) {
            *held = held.saturating_sub(qty);
            if *held == 0 {
                self.reserved.remove(product_id);
            }
        }
    }

    /// True once a catalog baseline has been loaded.
    pub fn is_seeded(&self) -> bool {
        !self.baseline.is_empty()
    }

    /// Clear every reservation (cart cleared or paid).
    pub fn reset_all_stock(&mut self) {
        self.reserved.clear();
    }

    fn check(&self, product_id: &str, qty: u32) -> Result<(), StockError> {
        if !self.is_tracked(product_id) {
            return Err(StockError::UnknownProduct(product_id.to_string()));
        }
        let available = self.get_current_stock(product_id);
        if available < qty {
            return Err(StockError::Insufficient {
                product_id: product_id.to_string(),
                requested: qty,
                available,
            });
        }
        Ok(())
    }

    /// Per-product requirement of `cart_qty` units of a package.
    fn package_requirements(
        package: &Package,
        cart_qty: u32,
    ) -> Result<HashMap<&str, u32>, StockError> {
        if package.items.is_empty() {
            return Err(StockError::PackageNotLoaded(package.id.clone()));
        }
        let mut needed: HashMap<&str, u32> = HashMap::new();
        for item in &package.items {
            *needed.entry(item.product_id.as_str()).or_insert(0) +=
                item.quantity.saturating_mul(cart_qty);
        }
        Ok(needed)
    }

    /// Reserve every component of a package. All components are checked
    /// before any is reserved.
    pub fn reserve_package(&mut self, package: &Package, cart_qty: u32) -> Result<(), StockError> {
        let needed = Self::package_requirements(package, cart_qty)?;
        for (product_id, qty) in &needed {
            self.check(product_id, *qty)?;
        }
        for (product_id, qty) in needed {
            *self.reserved.entry(product_id.to_string()).or_insert(0) += qty;
        }
        debug!(package_id = %package.id, cart_qty, "Package reserved");
        Ok(())
    }

    pub fn release_package(&mut self, package: &Package, cart_qty: u32) {
        for item in &package.items {
            self.release_stock(&item.product_id, item.quantity.saturating_mul(cart_qty));
        }
    }

    /// Rebuild the reservations of a persisted, unpaid cart. Until every
    /// referenced product is tracked, nothing is reserved and the caller
    /// retries after the next catalog load. A product whose baseline can no
    /// longer cover its holds is reserved up to the baseline and reported.
    pub fn restore_reservations(
        &mut self,
        lines: &[ReservationLine],
        packages: &HashMap<String, Package>,
    ) -> RestoreOutcome {
        let mut missing: Vec<String> = Vec::new();
        let mut needed: HashMap<String, u32> = HashMap::new();

        for line in lines {
            match line.kind {
                LineKind::Product => {
                    if !self.is_tracked(&line.item_id) {
                        missing.push(line.item_id.clone());
                        continue;
                    }
                    *needed.entry(line.item_id.clone()).or_insert(0) += line.quantity;
                }
                LineKind::Package => {
                    let Some(package) = packages.get(&line.item_id) else {
                        missing.push(line.item_id.clone());
                        continue;
                    };
                    match Self::package_requirements(package, line.quantity) {
                        Ok(reqs) => {
                            for (product_id, qty) in reqs {
                                if !self.is_tracked(product_id) {
                                    missing.push(product_id.to_string());
                                    continue;
                                }
                                *needed.entry(product_id.to_string()).or_insert(0) += qty;
                            }
                        }
                        Err(_) => missing.push(line.item_id.clone()),
                    }
                }
            }
        }

        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            warn!(missing = ?missing, "Cart re-reservation deferred until catalog is loaded");
            return RestoreOutcome::Deferred { missing };
        }

        let mut shortfalls = Vec::new();
        for (product_id, qty) in needed {
            let available = self.get_current_stock(&product_id);
            let held = qty.min(available);
            if held < qty {
                warn!(
                    product_id = %product_id,
                    requested = qty,
                    available,
                    "Cart hold exceeds new stock baseline, clamped"
                );
                shortfalls.push(Shortfall {
                    product_id: product_id.clone(),
                    requested: qty,
                    available,
                });
            }
            if held > 0 {
                *self.reserved.entry(product_id).or_insert(0) += held;
            }
        }

        info!(lines = lines.len(), "Cart reservations restored");
        if shortfalls.is_empty() {
            RestoreOutcome::Restored { lines: lines.len() }
        } else {
            shortfalls.sort_by(|a, b| a.product_id.cmp(&b.product_id));
            RestoreOutcome::Clamped {
                lines: lines.len(),
                shortfalls,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PackageItem;

    fn product(id: &str, stock: i64) -> Product {
        Product {
            id: id.into(),
            name: id.into(),
            stock,
            price: 1.0,
            tier_price: None,
            category_id: None,
            active: true,
            updated_at: String::new(),
        }
    }

    fn tracker() -> StockTracker {
        let mut t = StockTracker::new();
        t.initialize_stock(&[product("beer", 5), product("lime", 3), product("rum", 2)]);
        t
    }

    fn mojito_bucket() -> Package {
        Package {
            id: "bucket".into(),
            name: "Mojito bucket".into(),
            price: 20.0,
            items: vec![
                PackageItem {
                    product_id: "rum".into(),
                    quantity: 1,
                },
                PackageItem {
                    product_id: "lime".into(),
                    quantity: 1,
                },
            ],
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_reserve_and_release_adjust_current_stock() {
        let mut t = tracker();
        t.reserve_stock("beer", 2).unwrap();
        assert_eq!(t.get_current_stock("beer"), 3);
        t.release_stock("beer", 1);
        assert_eq!(t.get_current_stock("beer"), 4);
        t.release_stock("beer", 10);
        assert_eq!(t.reserved("beer"), 0);
        assert_eq!(t.get_current_stock("beer"), 5);
    }

    #[test]
    fn test_reserve_never_exceeds_baseline() {
        let mut t = tracker();
        let mut granted = 0;
        for _ in 0..10 {
            if t.reserve_stock("beer", 2).is_ok() {
                granted += 2;
            }
            assert!(t.reserved("beer") <= 5);
        }
        assert_eq!(granted, 4);
        let err = t.reserve_stock("beer", 2).unwrap_err();
        assert_eq!(
            err,
            StockError::Insufficient {
                product_id: "beer".into(),
                requested: 2,
                available: 1,
            }
        );
        assert!(t.has_stock("beer", 1));
        assert!(!t.has_stock("beer", 2));
    }

    #[test]
    fn test_unknown_product_is_rejected() {
        let mut t = tracker();
        assert_eq!(
            t.reserve_stock("ghost", 1),
            Err(StockError::UnknownProduct("ghost".into()))
        );
        assert!(!t.has_stock("ghost", 0));
    }

    #[test]
    fn test_initialize_clears_reservations_and_clamps() {
        let mut t = tracker();
        t.reserve_stock("beer", 3).unwrap();
        let mut inactive = product("old", 9);
        inactive.active = false;
        t.initialize_stock(&[product("beer", 5), product("neg", -4), inactive]);
        assert_eq!(t.get_current_stock("beer"), 5);
        assert_eq!(t.get_current_stock("neg"), 0);
        assert_eq!(t.get_current_stock("old"), 0);
    }

    #[test]
    fn test_package_fan_out_is_all_or_nothing() {
        let mut t = tracker();
        t.reserve_package(&mojito_bucket(), 2).unwrap();
        assert_eq!(t.get_current_stock("rum"), 0);
        assert_eq!(t.get_current_stock("lime"), 1);

        // rum is exhausted, so lime must not be touched either
        let err = t.reserve_package(&mojito_bucket(), 1).unwrap_err();
        assert!(matches!(err, StockError::Insufficient { ref product_id, .. } if product_id == "rum"));
        assert_eq!(t.get_current_stock("lime"), 1);

        t.release_package(&mojito_bucket(), 2);
        assert_eq!(t.get_current_stock("rum"), 2);
        assert_eq!(t.get_current_stock("lime"), 3);
    }

    #[test]
    fn test_package_without_components_must_be_loaded_first() {
        let mut t = tracker();
        let mut bare = mojito_bucket();
        bare.items.clear();
        assert_eq!(
            t.reserve_package(&bare, 1),
            Err(StockError::PackageNotLoaded("bucket".into()))
        );
    }

    #[test]
    fn test_reset_all_stock() {
        let mut t = tracker();
        t.reserve_stock("beer", 5).unwrap();
        t.reserve_stock("lime", 1).unwrap();
        t.reset_all_stock();
        assert_eq!(t.get_current_stock("beer"), 5);
        assert_eq!(t.get_current_stock("lime"), 3);
    }

    #[test]
    fn test_restore_rebuilds_same_availability() {
        let lines = vec![
            ReservationLine {
                kind: LineKind::Product,
                item_id: "beer".into(),
                quantity: 2,
            },
            ReservationLine {
                kind: LineKind::Package,
                item_id: "bucket".into(),
                quantity: 1,
            },
        ];
        let packages: HashMap<String, Package> =
            [("bucket".to_string(), mojito_bucket())].into_iter().collect();

        let mut before = tracker();
        before.reserve_stock("beer", 2).unwrap();
        before.reserve_package(&mojito_bucket(), 1).unwrap();

        let mut after = tracker();
        let outcome = after.restore_reservations(&lines, &packages);
        assert_eq!(outcome, RestoreOutcome::Restored { lines: 2 });
        for id in ["beer", "lime", "rum"] {
            assert_eq!(before.get_current_stock(id), after.get_current_stock(id));
        }
    }

    #[test]
    fn test_restore_defers_without_partial_reservation() {
        let lines = vec![
            ReservationLine {
                kind: LineKind::Product,
                item_id: "beer".into(),
                quantity: 2,
            },
            ReservationLine {
                kind: LineKind::Product,
                item_id: "cider".into(),
                quantity: 1,
            },
        ];
        let mut t = tracker();
        let outcome = t.restore_reservations(&lines, &HashMap::new());
        assert_eq!(
            outcome,
            RestoreOutcome::Deferred {
                missing: vec!["cider".into()]
            }
        );
        assert_eq!(t.reserved("beer"), 0);
    }

    #[test]
    fn test_restore_clamps_to_reduced_baseline() {
        let lines = vec![
            ReservationLine {
                kind: LineKind::Product,
                item_id: "beer".into(),
                quantity: 5,
            },
            ReservationLine {
                kind: LineKind::Product,
                item_id: "lime".into(),
                quantity: 2,
            },
        ];
        let mut t = StockTracker::new();
        t.initialize_stock(&[product("beer", 4), product("lime", 3)]);

        let outcome = t.restore_reservations(&lines, &HashMap::new());
        assert_eq!(
            outcome,
            RestoreOutcome::Clamped {
                lines: 2,
                shortfalls: vec![Shortfall {
                    product_id: "beer".into(),
                    requested: 5,
                    available: 4,
                }],
            }
        );
        assert_eq!(t.reserved("beer"), 4);
        assert_eq!(t.get_current_stock("beer"), 0);
        assert_eq!(t.get_current_stock("lime"), 1);
    }
}
