//! Persisted cart of the active cashier session.
//!
//! Lines are reserved against the stock tracker before they are persisted,
//! so an insufficient-stock rejection never reaches the store or the queue.
//! The cart survives a restart in `local_settings` and is replayed into a
//! fresh tracker by [`Cart::restore`].

use std::collections::{BTreeMap, HashMap};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::{self, DbState};
use crate::error::{StockError, StoreResult, TabError};
use crate::models::{LineKind, OrderLine, Package, Product};
use crate::stock::{ReservationLine, RestoreOutcome, StockTracker};
use crate::store;

const CART_CATEGORY: &str = "cart";
const CART_KEY: &str = "active";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub kind: LineKind,
    pub item_id: String,
    pub quantity: u32,
    pub unit_price: f64,
}

impl From<&CartLine> for OrderLine {
    fn from(line: &CartLine) -> Self {
        OrderLine {
            kind: line.kind,
            item_id: line.item_id.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
        }
    }
}

impl From<&CartLine> for ReservationLine {
    fn from(line: &CartLine) -> Self {
        ReservationLine {
            kind: line.kind,
            item_id: line.item_id.clone(),
            quantity: line.quantity,
        }
    }
}

/// Lines of one queued order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldOrder {
    pub session_id: String,
    pub lines: Vec<CartLine>,
}

/// Lines holding stock on this terminal: `draft` lines of the tab being rung
/// up, and `ordered` lines of queued orders, keyed by order id, that the
/// server has not accepted yet. A draft line is released when it is removed
/// or its tab closes; an ordered line when its order reaches the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub draft: Vec<CartLine>,
    #[serde(default)]
    pub ordered: BTreeMap<String, HeldOrder>,
}

impl Cart {
    pub fn load(db: &DbState) -> StoreResult<Cart> {
        let conn = db.lock()?;
        Self::load_in(&conn)
    }

    pub fn load_in(conn: &Connection) -> StoreResult<Cart> {
        match db::get_setting(conn, CART_CATEGORY, CART_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Cart::default()),
        }
    }

    pub fn save_in(&self, conn: &Connection) -> StoreResult<()> {
        if self.is_empty() && self.session_id.is_none() {
            return db::delete_setting(conn, CART_CATEGORY, CART_KEY);
        }
        let raw = serde_json::to_string(self)?;
        db::set_setting(conn, CART_CATEGORY, CART_KEY, &raw)
    }

    pub fn save(&self, db: &DbState) -> StoreResult<()> {
        let conn = db.lock()?;
        self.save_in(&conn)
    }

    pub fn is_empty(&self) -> bool {
        self.draft.is_empty() && self.ordered.is_empty()
    }

    pub fn draft_total(&self) -> f64 {
        self.draft
            .iter()
            .map(|l| l.unit_price * l.quantity as f64)
            .sum()
    }

    /// Reserve and append a line. Same item and price merge into one line.
    pub fn add(
        &mut self,
        db: &DbState,
        tracker: &mut StockTracker,
        line: CartLine,
    ) -> Result<(), TabError> {
        if line.quantity == 0 {
            return Err(TabError::InvalidOrder("quantity must be positive".into()));
        }
        reserve_line(db, tracker, line.kind, &line.item_id, line.quantity)?;

        let previous = self.draft.clone();
        let (kind, item_id, quantity) = (line.kind, line.item_id.clone(), line.quantity);
        if let Some(existing) = self.draft.iter_mut().find(|l| {
            l.kind == line.kind && l.item_id == line.item_id && l.unit_price == line.unit_price
        }) {
            existing.quantity += line.quantity;
        } else {
            self.draft.push(line);
        }

        if let Err(e) = self.save(db) {
            // a hold without a persisted line would leak after restart
            self.draft = previous;
            if let Err(release) = release_line(db, tracker, kind, &item_id, quantity) {
                warn!(item_id = %item_id, error = %release, "Could not release cart line");
            }
            return Err(e.into());
        }
        debug!(lines = self.draft.len(), "Cart line added");
        Ok(())
    }

    /// Release `quantity` units of a draft line.
    pub fn remove(
        &mut self,
        db: &DbState,
        tracker: &mut StockTracker,
        item_id: &str,
        quantity: u32,
    ) -> Result<(), TabError> {
        let Some(idx) = self.draft.iter().position(|l| l.item_id == item_id) else {
            return Ok(());
        };
        let take = quantity.min(self.draft[idx].quantity);
        let kind = self.draft[idx].kind;
        release_line(db, tracker, kind, item_id, take)?;
        self.draft[idx].quantity -= take;
        if self.draft[idx].quantity == 0 {
            self.draft.remove(idx);
        }
        self.save(db)?;
        Ok(())
    }

    /// Move the draft into the held lines of `order_id` and return the
    /// submitted lines. The reservations stay in place.
    pub fn submit_draft(&mut self, session_id: &str, order_id: &str) -> Vec<CartLine> {
        let submitted = std::mem::take(&mut self.draft);
        self.hold(session_id, order_id, &submitted);
        submitted
    }

    /// Record already-reserved lines as held by a queued order.
    pub fn hold(&mut self, session_id: &str, order_id: &str, lines: &[CartLine]) {
        if lines.is_empty() {
            return;
        }
        self.ordered.insert(
            order_id.to_string(),
            HeldOrder {
                session_id: session_id.to_string(),
                lines: lines.to_vec(),
            },
        );
    }

    /// Lines of `session_id` still waiting for the server.
    pub fn held_for_session(&self, session_id: &str) -> Vec<&CartLine> {
        self.ordered
            .values()
            .filter(|held| held.session_id == session_id)
            .flat_map(|held| held.lines.iter())
            .collect()
    }

    /// Detach a closing tab. Returns its unsent draft lines so the caller can
    /// release them; queued orders keep their holds until the server accepts
    /// them.
    pub fn take_session(&mut self, session_id: &str) -> Vec<CartLine> {
        if self.session_id.as_deref() != Some(session_id) {
            return Vec::new();
        }
        self.session_id = None;
        std::mem::take(&mut self.draft)
    }

    /// Remove the held lines of an order the server accepted.
    pub fn take_order(&mut self, order_id: &str) -> Option<HeldOrder> {
        self.ordered.remove(order_id)
    }

    /// Re-point lines held under a temporary session id.
    pub fn rename_session(&mut self, from: &str, to: &str) -> bool {
        let mut changed = false;
        for held in self.ordered.values_mut().filter(|h| h.session_id == from) {
            held.session_id = to.to_string();
            changed = true;
        }
        if self.session_id.as_deref() == Some(from) {
            self.session_id = Some(to.to_string());
            changed = true;
        }
        changed
    }

    /// Re-key an order held under a temporary id.
    pub fn rename_order(&mut self, from: &str, to: &str) -> bool {
        match self.ordered.remove(from) {
            Some(held) => {
                self.ordered.insert(to.to_string(), held);
                true
            }
            None => false,
        }
    }

    /// Drop every line and every reservation.
    pub fn clear(&mut self, tracker: &mut StockTracker) {
        tracker.reset_all_stock();
        self.draft.clear();
        self.ordered.clear();
        self.session_id = None;
    }

    pub fn reservation_lines(&self) -> Vec<ReservationLine> {
        self.ordered
            .values()
            .flat_map(|held| held.lines.iter())
            .chain(self.draft.iter())
            .map(ReservationLine::from)
            .collect()
    }

    /// Replay the persisted cart into `tracker` after a restart.
    pub fn restore(
        &self,
        db: &DbState,
        tracker: &mut StockTracker,
    ) -> Result<RestoreOutcome, TabError> {
        if self.is_empty() {
            return Ok(RestoreOutcome::Restored { lines: 0 });
        }
        let packages: HashMap<String, Package> = store::read_all::<Package>(db)?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        let outcome = tracker.restore_reservations(&self.reservation_lines(), &packages);
        match &outcome {
            RestoreOutcome::Restored { lines } => info!(lines, "Persisted cart re-reserved"),
            RestoreOutcome::Clamped { lines, shortfalls } => warn!(
                lines,
                short = shortfalls.len(),
                "Persisted cart re-reserved with shortfalls"
            ),
            RestoreOutcome::Deferred { .. } => {}
        }
        Ok(outcome)
    }
}

/// A held order reached the server: drop it from the persisted cart and book
/// its lines as sold against the local product baseline, inside the caller's
/// transaction. Returns the units sold per product.
pub fn settle_order_in(conn: &Connection, order_id: &str) -> StoreResult<BTreeMap<String, u32>> {
    let mut cart = Cart::load_in(conn)?;
    let Some(held) = cart.take_order(order_id) else {
        return Ok(BTreeMap::new());
    };
    cart.save_in(conn)?;

    let mut sold: BTreeMap<String, u32> = BTreeMap::new();
    for line in &held.lines {
        match line.kind {
            LineKind::Product => *sold.entry(line.item_id.clone()).or_insert(0) += line.quantity,
            LineKind::Package => match store::get_in::<Package>(conn, &line.item_id)? {
                Some(package) => {
                    for item in &package.items {
                        *sold.entry(item.product_id.clone()).or_insert(0) +=
                            item.quantity.saturating_mul(line.quantity);
                    }
                }
                None => warn!(package_id = %line.item_id, "Sold package no longer in catalog"),
            },
        }
    }
    for (product_id, qty) in &sold {
        if let Some(mut product) = store::get_in::<Product>(conn, product_id)? {
            product.stock -= i64::from(*qty);
            store::upsert_in(conn, &product)?;
        }
    }
    debug!(order_id, products = sold.len(), "Held order settled as sold");
    Ok(sold)
}

fn load_package(db: &DbState, package_id: &str) -> Result<Package, TabError> {
    let package: Option<Package> = store::get_by_id(db, package_id)?;
    match package {
        Some(p) if !p.items.is_empty() => Ok(p),
        _ => Err(StockError::PackageNotLoaded(package_id.to_string()).into()),
    }
}

fn reserve_line(
    db: &DbState,
    tracker: &mut StockTracker,
    kind: LineKind,
    item_id: &str,
    quantity: u32,
) -> Result<(), TabError> {
    match kind {
        LineKind::Product => tracker.reserve_stock(item_id, quantity)?,
        LineKind::Package => {
            let package = load_package(db, item_id)?;
            tracker.reserve_package(&package, quantity)?;
        }
    }
    Ok(())
}

fn release_line(
    db: &DbState,
    tracker: &mut StockTracker,
    kind: LineKind,
    item_id: &str,
    quantity: u32,
) -> Result<(), TabError> {
    match kind {
        LineKind::Product => tracker.release_stock(item_id, quantity),
        LineKind::Package => {
            let package = load_package(db, item_id)?;
            tracker.release_package(&package, quantity);
        }
    }
    Ok(())
}

/// Reserve every line or none of them.
pub fn reserve_lines(
    db: &DbState,
    tracker: &mut StockTracker,
    lines: &[CartLine],
) -> Result<(), TabError> {
    for (idx, line) in lines.iter().enumerate() {
        if line.quantity == 0 {
            release_lines(db, tracker, &lines[..idx]);
            return Err(TabError::InvalidOrder(format!(
                "quantity of {} must be positive",
                line.item_id
            )));
        }
        if let Err(e) = reserve_line(db, tracker, line.kind, &line.item_id, line.quantity) {
            release_lines(db, tracker, &lines[..idx]);
            return Err(e);
        }
    }
    Ok(())
}

/// Release the reservations of `lines`. A package whose components are no
/// longer loaded keeps its hold until the next re-seed.
pub fn release_lines(db: &DbState, tracker: &mut StockTracker, lines: &[CartLine]) {
    for line in lines {
        if let Err(e) = release_line(db, tracker, line.kind, &line.item_id, line.quantity) {
            warn!(item_id = %line.item_id, error = %e, "Could not release cart line");
        }
    }
}
