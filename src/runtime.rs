//! Process runtime: owns the store, the sync services and the background
//! loop, and exposes the cashier actions to the host shell.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{HttpBackend, RemoteBackend};
use crate::cart::{Cart, CartLine};
use crate::catalog::{CatalogReplicator, CatalogSource, ReplicationSummary};
use crate::config::SyncConfig;
use crate::db::{self, DbState};
use crate::error::{StoreError, StoreResult, TabError};
use crate::models::{DiningTable, Order, Product, Session, TableStatus};
use crate::stock::{RestoreOutcome, StockTracker};
use crate::store;
use crate::sync::{self, DrainReport, RetryPolicy, StockConflict, SyncProcessor};
use crate::tabs;
use crate::telemetry::{Subscription, SyncTelemetry, TelemetryHub};

/// Rebuild the stock baseline from the stored catalog and replay the
/// persisted cart on top of it. The new ledger replaces `tracker` only once
/// the cart is restored; a deferred restore keeps a seeded tracker as is.
/// Holds the new baseline cannot cover are recorded as stock conflicts.
pub fn reseed_stock(db: &DbState, tracker: &mut StockTracker) -> Result<RestoreOutcome, TabError> {
    let products: Vec<Product> = store::read_all(db)?;
    let mut next = StockTracker::new();
    next.initialize_stock(&products);
    let outcome = Cart::load(db)?.restore(db, &mut next)?;
    match &outcome {
        RestoreOutcome::Restored { .. } => *tracker = next,
        RestoreOutcome::Clamped { shortfalls, .. } => {
            sync::record_restore_shortfalls(db, shortfalls)?;
            *tracker = next;
        }
        RestoreOutcome::Deferred { .. } => {
            if !tracker.is_seeded() {
                *tracker = next;
            }
        }
    }
    Ok(outcome)
}

/// Components shared with the background loop.
#[derive(Clone)]
struct Services {
    db: Arc<DbState>,
    backend: Arc<dyn RemoteBackend>,
    replicator: Arc<CatalogReplicator>,
    processor: Arc<SyncProcessor>,
    tracker: Arc<Mutex<StockTracker>>,
    online: Arc<AtomicBool>,
}

impl Services {
    fn tracker(&self) -> MutexGuard<'_, StockTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reseed(&self) {
        let mut tracker = self.tracker();
        match reseed_stock(&self.db, &mut tracker) {
            Ok(RestoreOutcome::Restored { .. }) => {}
            Ok(RestoreOutcome::Clamped { shortfalls, .. }) => {
                warn!(products = shortfalls.len(), "Cart holds exceed refreshed stock, flagged for review")
            }
            Ok(RestoreOutcome::Deferred { missing }) => {
                debug!(missing = ?missing, "Cart restore waiting for catalog")
            }
            Err(e) => warn!(error = %e, "Failed to re-seed stock baseline"),
        }
    }

    async fn replicate_catalog(&self) -> ReplicationSummary {
        let summary = self.replicator.replicate_all().await;
        if summary.stock_baseline_changed() {
            self.reseed();
        }
        summary
    }

    /// Settled orders already lowered the stored stock and dropped their
    /// holds; rebuild the tracker from the store so the sale counts once.
    fn apply_report(&self, report: &DrainReport) {
        if !report.sold.is_empty() {
            debug!(products = report.sold.len(), "Booking accepted orders against stock");
            self.reseed();
        }
    }

    async fn drain(&self) -> Option<DrainReport> {
        match self.processor.process_pending().await {
            Ok(report) => {
                self.apply_report(&report);
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "Sync cycle failed");
                None
            }
        }
    }

    /// Record a connectivity observation. Returns `true` on an
    /// offline-to-online transition.
    fn observe_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online != online {
            if online {
                info!("Network restored; resuming queued sync");
            } else {
                info!("Network offline; keeping queue pending");
            }
        }
        online && !was_online
    }

    async fn on_reconnect(&self) -> Option<DrainReport> {
        self.replicate_catalog().await;
        self.drain().await
    }

    async fn run(self, config: SyncConfig, shutdown: CancellationToken) {
        info!(
            sync_interval_secs = config.sync_interval.as_secs(),
            catalog_interval_secs = config.catalog_interval.as_secs(),
            "Sync loop started"
        );

        // boot
        let reachable = self.backend.is_reachable().await;
        self.online.store(reachable, Ordering::SeqCst);
        if reachable {
            self.on_reconnect().await;
        }

        let mut sync_tick = tokio::time::interval(config.sync_interval);
        let mut catalog_tick = tokio::time::interval(config.catalog_interval);
        sync_tick.tick().await;
        catalog_tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync loop stopped");
                    break;
                }
                _ = sync_tick.tick() => {
                    let reachable = self.backend.is_reachable().await;
                    if self.observe_online(reachable) {
                        self.on_reconnect().await;
                    } else if reachable {
                        self.drain().await;
                    }
                }
                _ = catalog_tick.tick() => {
                    if self.online.load(Ordering::SeqCst) {
                        self.replicate_catalog().await;
                    }
                }
            }
        }
    }
}

pub struct Runtime {
    services: Services,
    config: SyncConfig,
    telemetry: TelemetryHub,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Open the database under `data_dir`, load configuration and build the
    /// HTTP backend.
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let db = Arc::new(db::init(data_dir).context("opening local database")?);
        let config = SyncConfig::load(&db).context("loading sync configuration")?;
        let http = Arc::new(HttpBackend::new(&config).context("building admin API client")?);
        info!(admin_url = %http.base_url(), "Runtime opened");
        Ok(Self::with_parts(db, config, http.clone(), http))
    }

    /// Assemble a runtime from explicit parts.
    pub fn with_parts(
        db: Arc<DbState>,
        config: SyncConfig,
        backend: Arc<dyn RemoteBackend>,
        catalog: Arc<dyn CatalogSource>,
    ) -> Self {
        let telemetry = TelemetryHub::new();
        let processor = Arc::new(SyncProcessor::new(
            db.clone(),
            backend.clone(),
            telemetry.clone(),
            RetryPolicy::from(&config),
        ));
        let replicator = Arc::new(CatalogReplicator::new(db.clone(), catalog));
        let services = Services {
            db,
            backend,
            replicator,
            processor,
            tracker: Arc::new(Mutex::new(StockTracker::new())),
            online: Arc::new(AtomicBool::new(false)),
        };
        Self {
            services,
            config,
            telemetry,
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Seed stock from the local catalog and start the background loop.
    /// Calling `start` twice is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return;
        }
        self.services.reseed();
        let services = self.services.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        *worker = Some(tokio::spawn(services.run(config, shutdown)));
    }

    /// Stop the background loop and wait for it to finish its current step.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sync loop ended abnormally");
            }
        }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.services.db
    }

    pub fn is_online(&self) -> bool {
        self.services.online.load(Ordering::SeqCst)
    }

    // -- sync triggers ------------------------------------------------------

    /// Connectivity reported by the host. An offline-to-online transition
    /// refreshes the catalog and drains the queue.
    pub async fn set_online(&self, online: bool) -> Option<DrainReport> {
        if self.services.observe_online(online) {
            self.services.on_reconnect().await
        } else {
            None
        }
    }

    /// Drain now.
    pub async fn sync_now(&self) -> Result<DrainReport, StoreError> {
        let report = self.services.processor.process_pending().await?;
        self.services.apply_report(&report);
        Ok(report)
    }

    /// Manual retry: failed entries get a fresh retry budget.
    pub async fn retry_failed(&self) -> Result<DrainReport, StoreError> {
        let report = self.services.processor.retry_failed().await?;
        self.services.apply_report(&report);
        Ok(report)
    }

    pub async fn refresh_catalog(&self) -> ReplicationSummary {
        self.services.replicate_catalog().await
    }

    // -- telemetry and conflicts --------------------------------------------

    pub fn subscribe(&self, listener: impl Fn(&SyncTelemetry) + Send + Sync + 'static) -> Subscription {
        self.telemetry.subscribe(listener)
    }

    pub fn telemetry_snapshot(&self) -> StoreResult<SyncTelemetry> {
        self.services.processor.snapshot()
    }

    pub fn open_conflicts(&self) -> StoreResult<Vec<StockConflict>> {
        sync::list_open_conflicts(&self.services.db)
    }

    pub fn resolve_conflict(&self, id: i64, note: Option<&str>) -> StoreResult<bool> {
        sync::resolve_conflict(&self.services.db, id, note)
    }

    // -- cashier actions ----------------------------------------------------

    pub fn current_stock(&self, product_id: &str) -> u32 {
        self.services.tracker().get_current_stock(product_id)
    }

    pub fn cart(&self) -> StoreResult<Cart> {
        Cart::load(&self.services.db)
    }

    pub fn open_tab(&self, table_id: &str, customer_id: Option<&str>) -> Result<Session, TabError> {
        tabs::open_tab(&self.services.db, table_id, customer_id)
    }

    /// Attach the cart's draft to a tab.
    pub fn select_tab(&self, session_id: &str) -> Result<Cart, TabError> {
        let mut cart = Cart::load(&self.services.db)?;
        if !cart.draft.is_empty() && cart.session_id.as_deref() != Some(session_id) {
            return Err(TabError::InvalidOrder(
                "submit or clear the current draft first".into(),
            ));
        }
        cart.session_id = Some(session_id.to_string());
        cart.save(&self.services.db)?;
        Ok(cart)
    }

    pub fn add_to_cart(&self, line: CartLine) -> Result<Cart, TabError> {
        let mut tracker = self.services.tracker();
        let mut cart = Cart::load(&self.services.db)?;
        cart.add(&self.services.db, &mut tracker, line)?;
        Ok(cart)
    }

    pub fn remove_from_cart(&self, item_id: &str, quantity: u32) -> Result<Cart, TabError> {
        let mut tracker = self.services.tracker();
        let mut cart = Cart::load(&self.services.db)?;
        cart.remove(&self.services.db, &mut tracker, item_id, quantity)?;
        Ok(cart)
    }

    pub fn submit_cart(&self) -> Result<Order, TabError> {
        let mut cart = Cart::load(&self.services.db)?;
        tabs::submit_cart(&self.services.db, &mut cart)
    }

    pub fn add_order(&self, session_id: &str, lines: Vec<CartLine>) -> Result<Order, TabError> {
        let mut tracker = self.services.tracker();
        let mut cart = Cart::load(&self.services.db)?;
        tabs::add_order(&self.services.db, &mut tracker, &mut cart, session_id, lines)
    }

    pub fn close_tab(&self, session_id: &str, payment_method: &str) -> Result<Session, TabError> {
        let mut tracker = self.services.tracker();
        let mut cart = Cart::load(&self.services.db)?;
        tabs::close_tab(&self.services.db, &mut tracker, &mut cart, session_id, payment_method)
    }

    /// Drop every unpaid line and every reservation.
    pub fn clear_cart(&self) -> Result<(), TabError> {
        let mut tracker = self.services.tracker();
        let mut cart = Cart::load(&self.services.db)?;
        cart.clear(&mut tracker);
        cart.save(&self.services.db)?;
        Ok(())
    }

    pub fn set_table_status(&self, table_id: &str, status: TableStatus) -> Result<DiningTable, TabError> {
        tabs::set_table_status(&self.services.db, table_id, status)
    }

    pub fn active_session_for_table(&self, table_id: &str) -> StoreResult<Option<Session>> {
        tabs::active_session_for_table(&self.services.db, table_id)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
