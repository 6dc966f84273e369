//! Cashier actions on tabs.
//!
//! Each action validates stock synchronously, then writes its local records
//! and its queue entry in one transaction. None of them waits on the
//! network.

use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::cart::{self, Cart, CartLine};
use crate::db::DbState;
use crate::error::{StoreError, StoreResult, TabError};
use crate::models::{
    DiningTable, Order, OrderLine, OrderStatus, Session, SessionStatus, TableStatus,
};
use crate::queue::{self, mutation_types, HttpMethod, MutationEnvelope};
use crate::reconciler;
use crate::stock::StockTracker;
use crate::store::{self, Collection};

/// Temporary ids are prefixed for readability in logs only; records carry
/// an explicit `is_temporary` flag.
fn temp_id() -> String {
    format!("tmp-{}", Uuid::new_v4())
}

fn sessions_endpoint(session_id: &str) -> String {
    format!("/api/pos/order-sessions/{session_id}")
}

fn require_table(conn: &rusqlite::Connection, table_id: &str) -> Result<DiningTable, TabError> {
    store::get_in::<DiningTable>(conn, table_id)?
        .ok_or_else(|| StoreError::NotFound(format!("table {table_id}")).into())
}

fn require_active_session(conn: &rusqlite::Connection, session_id: &str) -> Result<Session, TabError> {
    let session = store::get_in::<Session>(conn, session_id)?
        .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
    if !session.is_active() {
        return Err(TabError::SessionClosed(session_id.to_string()));
    }
    Ok(session)
}

fn sessions_for_table(conn: &rusqlite::Connection, table_id: &str) -> StoreResult<Vec<Session>> {
    Ok(store::read_all_in::<Session>(conn)?
        .into_iter()
        .filter(|s| s.table_id == table_id)
        .collect())
}

/// The session a table should display, if any.
pub fn active_session_for_table(db: &DbState, table_id: &str) -> StoreResult<Option<Session>> {
    let conn = db.lock()?;
    let sessions = sessions_for_table(&conn, table_id)?;
    Ok(reconciler::select_authoritative(&sessions).cloned())
}

/// Open a tab on `table_id` with a temporary session and mark the table
/// occupied.
pub fn open_tab(db: &DbState, table_id: &str, customer_id: Option<&str>) -> Result<Session, TabError> {
    let session = store::with_transaction(db, |conn| {
        let mut table = require_table(conn, table_id)?;
        let existing = sessions_for_table(conn, table_id)?;
        if let Some(open) = reconciler::select_authoritative(&existing) {
            return Err(TabError::TableBusy(format!("{table_id} ({})", open.id)));
        }

        let now = Utc::now().to_rfc3339();
        let session = Session {
            id: temp_id(),
            is_temporary: true,
            table_id: table_id.to_string(),
            customer_id: customer_id.map(str::to_string),
            status: SessionStatus::PendingSync,
            total: 0.0,
            pending_sync: true,
            payment_method: None,
            opened_at: now.clone(),
            updated_at: now.clone(),
        };
        store::upsert_in(conn, &session)?;

        reconciler::assert_table_status(&mut table, TableStatus::Occupied);
        table.updated_at = now.clone();
        store::upsert_in(conn, &table)?;

        let envelope = MutationEnvelope::new(
            HttpMethod::Post,
            "/api/pos/order-sessions",
            json!({
                "table_id": table_id,
                "customer_id": customer_id,
                "opened_at": now,
            }),
        )
        .creating(Collection::Sessions, &session.id)
        .touching(Collection::Sessions, &session.id)
        .touching_table(table_id, TableStatus::Occupied);
        queue::enqueue_in(conn, mutation_types::SESSION_CREATE, &envelope)?;
        Ok::<_, TabError>(session)
    })?;

    info!(session_id = %session.id, table_id, "Tab opened");
    Ok(session)
}

/// Write the order and its queue entry. `lines` are already reserved.
fn write_order(
    db: &DbState,
    cart: &Cart,
    session_id: &str,
    lines: &[CartLine],
    from_draft: bool,
) -> Result<(Order, Cart), TabError> {
    store::with_transaction(db, |conn| {
        let mut session = require_active_session(conn, session_id)?;
        let now = Utc::now().to_rfc3339();
        let order_lines: Vec<OrderLine> = lines.iter().map(OrderLine::from).collect();
        let total: f64 = order_lines.iter().map(OrderLine::line_total).sum();

        let order = Order {
            id: temp_id(),
            is_temporary: true,
            session_id: session.id.clone(),
            status: OrderStatus::Draft,
            lines: order_lines,
            total,
            payment_method: None,
            pending_sync: true,
            created_at: now.clone(),
            updated_at: now.clone(),
        };
        store::upsert_in(conn, &order)?;

        session.total += total;
        session.updated_at = now.clone();
        store::upsert_in(conn, &session)?;

        let mut envelope = MutationEnvelope::new(
            HttpMethod::Post,
            format!("{}/orders", sessions_endpoint(&session.id)),
            json!({
                "session_id": session.id,
                "lines": order.lines,
                "total": total,
                "created_at": now,
            }),
        )
        .creating(Collection::Orders, &order.id)
        .touching(Collection::Orders, &order.id);
        if session.is_temporary {
            envelope = envelope.depending_on(&session.id);
        }
        queue::enqueue_in(conn, mutation_types::ORDER_CREATE, &envelope)?;

        let mut next = cart.clone();
        if from_draft {
            next.submit_draft(&session.id, &order.id);
        } else {
            next.hold(&session.id, &order.id, lines);
        }
        next.save_in(conn)?;
        Ok::<_, TabError>((order, next))
    })
}

/// Reserve `lines` and add them to the tab as one order. A stock rejection
/// is raised before anything is written.
pub fn add_order(
    db: &DbState,
    tracker: &mut StockTracker,
    cart: &mut Cart,
    session_id: &str,
    lines: Vec<CartLine>,
) -> Result<Order, TabError> {
    if lines.is_empty() {
        return Err(TabError::InvalidOrder("order has no lines".into()));
    }
    {
        let conn = db.lock()?;
        require_active_session(&conn, session_id)?;
    }
    cart::reserve_lines(db, tracker, &lines)?;

    match write_order(db, cart, session_id, &lines, false) {
        Ok((order, next)) => {
            *cart = next;
            info!(order_id = %order.id, session_id, total = order.total, "Order added");
            Ok(order)
        }
        Err(e) => {
            cart::release_lines(db, tracker, &lines);
            Err(e)
        }
    }
}

/// Send the cart's draft lines, already reserved, as an order on the cart's
/// session.
pub fn submit_cart(db: &DbState, cart: &mut Cart) -> Result<Order, TabError> {
    let session_id = cart
        .session_id
        .clone()
        .ok_or_else(|| TabError::InvalidOrder("cart is not attached to a tab".into()))?;
    if cart.draft.is_empty() {
        return Err(TabError::InvalidOrder("cart is empty".into()));
    }
    let lines = cart.draft.clone();
    let (order, next) = write_order(db, cart, &session_id, &lines, true)?;
    *cart = next;
    info!(order_id = %order.id, session_id = %session_id, total = order.total, "Cart submitted");
    Ok(order)
}

/// Close and pay a tab. The table is released locally at once; the server
/// learns about it when the queue drains. Unsent draft lines are released;
/// queued orders keep their holds until the server accepts them.
pub fn close_tab(
    db: &DbState,
    tracker: &mut StockTracker,
    cart: &mut Cart,
    session_id: &str,
    payment_method: &str,
) -> Result<Session, TabError> {
    let (session, next, released) = store::with_transaction(db, |conn| {
        let mut session = require_active_session(conn, session_id)?;
        let now = Utc::now().to_rfc3339();

        session.status = SessionStatus::Closed;
        session.pending_sync = true;
        session.payment_method = Some(payment_method.to_string());
        session.updated_at = now.clone();
        store::upsert_in(conn, &session)?;

        for mut order in store::read_all_in::<Order>(conn)? {
            if order.session_id == session.id && order.status != OrderStatus::Completed {
                order.status = OrderStatus::Completed;
                order.payment_method = Some(payment_method.to_string());
                order.updated_at = now.clone();
                store::upsert_in(conn, &order)?;
            }
        }

        if let Some(mut table) = store::get_in::<DiningTable>(conn, &session.table_id)? {
            reconciler::assert_table_status(&mut table, TableStatus::Available);
            table.updated_at = now.clone();
            store::upsert_in(conn, &table)?;
        }

        let mut envelope = MutationEnvelope::new(
            HttpMethod::Post,
            format!("{}/close", sessions_endpoint(&session.id)),
            json!({
                "session_id": session.id,
                "payment_method": payment_method,
                "total": session.total,
                "closed_at": now,
            }),
        )
        .touching(Collection::Sessions, &session.id)
        .touching_table(&session.table_id, TableStatus::Available);
        if session.is_temporary {
            envelope = envelope.depending_on(&session.id);
        }
        queue::enqueue_in(conn, mutation_types::SESSION_CLOSE, &envelope)?;

        let mut next = cart.clone();
        let released = next.take_session(&session.id);
        next.save_in(conn)?;
        Ok::<_, TabError>((session, next, released))
    })?;

    cart::release_lines(db, tracker, &released);
    *cart = next;
    info!(
        session_id,
        table_id = %session.table_id,
        total = session.total,
        "Tab closed"
    );
    Ok(session)
}

/// Assert a table status locally and queue it for the server.
pub fn set_table_status(db: &DbState, table_id: &str, status: TableStatus) -> Result<DiningTable, TabError> {
    store::with_transaction(db, |conn| {
        let mut table = require_table(conn, table_id)?;
        reconciler::assert_table_status(&mut table, status);
        table.updated_at = Utc::now().to_rfc3339();
        store::upsert_in(conn, &table)?;

        let envelope = MutationEnvelope::new(
            HttpMethod::Patch,
            format!("/api/pos/tables/{table_id}"),
            json!({ "status": status }),
        )
        .touching_table(table_id, status);
        queue::enqueue_in(conn, mutation_types::TABLE_STATUS, &envelope)?;
        Ok(table)
    })
}

// ===========================================================================
// Tests
// ===========================================================================
