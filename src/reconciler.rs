//! Session/table reconciliation.
//!
//! A table can transiently carry both a locally-created (temporary) session
//! and a server session. Exactly one is treated as authoritative.

use crate::models::{DiningTable, Session, TableStatus};

fn best_by_total<'a>(sessions: impl Iterator<Item = &'a Session>) -> Option<&'a Session> {
    sessions.fold(None::<&Session>, |best, s| match best {
        Some(b) if b.total >= s.total => Some(b),
        _ => Some(s),
    })
}

/// Pick the session a table should display.
///
/// The best real session wins only when it is fully synced and its total is
/// at least the best temporary total; otherwise the best temporary session
/// wins. Closed sessions are never considered.
pub fn select_authoritative(sessions: &[Session]) -> Option<&Session> {
    let active = || sessions.iter().filter(|s| s.is_active());
    let best_temp = best_by_total(active().filter(|s| s.is_temporary));
    let best_real = best_by_total(active().filter(|s| !s.is_temporary));

    match (best_real, best_temp) {
        (Some(real), Some(temp)) => {
            if !real.pending_sync && real.total >= temp.total {
                Some(real)
            } else {
                Some(temp)
            }
        }
        (Some(real), None) => Some(real),
        (None, temp) => temp,
    }
}

/// Optimistically assert a table status ahead of the server.
pub fn assert_table_status(table: &mut DiningTable, status: TableStatus) {
    table.status.assert_local(status);
}

/// Record the server's view; the local assertion is dropped.
pub fn confirm_from_server(table: &mut DiningTable, status: TableStatus) {
    table.status.confirm(status);
}

/// The server accepted a status this terminal asserted. A newer local
/// assertion made since then is kept.
pub fn acknowledge_table_status(table: &mut DiningTable, status: TableStatus) {
    table.status.acknowledge(status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Asserted, SessionStatus};

    fn session(id: &str, temp: bool, total: f64, pending: bool) -> Session {
        Session {
            id: id.into(),
            is_temporary: temp,
            table_id: "t1".into(),
            customer_id: None,
            status: if pending && temp {
                SessionStatus::PendingSync
            } else {
                SessionStatus::Open
            },
            total,
            pending_sync: pending,
            payment_method: None,
            opened_at: "2026-03-01T10:00:00Z".into(),
            updated_at: "2026-03-01T10:00:00Z".into(),
        }
    }

    #[test]
    fn test_temp_beats_pending_real() {
        let sessions = [session("tmp-a", true, 500.0, true), session("r1", false, 300.0, true)];
        assert_eq!(select_authoritative(&sessions).unwrap().id, "tmp-a");
    }

    #[test]
    fn test_synced_real_with_equal_total_wins() {
        let sessions = [session("tmp-a", true, 500.0, true), session("r1", false, 500.0, false)];
        assert_eq!(select_authoritative(&sessions).unwrap().id, "r1");
    }

    #[test]
    fn test_synced_real_with_lower_total_loses() {
        let sessions = [session("tmp-a", true, 500.0, true), session("r1", false, 300.0, false)];
        assert_eq!(select_authoritative(&sessions).unwrap().id, "tmp-a");
    }

    #[test]
    fn test_single_partition_and_closed_sessions() {
        let mut closed = session("r0", false, 900.0, false);
        closed.status = SessionStatus::Closed;
        let only_real = [closed.clone(), session("r1", false, 40.0, true), session("r2", false, 70.0, true)];
        assert_eq!(select_authoritative(&only_real).unwrap().id, "r2");

        let only_temp = [session("tmp-a", true, 10.0, true)];
        assert_eq!(select_authoritative(&only_temp).unwrap().id, "tmp-a");

        assert!(select_authoritative(&[closed]).is_none());
        assert!(select_authoritative(&[]).is_none());
    }

    #[test]
    fn test_table_assert_then_confirm() {
        let mut table = DiningTable {
            id: "t1".into(),
            name: "Table 1".into(),
            status: Asserted::confirmed(TableStatus::Occupied),
            updated_at: String::new(),
        };
        assert_table_status(&mut table, TableStatus::Available);
        assert_eq!(table.effective_status(), TableStatus::Available);
        confirm_from_server(&mut table, TableStatus::Cleaning);
        assert_eq!(table.effective_status(), TableStatus::Cleaning);
        assert!(!table.status.is_diverged());
    }
}
