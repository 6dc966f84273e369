//! Sync telemetry published to the host shell after every drain cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tracing::trace;

/// Snapshot of the sync engine's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTelemetry {
    pub syncing: bool,
    pub pending_count: i64,
    pub failed_count: i64,
    pub conflict_count: i64,
    pub last_sync_at: Option<String>,
}

type Listener = Arc<dyn Fn(&SyncTelemetry) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
    latest: Mutex<Option<SyncTelemetry>>,
}

impl Registry {
    fn remove(&self, id: u64) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|(lid, _)| *lid != id);
    }
}

/// Listener registry. Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct TelemetryHub {
    registry: Arc<Registry>,
}

/// Handle returned by [`TelemetryHub::subscribe`]. The listener is removed
/// when the handle is dropped or [`Subscription::unsubscribe`] is called.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    registry: Weak<Registry>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl TelemetryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&SyncTelemetry) + Send + Sync + 'static) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self
            .registry
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        listeners.push((id, Arc::new(listener)));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Deliver `snapshot` to every listener. Listeners run outside the
    /// registry lock, so they may subscribe or unsubscribe.
    pub fn publish(&self, snapshot: SyncTelemetry) {
        let listeners: Vec<Listener> = {
            let guard = self
                .registry
                .listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|(_, l)| l.clone()).collect()
        };
        trace!(
            syncing = snapshot.syncing,
            pending = snapshot.pending_count,
            failed = snapshot.failed_count,
            conflicts = snapshot.conflict_count,
            listeners = listeners.len(),
            "Publishing sync telemetry"
        );
        for listener in &listeners {
            listener(&snapshot);
        }
        *self
            .registry
            .latest
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
    }

    /// Most recently published snapshot.
    pub fn latest(&self) -> Option<SyncTelemetry> {
        self.registry
            .latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_reaches_listeners_until_unsubscribed() {
        let hub = TelemetryHub::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let sub = {
            let seen = seen.clone();
            hub.subscribe(move |t| {
                assert_eq!(t.pending_count, 2);
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };
        let snapshot = SyncTelemetry {
            pending_count: 2,
            ..Default::default()
        };
        hub.publish(snapshot.clone());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(hub.latest(), Some(snapshot.clone()));

        sub.unsubscribe();
        assert_eq!(hub.listener_count(), 0);
        hub.publish(snapshot);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let hub = TelemetryHub::new();
        {
            let _a = hub.subscribe(|_| {});
            let _b = hub.subscribe(|_| {});
            assert_eq!(hub.listener_count(), 2);
        }
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn test_wire_shape_is_camel_case() {
        let wire = serde_json::to_value(SyncTelemetry {
            syncing: true,
            pending_count: 1,
            failed_count: 0,
            conflict_count: 3,
            last_sync_at: Some("2026-03-01T10:00:00Z".into()),
        })
        .unwrap();
        assert_eq!(wire["pendingCount"], 1);
        assert_eq!(wire["conflictCount"], 3);
        assert_eq!(wire["lastSyncAt"], "2026-03-01T10:00:00Z");
        assert_eq!(wire["syncing"], true);
    }
}
