//! Scripted remote fakes shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::api::RemoteBackend;
use crate::catalog::{CatalogDelta, CatalogSource};
use crate::error::ApiError;
use crate::queue::MutationEnvelope;
use crate::store::Collection;

/// Replays scripted responses in order. With no script left, a create is
/// answered with a fresh `srv-N` id and anything else with `{}`.
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<Result<Value, ApiError>>>,
    replayed: Mutex<Vec<MutationEnvelope>>,
    online: AtomicBool,
    held: AtomicBool,
    next_id: AtomicUsize,
    pub started: Notify,
    pub release: Notify,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self {
            responses: Mutex::default(),
            replayed: Mutex::default(),
            online: AtomicBool::new(true),
            held: AtomicBool::new(false),
            next_id: AtomicUsize::new(1),
            started: Notify::new(),
            release: Notify::new(),
        }
    }
}

impl ScriptedBackend {
    pub fn respond(&self, response: Result<Value, ApiError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Block every replay until `release` is notified.
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn replayed(&self) -> Vec<MutationEnvelope> {
        self.replayed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteBackend for ScriptedBackend {
    async fn replay(&self, envelope: &MutationEnvelope) -> Result<Value, ApiError> {
        self.replayed.lock().unwrap().push(envelope.clone());
        if self.held.load(Ordering::SeqCst) {
            self.started.notify_one();
            self.release.notified().await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(ApiError::Network("Cannot reach admin dashboard".into()));
        }
        let scripted = self.responses.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            if envelope.creates.is_some() {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "id": format!("srv-{n}") }))
            } else {
                Ok(json!({}))
            }
        })
    }

    async fn is_reachable(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Serves scripted deltas per collection; an exhausted script yields an
/// empty delta.
#[derive(Default)]
pub struct ScriptedCatalog {
    scripts: Mutex<HashMap<Collection, VecDeque<Result<CatalogDelta, ApiError>>>>,
    requests: Mutex<Vec<(Collection, Option<String>)>>,
    held: Mutex<HashSet<Collection>>,
    pub started: Notify,
    pub release: Notify,
}

impl ScriptedCatalog {
    pub fn push(&self, collection: Collection, delta: Result<CatalogDelta, ApiError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(collection)
            .or_default()
            .push_back(delta);
    }

    /// Block fetches of `collection` until `release` is notified.
    pub fn hold(&self, collection: Collection) {
        self.held.lock().unwrap().insert(collection);
    }

    pub fn requested_since(&self, collection: Collection) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == collection)
            .map(|(_, since)| since.clone())
            .collect()
    }
}

#[async_trait]
impl CatalogSource for ScriptedCatalog {
    async fn fetch_delta(
        &self,
        collection: Collection,
        since: Option<&str>,
    ) -> Result<CatalogDelta, ApiError> {
        self.requests
            .lock()
            .unwrap()
            .push((collection, since.map(str::to_string)));
        let held = self.held.lock().unwrap().contains(&collection);
        if held {
            self.started.notify_one();
            self.release.notified().await;
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&collection)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(CatalogDelta::default()))
    }
}
