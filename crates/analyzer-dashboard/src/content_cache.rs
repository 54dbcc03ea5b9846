//! Selection-driven content cache.
//!
//! One `SelectionCache` per artifact kind.  It keeps at most one entry per
//! entity (in the `Store`), fetches the selected artifact on demand, and makes
//! sure only the response for the latest selection is ever committed.
//!
//! Each fetch carries a `CancellationToken`.  Starting a new fetch for an
//! entity cancels the previous one, which aborts the request if it is still
//! running.  A result that races past the cancellation is still dropped in
//! `on_loaded` because its fetch id no longer matches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use analyzer_proto::model::{ArtifactContent, ArtifactKind, CacheEntry, EntityId};
use analyzer_proto::state::Store;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::DashboardEvent;
use crate::gateway::{Gateway, GatewayError};

/// What to store when a fetch fails.
#[derive(Debug, Clone, PartialEq)]
pub enum FailurePolicy {
    /// Log only; the slot keeps whatever it held.
    Silent,
    /// Store an error marker with this message under the selected filename.
    Placeholder(String),
}

#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Quiet period after the last selection change before fetching.
    /// `None` fetches immediately.
    pub debounce: Option<Duration>,
    pub on_failure: FailurePolicy,
}

struct InFlight {
    filename: String,
    fetch_id: u64,
    token: CancellationToken,
}

pub struct SelectionCache<G: Gateway> {
    kind: ArtifactKind,
    policy: CachePolicy,
    gateway: Arc<G>,
    event_tx: mpsc::Sender<DashboardEvent>,
    in_flight: HashMap<EntityId, InFlight>,
    next_fetch_id: u64,
    /// Bumped on every debounced selection; only the newest timer counts.
    debounce_generation: u64,
    debounce_timer: Option<AbortHandle>,
}

impl<G: Gateway> SelectionCache<G> {
    pub fn new(
        kind: ArtifactKind,
        policy: CachePolicy,
        gateway: Arc<G>,
        event_tx: mpsc::Sender<DashboardEvent>,
    ) -> Self {
        Self {
            kind,
            policy,
            gateway,
            event_tx,
            in_flight: HashMap::new(),
            next_fetch_id: 0,
            debounce_generation: 0,
            debounce_timer: None,
        }
    }

    /// Record a selection change.  The selection itself is visible at once;
    /// the fetch follows immediately or after the debounce window.
    pub fn select(&mut self, store: &mut Store, entity_id: &EntityId, filename: Option<String>) {
        store.set_selection(self.kind, entity_id, filename);
        match self.policy.debounce {
            Some(delay) => self.arm_debounce(delay),
            None => self.reconcile(store),
        }
    }

    /// Restart the debounce window.  Any selection change inside the window
    /// pushes the fetch out again.
    fn arm_debounce(&mut self, delay: Duration) {
        self.debounce_generation += 1;
        if let Some(timer) = self.debounce_timer.take() {
            timer.abort();
        }

        let generation = self.debounce_generation;
        let kind = self.kind;
        let tx = self.event_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(DashboardEvent::SelectionSettled { kind, generation })
                .await;
        });
        self.debounce_timer = Some(timer.abort_handle());
    }

    pub fn on_settled(&mut self, store: &Store, generation: u64) {
        if generation != self.debounce_generation {
            debug!("{} cache: ignoring superseded debounce #{}", self.kind, generation);
            return;
        }
        self.debounce_timer = None;
        self.reconcile(store);
    }

    /// Bring fetches in line with the current selections: every selected
    /// filename that is neither cached nor already loading gets a fetch, and
    /// every fetch that no longer matches a selection is cancelled.
    fn reconcile(&mut self, store: &Store) {
        let state = store.state();
        let selections = state.selections.get(self.kind);

        let orphaned: Vec<EntityId> = self
            .in_flight
            .keys()
            .filter(|id| !selections.contains_key(*id))
            .cloned()
            .collect();
        for id in orphaned {
            self.cancel(&id);
        }

        for (id, filename) in selections {
            let cached = state
                .cache_entry(self.kind, id)
                .is_some_and(|entry| entry.is_fresh_for(Some(filename.as_str())));
            if cached {
                self.cancel(id);
                continue;
            }
            if self
                .in_flight
                .get(id)
                .is_some_and(|fetch| &fetch.filename == filename)
            {
                continue;
            }
            self.cancel(id);
            self.issue(id.clone(), filename.clone());
        }
    }

    /// Cancel fetches for entities that are gone from the store.
    pub fn prune(&mut self, store: &Store) {
        let gone: Vec<EntityId> = self
            .in_flight
            .keys()
            .filter(|id| !store.contains(id))
            .cloned()
            .collect();
        for id in gone {
            self.cancel(&id);
        }
    }

    fn cancel(&mut self, entity_id: &EntityId) {
        if let Some(fetch) = self.in_flight.remove(entity_id) {
            debug!(
                "{} cache: cancelling fetch #{} of {} for analyzer {}",
                self.kind, fetch.fetch_id, fetch.filename, entity_id
            );
            fetch.token.cancel();
        }
    }

    fn issue(&mut self, entity_id: EntityId, filename: String) {
        self.next_fetch_id += 1;
        let fetch_id = self.next_fetch_id;
        let token = CancellationToken::new();
        debug!(
            "{} cache: fetch #{} of {} for analyzer {}",
            self.kind, fetch_id, filename, entity_id
        );

        self.in_flight.insert(
            entity_id.clone(),
            InFlight {
                filename: filename.clone(),
                fetch_id,
                token: token.clone(),
            },
        );

        let kind = self.kind;
        let gateway = self.gateway.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = gateway.fetch_artifact(&entity_id, kind, &filename) => result,
            };
            let _ = tx
                .send(DashboardEvent::ArtifactLoaded {
                    kind,
                    entity_id,
                    filename,
                    fetch_id,
                    result,
                })
                .await;
        });
    }

    /// Commit a finished fetch if it is still the one the selection wants.
    pub fn on_loaded(
        &mut self,
        store: &mut Store,
        entity_id: EntityId,
        filename: String,
        fetch_id: u64,
        result: Result<ArtifactContent, GatewayError>,
    ) {
        let current = self
            .in_flight
            .get(&entity_id)
            .is_some_and(|fetch| fetch.fetch_id == fetch_id && !fetch.token.is_cancelled());
        if !current {
            debug!(
                "{} cache: dropping superseded fetch #{} of {}",
                self.kind, fetch_id, filename
            );
            return;
        }
        self.in_flight.remove(&entity_id);

        if store.state().selection(self.kind, &entity_id) != Some(filename.as_str()) {
            debug!(
                "{} cache: {} is no longer selected for analyzer {}",
                self.kind, filename, entity_id
            );
            return;
        }

        match result {
            Ok(content) => {
                store.put_cache_entry(self.kind, &entity_id, CacheEntry { filename, content });
            }
            Err(e) => match &self.policy.on_failure {
                FailurePolicy::Silent => {
                    error!(
                        "{} cache: failed to load {} for analyzer {}: {}",
                        self.kind, filename, entity_id, e
                    );
                }
                FailurePolicy::Placeholder(message) => {
                    warn!(
                        "{} cache: failed to load {} for analyzer {}: {}",
                        self.kind, filename, entity_id, e
                    );
                    let content = ArtifactContent::failed(message.clone());
                    store.put_cache_entry(self.kind, &entity_id, CacheEntry { filename, content });
                }
            },
        }
    }
}
