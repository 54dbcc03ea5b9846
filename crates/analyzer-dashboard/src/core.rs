//! DashboardCore: single-owner event loop for all dashboard state.
//!
//! Every mutation of the `Store` happens here.  Network work (entity list,
//! manifests, artifact contents, entity mutations) runs in spawned tasks that
//! report back by sending a `DashboardEvent`; media sessions run as their own
//! actors and report preview changes the same way.
//!
//! After each event that changes the store, the core publishes a snapshot on
//! a `watch` channel for the HTTP API.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use analyzer_proto::config::Config;
use analyzer_proto::model::{ArtifactContent, ArtifactKind, Entity, EntityId};
use analyzer_proto::protocol::Command;
use analyzer_proto::state::{DashboardState, PreviewState, Store};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::content_cache::{CachePolicy, FailurePolicy, SelectionCache};
use crate::directory::DirectorySynchronizer;
use crate::gateway::{Gateway, GatewayError};
use crate::media::surface::PreviewSurface;
use crate::media::{BufferOptions, DecoderLibrary, MediaSession, PreviewFeed, SessionHandle};

// ── DashboardEvent ────────────────────────────────────────────────────────────

/// All inputs into the DashboardCore loop.
#[derive(Debug)]
pub enum DashboardEvent {
    /// An operator command from the HTTP API.
    Command(Command),
    /// Periodic refresh timer.
    RefreshTick,
    /// The entity list request of refresh `seq` finished.
    EntitiesLoaded {
        seq: u64,
        result: Result<Vec<Entity>, GatewayError>,
    },
    /// One filename listing of refresh `seq` finished.
    ManifestLoaded {
        seq: u64,
        entity_id: EntityId,
        kind: ArtifactKind,
        result: Result<Vec<String>, GatewayError>,
    },
    /// A debounce window of one cache elapsed.
    SelectionSettled { kind: ArtifactKind, generation: u64 },
    /// An artifact fetch finished (never sent for fetches aborted in flight).
    ArtifactLoaded {
        kind: ArtifactKind,
        entity_id: EntityId,
        filename: String,
        fetch_id: u64,
        result: Result<ArtifactContent, GatewayError>,
    },
    /// A media session changed state.
    PreviewChanged {
        entity_id: EntityId,
        session_id: u64,
        preview: PreviewState,
    },
    /// A create/update/delete call returned.
    MutationFinished {
        mutation: Mutation,
        result: Result<(), GatewayError>,
    },
    /// A WARN/ERROR line captured from the tracing pipeline.
    Log(String),
    /// Shutdown requested.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create,
    Update(EntityId),
    Delete(EntityId),
}

// ── DashboardCore ─────────────────────────────────────────────────────────────

pub struct DashboardCore<G: Gateway> {
    config: Config,
    store: Store,
    gateway: Arc<G>,
    directory: DirectorySynchronizer<G>,
    reports: SelectionCache<G>,
    summaries: SelectionCache<G>,
    /// One media session actor per entity with a stream URL.
    sessions: HashMap<EntityId, SessionHandle>,
    next_session_id: u64,
    /// `None` when the adaptive decoder is disabled in config.
    library: Option<Arc<dyn DecoderLibrary>>,
    event_tx: mpsc::Sender<DashboardEvent>,
    state_tx: watch::Sender<DashboardState>,
    published_rev: u64,
}

impl<G: Gateway> DashboardCore<G> {
    pub fn new(
        config: Config,
        gateway: Arc<G>,
        library: Option<Arc<dyn DecoderLibrary>>,
        event_tx: mpsc::Sender<DashboardEvent>,
    ) -> Self {
        let report_policy = CachePolicy {
            debounce: config.cache.report_debounce(),
            on_failure: match &config.cache.report_failure_placeholder {
                Some(message) => FailurePolicy::Placeholder(message.clone()),
                None => FailurePolicy::Silent,
            },
        };
        let summary_policy = CachePolicy {
            debounce: config.cache.summary_debounce(),
            on_failure: FailurePolicy::Placeholder(config.cache.summary_error_message.clone()),
        };

        let store = Store::new();
        let (state_tx, _) = watch::channel(store.state().clone());

        Self {
            directory: DirectorySynchronizer::new(gateway.clone(), event_tx.clone()),
            reports: SelectionCache::new(
                ArtifactKind::Report,
                report_policy,
                gateway.clone(),
                event_tx.clone(),
            ),
            summaries: SelectionCache::new(
                ArtifactKind::Summary,
                summary_policy,
                gateway.clone(),
                event_tx.clone(),
            ),
            config,
            store,
            gateway,
            sessions: HashMap::new(),
            next_session_id: 0,
            library,
            event_tx,
            state_tx,
            published_rev: 0,
        }
    }

    /// Snapshot feed for readers outside the loop.
    pub fn subscribe(&self) -> watch::Receiver<DashboardState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> &DashboardState {
        self.store.state()
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DashboardEvent>) -> anyhow::Result<()> {
        info!("DashboardCore: starting event loop");

        if self.config.polling.auto_polling && self.config.polling.poll_interval_secs > 0 {
            let tick_tx = self.event_tx.clone();
            let period = Duration::from_secs(self.config.polling.poll_interval_secs);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    if tick_tx.send(DashboardEvent::RefreshTick).await.is_err() {
                        break;
                    }
                }
            });
        }

        loop {
            match event_rx.recv().await {
                None => {
                    info!("DashboardCore: event channel closed, shutting down");
                    break;
                }
                Some(DashboardEvent::Shutdown) => {
                    info!("DashboardCore: shutdown requested");
                    break;
                }
                Some(evt) => self.handle_event(evt).await,
            }
        }

        // Sessions publish while tearing down; with the receiver gone those
        // sends fail fast instead of waiting on a loop that no longer reads.
        drop(event_rx);
        self.cleanup().await;
        Ok(())
    }

    pub async fn handle_event(&mut self, evt: DashboardEvent) {
        match evt {
            DashboardEvent::Command(cmd) => {
                debug!("DashboardCore: command {:?}", cmd);
                self.handle_command(cmd).await;
            }
            DashboardEvent::RefreshTick => self.directory.refresh(&mut self.store),
            DashboardEvent::EntitiesLoaded { seq, result } => {
                if self.directory.on_entities(&mut self.store, seq, result) {
                    self.reports.prune(&self.store);
                    self.summaries.prune(&self.store);
                    self.sync_sessions();
                }
            }
            DashboardEvent::ManifestLoaded {
                seq,
                entity_id,
                kind,
                result,
            } => self
                .directory
                .on_manifest(&mut self.store, seq, entity_id, kind, result),
            DashboardEvent::SelectionSettled { kind, generation } => {
                let (cache, store) = self.split(kind);
                cache.on_settled(store, generation);
            }
            DashboardEvent::ArtifactLoaded {
                kind,
                entity_id,
                filename,
                fetch_id,
                result,
            } => {
                let (cache, store) = self.split(kind);
                cache.on_loaded(store, entity_id, filename, fetch_id, result);
            }
            DashboardEvent::PreviewChanged {
                entity_id,
                session_id,
                preview,
            } => {
                // late updates from a closed session, possibly already replaced
                let current = self
                    .sessions
                    .get(&entity_id)
                    .is_some_and(|session| session.session_id() == session_id);
                if current {
                    self.store.set_preview(&entity_id, preview);
                } else {
                    debug!("preview {}: dropping update of session #{}", entity_id, session_id);
                }
            }
            DashboardEvent::MutationFinished { mutation, result } => {
                self.on_mutation_finished(mutation, result)
            }
            DashboardEvent::Log(line) => self.store.push_log(line),
            DashboardEvent::Shutdown => {}
        }
        self.publish();
    }

    fn split(&mut self, kind: ArtifactKind) -> (&mut SelectionCache<G>, &mut Store) {
        match kind {
            ArtifactKind::Report => (&mut self.reports, &mut self.store),
            ArtifactKind::Summary => (&mut self.summaries, &mut self.store),
        }
    }

    fn publish(&mut self) {
        let rev = self.store.rev();
        if rev != self.published_rev {
            self.published_rev = rev;
            self.state_tx.send_replace(self.store.state().clone());
        }
    }

    // ── command handlers ──────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Refresh => self.directory.refresh(&mut self.store),
            Command::Select {
                entity_id,
                kind,
                filename,
            } => {
                if !self.store.contains(&entity_id) {
                    warn!("select: unknown analyzer {}", entity_id);
                    return;
                }
                let (cache, store) = self.split(kind);
                cache.select(store, &entity_id, filename);
            }
            Command::ToggleFullscreen { entity_id } => match self.sessions.get(&entity_id) {
                Some(session) => session.toggle_fullscreen(),
                None => debug!("fullscreen: no preview for analyzer {}", entity_id),
            },
            Command::CopyStreamUrl { entity_id } => self.copy_stream_url(&entity_id),
            Command::CreateEntity { fields } => {
                let gateway = self.gateway.clone();
                self.spawn_mutation(Mutation::Create, async move {
                    gateway.create_entity(&fields).await
                });
            }
            Command::UpdateEntity { entity_id, fields } => {
                let gateway = self.gateway.clone();
                let id = entity_id.clone();
                self.spawn_mutation(Mutation::Update(entity_id), async move {
                    gateway.update_entity(&id, &fields).await
                });
            }
            Command::DeleteEntity { entity_id } => {
                let gateway = self.gateway.clone();
                let id = entity_id.clone();
                self.spawn_mutation(Mutation::Delete(entity_id), async move {
                    gateway.delete_entity(&id).await
                });
            }
        }
    }

    fn spawn_mutation<F>(&self, mutation: Mutation, call: F)
    where
        F: std::future::Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = call.await;
            let _ = tx
                .send(DashboardEvent::MutationFinished { mutation, result })
                .await;
        });
    }

    fn on_mutation_finished(&mut self, mutation: Mutation, result: Result<(), GatewayError>) {
        match (mutation, result) {
            (Mutation::Delete(id), Ok(())) => {
                info!("analyzer {} deleted", id);
                self.store.remove_entity(&id);
                self.reports.prune(&self.store);
                self.summaries.prune(&self.store);
                self.sync_sessions();
            }
            (mutation, Ok(())) => {
                info!("{:?} succeeded, refreshing", mutation);
                self.directory.refresh(&mut self.store);
            }
            (mutation, Err(e)) => error!("{:?} failed: {}", mutation, e),
        }
    }

    fn copy_stream_url(&self, entity_id: &EntityId) {
        let Some(url) = self
            .store
            .state()
            .entity(entity_id)
            .map(|e| e.stream_url.clone())
        else {
            warn!("copy: unknown analyzer {}", entity_id);
            return;
        };
        tokio::task::spawn_blocking(move || {
            let copied = arboard::Clipboard::new().and_then(|mut cb| cb.set_text(url.clone()));
            match copied {
                Ok(()) => info!("copied stream url {}", url),
                Err(e) => warn!("clipboard unavailable: {}", e),
            }
        });
    }

    // ── media sessions ────────────────────────────────────────────────────────

    /// Bring session actors in line with the entity list: one per entity with
    /// a non-empty stream URL, re-pointed when the URL changed.
    fn sync_sessions(&mut self) {
        if !self.config.preview.enabled {
            return;
        }

        let wanted: HashMap<EntityId, String> = self
            .store
            .state()
            .entities
            .iter()
            .filter(|e| !e.stream_url.trim().is_empty())
            .map(|e| (e.id.clone(), e.stream_url.trim().to_string()))
            .collect();

        let gone: Vec<EntityId> = self
            .sessions
            .keys()
            .filter(|id| !wanted.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(session) = self.sessions.remove(&id) {
                debug!("preview {}: removed", id);
                session.close();
            }
            self.store.remove_preview(&id);
        }

        for (id, url) in wanted {
            match self.sessions.get_mut(&id) {
                Some(session) if session.source() == url => {}
                Some(session) => {
                    info!("preview {}: source changed to {}", id, url);
                    session.set_source(url);
                }
                None => {
                    self.next_session_id += 1;
                    let feed = PreviewFeed {
                        session_id: self.next_session_id,
                        tx: self.event_tx.clone(),
                    };
                    let session = MediaSession::new(
                        id.clone(),
                        PreviewSurface::new(&self.config.preview),
                        self.library.clone(),
                        BufferOptions::from(&self.config.decoder),
                        Some(feed),
                    );
                    let mut handle = SessionHandle::spawn(session);
                    handle.set_source(url);
                    self.sessions.insert(id, handle);
                }
            }
        }
    }

    async fn cleanup(&mut self) {
        info!("DashboardCore: cleanup, closing {} previews", self.sessions.len());
        for (id, session) in self.sessions.drain() {
            if tokio::time::timeout(Duration::from_secs(5), session.join())
                .await
                .is_err()
            {
                warn!("preview {}: teardown timed out", id);
            }
        }
    }
}
