use crate::model::{ArtifactKind, CacheEntry, Entity, EntityId, Manifest};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// How many WARN/ERROR lines the dashboard keeps for its log panel.
pub const RECENT_LOG_CAPACITY: usize = 100;

/// One value per artifact kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PerKind<T> {
    pub report: T,
    pub summary: T,
}

impl<T> PerKind<T> {
    pub fn get(&self, kind: ArtifactKind) -> &T {
        match kind {
            ArtifactKind::Report => &self.report,
            ArtifactKind::Summary => &self.summary,
        }
    }

    pub fn get_mut(&mut self, kind: ArtifactKind) -> &mut T {
        match kind {
            ArtifactKind::Report => &mut self.report,
            ArtifactKind::Summary => &mut self.summary,
        }
    }
}

/// Lifecycle of a preview's media session.
///
/// ```text
///  Idle → Resolving → Attached → Idle      (teardown)
///         Resolving → Failed   → Idle      (fallback exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SessionState {
    #[default]
    Idle,
    Resolving,
    Attached(PlaybackStrategy),
    Failed,
}

/// Which decoding strategy currently drives a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaybackStrategy {
    /// Segmented-manifest decoder acquired at runtime.
    Adaptive,
    /// Source bound straight to the surface.
    Native,
}

/// Published state of one entity's live preview.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PreviewState {
    pub session: SessionState,
    pub source: String,
    pub playing: bool,
    pub fullscreen: bool,
}

/// What the UI should render in an artifact pane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArtifactView<'a> {
    Unselected,
    /// Selection made but its content has not landed yet.  `previous` is an
    /// older entry that may be shown dimmed.
    Loading { previous: Option<&'a CacheEntry> },
    Ready(&'a CacheEntry),
}

/// Full dashboard state.  `rev` is incremented on every mutation so that
/// observers can skip redundant renders.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DashboardState {
    pub rev: u64,
    pub entities: Vec<Entity>,
    pub manifests: BTreeMap<EntityId, Manifest>,
    pub selections: PerKind<BTreeMap<EntityId, String>>,
    pub caches: PerKind<BTreeMap<EntityId, CacheEntry>>,
    pub previews: BTreeMap<EntityId, PreviewState>,
    pub refreshing: bool,
    pub refreshed_at: Option<DateTime<Local>>,
    pub recent_logs: VecDeque<String>,
}

impl DashboardState {
    pub fn entity(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.iter().find(|e| &e.id == id)
    }

    pub fn manifest(&self, id: &EntityId) -> Option<&Manifest> {
        self.manifests.get(id)
    }

    pub fn selection(&self, kind: ArtifactKind, id: &EntityId) -> Option<&str> {
        self.selections.get(kind).get(id).map(String::as_str)
    }

    pub fn cache_entry(&self, kind: ArtifactKind, id: &EntityId) -> Option<&CacheEntry> {
        self.caches.get(kind).get(id)
    }

    pub fn artifact_view(&self, kind: ArtifactKind, id: &EntityId) -> ArtifactView<'_> {
        let Some(selected) = self.selection(kind, id) else {
            return ArtifactView::Unselected;
        };
        match self.cache_entry(kind, id) {
            Some(entry) if entry.is_fresh_for(Some(selected)) => ArtifactView::Ready(entry),
            previous => ArtifactView::Loading { previous },
        }
    }

    /// "Refreshing…" while the entity list is in flight, "Ready" otherwise.
    pub fn status_label(&self) -> &'static str {
        if self.refreshing {
            "Refreshing…"
        } else {
            "Ready"
        }
    }
}

/// Owner-side wrapper around `DashboardState`.
///
/// Every write replaces the value stored under one key; nothing is merged
/// in place.  The store is owned by the dashboard event loop and is not
/// shared, so it needs no locking.
#[derive(Debug, Default)]
pub struct Store {
    state: DashboardState,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &DashboardState {
        &self.state
    }

    pub fn rev(&self) -> u64 {
        self.state.rev
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.state.entity(id).is_some()
    }

    /// Replace the entity collection wholesale.  Per-entity state of entities
    /// that disappeared is dropped; state of survivors is kept.
    pub fn replace_entities(&mut self, entities: Vec<Entity>) {
        let keep = |id: &EntityId| entities.iter().any(|e| &e.id == id);
        self.state.manifests.retain(|id, _| keep(id));
        for kind in ArtifactKind::ALL {
            self.state.selections.get_mut(kind).retain(|id, _| keep(id));
            self.state.caches.get_mut(kind).retain(|id, _| keep(id));
        }
        self.state.previews.retain(|id, _| keep(id));
        self.state.entities = entities;
        self.state.refreshed_at = Some(Local::now());
        self.bump();
    }

    /// Drop one entity and everything keyed by it.
    pub fn remove_entity(&mut self, id: &EntityId) {
        self.state.entities.retain(|e| &e.id != id);
        self.state.manifests.remove(id);
        for kind in ArtifactKind::ALL {
            self.state.selections.get_mut(kind).remove(id);
            self.state.caches.get_mut(kind).remove(id);
        }
        self.state.previews.remove(id);
        self.bump();
    }

    pub fn set_refreshing(&mut self, refreshing: bool) {
        if self.state.refreshing != refreshing {
            self.state.refreshing = refreshing;
            self.bump();
        }
    }

    pub fn set_manifest(&mut self, id: &EntityId, kind: ArtifactKind, files: Vec<String>) {
        self.state
            .manifests
            .entry(id.clone())
            .or_default()
            .set_files(kind, files);
        self.bump();
    }

    /// `None` or an empty filename clears the selection.
    pub fn set_selection(&mut self, kind: ArtifactKind, id: &EntityId, filename: Option<String>) {
        let slot = self.state.selections.get_mut(kind);
        match filename.filter(|f| !f.is_empty()) {
            Some(f) => {
                slot.insert(id.clone(), f);
            }
            None => {
                slot.remove(id);
            }
        }
        self.bump();
    }

    pub fn put_cache_entry(&mut self, kind: ArtifactKind, id: &EntityId, entry: CacheEntry) {
        self.state.caches.get_mut(kind).insert(id.clone(), entry);
        self.bump();
    }

    pub fn set_preview(&mut self, id: &EntityId, preview: PreviewState) {
        self.state.previews.insert(id.clone(), preview);
        self.bump();
    }

    pub fn remove_preview(&mut self, id: &EntityId) {
        if self.state.previews.remove(id).is_some() {
            self.bump();
        }
    }

    pub fn push_log(&mut self, line: String) {
        if self.state.recent_logs.len() >= RECENT_LOG_CAPACITY {
            self.state.recent_logs.pop_front();
        }
        self.state.recent_logs.push_back(line);
        self.bump();
    }

    fn bump(&mut self) {
        self.state.rev += 1;
    }
}
