//! Directory synchronizer: keeps the entity list and every entity's filename
//! manifests in step with the backend.
//!
//! A refresh loads the entity list and, once it lands, fans out one report
//! listing and one summary listing per entity.  Each listing is committed as
//! soon as it arrives.  Refreshes are numbered so that a slow, older refresh
//! can never overwrite what a newer one already wrote.

use std::collections::HashMap;
use std::sync::Arc;

use analyzer_proto::model::{ArtifactKind, Entity, EntityId};
use analyzer_proto::state::Store;
use futures_util::future::join;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::DashboardEvent;
use crate::gateway::{Gateway, GatewayError};

pub struct DirectorySynchronizer<G: Gateway> {
    gateway: Arc<G>,
    event_tx: mpsc::Sender<DashboardEvent>,
    /// Sequence number of the most recently started refresh.
    issued_seq: u64,
    /// Sequence number of the entity list currently in the store.
    applied_seq: u64,
    /// Per (entity, kind), the refresh that wrote the current listing.
    manifest_seq: HashMap<(EntityId, ArtifactKind), u64>,
}

impl<G: Gateway> DirectorySynchronizer<G> {
    pub fn new(gateway: Arc<G>, event_tx: mpsc::Sender<DashboardEvent>) -> Self {
        Self {
            gateway,
            event_tx,
            issued_seq: 0,
            applied_seq: 0,
            manifest_seq: HashMap::new(),
        }
    }

    /// Start a refresh.  Overlapping refreshes are allowed; the newest one
    /// wins.
    pub fn refresh(&mut self, store: &mut Store) {
        self.issued_seq += 1;
        let seq = self.issued_seq;
        store.set_refreshing(true);
        debug!("directory: refresh #{} started", seq);

        let gateway = self.gateway.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = gateway.list_entities().await;
            let _ = tx.send(DashboardEvent::EntitiesLoaded { seq, result }).await;
        });
    }

    /// Apply the entity list of refresh `seq`.  Returns true when the store's
    /// entity collection was replaced.
    pub fn on_entities(
        &mut self,
        store: &mut Store,
        seq: u64,
        result: Result<Vec<Entity>, GatewayError>,
    ) -> bool {
        if seq == self.issued_seq {
            store.set_refreshing(false);
        }

        let entities = match result {
            Ok(entities) => entities,
            Err(e) => {
                error!("directory: refresh #{} failed, keeping previous list: {}", seq, e);
                return false;
            }
        };

        if seq <= self.applied_seq {
            debug!(
                "directory: dropping entity list of refresh #{} (already at #{})",
                seq, self.applied_seq
            );
            return false;
        }
        self.applied_seq = seq;

        info!("directory: {} analyzers (refresh #{})", entities.len(), seq);
        let ids: Vec<EntityId> = entities.iter().map(|e| e.id.clone()).collect();
        store.replace_entities(entities);
        self.manifest_seq.retain(|(id, _), _| ids.contains(id));

        for id in ids {
            self.fetch_manifests(seq, id);
        }
        true
    }

    /// Both listings of one entity are requested together; each one reports
    /// back on its own so neither waits for, or is lost with, the other.
    fn fetch_manifests(&self, seq: u64, entity_id: EntityId) {
        let gateway = self.gateway.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            join(
                load_listing(&*gateway, &tx, seq, entity_id.clone(), ArtifactKind::Report),
                load_listing(&*gateway, &tx, seq, entity_id, ArtifactKind::Summary),
            )
            .await;
        });
    }

    pub fn on_manifest(
        &mut self,
        store: &mut Store,
        seq: u64,
        entity_id: EntityId,
        kind: ArtifactKind,
        result: Result<Vec<String>, GatewayError>,
    ) {
        if !store.contains(&entity_id) {
            debug!("directory: {} listing for removed analyzer {}", kind, entity_id);
            return;
        }

        let files = match result {
            Ok(files) => files,
            Err(e) => {
                // other entities and the other kind are unaffected
                warn!("directory: {} listing for analyzer {} failed: {}", kind, entity_id, e);
                return;
            }
        };

        let last = self.manifest_seq.entry((entity_id.clone(), kind)).or_insert(0);
        if seq < *last {
            debug!(
                "directory: stale {} listing for analyzer {} (#{} < #{})",
                kind, entity_id, seq, last
            );
            return;
        }
        *last = seq;
        store.set_manifest(&entity_id, kind, files);
    }
}

async fn load_listing<G: Gateway>(
    gateway: &G,
    tx: &mpsc::Sender<DashboardEvent>,
    seq: u64,
    entity_id: EntityId,
    kind: ArtifactKind,
) {
    let result = gateway.list_artifact_filenames(&entity_id, kind).await;
    let _ = tx
        .send(DashboardEvent::ManifestLoaded {
            seq,
            entity_id,
            kind,
            result,
        })
        .await;
}
