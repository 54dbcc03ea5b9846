use crate::model::{ArtifactKind, EntityFields, EntityId};
use serde::{Deserialize, Serialize};

/// Operator intents sent to the dashboard core, from the local HTTP API or
/// from the core's own timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Refresh,
    /// Select (or with `None`, clear) the artifact shown for one entity.
    Select {
        entity_id: EntityId,
        kind: ArtifactKind,
        filename: Option<String>,
    },
    ToggleFullscreen {
        entity_id: EntityId,
    },
    CopyStreamUrl {
        entity_id: EntityId,
    },
    CreateEntity {
        fields: EntityFields,
    },
    UpdateEntity {
        entity_id: EntityId,
        fields: EntityFields,
    },
    DeleteEntity {
        entity_id: EntityId,
    },
}
