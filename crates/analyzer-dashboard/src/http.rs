use crate::core::DashboardEvent;
use analyzer_proto::model::{
    ArtifactKind, ArtifactPreview, CacheEntry, EntityFields, EntityId, ManifestStatus,
};
use analyzer_proto::protocol::Command;
use analyzer_proto::state::{ArtifactView, DashboardState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_rx: watch::Receiver<DashboardState>,
    event_tx: mpsc::Sender<DashboardEvent>,
}

#[derive(Serialize)]
struct ViewBody {
    /// "unselected", "loading" or "ready".
    status: &'static str,
    selection: Option<String>,
    /// "loading", "empty" or "available".
    manifest: &'static str,
    files: Vec<String>,
    /// The ready entry, or while loading the previous one if any.
    entry: Option<CacheEntry>,
    /// True when `entry` is an error placeholder rather than content.
    failed: bool,
    preview: Option<ArtifactPreview>,
}

/// Create/update body.  `schema_fields` is either a list or the form's
/// comma separated text.
#[derive(Deserialize)]
struct FieldsBody {
    name: String,
    #[serde(default)]
    stream_url: String,
    #[serde(default)]
    schema_fields: SchemaInput,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SchemaInput {
    List(Vec<String>),
    Csv(String),
}

impl Default for SchemaInput {
    fn default() -> Self {
        SchemaInput::List(Vec::new())
    }
}

impl From<FieldsBody> for EntityFields {
    fn from(body: FieldsBody) -> Self {
        let csv = match body.schema_fields {
            SchemaInput::List(items) => items.join(","),
            SchemaInput::Csv(csv) => csv,
        };
        EntityFields::from_form(&body.name, &body.stream_url, &csv)
    }
}

#[derive(Deserialize)]
struct SelectBody {
    #[serde(default)]
    filename: Option<String>,
}

pub fn router(
    state_rx: watch::Receiver<DashboardState>,
    event_tx: mpsc::Sender<DashboardEvent>,
) -> Router {
    let app_state = HttpState { state_rx, event_tx };

    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/refresh", post(refresh))
        .route("/api/analyzers", post(create_analyzer))
        .route(
            "/api/analyzers/:id",
            axum::routing::put(update_analyzer).delete(delete_analyzer),
        )
        .route("/api/analyzers/:id/view/:kind", get(get_view))
        .route("/api/analyzers/:id/select/:kind", post(select))
        .route("/api/analyzers/:id/fullscreen", post(toggle_fullscreen))
        .route("/api/analyzers/:id/copy-url", post(copy_url))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_rx: watch::Receiver<DashboardState>,
    event_tx: mpsc::Sender<DashboardEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state_rx, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn forward(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state.event_tx.send(DashboardEvent::Command(cmd)).await.is_err() {
        error!("Failed to forward command, core is gone");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}

async fn get_state(State(state): State<HttpState>) -> Json<DashboardState> {
    Json(state.state_rx.borrow().clone())
}

async fn get_view(
    State(state): State<HttpState>,
    Path((id, kind)): Path<(String, String)>,
) -> Result<Json<ViewBody>, StatusCode> {
    let kind = ArtifactKind::parse(&kind).ok_or(StatusCode::BAD_REQUEST)?;
    let id = EntityId::new(id);
    let snapshot = state.state_rx.borrow();
    if snapshot.entity(&id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    let (manifest, files) = match snapshot.manifest(&id).map(|m| m.status(kind)) {
        None | Some(ManifestStatus::Loading) => ("loading", Vec::new()),
        Some(ManifestStatus::Empty) => ("empty", Vec::new()),
        Some(ManifestStatus::Available(files)) => ("available", files.to_vec()),
    };
    let (status, entry) = match snapshot.artifact_view(kind, &id) {
        ArtifactView::Unselected => ("unselected", None),
        ArtifactView::Loading { previous } => ("loading", previous.cloned()),
        ArtifactView::Ready(entry) => ("ready", Some(entry.clone())),
    };

    Ok(Json(ViewBody {
        status,
        selection: snapshot.selection(kind, &id).map(str::to_string),
        manifest,
        files,
        failed: entry.as_ref().is_some_and(|e| e.content.is_failure()),
        preview: entry.as_ref().map(|e| e.content.preview()),
        entry,
    }))
}

async fn refresh(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::Refresh).await
}

async fn select(
    State(state): State<HttpState>,
    Path((id, kind)): Path<(String, String)>,
    Json(body): Json<SelectBody>,
) -> StatusCode {
    let Some(kind) = ArtifactKind::parse(&kind) else {
        return StatusCode::BAD_REQUEST;
    };
    let cmd = Command::Select {
        entity_id: EntityId::new(id),
        kind,
        filename: body.filename,
    };
    forward(&state, cmd).await
}

async fn toggle_fullscreen(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    let cmd = Command::ToggleFullscreen {
        entity_id: EntityId::new(id),
    };
    forward(&state, cmd).await
}

async fn copy_url(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    let cmd = Command::CopyStreamUrl {
        entity_id: EntityId::new(id),
    };
    forward(&state, cmd).await
}

async fn create_analyzer(
    State(state): State<HttpState>,
    Json(body): Json<FieldsBody>,
) -> StatusCode {
    let cmd = Command::CreateEntity {
        fields: body.into(),
    };
    forward(&state, cmd).await
}

async fn update_analyzer(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Json(body): Json<FieldsBody>,
) -> StatusCode {
    let cmd = Command::UpdateEntity {
        entity_id: EntityId::new(id),
        fields: body.into(),
    };
    forward(&state, cmd).await
}

async fn delete_analyzer(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    let cmd = Command::DeleteEntity {
        entity_id: EntityId::new(id),
    };
    forward(&state, cmd).await
}
