//! Scenario tests for the dashboard core.
//!
//! The core runs against a scripted in-memory gateway on a paused clock, so
//! debounce windows and out-of-order completions are deterministic:
//! 1. directory refresh and manifest fan-out
//! 2. selection debounce and fetch supersession
//! 3. failure handling per artifact kind
//! 4. entity mutations
//! 5. preview sessions following the entity list

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use analyzer_proto::config::Config;
use analyzer_proto::model::{
    ArtifactContent, ArtifactKind, CacheEntry, Entity, EntityFields, EntityId,
};
use analyzer_proto::protocol::Command;
use analyzer_proto::state::{ArtifactView, DashboardState, PlaybackStrategy, SessionState};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::{DashboardCore, DashboardEvent};
use crate::gateway::{Gateway, GatewayError};
use crate::media::{
    AdaptiveDecoder, BufferOptions, DecoderFactory, DecoderLibrary, MediaError, PlaybackSurface,
};

// ── scripted gateway ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Call {
    ListEntities,
    ListFiles(EntityId, ArtifactKind),
    Fetch(EntityId, ArtifactKind, String),
    Create(String),
    Update(EntityId),
    Delete(EntityId),
}

#[derive(Clone)]
struct Reply<T> {
    delay: Duration,
    result: Result<T, u16>,
}

fn ok<T>(value: T) -> Reply<T> {
    Reply {
        delay: Duration::from_millis(10),
        result: Ok(value),
    }
}

fn slow<T>(ms: u64, value: T) -> Reply<T> {
    Reply {
        delay: Duration::from_millis(ms),
        result: Ok(value),
    }
}

fn fail<T>(status: u16) -> Reply<T> {
    Reply {
        delay: Duration::from_millis(10),
        result: Err(status),
    }
}

#[derive(Default)]
struct FakeGateway {
    /// One reply per call; the last one repeats.
    entity_lists: Mutex<VecDeque<Reply<Vec<Entity>>>>,
    /// Unscripted listings are empty.
    listings: Mutex<HashMap<(EntityId, ArtifactKind), Reply<Vec<String>>>>,
    /// Unscripted artifacts are 404.
    artifacts: Mutex<HashMap<(EntityId, ArtifactKind, String), Reply<ArtifactContent>>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeGateway {
    fn with_entities(entities: Vec<Entity>) -> Self {
        let gateway = Self::default();
        gateway.entity_lists.lock().unwrap().push_back(ok(entities));
        gateway
    }

    fn script_entities(&self, reply: Reply<Vec<Entity>>) {
        self.entity_lists.lock().unwrap().push_back(reply);
    }

    fn script_listing(&self, id: i64, kind: ArtifactKind, reply: Reply<Vec<String>>) {
        self.listings
            .lock()
            .unwrap()
            .insert((EntityId::from(id), kind), reply);
    }

    fn script_artifact(
        &self,
        id: i64,
        kind: ArtifactKind,
        filename: &str,
        reply: Reply<ArtifactContent>,
    ) {
        self.artifacts
            .lock()
            .unwrap()
            .insert((EntityId::from(id), kind, filename.to_string()), reply);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn fetches(&self, kind: ArtifactKind) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Fetch(_, k, filename) if k == kind => Some(filename),
                _ => None,
            })
            .collect()
    }

    fn count(&self, wanted: &Call) -> usize {
        self.calls().iter().filter(|call| *call == wanted).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

async fn answer<T>(reply: Reply<T>) -> Result<T, GatewayError> {
    tokio::time::sleep(reply.delay).await;
    reply.result.map_err(|status| GatewayError::Status {
        url: "fake".into(),
        status,
    })
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn list_entities(&self) -> Result<Vec<Entity>, GatewayError> {
        self.record(Call::ListEntities);
        let reply = {
            let mut queue = self.entity_lists.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        };
        answer(reply.unwrap_or_else(|| ok(Vec::new()))).await
    }

    async fn list_artifact_filenames(
        &self,
        entity_id: &EntityId,
        kind: ArtifactKind,
    ) -> Result<Vec<String>, GatewayError> {
        self.record(Call::ListFiles(entity_id.clone(), kind));
        let reply = self
            .listings
            .lock()
            .unwrap()
            .get(&(entity_id.clone(), kind))
            .cloned();
        answer(reply.unwrap_or_else(|| ok(Vec::new()))).await
    }

    async fn fetch_artifact(
        &self,
        entity_id: &EntityId,
        kind: ArtifactKind,
        filename: &str,
    ) -> Result<ArtifactContent, GatewayError> {
        self.record(Call::Fetch(entity_id.clone(), kind, filename.to_string()));
        let reply = self
            .artifacts
            .lock()
            .unwrap()
            .get(&(entity_id.clone(), kind, filename.to_string()))
            .cloned();
        answer(reply.unwrap_or_else(|| fail(404))).await
    }

    async fn create_entity(&self, fields: &EntityFields) -> Result<(), GatewayError> {
        self.record(Call::Create(fields.name.clone()));
        answer(ok(())).await
    }

    async fn update_entity(
        &self,
        entity_id: &EntityId,
        _fields: &EntityFields,
    ) -> Result<(), GatewayError> {
        self.record(Call::Update(entity_id.clone()));
        answer(ok(())).await
    }

    async fn delete_entity(&self, entity_id: &EntityId) -> Result<(), GatewayError> {
        self.record(Call::Delete(entity_id.clone()));
        answer(ok(())).await
    }
}

// ── harness ───────────────────────────────────────────────────────────────────

struct Harness {
    core: DashboardCore<FakeGateway>,
    rx: mpsc::Receiver<DashboardEvent>,
    gateway: Arc<FakeGateway>,
}

impl Harness {
    fn new(gateway: FakeGateway) -> Self {
        Self::build(gateway, None)
    }

    fn build(gateway: FakeGateway, library: Option<Arc<dyn DecoderLibrary>>) -> Self {
        let mut config = Config::default();
        config.polling.auto_polling = false;
        let gateway = Arc::new(gateway);
        let (tx, rx) = mpsc::channel(1024);
        let core = DashboardCore::new(config, gateway.clone(), library, tx);
        Self { core, rx, gateway }
    }

    /// Refresh and let everything it triggers settle.
    async fn loaded(gateway: FakeGateway) -> Self {
        let mut harness = Self::new(gateway);
        harness.command(Command::Refresh).await;
        harness.run_for(Duration::from_secs(1)).await;
        harness
    }

    async fn command(&mut self, cmd: Command) {
        self.core.handle_event(DashboardEvent::Command(cmd)).await;
    }

    async fn select(&mut self, id: i64, kind: ArtifactKind, filename: Option<&str>) {
        self.command(Command::Select {
            entity_id: EntityId::from(id),
            kind,
            filename: filename.map(str::to_string),
        })
        .await;
    }

    /// Feed events into the core until `duration` of (virtual) time passed.
    async fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            tokio::select! {
                Some(evt) = self.rx.recv() => self.core.handle_event(evt).await,
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
    }

    fn state(&self) -> &DashboardState {
        self.core.state()
    }

    fn entry(&self, id: i64, kind: ArtifactKind) -> Option<&CacheEntry> {
        self.state().cache_entry(kind, &EntityId::from(id))
    }

    fn entity_ids(&self) -> Vec<EntityId> {
        self.state().entities.iter().map(|e| e.id.clone()).collect()
    }
}

fn entity(id: i64, stream_url: &str) -> Entity {
    Entity {
        id: EntityId::from(id),
        name: format!("Cam{id}"),
        stream_url: stream_url.to_string(),
        schema_fields: vec!["person".into()],
    }
}

fn report(tag: &str) -> ArtifactContent {
    ArtifactContent::Structured(json!({ "report": tag }))
}

const REPORT: ArtifactKind = ArtifactKind::Report;
const SUMMARY: ArtifactKind = ArtifactKind::Summary;

// ── 1. directory ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_refresh_loads_entities_and_manifests() {
    let gateway = FakeGateway::with_entities(vec![entity(1, ""), entity(2, "")]);
    gateway.script_listing(1, REPORT, ok(vec!["r1.json".into(), "r2.json".into()]));
    gateway.script_listing(1, SUMMARY, ok(vec!["s1.json".into()]));
    gateway.script_listing(2, SUMMARY, ok(vec!["s9.json".into()]));

    let mut h = Harness::new(gateway);
    h.command(Command::Refresh).await;
    assert_eq!(h.state().status_label(), "Refreshing…");

    h.run_for(Duration::from_secs(1)).await;

    assert_eq!(h.state().status_label(), "Ready");
    assert_eq!(h.entity_ids(), vec![EntityId::from(1), EntityId::from(2)]);
    let m1 = h.state().manifest(&EntityId::from(1)).unwrap();
    assert_eq!(m1.files(REPORT).unwrap(), ["r1.json", "r2.json"]);
    assert_eq!(m1.files(SUMMARY).unwrap(), ["s1.json"]);
    let m2 = h.state().manifest(&EntityId::from(2)).unwrap();
    assert_eq!(m2.files(REPORT).unwrap().len(), 0);
    assert_eq!(m2.files(SUMMARY).unwrap(), ["s9.json"]);
    assert!(h.state().refreshed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_manifest_failure_is_isolated() {
    let gateway = FakeGateway::with_entities(vec![entity(1, ""), entity(2, "")]);
    gateway.script_listing(1, REPORT, fail(500));
    gateway.script_listing(1, SUMMARY, ok(vec!["s1.json".into()]));
    gateway.script_listing(2, REPORT, ok(vec!["r9.json".into()]));

    let mut h = Harness::loaded(gateway).await;

    let m1 = h.state().manifest(&EntityId::from(1)).unwrap();
    assert_eq!(m1.files(REPORT), None);
    assert_eq!(m1.files(SUMMARY).unwrap(), ["s1.json"]);
    let m2 = h.state().manifest(&EntityId::from(2)).unwrap();
    assert_eq!(m2.files(REPORT).unwrap(), ["r9.json"]);

    // a listing that fails on a later refresh keeps the one already shown
    h.gateway.script_listing(2, REPORT, fail(502));
    h.command(Command::Refresh).await;
    h.run_for(Duration::from_secs(1)).await;
    let m2 = h.state().manifest(&EntityId::from(2)).unwrap();
    assert_eq!(m2.files(REPORT).unwrap(), ["r9.json"]);
}

#[tokio::test(start_paused = true)]
async fn test_list_failure_keeps_previous_entities() {
    let gateway = FakeGateway::with_entities(vec![entity(1, "")]);
    gateway.script_entities(fail(503));

    let mut h = Harness::loaded(gateway).await;
    assert_eq!(h.entity_ids(), vec![EntityId::from(1)]);

    h.command(Command::Refresh).await;
    h.run_for(Duration::from_secs(1)).await;

    assert_eq!(h.entity_ids(), vec![EntityId::from(1)]);
    assert!(!h.state().refreshing);
    assert_eq!(h.gateway.count(&Call::ListEntities), 2);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_refreshes_newest_wins() {
    let gateway = FakeGateway::default();
    gateway.script_entities(slow(500, vec![entity(1, "")]));
    gateway.script_entities(slow(10, vec![entity(1, ""), entity(2, "")]));

    let mut h = Harness::new(gateway);
    h.command(Command::Refresh).await;
    h.command(Command::Refresh).await;
    h.run_for(Duration::from_secs(1)).await;

    assert_eq!(h.entity_ids(), vec![EntityId::from(1), EntityId::from(2)]);
    assert!(!h.state().refreshing);
}

#[tokio::test(start_paused = true)]
async fn test_late_listing_of_older_refresh_is_discarded() {
    let gateway = FakeGateway::with_entities(vec![entity(1, "")]);
    gateway.script_listing(1, REPORT, slow(500, vec!["old.json".into()]));

    let mut h = Harness::new(gateway);
    h.command(Command::Refresh).await;
    h.run_for(Duration::from_millis(50)).await;

    // the second refresh lists before the first one's listing returns
    h.gateway.script_listing(1, REPORT, ok(vec!["new.json".into()]));
    h.command(Command::Refresh).await;
    h.run_for(Duration::from_millis(100)).await;
    let manifest = h.state().manifest(&EntityId::from(1)).unwrap();
    assert_eq!(manifest.files(REPORT).unwrap(), ["new.json"]);

    h.run_for(Duration::from_secs(1)).await;
    let manifest = h.state().manifest(&EntityId::from(1)).unwrap();
    assert_eq!(manifest.files(REPORT).unwrap(), ["new.json"]);
    assert_eq!(
        h.gateway.count(&Call::ListFiles(EntityId::from(1), REPORT)),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_listing_for_removed_entity_is_dropped() {
    let gateway = FakeGateway::default();
    gateway.script_entities(ok(vec![entity(1, "")]));
    gateway.script_entities(ok(vec![]));
    gateway.script_listing(1, REPORT, slow(500, vec!["late.json".into()]));

    let mut h = Harness::new(gateway);
    h.command(Command::Refresh).await;
    h.run_for(Duration::from_millis(100)).await;
    assert_eq!(h.entity_ids(), vec![EntityId::from(1)]);

    h.command(Command::Refresh).await;
    h.run_for(Duration::from_secs(1)).await;

    assert!(h.entity_ids().is_empty());
    assert!(h.state().manifests.is_empty());
}

// ── 2. selection and supersession ─────────────────────────────────────────────

fn one_camera() -> FakeGateway {
    let gateway = FakeGateway::with_entities(vec![entity(1, "")]);
    gateway.script_listing(1, REPORT, ok(vec!["r1.json".into(), "r2.json".into()]));
    gateway.script_listing(1, SUMMARY, ok(vec!["s1.json".into(), "s2.json".into()]));
    gateway
}

#[tokio::test(start_paused = true)]
async fn test_rapid_report_selection_fetches_once() {
    let gateway = one_camera();
    gateway.script_artifact(1, REPORT, "r1.json", ok(report("r1")));
    gateway.script_artifact(1, REPORT, "r2.json", ok(report("r2")));
    let mut h = Harness::loaded(gateway).await;

    h.select(1, REPORT, Some("r1.json")).await;
    h.run_for(Duration::from_millis(50)).await;
    h.select(1, REPORT, Some("r2.json")).await;
    // selection is visible before the fetch even starts
    assert_eq!(h.state().selection(REPORT, &EntityId::from(1)), Some("r2.json"));
    assert!(h.gateway.fetches(REPORT).is_empty());

    h.run_for(Duration::from_secs(1)).await;

    assert_eq!(h.gateway.fetches(REPORT), vec!["r2.json"]);
    let entry = h.entry(1, REPORT).unwrap();
    assert_eq!(entry.filename, "r2.json");
    assert_eq!(entry.content, report("r2"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_superseded_report_never_lands() {
    let gateway = one_camera();
    gateway.script_artifact(1, REPORT, "r1.json", slow(1000, report("r1")));
    gateway.script_artifact(1, REPORT, "r2.json", slow(100, report("r2")));
    let mut h = Harness::loaded(gateway).await;

    h.select(1, REPORT, Some("r1.json")).await;
    h.run_for(Duration::from_millis(250)).await;
    h.select(1, REPORT, Some("r2.json")).await;
    h.run_for(Duration::from_secs(2)).await;

    assert_eq!(h.gateway.fetches(REPORT), vec!["r1.json", "r2.json"]);
    assert_eq!(h.entry(1, REPORT).unwrap().filename, "r2.json");
}

#[tokio::test(start_paused = true)]
async fn test_fast_superseded_summary_never_lands() {
    let gateway = one_camera();
    gateway.script_artifact(1, SUMMARY, "s1.json", slow(50, report("s1")));
    gateway.script_artifact(1, SUMMARY, "s2.json", slow(300, report("s2")));
    let mut h = Harness::loaded(gateway).await;

    h.select(1, SUMMARY, Some("s1.json")).await;
    h.select(1, SUMMARY, Some("s2.json")).await;

    h.run_for(Duration::from_millis(100)).await;
    assert!(h.entry(1, SUMMARY).is_none());
    assert!(matches!(
        h.state().artifact_view(SUMMARY, &EntityId::from(1)),
        ArtifactView::Loading { previous: None }
    ));

    h.run_for(Duration::from_secs(1)).await;
    assert_eq!(h.entry(1, SUMMARY).unwrap().filename, "s2.json");
}

#[tokio::test(start_paused = true)]
async fn test_reselect_is_idempotent() {
    let gateway = one_camera();
    gateway.script_artifact(1, REPORT, "r1.json", ok(report("r1")));
    gateway.script_artifact(1, SUMMARY, "s1.json", slow(200, report("s1")));
    let mut h = Harness::loaded(gateway).await;

    h.select(1, REPORT, Some("r1.json")).await;
    h.run_for(Duration::from_secs(1)).await;
    h.select(1, REPORT, Some("r1.json")).await;
    h.run_for(Duration::from_secs(1)).await;
    assert_eq!(h.gateway.fetches(REPORT), vec!["r1.json"]);

    // same filename while the first fetch is still in flight
    h.select(1, SUMMARY, Some("s1.json")).await;
    h.run_for(Duration::from_millis(20)).await;
    h.select(1, SUMMARY, Some("s1.json")).await;
    h.run_for(Duration::from_secs(1)).await;
    assert_eq!(h.gateway.fetches(SUMMARY), vec!["s1.json"]);
    assert_eq!(h.entry(1, SUMMARY).unwrap().filename, "s1.json");
}

#[tokio::test(start_paused = true)]
async fn test_clearing_selection_cancels_fetch() {
    let gateway = one_camera();
    gateway.script_artifact(1, SUMMARY, "s1.json", slow(500, report("s1")));
    let mut h = Harness::loaded(gateway).await;

    h.select(1, SUMMARY, Some("s1.json")).await;
    h.run_for(Duration::from_millis(10)).await;
    h.select(1, SUMMARY, None).await;
    h.run_for(Duration::from_secs(1)).await;

    assert!(h.state().selection(SUMMARY, &EntityId::from(1)).is_none());
    assert!(h.entry(1, SUMMARY).is_none());
    assert_eq!(
        h.state().artifact_view(SUMMARY, &EntityId::from(1)),
        ArtifactView::Unselected
    );
}

#[tokio::test(start_paused = true)]
async fn test_select_for_unknown_entity_is_ignored() {
    let mut h = Harness::loaded(one_camera()).await;
    h.select(42, SUMMARY, Some("s1.json")).await;
    h.run_for(Duration::from_secs(1)).await;

    assert!(h.state().selection(SUMMARY, &EntityId::from(42)).is_none());
    assert!(h.gateway.fetches(SUMMARY).is_empty());
}

// ── 3. failures ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_summary_failure_writes_placeholder() {
    let mut h = Harness::loaded(one_camera()).await;

    h.select(1, SUMMARY, Some("s1.json")).await;
    h.run_for(Duration::from_secs(1)).await;

    let entry = h.entry(1, SUMMARY).unwrap();
    assert_eq!(entry.filename, "s1.json");
    assert_eq!(entry.content, ArtifactContent::failed("Failed to load summary."));
    assert_eq!(
        serde_json::to_value(&entry.content).unwrap(),
        json!({"error": "Failed to load summary."})
    );

    // the placeholder is a cache hit; no retry on reselect
    h.select(1, SUMMARY, Some("s1.json")).await;
    h.run_for(Duration::from_secs(1)).await;
    assert_eq!(h.gateway.fetches(SUMMARY), vec!["s1.json"]);
}

#[tokio::test(start_paused = true)]
async fn test_report_failure_keeps_previous_entry() {
    let gateway = one_camera();
    gateway.script_artifact(1, REPORT, "r1.json", ok(report("r1")));
    let mut h = Harness::loaded(gateway).await;

    h.select(1, REPORT, Some("r1.json")).await;
    h.run_for(Duration::from_secs(1)).await;
    h.select(1, REPORT, Some("r3.json")).await;
    h.run_for(Duration::from_secs(1)).await;

    assert_eq!(h.gateway.fetches(REPORT), vec!["r1.json", "r3.json"]);
    assert_eq!(h.entry(1, REPORT).unwrap().filename, "r1.json");
    assert!(matches!(
        h.state().artifact_view(REPORT, &EntityId::from(1)),
        ArtifactView::Loading { previous: Some(e) } if e.filename == "r1.json"
    ));
}

// ── 4. mutations ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_delete_removes_entity_locally() {
    let gateway = FakeGateway::with_entities(vec![entity(1, ""), entity(2, "")]);
    gateway.script_artifact(1, SUMMARY, "s1.json", ok(report("s1")));
    let mut h = Harness::loaded(gateway).await;
    h.select(1, SUMMARY, Some("s1.json")).await;
    h.run_for(Duration::from_secs(1)).await;

    h.command(Command::DeleteEntity {
        entity_id: EntityId::from(1),
    })
    .await;
    h.run_for(Duration::from_secs(1)).await;

    assert_eq!(h.entity_ids(), vec![EntityId::from(2)]);
    assert!(h.state().selection(SUMMARY, &EntityId::from(1)).is_none());
    assert!(h.entry(1, SUMMARY).is_none());
    assert!(h.state().manifest(&EntityId::from(1)).is_none());
    assert_eq!(h.gateway.count(&Call::Delete(EntityId::from(1))), 1);
    // no refetch of the list
    assert_eq!(h.gateway.count(&Call::ListEntities), 1);
}

#[tokio::test(start_paused = true)]
async fn test_create_and_update_trigger_refresh() {
    let mut h = Harness::loaded(FakeGateway::with_entities(vec![entity(1, "")])).await;

    h.command(Command::CreateEntity {
        fields: EntityFields::from_form("Cam2", "http://x/cam2.mp4", "car"),
    })
    .await;
    h.run_for(Duration::from_secs(1)).await;
    assert_eq!(h.gateway.count(&Call::Create("Cam2".into())), 1);
    assert_eq!(h.gateway.count(&Call::ListEntities), 2);

    h.command(Command::UpdateEntity {
        entity_id: EntityId::from(1),
        fields: EntityFields::from_form("Cam1b", "", ""),
    })
    .await;
    h.run_for(Duration::from_secs(1)).await;
    assert_eq!(h.gateway.count(&Call::Update(EntityId::from(1))), 1);
    assert_eq!(h.gateway.count(&Call::ListEntities), 3);
}

// ── 5. previews ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_previews_follow_entity_list() {
    let gateway = FakeGateway::default();
    gateway.script_entities(ok(vec![entity(1, "http://x/cam1.m3u8"), entity(2, "")]));
    gateway.script_entities(ok(vec![entity(2, "")]));
    let mut h = Harness::loaded(gateway).await;

    // no decoder library in tests, so the manifest plays natively
    let preview = h.state().previews.get(&EntityId::from(1)).unwrap().clone();
    assert_eq!(preview.session, SessionState::Attached(PlaybackStrategy::Native));
    assert_eq!(preview.source, "http://x/cam1.m3u8");
    assert!(preview.playing);
    assert!(!h.state().previews.contains_key(&EntityId::from(2)));

    h.command(Command::ToggleFullscreen {
        entity_id: EntityId::from(1),
    })
    .await;
    h.run_for(Duration::from_millis(100)).await;
    assert!(h.state().previews[&EntityId::from(1)].fullscreen);

    h.command(Command::Refresh).await;
    h.run_for(Duration::from_secs(1)).await;
    assert!(h.state().previews.is_empty());
}

/// Decoder whose teardown takes a while, like an mpv process slow to quit.
struct SlowTeardownDecoder;

#[async_trait]
impl AdaptiveDecoder for SlowTeardownDecoder {
    async fn load_source(&mut self, _url: &str) -> Result<(), MediaError> {
        Ok(())
    }

    async fn attach_media(
        &mut self,
        surface: &mut dyn PlaybackSurface,
    ) -> Result<(), MediaError> {
        surface.attach_decoder("slow");
        Ok(())
    }

    async fn destroy(&mut self) {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

struct SlowTeardownLibrary;

impl DecoderFactory for SlowTeardownLibrary {
    fn construct(&self, _options: &BufferOptions) -> Box<dyn AdaptiveDecoder> {
        Box::new(SlowTeardownDecoder)
    }
}

#[async_trait]
impl DecoderLibrary for SlowTeardownLibrary {
    fn available(&self) -> Option<Arc<dyn DecoderFactory>> {
        Some(Arc::new(SlowTeardownLibrary))
    }

    async fn acquire(&self) -> Result<Arc<dyn DecoderFactory>, MediaError> {
        let factory: Arc<dyn DecoderFactory> = Arc::new(SlowTeardownLibrary);
        Ok(factory)
    }

    fn unload(&self) {}
}

#[tokio::test(start_paused = true)]
async fn test_closed_session_does_not_overwrite_its_successor() {
    let gateway = FakeGateway::default();
    gateway.script_entities(ok(vec![entity(1, "http://x/a.m3u8")]));
    gateway.script_entities(ok(vec![]));
    gateway.script_entities(ok(vec![entity(1, "http://x/a.m3u8")]));

    let mut h = Harness::build(gateway, Some(Arc::new(SlowTeardownLibrary)));
    h.command(Command::Refresh).await;
    h.run_for(Duration::from_secs(1)).await;
    let id = EntityId::from(1);
    assert_eq!(
        h.state().previews[&id].session,
        SessionState::Attached(PlaybackStrategy::Adaptive)
    );

    // drop out, then come back while the first session is still tearing down
    h.command(Command::Refresh).await;
    h.run_for(Duration::from_millis(50)).await;
    assert!(!h.state().previews.contains_key(&id));
    h.command(Command::Refresh).await;
    h.run_for(Duration::from_secs(2)).await;

    let preview = &h.state().previews[&id];
    assert_eq!(preview.session, SessionState::Attached(PlaybackStrategy::Adaptive));
    assert_eq!(preview.source, "http://x/a.m3u8");
    assert!(preview.playing);
}
