//! Adaptive media sessions: one live preview per entity.
//!
//! ```text
//!  Idle → Resolving → Attached(Adaptive | Native) → Idle   (teardown)
//!         Resolving → Failed → Idle                        (native bind refused)
//! ```
//!
//! A session plays its source on a [`PlaybackSurface`].  Sources ending in
//! `.m3u8` go through an [`AdaptiveDecoder`] when the [`DecoderLibrary`] can
//! provide one, acquiring it at runtime if needed; everything else, and every
//! adaptive source whose decoder cannot be had, is bound to the surface
//! directly.  The previous decoder is always destroyed before a new source is
//! attached.

pub mod mpv;
pub mod surface;

use std::collections::VecDeque;
use std::sync::Arc;

use analyzer_proto::config::DecoderConfig;
use analyzer_proto::model::EntityId;
use analyzer_proto::state::{PlaybackStrategy, PreviewState, SessionState};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::DashboardEvent;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("adaptive decoder library unavailable: {0}")]
    LibraryUnavailable(String),

    #[error("decoder failure: {0}")]
    Decoder(String),

    #[error("autoplay refused by the surface")]
    AutoplayBlocked,

    #[error("fullscreen refused by the surface")]
    FullscreenRefused,

    #[error("decoder ipc: {0}")]
    Ipc(#[from] anyhow::Error),
}

/// Buffering limits handed to every decoder instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferOptions {
    pub max_buffer_secs: u32,
    pub max_max_buffer_secs: u32,
}

impl From<&DecoderConfig> for BufferOptions {
    fn from(config: &DecoderConfig) -> Self {
        Self {
            max_buffer_secs: config.max_buffer_secs,
            max_max_buffer_secs: config.max_max_buffer_secs,
        }
    }
}

/// Where a preview is rendered.
#[async_trait]
pub trait PlaybackSurface: Send {
    /// Drop any bound source or decoder and stop playback.
    fn reset(&mut self);

    /// Play `url` natively, without an adaptive decoder.
    fn bind_source(&mut self, url: &str) -> Result<(), MediaError>;

    /// Record that `decoder` now feeds this surface.
    fn attach_decoder(&mut self, decoder: &str);

    fn is_playing(&self) -> bool;

    fn is_fullscreen(&self) -> bool;

    async fn play(&mut self) -> Result<(), MediaError>;

    async fn request_fullscreen(&mut self) -> Result<(), MediaError>;

    async fn exit_fullscreen(&mut self) -> Result<(), MediaError>;
}

/// One decoder instance, owned by exactly one session.
#[async_trait]
pub trait AdaptiveDecoder: Send {
    async fn load_source(&mut self, url: &str) -> Result<(), MediaError>;

    async fn attach_media(&mut self, surface: &mut dyn PlaybackSurface) -> Result<(), MediaError>;

    /// Release everything the decoder holds.  Must not fail.
    async fn destroy(&mut self);
}

pub trait DecoderFactory: Send + Sync {
    fn construct(&self, options: &BufferOptions) -> Box<dyn AdaptiveDecoder>;
}

/// Process-wide source of the adaptive decoder capability.
#[async_trait]
pub trait DecoderLibrary: Send + Sync {
    /// The capability, if it is already present.
    fn available(&self) -> Option<Arc<dyn DecoderFactory>>;

    /// Make the capability available at runtime.
    async fn acquire(&self) -> Result<Arc<dyn DecoderFactory>, MediaError>;

    /// Undo side effects left by `acquire`.  Best effort and idempotent; an
    /// already loaded capability stays usable.
    fn unload(&self);
}

/// True when `source` names a segmented adaptive manifest.
pub fn is_adaptive_source(source: &str) -> bool {
    let path = source.split(['?', '#']).next().unwrap_or(source);
    path.to_ascii_lowercase().ends_with(".m3u8")
}

/// Where a session reports its preview state.  `session_id` is unique per
/// spawned session, so updates from a session that was already replaced can
/// be told apart from those of its successor.
#[derive(Debug, Clone)]
pub struct PreviewFeed {
    pub session_id: u64,
    pub tx: mpsc::Sender<DashboardEvent>,
}

// ── MediaSession ──────────────────────────────────────────────────────────────

pub struct MediaSession<S: PlaybackSurface + 'static> {
    entity_id: EntityId,
    surface: S,
    library: Option<Arc<dyn DecoderLibrary>>,
    options: BufferOptions,
    decoder: Option<Box<dyn AdaptiveDecoder>>,
    /// Set when this session triggered `acquire`, so teardown can undo it.
    acquired: bool,
    state: SessionState,
    source: String,
    updates: Option<PreviewFeed>,
}

impl<S: PlaybackSurface + 'static> MediaSession<S> {
    pub fn new(
        entity_id: EntityId,
        surface: S,
        library: Option<Arc<dyn DecoderLibrary>>,
        options: BufferOptions,
        updates: Option<PreviewFeed>,
    ) -> Self {
        Self {
            entity_id,
            surface,
            library,
            options,
            decoder: None,
            acquired: false,
            state: SessionState::Idle,
            source: String::new(),
            updates,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<u64> {
        self.updates.as_ref().map(|feed| feed.session_id)
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn preview(&self) -> PreviewState {
        PreviewState {
            session: self.state,
            source: self.source.clone(),
            playing: self.surface.is_playing(),
            fullscreen: self.surface.is_fullscreen(),
        }
    }

    /// Switch to `source`.  An empty source leaves the session idle.
    pub async fn set_source(&mut self, source: &str) {
        self.teardown().await;
        self.source = source.trim().to_string();
        if self.source.is_empty() {
            self.publish().await;
            return;
        }

        if !is_adaptive_source(&self.source) {
            self.play_native().await;
            return;
        }

        self.transition(SessionState::Resolving).await;
        let Some(factory) = self.resolve_factory().await else {
            self.play_native().await;
            return;
        };

        if let Err(e) = self.attach_adaptive(factory).await {
            warn!("preview {}: adaptive decoder failed: {}", self.entity_id, e);
            if let Some(mut decoder) = self.decoder.take() {
                decoder.destroy().await;
            }
            self.surface.reset();
            self.play_native().await;
        }
    }

    async fn resolve_factory(&mut self) -> Option<Arc<dyn DecoderFactory>> {
        let library = self.library.clone()?;
        if let Some(factory) = library.available() {
            return Some(factory);
        }
        self.acquired = true;
        match library.acquire().await {
            Ok(factory) => Some(factory),
            Err(e) => {
                debug!(
                    "preview {}: {}, falling back to native playback",
                    self.entity_id, e
                );
                None
            }
        }
    }

    async fn attach_adaptive(
        &mut self,
        factory: Arc<dyn DecoderFactory>,
    ) -> Result<(), MediaError> {
        let decoder = self.decoder.insert(factory.construct(&self.options));
        decoder.load_source(&self.source).await?;
        decoder.attach_media(&mut self.surface).await?;
        info!("preview {}: adaptive playback of {}", self.entity_id, self.source);
        self.transition(SessionState::Attached(PlaybackStrategy::Adaptive))
            .await;
        self.start_playback().await;
        Ok(())
    }

    async fn play_native(&mut self) {
        match self.surface.bind_source(&self.source) {
            Ok(()) => {
                info!("preview {}: native playback of {}", self.entity_id, self.source);
                self.transition(SessionState::Attached(PlaybackStrategy::Native))
                    .await;
                self.start_playback().await;
            }
            Err(e) => {
                warn!("preview {}: cannot play {}: {}", self.entity_id, self.source, e);
                self.transition(SessionState::Failed).await;
            }
        }
    }

    /// Autoplay refusals are expected and never surface as errors.
    async fn start_playback(&mut self) {
        match self.surface.play().await {
            Ok(()) => {}
            Err(MediaError::AutoplayBlocked) => {
                debug!("preview {}: autoplay blocked", self.entity_id)
            }
            Err(e) => debug!("preview {}: play failed: {}", self.entity_id, e),
        }
        self.publish().await;
    }

    /// Release the decoder and reset the surface.  Safe to call repeatedly.
    pub async fn teardown(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            debug!("preview {}: destroying decoder", self.entity_id);
            decoder.destroy().await;
        }
        if self.acquired {
            if let Some(library) = &self.library {
                library.unload();
            }
            self.acquired = false;
        }
        self.surface.reset();
        if self.state != SessionState::Idle {
            self.transition(SessionState::Idle).await;
        }
    }

    pub async fn toggle_fullscreen(&mut self) {
        let result = if self.surface.is_fullscreen() {
            self.surface.exit_fullscreen().await
        } else {
            self.surface.request_fullscreen().await
        };
        if let Err(e) = result {
            debug!("preview {}: fullscreen toggle: {}", self.entity_id, e);
        }
        self.publish().await;
    }

    async fn transition(&mut self, next: SessionState) {
        debug!("preview {}: {:?} → {:?}", self.entity_id, self.state, next);
        self.state = next;
        self.publish().await;
    }

    async fn publish(&mut self) {
        let preview = self.preview();
        if let Some(feed) = &self.updates {
            let _ = feed
                .tx
                .send(DashboardEvent::PreviewChanged {
                    entity_id: self.entity_id.clone(),
                    session_id: feed.session_id,
                    preview,
                })
                .await;
        }
    }
}

// ── session actor ─────────────────────────────────────────────────────────────

#[derive(Debug)]
enum SessionCommand {
    SetSource(String),
    ToggleFullscreen,
    Shutdown,
}

/// Handle to a session running as its own task.  Sending never blocks the
/// caller.
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
    session_id: u64,
    source: String,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn spawn<S: PlaybackSurface + 'static>(session: MediaSession<S>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = session.session_id().unwrap_or_default();
        let task = tokio::spawn(run_session(session, rx));
        Self {
            tx,
            session_id,
            source: String::new(),
            task,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// The source most recently requested.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn set_source(&mut self, source: String) {
        self.source = source.clone();
        let _ = self.tx.send(SessionCommand::SetSource(source));
    }

    pub fn toggle_fullscreen(&self) {
        let _ = self.tx.send(SessionCommand::ToggleFullscreen);
    }

    /// Ask the session to tear down and exit, without waiting.
    pub fn close(&self) {
        let _ = self.tx.send(SessionCommand::Shutdown);
    }

    /// Tear the session down and wait until it has released its decoder.
    pub async fn join(self) {
        self.close();
        let _ = self.task.await;
    }
}

/// A new source interrupts an attach that is still resolving.  Fullscreen
/// toggles received meanwhile are applied once the attach settles.
async fn run_session<S: PlaybackSurface + 'static>(
    mut session: MediaSession<S>,
    mut rx: mpsc::UnboundedReceiver<SessionCommand>,
) {
    let mut pending: VecDeque<SessionCommand> = VecDeque::new();

    loop {
        let cmd = match pending.pop_front() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };

        match cmd {
            SessionCommand::SetSource(source) => {
                let attach = session.set_source(&source);
                tokio::pin!(attach);
                loop {
                    tokio::select! {
                        _ = &mut attach => break,
                        next = rx.recv() => match next {
                            Some(SessionCommand::ToggleFullscreen) => {
                                pending.push_back(SessionCommand::ToggleFullscreen);
                            }
                            Some(other) => {
                                debug!("preview: attach of {} interrupted", source);
                                pending.push_back(other);
                                break;
                            }
                            None => {
                                pending.push_back(SessionCommand::Shutdown);
                                break;
                            }
                        },
                    }
                }
            }
            SessionCommand::ToggleFullscreen => session.toggle_fullscreen().await,
            SessionCommand::Shutdown => break,
        }
    }

    session.teardown().await;
}

#[cfg(test)]
mod tests {
    use super::surface::PreviewSurface;
    use super::*;
    use analyzer_proto::config::PreviewConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Shared record of what the fake library and its decoders were asked to do.
    #[derive(Default)]
    struct Journal {
        ops: Mutex<Vec<String>>,
        live: AtomicUsize,
        max_live: AtomicUsize,
    }

    impl Journal {
        fn push(&self, op: impl Into<String>) {
            self.ops.lock().unwrap().push(op.into());
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }
    }

    struct FakeDecoder {
        journal: Arc<Journal>,
        fail_load: bool,
        alive: bool,
    }

    #[async_trait]
    impl AdaptiveDecoder for FakeDecoder {
        async fn load_source(&mut self, url: &str) -> Result<(), MediaError> {
            self.journal.push(format!("load {url}"));
            if self.fail_load {
                return Err(MediaError::Decoder("manifest rejected".into()));
            }
            Ok(())
        }

        async fn attach_media(
            &mut self,
            surface: &mut dyn PlaybackSurface,
        ) -> Result<(), MediaError> {
            self.journal.push("attach");
            surface.attach_decoder("fake");
            Ok(())
        }

        async fn destroy(&mut self) {
            self.journal.push("destroy");
            if self.alive {
                self.alive = false;
                self.journal.live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    struct FakeFactory {
        journal: Arc<Journal>,
        fail_load: bool,
    }

    impl DecoderFactory for FakeFactory {
        fn construct(&self, _options: &BufferOptions) -> Box<dyn AdaptiveDecoder> {
            self.journal.push("construct");
            let live = self.journal.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.journal.max_live.fetch_max(live, Ordering::SeqCst);
            Box::new(FakeDecoder {
                journal: self.journal.clone(),
                fail_load: self.fail_load,
                alive: true,
            })
        }
    }

    struct FakeLibrary {
        journal: Arc<Journal>,
        preloaded: bool,
        acquire_ok: bool,
        acquire_delay: Duration,
        fail_load: bool,
    }

    impl FakeLibrary {
        fn new(journal: &Arc<Journal>) -> Self {
            Self {
                journal: journal.clone(),
                preloaded: true,
                acquire_ok: true,
                acquire_delay: Duration::ZERO,
                fail_load: false,
            }
        }

        fn factory(&self) -> Arc<dyn DecoderFactory> {
            Arc::new(FakeFactory {
                journal: self.journal.clone(),
                fail_load: self.fail_load,
            })
        }
    }

    #[async_trait]
    impl DecoderLibrary for FakeLibrary {
        fn available(&self) -> Option<Arc<dyn DecoderFactory>> {
            self.preloaded.then(|| self.factory())
        }

        async fn acquire(&self) -> Result<Arc<dyn DecoderFactory>, MediaError> {
            self.journal.push("acquire");
            tokio::time::sleep(self.acquire_delay).await;
            if self.acquire_ok {
                Ok(self.factory())
            } else {
                Err(MediaError::LibraryUnavailable("no decoder here".into()))
            }
        }

        fn unload(&self) {
            self.journal.push("unload");
        }
    }

    fn options() -> BufferOptions {
        BufferOptions {
            max_buffer_secs: 6,
            max_max_buffer_secs: 12,
        }
    }

    fn session(
        library: Option<FakeLibrary>,
        preview: &PreviewConfig,
    ) -> MediaSession<PreviewSurface> {
        MediaSession::new(
            EntityId::from(1),
            PreviewSurface::new(preview),
            library.map(|l| Arc::new(l) as Arc<dyn DecoderLibrary>),
            options(),
            None,
        )
    }

    #[test]
    fn test_adaptive_source_detection() {
        assert!(is_adaptive_source("http://x/live/cam1.m3u8"));
        assert!(is_adaptive_source("http://x/live/CAM1.M3U8?token=abc"));
        assert!(!is_adaptive_source("http://x/live/cam1.mp4"));
        assert!(!is_adaptive_source("http://x/cam1.m3u8.bak"));
        assert!(!is_adaptive_source(""));
    }

    #[tokio::test]
    async fn test_adaptive_source_with_available_library() {
        let journal = Arc::new(Journal::default());
        let mut s = session(Some(FakeLibrary::new(&journal)), &PreviewConfig::default());

        s.set_source("http://x/cam1.m3u8").await;

        assert_eq!(s.state(), SessionState::Attached(PlaybackStrategy::Adaptive));
        assert_eq!(journal.ops(), vec!["construct", "load http://x/cam1.m3u8", "attach"]);
        assert_eq!(s.surface().decoder(), Some("fake"));
        assert!(s.surface().is_playing());
    }

    #[tokio::test]
    async fn test_acquire_failure_falls_back_to_native() {
        let journal = Arc::new(Journal::default());
        let mut library = FakeLibrary::new(&journal);
        library.preloaded = false;
        library.acquire_ok = false;
        let mut s = session(Some(library), &PreviewConfig::default());

        s.set_source("http://x/cam1.m3u8").await;

        assert_eq!(s.state(), SessionState::Attached(PlaybackStrategy::Native));
        assert_eq!(s.surface().source(), Some("http://x/cam1.m3u8"));
        assert_eq!(journal.ops(), vec!["acquire"]);

        s.teardown().await;
        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(journal.ops(), vec!["acquire", "unload"]);
    }

    #[tokio::test]
    async fn test_acquired_library_is_used() {
        let journal = Arc::new(Journal::default());
        let mut library = FakeLibrary::new(&journal);
        library.preloaded = false;
        let mut s = session(Some(library), &PreviewConfig::default());

        s.set_source("http://x/cam1.m3u8").await;

        assert_eq!(s.state(), SessionState::Attached(PlaybackStrategy::Adaptive));
        assert_eq!(journal.ops()[0], "acquire");
    }

    #[tokio::test]
    async fn test_non_adaptive_source_never_touches_library() {
        let journal = Arc::new(Journal::default());
        let mut s = session(Some(FakeLibrary::new(&journal)), &PreviewConfig::default());

        s.set_source("http://x/cam1.mp4").await;

        assert_eq!(s.state(), SessionState::Attached(PlaybackStrategy::Native));
        assert!(journal.ops().is_empty());
    }

    #[tokio::test]
    async fn test_decoder_error_falls_back_to_native() {
        let journal = Arc::new(Journal::default());
        let mut library = FakeLibrary::new(&journal);
        library.fail_load = true;
        let mut s = session(Some(library), &PreviewConfig::default());

        s.set_source("http://x/cam1.m3u8").await;

        assert_eq!(s.state(), SessionState::Attached(PlaybackStrategy::Native));
        assert_eq!(
            journal.ops(),
            vec!["construct", "load http://x/cam1.m3u8", "destroy"]
        );
        assert_eq!(journal.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_source_change_destroys_previous_decoder_first() {
        let journal = Arc::new(Journal::default());
        let mut s = session(Some(FakeLibrary::new(&journal)), &PreviewConfig::default());

        s.set_source("http://x/a.m3u8").await;
        s.set_source("http://x/b.m3u8").await;

        let ops = journal.ops();
        let destroy = ops.iter().position(|op| op == "destroy").unwrap();
        let second = ops.iter().rposition(|op| op == "construct").unwrap();
        assert!(destroy < second);
        assert_eq!(journal.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(journal.live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_source_leaves_session_idle() {
        let journal = Arc::new(Journal::default());
        let mut s = session(Some(FakeLibrary::new(&journal)), &PreviewConfig::default());

        s.set_source("http://x/a.m3u8").await;
        s.set_source("  ").await;

        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(s.surface().source(), None);
        assert_eq!(journal.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_autoplay_refusal_is_swallowed() {
        let preview = PreviewConfig {
            autoplay: false,
            ..PreviewConfig::default()
        };
        let mut s = session(None, &preview);

        s.set_source("http://x/cam1.mp4").await;

        assert_eq!(s.state(), SessionState::Attached(PlaybackStrategy::Native));
        assert!(!s.surface().is_playing());
    }

    #[tokio::test]
    async fn test_fullscreen_toggle_and_refusal() {
        let mut s = session(None, &PreviewConfig::default());
        s.toggle_fullscreen().await;
        assert!(s.preview().fullscreen);
        s.toggle_fullscreen().await;
        assert!(!s.preview().fullscreen);

        let preview = PreviewConfig {
            allow_fullscreen: false,
            ..PreviewConfig::default()
        };
        let mut s = session(None, &preview);
        s.toggle_fullscreen().await;
        assert!(!s.preview().fullscreen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_source_interrupts_resolving_attach() {
        let journal = Arc::new(Journal::default());
        let mut library = FakeLibrary::new(&journal);
        library.preloaded = false;
        library.acquire_delay = Duration::from_secs(1);

        let (tx, mut rx) = mpsc::channel(64);
        let s = MediaSession::new(
            EntityId::from(1),
            PreviewSurface::new(&PreviewConfig::default()),
            Some(Arc::new(library) as Arc<dyn DecoderLibrary>),
            options(),
            Some(PreviewFeed { session_id: 7, tx }),
        );
        let mut handle = SessionHandle::spawn(s);
        assert_eq!(handle.session_id(), 7);

        handle.set_source("http://x/a.m3u8".into());
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.toggle_fullscreen();
        handle.set_source("http://x/b.mp4".into());
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.join().await;

        let mut last_attached = None;
        let mut saw_fullscreen = false;
        while let Ok(DashboardEvent::PreviewChanged {
            session_id,
            preview,
            ..
        }) = rx.try_recv()
        {
            assert_eq!(session_id, 7);
            if let SessionState::Attached(strategy) = preview.session {
                last_attached = Some((strategy, preview.source.clone()));
            }
            saw_fullscreen |= preview.fullscreen;
        }

        assert_eq!(
            last_attached,
            Some((PlaybackStrategy::Native, "http://x/b.mp4".to_string()))
        );
        assert!(saw_fullscreen);
        // the acquire was abandoned before any decoder was built
        assert!(!journal.ops().contains(&"construct".to_string()));
    }
}
