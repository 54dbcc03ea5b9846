//! mpv-backed adaptive decoder, driven over JSON IPC.
//!
//! Architecture:
//!
//! ```text
//!   MpvDecoder::attach_media()
//!         │
//!         └── MpvDriver::spawn_and_connect()
//!                 ├── writer_task   ← receives MpvRequest via mpsc, serialises → socket
//!                 └── reader_task   ← reads JSON lines from socket
//!                                        ├── response (has request_id) → matched oneshot::Sender
//!                                        └── event                     → event_tx channel
//! ```
//!
//! Every decoder instance owns its own mpv process and IPC endpoint, so any
//! number of previews can run side by side.
//!
//! Platform notes:
//! - Unix:   Unix domain sockets
//! - Windows: Named pipes  \\.\pipe\<name>
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use analyzer_proto::platform;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use super::{
    AdaptiveDecoder, BufferOptions, DecoderFactory, DecoderLibrary, MediaError, PlaybackSurface,
};

// ── global counters ───────────────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

// ── library ───────────────────────────────────────────────────────────────────

/// Locates the mpv binary.  A configured path makes the decoder available up
/// front; otherwise it is discovered and probed on first use.
pub struct MpvLibrary {
    factory: OnceLock<Arc<MpvFactory>>,
}

impl MpvLibrary {
    pub fn new(configured: Option<PathBuf>) -> Self {
        let factory = OnceLock::new();
        match configured {
            Some(path) if path.exists() => {
                info!("mpv: using configured binary {:?}", path);
                let _ = factory.set(Arc::new(MpvFactory { binary: path }));
            }
            Some(path) => warn!("mpv: configured binary {:?} does not exist", path),
            None => {}
        }
        Self { factory }
    }
}

#[async_trait]
impl DecoderLibrary for MpvLibrary {
    fn available(&self) -> Option<Arc<dyn DecoderFactory>> {
        self.factory
            .get()
            .map(|f| f.clone() as Arc<dyn DecoderFactory>)
    }

    async fn acquire(&self) -> Result<Arc<dyn DecoderFactory>, MediaError> {
        if let Some(factory) = self.available() {
            return Ok(factory);
        }

        let binary = tokio::task::spawn_blocking(platform::find_mpv_binary)
            .await
            .map_err(|e| MediaError::LibraryUnavailable(e.to_string()))?
            .ok_or_else(|| MediaError::LibraryUnavailable("mpv binary not found".into()))?;

        let probe = tokio::process::Command::new(&binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(Duration::from_secs(5), probe).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => {
                return Err(MediaError::LibraryUnavailable(format!(
                    "{:?} --version exited with {}",
                    binary, status
                )))
            }
            Ok(Err(e)) => return Err(MediaError::LibraryUnavailable(e.to_string())),
            Err(_) => {
                return Err(MediaError::LibraryUnavailable(format!(
                    "{:?} --version timed out",
                    binary
                )))
            }
        }

        info!("mpv: found {:?}", binary);
        let factory: Arc<dyn DecoderFactory> = self
            .factory
            .get_or_init(|| Arc::new(MpvFactory { binary }))
            .clone();
        Ok(factory)
    }

    fn unload(&self) {
        // discovery only runs a short-lived probe, which is reaped on drop
        debug!("mpv: nothing to unload");
    }
}

pub struct MpvFactory {
    binary: PathBuf,
}

impl DecoderFactory for MpvFactory {
    fn construct(&self, options: &BufferOptions) -> Box<dyn AdaptiveDecoder> {
        Box::new(MpvDecoder {
            driver: MpvDriver::new(self.binary.clone(), *options),
            handle: None,
            source: None,
            events: None,
        })
    }
}

// ── decoder ───────────────────────────────────────────────────────────────────

pub struct MpvDecoder {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    source: Option<String>,
    events: Option<JoinHandle<()>>,
}

#[async_trait]
impl AdaptiveDecoder for MpvDecoder {
    async fn load_source(&mut self, url: &str) -> Result<(), MediaError> {
        self.source = Some(url.to_string());
        if let Some(handle) = &self.handle {
            handle.load(url).await?;
        }
        Ok(())
    }

    async fn attach_media(&mut self, surface: &mut dyn PlaybackSurface) -> Result<(), MediaError> {
        let (event_tx, event_rx) = mpsc::channel(64);
        let handle = self.driver.spawn_and_connect(event_tx).await?;
        self.events = Some(tokio::spawn(log_events(
            self.driver.socket_name.clone(),
            event_rx,
        )));
        if let Some(url) = &self.source {
            handle.load(url).await?;
        }
        surface.attach_decoder("mpv");
        self.handle = Some(handle);
        Ok(())
    }

    async fn destroy(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.quit().await;
        }
        self.driver.kill().await;
        if let Some(events) = self.events.take() {
            events.abort();
        }
    }
}

async fn log_events(socket_name: String, mut rx: mpsc::Receiver<MpvEvent>) {
    while let Some(evt) = rx.recv().await {
        match evt.event_name() {
            Some("end-file") => {
                let reason = evt.raw.get("reason").and_then(Value::as_str).unwrap_or("?");
                if reason == "error" {
                    warn!("mpv {}: playback ended with error", socket_name);
                } else {
                    debug!("mpv {}: end-file ({})", socket_name, reason);
                }
            }
            Some(name) => debug!("mpv {}: {}", socket_name, name),
            None => {}
        }
    }
}

// ── internal channel types ────────────────────────────────────────────────────

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn load(&self, url: &str) -> anyhow::Result<()> {
        debug!("mpv: loadfile {}", url);
        self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(())
    }

    pub async fn quit(&self) -> anyhow::Result<()> {
        self.send(json!(["quit"])).await?;
        Ok(())
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns one mpv child process and its IPC connection.
pub struct MpvDriver {
    pub socket_name: String,
    binary: PathBuf,
    options: BufferOptions,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new(binary: PathBuf, options: BufferOptions) -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        Self {
            socket_name: platform::decoder_socket_name(instance),
            binary,
            options,
            process: None,
        }
    }

    /// Kill the process if running.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
        #[cfg(unix)]
        {
            let _ = tokio::fs::remove_file(&self.socket_name).await;
        }
    }

    fn command(&self) -> tokio::process::Command {
        let stderr = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(platform::data_dir().join("decoder-stderr.log"))
            .map(Stdio::from)
            .unwrap_or_else(|_| Stdio::null());

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("--idle=yes")
            .arg(platform::decoder_socket_arg(&self.socket_name))
            .arg("--quiet")
            .arg("--mute=yes")
            .arg("--force-window=yes")
            .arg("--cache=yes")
            .arg(format!("--demuxer-readahead-secs={}", self.options.max_buffer_secs))
            .arg(format!("--cache-secs={}", self.options.max_max_buffer_secs))
            .stdout(Stdio::null())
            .stderr(stderr)
            .kill_on_drop(true);
        cmd
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let socket_path = PathBuf::from(&self.socket_name);
        let child = self.command().spawn()?;
        info!("mpv: spawned pid {:?} on {}", child.id(), self.socket_name);
        self.process = Some(child);

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        debug!("mpv: connected to {}", self.socket_name);
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let child = self.command().spawn()?;
        info!("mpv: spawned pid {:?} on {}", child.id(), self.socket_name);
        self.process = Some(child);

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                debug!("mpv: connected to {}", pipe_path);
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                            debug!("mpv reader: req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<PendingRequest>,
    pending: PendingMap,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}
