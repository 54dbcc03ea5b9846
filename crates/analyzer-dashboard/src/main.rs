mod content_cache;
mod core;
mod directory;
mod gateway;
mod http;
mod media;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use analyzer_proto::config::Config;
use analyzer_proto::protocol::Command;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::core::{DashboardCore, DashboardEvent};
use crate::gateway::HttpGateway;
use crate::media::mpv::MpvLibrary;
use crate::media::DecoderLibrary;

/// Forwards WARN and ERROR lines to the core's recent log ring.
struct BroadcastLayer {
    sender: broadcast::Sender<String>,
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // no receivers is fine
        let _ = self.sender.send(message);
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, mut log_rx) = broadcast::channel::<String>(100);

    let data_dir = analyzer_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("dashboard.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer { sender: log_tx })
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "info,analyzer_dashboard=debug,hyper=warn,reqwest=warn",
                )
            }),
        )
        .init();

    eprintln!("va-dashboard log: {}", log_path.display());
    info!("va-dashboard starting…");

    // ── Load config ──────────────────────────────────────────────────────────
    let config = Config::load().unwrap_or_default();
    info!("Config loaded from: {:?}", Config::config_path());

    // ── Event channel (HTTP / timers / tasks → DashboardCore) ────────────────
    let (event_tx, event_rx) = mpsc::channel::<DashboardEvent>(1024);

    let gateway = Arc::new(HttpGateway::new(
        &config.gateway.base_url,
        Duration::from_secs(config.gateway.request_timeout_secs),
    )?);
    let library: Option<Arc<dyn DecoderLibrary>> = if config.decoder.enabled {
        Some(Arc::new(MpvLibrary::new(config.decoder.mpv_path.clone())))
    } else {
        None
    };

    let dashboard_core = DashboardCore::new(config.clone(), gateway, library, event_tx.clone());

    // ── HTTP server ──────────────────────────────────────────────────────────
    if config.http.enabled {
        http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            dashboard_core.subscribe(),
            event_tx.clone(),
        );
    }

    // ── Log lines into the core ──────────────────────────────────────────────
    let log_event_tx = event_tx.clone();
    tokio::spawn(async move {
        loop {
            match log_rx.recv().await {
                Ok(line) => {
                    if log_event_tx.send(DashboardEvent::Log(line)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // ── Shutdown on Ctrl-C ───────────────────────────────────────────────────
    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            let _ = shutdown_tx.send(DashboardEvent::Shutdown).await;
        }
    });

    // First load; later ones come from the polling timer or the API.
    event_tx
        .send(DashboardEvent::Command(Command::Refresh))
        .await?;
    drop(event_tx);

    dashboard_core.run(event_rx).await
}
