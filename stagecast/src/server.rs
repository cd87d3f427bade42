//! Server lifecycle management
//!
//! Wires the session manager and the media orchestrators together, serves the
//! HTTP/WebSocket control channel and tears everything down in order on a
//! shutdown signal:
//! - stop accepting and close control connections
//! - stop relays, then recordings (each recording finalizes)
//! - cancel pending grace-period sweeps
//! - stop the persistence sync once the last events are applied

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use stagecast_core::{
    encoder::EncoderLauncher,
    recording::RecordingOrchestrator,
    relay::{LiveSourceProbe, RelayOrchestrator},
    store::{spawn_persistence_sync, MemoryRecordingStore, RecordingStore},
    Config, MediaEvent,
};
use stagecast_sfu::{InProcessEngine, SessionManager};

use crate::websocket::websocket_handler;

/// Buffered media events per subscriber
const MEDIA_EVENT_CAPACITY: usize = 256;

/// Shared state handed to every control connection
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub recordings: Arc<RecordingOrchestrator>,
    pub relays: Arc<RelayOrchestrator>,
    pub store: Arc<dyn RecordingStore>,
    pub media_events: broadcast::Sender<MediaEvent>,
    pub max_message_bytes: usize,
    /// Fires when the server starts shutting down
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: &Config,
        recording_launcher: Arc<dyn EncoderLauncher>,
        relay_launcher: Arc<dyn EncoderLauncher>,
    ) -> Self {
        let engine = Arc::new(InProcessEngine::new(
            config.sfu.announced_ip.clone(),
            config.sfu.rtc_min_port,
            config.sfu.rtc_max_port,
        ));
        let sessions = SessionManager::new(config.sfu.clone(), engine);

        let (media_events, _) = broadcast::channel(MEDIA_EVENT_CAPACITY);
        let store: Arc<dyn RecordingStore> = Arc::new(MemoryRecordingStore::new());

        let recordings = RecordingOrchestrator::new(
            config.recording.clone(),
            recording_launcher,
            Arc::clone(&store),
            media_events.clone(),
        );
        let probe: Arc<dyn LiveSourceProbe> = sessions.clone();
        let relays = RelayOrchestrator::new(
            config.relay.clone(),
            relay_launcher,
            probe,
            media_events.clone(),
        );

        Self {
            sessions,
            recordings,
            relays,
            store,
            media_events,
            max_message_bytes: config.server.max_message_bytes,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Build the HTTP router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Basic health check (always returns ok if the server is running)
async fn health_check() -> &'static str {
    "ok"
}

pub struct StagecastServer {
    config: Config,
    state: AppState,
}

impl StagecastServer {
    pub const fn new(config: Config, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serve until a shutdown signal, then shut down gracefully
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting Stagecast server...");

        let sync_shutdown = CancellationToken::new();
        let sync_handle = spawn_persistence_sync(
            Arc::clone(&self.state.store),
            self.state.media_events.subscribe(),
            sync_shutdown.clone(),
        );

        let http_address = self.config.http_address();
        let http_addr: SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;
        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        let connections = self.state.shutdown.clone();
        let graceful = async move {
            shutdown_signal().await;
            info!("Shutdown signal received, starting graceful shutdown...");
            connections.cancel();
        };

        if let Err(e) = axum::serve(listener, create_router(self.state.clone()))
            .with_graceful_shutdown(graceful)
            .await
        {
            error!("HTTP server error: {}", e);
        }
        // Also covers a server error: control connections must not outlive it
        self.state.shutdown.cancel();

        self.shutdown().await;

        sync_shutdown.cancel();
        if let Err(e) = sync_handle.await {
            error!("Persistence sync task failed: {}", e);
        }
        info!("Stagecast server shut down complete");
        Ok(())
    }

    /// Stop media jobs and pending timers
    async fn shutdown(&self) {
        info!("Shutting down Stagecast server...");

        let relays = self.state.relays.active_count();
        if relays > 0 {
            info!("Stopping {} relay(s)...", relays);
        }
        self.state.relays.stop_all().await;

        let recordings = self.state.recordings.active_count();
        if recordings > 0 {
            info!("Finalizing {} recording(s)...", recordings);
        }
        self.state.recordings.stop_all().await;

        let stats = self.state.sessions.stats();
        info!(
            connections = stats.connections,
            pending_sweeps = stats.pending_sweeps,
            "Shutting down SFU session manager"
        );
        self.state.sessions.shutdown();
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
