use std::sync::Arc;

use diagrammer_core::{DiagramRenderer, HistoryStore};
use diagrammer_protocol::{ServerMessage, StatusReport};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::idle::IdleManager;

const BROADCAST_CAPACITY: usize = 64;

/// Shared handles passed to every route.
#[derive(Clone)]
pub struct AppState {
    pub port: u16,
    pub started: Instant,
    pub idle: Arc<IdleManager>,
    pub renderer: Arc<dyn DiagramRenderer>,
    pub history: Arc<dyn HistoryStore>,
    pub broadcast: broadcast::Sender<ServerMessage>,
}

impl AppState {
    pub fn new(
        port: u16,
        idle: Arc<IdleManager>,
        renderer: Arc<dyn DiagramRenderer>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            port,
            started: Instant::now(),
            idle,
            renderer,
            history,
            broadcast,
        }
    }

    pub fn status(&self) -> StatusReport {
        let idle = self.idle.snapshot();
        StatusReport {
            running: !self.idle.is_shutting_down(),
            mcp_active: idle.mcp_active,
            last_activity_seconds_ago: idle.last_activity_secs,
            seconds_until_shutdown: idle.seconds_until_shutdown,
            uptime_seconds: self.started.elapsed().as_secs(),
            port: self.port,
        }
    }

    /// Pushes a frame to every open socket. No-op without subscribers.
    pub fn publish(&self, message: ServerMessage) {
        let receivers = self.broadcast.send(message).unwrap_or(0);
        tracing::debug!(receivers, "Broadcast frame to sockets");
    }
}
