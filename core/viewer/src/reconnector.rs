//! Push-channel reconnector for the viewer.
//!
//! Keeps one socket to the backend open. After a disconnect it retries on a
//! short interval a bounded number of times, then drops to `FAILED` and keeps
//! trying on a long interval forever. A manual reconnect starts over with a
//! fresh budget.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use diagrammer_core::fsm::{self, Behavior, Dispatcher, StateMachine, TransitionRecord, TransitionTable};
use diagrammer_core::{LifecycleError, Result, SocketConfig, TimerSlot};
use diagrammer_protocol::{ClientMessage, ServerMessage};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketState::Disconnected => "DISCONNECTED",
            SocketState::Connecting => "CONNECTING",
            SocketState::Connected => "CONNECTED",
            SocketState::Reconnecting => "RECONNECTING",
            SocketState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEvent {
    Connect,
    ConnectionSuccess,
    ConnectionError,
    ConnectionClosed,
    Reconnect,
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketEvent::Connect => "CONNECT",
            SocketEvent::ConnectionSuccess => "CONNECTION_SUCCESS",
            SocketEvent::ConnectionError => "CONNECTION_ERROR",
            SocketEvent::ConnectionClosed => "CONNECTION_CLOSED",
            SocketEvent::Reconnect => "RECONNECT",
        };
        f.write_str(name)
    }
}

pub fn transition_table() -> TransitionTable<SocketState, SocketEvent> {
    use SocketEvent as E;
    use SocketState as S;

    TransitionTable::new()
        .on(S::Disconnected, E::Connect, S::Connecting)
        .on(S::Connecting, E::ConnectionSuccess, S::Connected)
        .on(S::Connecting, E::ConnectionError, S::Reconnecting)
        .on(S::Connecting, E::ConnectionClosed, S::Reconnecting)
        .on(S::Connected, E::ConnectionClosed, S::Reconnecting)
        .on(S::Connected, E::ConnectionError, S::Reconnecting)
        .on(S::Connected, E::Connect, S::Connecting)
        // Redirected to FAILED by the retry budget, see `resolve`.
        .on(S::Reconnecting, E::Reconnect, S::Connecting)
        .on(S::Reconnecting, E::ConnectionSuccess, S::Connected)
        .on(S::Reconnecting, E::Connect, S::Connecting)
        .on(S::Failed, E::Reconnect, S::Connecting)
        .on(S::Failed, E::Connect, S::Connecting)
}

/// An open socket, seen as a pair of channels. The inbound side closes when
/// the socket does.
#[derive(Debug)]
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self) -> Result<SocketLink>;
}

type Outbound = Arc<Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>>;

struct Reconnection {
    config: SocketConfig,
    connector: Arc<dyn SocketConnector>,
    dispatcher: Dispatcher<SocketEvent>,
    attempts: u32,
    attempts_tx: watch::Sender<u32>,
    reconnect_timer: TimerSlot,
    // Tracked here rather than through the slot: the timer task is still
    // finishing when its RECONNECT event is processed.
    reconnect_armed: bool,
    pump: TimerSlot,
    outbound: Outbound,
    messages: mpsc::UnboundedSender<ServerMessage>,
}

impl Reconnection {
    fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts;
        self.attempts_tx.send_replace(attempts);
    }

    fn disarm(&mut self) {
        if self.reconnect_timer.cancel() {
            debug!("Pending reconnect cancelled");
        }
        self.reconnect_armed = false;
    }

    fn arm(&mut self, delay: std::time::Duration) {
        if self.reconnect_armed {
            debug!("Reconnect already pending");
            return;
        }
        let dispatcher = self.dispatcher.clone();
        self.reconnect_timer.schedule(delay, async move {
            let _ = dispatcher.dispatch(SocketEvent::Reconnect);
        });
        self.reconnect_armed = true;
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.attempts,
            "Reconnect scheduled"
        );
    }

    fn drop_link(&mut self) {
        self.pump.cancel();
        let mut outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *outbound = None;
    }

    async fn open(&mut self) -> Result<Option<SocketEvent>> {
        self.drop_link();
        let timeout = self.config.connect_timeout();
        let link = match tokio::time::timeout(timeout, self.connector.connect()).await {
            Ok(link) => link?,
            Err(_) => {
                return Err(LifecycleError::Socket(format!(
                    "connect timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        };

        let SocketLink {
            outbound,
            mut inbound,
        } = link;
        *self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(outbound);

        let messages = self.messages.clone();
        let dispatcher = self.dispatcher.clone();
        self.pump.replace(async move {
            while let Some(message) = inbound.recv().await {
                if messages.send(message).is_err() {
                    debug!("Viewer stopped listening for messages");
                }
            }
            info!("Socket closed");
            let _ = dispatcher.dispatch(SocketEvent::ConnectionClosed);
        });
        Ok(Some(SocketEvent::ConnectionSuccess))
    }
}

#[async_trait]
impl Behavior<SocketState, SocketEvent> for Reconnection {
    async fn on_enter(&mut self, state: SocketState) -> Result<Option<SocketEvent>> {
        match state {
            SocketState::Disconnected => Ok(None),
            SocketState::Connecting => self.open().await,
            SocketState::Connected => {
                self.set_attempts(0);
                info!("Socket connected");
                Ok(None)
            }
            SocketState::Reconnecting => {
                self.drop_link();
                if self.attempts >= self.config.max_reconnect_attempts {
                    // A keep-trying attempt failed; go straight back to FAILED.
                    return Ok(Some(SocketEvent::Reconnect));
                }
                self.arm(self.config.reconnect_interval());
                Ok(None)
            }
            SocketState::Failed => {
                self.drop_link();
                warn!(
                    attempts = self.attempts,
                    "Socket reconnect budget spent; retrying on the long interval"
                );
                self.arm(self.config.keep_trying_interval());
                Ok(None)
            }
        }
    }

    fn resolve(&mut self, from: SocketState, event: SocketEvent, to: SocketState) -> SocketState {
        match (from, event) {
            (_, SocketEvent::Connect) => {
                self.disarm();
                self.set_attempts(0);
                to
            }
            (SocketState::Connected, _) if to == SocketState::Reconnecting => {
                self.set_attempts(0);
                to
            }
            (SocketState::Reconnecting, SocketEvent::Reconnect) => {
                self.reconnect_armed = false;
                let max = self.config.max_reconnect_attempts;
                if self.attempts >= max {
                    return SocketState::Failed;
                }
                self.set_attempts(self.attempts + 1);
                if self.attempts >= max {
                    SocketState::Failed
                } else {
                    to
                }
            }
            (SocketState::Failed, SocketEvent::Reconnect) => {
                self.reconnect_armed = false;
                to
            }
            _ if to == SocketState::Connected => {
                self.disarm();
                to
            }
            _ => to,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectorHandle {
    dispatcher: Dispatcher<SocketEvent>,
    state: watch::Receiver<SocketState>,
    attempts: watch::Receiver<u32>,
    outbound: Outbound,
}

impl ReconnectorHandle {
    /// Manual reconnect: fresh budget, immediate attempt.
    pub fn connect(&self) -> Result<()> {
        self.dispatcher.dispatch(SocketEvent::Connect)
    }

    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.borrow()
    }

    /// Returns false when the message was dropped.
    pub fn send(&self, message: ClientMessage) -> bool {
        let state = self.state();
        if state != SocketState::Connected {
            warn!(state = %state, "Socket not connected; message dropped");
            return false;
        }
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match outbound {
            Some(tx) if tx.send(message).is_ok() => true,
            _ => {
                warn!("Socket closing; message dropped");
                false
            }
        }
    }
}

pub struct Reconnector {
    machine: StateMachine<SocketState, SocketEvent, Reconnection>,
}

impl Reconnector {
    pub fn new(
        config: SocketConfig,
        connector: Arc<dyn SocketConnector>,
    ) -> (Self, ReconnectorHandle, mpsc::UnboundedReceiver<ServerMessage>) {
        let (dispatcher, inbox) = fsm::channel();
        let (messages, messages_rx) = mpsc::unbounded_channel();
        let (attempts_tx, attempts_rx) = watch::channel(0);
        let outbound: Outbound = Arc::new(Mutex::new(None));

        let behavior = Reconnection {
            config,
            connector,
            dispatcher: dispatcher.clone(),
            attempts: 0,
            attempts_tx,
            reconnect_timer: TimerSlot::new("socket-reconnect"),
            reconnect_armed: false,
            pump: TimerSlot::new("socket-pump"),
            outbound: Arc::clone(&outbound),
            messages,
        };
        let machine = StateMachine::new(
            "socket",
            transition_table(),
            SocketState::Disconnected,
            behavior,
            inbox,
        )
        .with_error_event(SocketEvent::ConnectionError);

        let handle = ReconnectorHandle {
            dispatcher,
            state: machine.watch(),
            attempts: attempts_rx,
            outbound,
        };
        (Self { machine }, handle, messages_rx)
    }

    pub fn on_transition<F>(&mut self, listener: F)
    where
        F: Fn(&TransitionRecord<SocketState, SocketEvent>) + Send + Sync + 'static,
    {
        self.machine.on_transition(listener);
    }

    pub async fn run(mut self) -> Result<SocketState> {
        self.machine.run().await
    }
}
