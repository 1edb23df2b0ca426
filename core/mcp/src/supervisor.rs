//! Connection supervisor.
//!
//! Makes sure this MCP client is attached to exactly one local backend:
//! probe the port, start the backend when nobody answers, wait for it to come
//! up, then keep it alive with a heartbeat. Lost heartbeats trigger a
//! reconnect; repeated failures go through `ERROR` with a bounded retry
//! budget, after which the supervisor gives up and the process exits.
//!
//! ```text
//! INIT ─START→ CHECKING_SERVER ─ok→ CONNECTED ⇄ RECONNECTING
//!                   │ fail                ↑          │ fail
//!                   ↓                     │          ↓
//!            STARTING_SERVER → WAITING_FOR_SERVER → ERROR ─START→ CHECKING_SERVER
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use diagrammer_core::fsm::{self, Behavior, Dispatcher, StateMachine, TransitionRecord, TransitionTable};
use diagrammer_core::{LifecycleError, Result, SupervisorConfig, TimerSlot};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::BackendProbe;
use crate::launcher::Launcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    Init,
    CheckingServer,
    StartingServer,
    WaitingForServer,
    Connected,
    Reconnecting,
    Error,
    Shutdown,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Init => "INIT",
            SupervisorState::CheckingServer => "CHECKING_SERVER",
            SupervisorState::StartingServer => "STARTING_SERVER",
            SupervisorState::WaitingForServer => "WAITING_FOR_SERVER",
            SupervisorState::Connected => "CONNECTED",
            SupervisorState::Reconnecting => "RECONNECTING",
            SupervisorState::Error => "ERROR",
            SupervisorState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorEvent {
    Start,
    ServerCheckComplete,
    ServerStarted,
    ConnectionEstablished,
    ErrorOccurred,
    KeepaliveFailed,
    ShutdownRequested,
}

impl fmt::Display for SupervisorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorEvent::Start => "START",
            SupervisorEvent::ServerCheckComplete => "SERVER_CHECK_COMPLETE",
            SupervisorEvent::ServerStarted => "SERVER_STARTED",
            SupervisorEvent::ConnectionEstablished => "CONNECTION_ESTABLISHED",
            SupervisorEvent::ErrorOccurred => "ERROR_OCCURRED",
            SupervisorEvent::KeepaliveFailed => "KEEPALIVE_FAILED",
            SupervisorEvent::ShutdownRequested => "SHUTDOWN_REQUESTED",
        };
        f.write_str(name)
    }
}

pub fn transition_table() -> TransitionTable<SupervisorState, SupervisorEvent> {
    use SupervisorEvent as E;
    use SupervisorState as S;

    TransitionTable::new()
        .on(S::Init, E::Start, S::CheckingServer)
        .on(S::CheckingServer, E::ServerCheckComplete, S::Connected)
        .on(S::CheckingServer, E::ErrorOccurred, S::StartingServer)
        .on(S::StartingServer, E::ServerStarted, S::WaitingForServer)
        .on(S::StartingServer, E::ErrorOccurred, S::Error)
        .on(S::WaitingForServer, E::ConnectionEstablished, S::Connected)
        .on(S::WaitingForServer, E::ErrorOccurred, S::Error)
        .on(S::Connected, E::KeepaliveFailed, S::Reconnecting)
        .on(S::Reconnecting, E::ConnectionEstablished, S::Connected)
        .on(S::Reconnecting, E::ErrorOccurred, S::Error)
        .on(S::Error, E::Start, S::CheckingServer)
        .with_shutdown(E::ShutdownRequested, S::Shutdown)
}

/// Context visible to tools and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSnapshot {
    pub state: SupervisorState,
    pub port: u16,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
}

struct Supervision {
    config: SupervisorConfig,
    snapshot: SupervisorSnapshot,
    snapshot_tx: watch::Sender<SupervisorSnapshot>,
    probe: Arc<dyn BackendProbe>,
    launcher: Arc<dyn Launcher>,
    dispatcher: Dispatcher<SupervisorEvent>,
    heartbeat: TimerSlot,
}

impl Supervision {
    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot.clone());
    }

    async fn check_server(&self) -> Result<Option<SupervisorEvent>> {
        let status = self.probe.status().await?;
        info!(port = status.port, uptime = status.uptime_seconds, "Backend already running");
        Ok(Some(SupervisorEvent::ServerCheckComplete))
    }

    fn start_server(&self) -> Result<Option<SupervisorEvent>> {
        self.launcher.launch(self.snapshot.port)?;
        Ok(Some(SupervisorEvent::ServerStarted))
    }

    async fn wait_for_server(&self) -> Result<Option<SupervisorEvent>> {
        let attempts = self.config.readiness_max_attempts;
        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.readiness_poll_interval()).await;
            match self.probe.status().await {
                Ok(_) => {
                    info!(attempt, "Backend is ready");
                    return Ok(Some(SupervisorEvent::ConnectionEstablished));
                }
                Err(err) => debug!(attempt, error = %err, "Backend not ready yet"),
            }
        }
        Err(LifecycleError::ReadinessTimeout {
            port: self.snapshot.port,
            attempts,
        })
    }

    fn start_heartbeat(&self) {
        let probe = Arc::clone(&self.probe);
        let dispatcher = self.dispatcher.clone();
        let period = self.config.keepalive_interval();

        self.heartbeat.replace(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = probe.keepalive().await {
                    warn!(error = %err, "Keepalive failed");
                    if let Err(err) = dispatcher.dispatch(SupervisorEvent::KeepaliveFailed) {
                        debug!(error = %err, "Supervisor gone; heartbeat stops");
                    }
                    break;
                }
            }
        });
    }

    async fn reconnect(&self) -> Result<Option<SupervisorEvent>> {
        self.heartbeat.cancel();
        tokio::time::sleep(self.config.reconnect_delay()).await;
        self.probe.status().await?;
        info!("Backend answered after keepalive loss");
        Ok(Some(SupervisorEvent::ConnectionEstablished))
    }

    async fn retry(&mut self) -> Result<Option<SupervisorEvent>> {
        let max = self.snapshot.max_retries;
        if self.snapshot.retry_count >= max {
            return Err(LifecycleError::RetriesExhausted {
                attempts: self.snapshot.retry_count,
            });
        }
        self.snapshot.retry_count += 1;
        self.publish();
        info!(
            attempt = self.snapshot.retry_count,
            max_retries = max,
            backoff_ms = self.config.retry_backoff_ms,
            "Retrying backend connection"
        );
        tokio::time::sleep(self.config.retry_backoff()).await;
        Ok(Some(SupervisorEvent::Start))
    }
}

#[async_trait]
impl Behavior<SupervisorState, SupervisorEvent> for Supervision {
    async fn on_enter(&mut self, state: SupervisorState) -> Result<Option<SupervisorEvent>> {
        self.snapshot.state = state;
        self.publish();

        match state {
            SupervisorState::Init => Ok(None),
            SupervisorState::CheckingServer => self.check_server().await,
            SupervisorState::StartingServer => self.start_server(),
            SupervisorState::WaitingForServer => self.wait_for_server().await,
            SupervisorState::Connected => {
                self.snapshot.retry_count = 0;
                self.snapshot.last_error = None;
                self.publish();
                self.start_heartbeat();
                Ok(None)
            }
            SupervisorState::Reconnecting => self.reconnect().await,
            SupervisorState::Error => self.retry().await,
            SupervisorState::Shutdown => {
                self.heartbeat.cancel();
                info!("Supervisor shut down");
                Ok(None)
            }
        }
    }

    fn on_error(&mut self, _state: SupervisorState, error: &LifecycleError) {
        self.snapshot.last_error = Some(error.to_string());
        self.publish();
    }
}

/// Cloneable view of a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    dispatcher: Dispatcher<SupervisorEvent>,
    state: watch::Receiver<SupervisorState>,
    snapshot: watch::Receiver<SupervisorSnapshot>,
    connect_timeout: Duration,
}

impl SupervisorHandle {
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let mut snapshot = self.snapshot.borrow().clone();
        snapshot.state = self.state();
        snapshot
    }

    pub fn start(&self) -> Result<()> {
        self.dispatcher.dispatch(SupervisorEvent::Start)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.dispatcher.dispatch(SupervisorEvent::ShutdownRequested)
    }

    /// Waits up to the configured tool timeout for `CONNECTED`.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.wait_connected(self.connect_timeout).await
    }

    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.clone();
        let current = *state.borrow_and_update();
        match current {
            SupervisorState::Connected => return Ok(()),
            SupervisorState::Init => self.start()?,
            SupervisorState::Error | SupervisorState::Shutdown => {
                return Err(self.not_connected(current));
            }
            _ => {}
        }

        let settled = tokio::time::timeout(
            timeout,
            state.wait_for(|state| {
                matches!(
                    state,
                    SupervisorState::Connected | SupervisorState::Error | SupervisorState::Shutdown
                )
            }),
        )
        .await;

        match settled {
            Err(_) => Err(LifecycleError::ConnectTimeout {
                state: self.state().to_string(),
                waited_ms: timeout.as_millis() as u64,
            }),
            Ok(Err(_)) => Err(LifecycleError::MachineStopped("supervisor".to_string())),
            Ok(Ok(state)) if *state == SupervisorState::Connected => Ok(()),
            Ok(Ok(state)) => Err(self.not_connected(*state)),
        }
    }

    fn not_connected(&self, state: SupervisorState) -> LifecycleError {
        match self.snapshot.borrow().last_error.clone() {
            Some(last_error) => LifecycleError::NotConnected {
                state: format!("{}, last error: {}", state, last_error),
            },
            None => LifecycleError::NotConnected {
                state: state.to_string(),
            },
        }
    }
}

pub struct Supervisor {
    machine: StateMachine<SupervisorState, SupervisorEvent, Supervision>,
}

impl Supervisor {
    pub fn new(
        port: u16,
        config: SupervisorConfig,
        probe: Arc<dyn BackendProbe>,
        launcher: Arc<dyn Launcher>,
    ) -> (Self, SupervisorHandle) {
        let (dispatcher, inbox) = fsm::channel();
        let snapshot = SupervisorSnapshot {
            state: SupervisorState::Init,
            port,
            retry_count: 0,
            max_retries: config.max_retries,
            last_error: None,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot.clone());
        let connect_timeout = config.tool_connect_timeout();

        let behavior = Supervision {
            config,
            snapshot,
            snapshot_tx,
            probe,
            launcher,
            dispatcher: dispatcher.clone(),
            heartbeat: TimerSlot::new("keepalive-heartbeat"),
        };
        let machine = StateMachine::new(
            "supervisor",
            transition_table(),
            SupervisorState::Init,
            behavior,
            inbox,
        )
        .with_error_event(SupervisorEvent::ErrorOccurred);

        let handle = SupervisorHandle {
            dispatcher,
            state: machine.watch(),
            snapshot: snapshot_rx,
            connect_timeout,
        };
        (Self { machine }, handle)
    }

    pub fn on_transition<F>(&mut self, listener: F)
    where
        F: Fn(&TransitionRecord<SupervisorState, SupervisorEvent>) + Send + Sync + 'static,
    {
        self.machine.on_transition(listener);
    }

    /// Runs until `SHUTDOWN`, or fails once the retry budget is spent.
    pub async fn run(mut self) -> Result<SupervisorState> {
        self.machine.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diagrammer_protocol::{KeepaliveAck, StatusReport};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Scripted backend: `up` answers probes; `boot_polls` makes a launched
    /// backend answer from its Nth probe on.
    #[derive(Default)]
    struct FakeBackend {
        up: AtomicBool,
        boot_polls: Mutex<Option<u32>>,
        keepalive_failures: AtomicU32,
        keepalives: AtomicU32,
        status_calls: AtomicU32,
    }

    impl FakeBackend {
        fn running() -> Arc<Self> {
            let backend = Self::default();
            backend.up.store(true, Ordering::SeqCst);
            Arc::new(backend)
        }
    }

    fn report() -> StatusReport {
        StatusReport {
            running: true,
            mcp_active: true,
            last_activity_seconds_ago: 0,
            seconds_until_shutdown: None,
            uptime_seconds: 1,
            port: 3737,
        }
    }

    #[async_trait]
    impl BackendProbe for FakeBackend {
        async fn status(&self) -> Result<StatusReport> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                return Ok(report());
            }
            let mut boot = self.boot_polls.lock().unwrap();
            if let Some(remaining) = boot.as_mut() {
                *remaining -= 1;
                if *remaining == 0 {
                    *boot = None;
                    self.up.store(true, Ordering::SeqCst);
                    return Ok(report());
                }
            }
            Err(LifecycleError::connectivity("/status", "connection refused"))
        }

        async fn keepalive(&self) -> Result<KeepaliveAck> {
            self.keepalives.fetch_add(1, Ordering::SeqCst);
            let failures = self.keepalive_failures.load(Ordering::SeqCst);
            if failures > 0 {
                self.keepalive_failures.store(failures - 1, Ordering::SeqCst);
                return Err(LifecycleError::connectivity("/keepalive", "connection reset"));
            }
            Ok(KeepaliveAck::ok(chrono::Utc::now()))
        }
    }

    struct FakeLauncher {
        backend: Arc<FakeBackend>,
        boots_after: Option<u32>,
        launches: AtomicU32,
    }

    impl FakeLauncher {
        fn booting(backend: &Arc<FakeBackend>, polls: u32) -> Arc<Self> {
            Arc::new(Self {
                backend: Arc::clone(backend),
                boots_after: Some(polls),
                launches: AtomicU32::new(0),
            })
        }

        fn broken(backend: &Arc<FakeBackend>) -> Arc<Self> {
            Arc::new(Self {
                backend: Arc::clone(backend),
                boots_after: None,
                launches: AtomicU32::new(0),
            })
        }
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, _port: u16) -> Result<()> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            match self.boots_after {
                Some(polls) => {
                    *self.backend.boot_polls.lock().unwrap() = Some(polls);
                    Ok(())
                }
                None => Err(LifecycleError::Spawn {
                    command: "diagrammer-backend".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }),
            }
        }
    }

    type Journal = Arc<Mutex<Vec<(SupervisorState, SupervisorState)>>>;

    fn supervisor(
        backend: &Arc<FakeBackend>,
        launcher: &Arc<FakeLauncher>,
    ) -> (Supervisor, SupervisorHandle, Journal) {
        let (mut supervisor, handle) = Supervisor::new(
            3737,
            SupervisorConfig::default(),
            Arc::clone(backend) as Arc<dyn BackendProbe>,
            Arc::clone(launcher) as Arc<dyn Launcher>,
        );
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&journal);
        supervisor.on_transition(move |record| log.lock().unwrap().push((record.from, record.to)));
        (supervisor, handle, journal)
    }

    #[test]
    fn table_matches_lifecycle() {
        use SupervisorEvent as E;
        use SupervisorState as S;
        let table = transition_table();
        assert_eq!(table.lookup(S::Init, E::Start), Some(S::CheckingServer));
        assert_eq!(table.lookup(S::Error, E::Start), Some(S::CheckingServer));
        assert_eq!(table.lookup(S::Connected, E::KeepaliveFailed), Some(S::Reconnecting));
        assert_eq!(table.lookup(S::WaitingForServer, E::ShutdownRequested), Some(S::Shutdown));
        assert_eq!(table.lookup(S::Connected, E::Start), None);
        assert_eq!(S::WaitingForServer.to_string(), "WAITING_FOR_SERVER");
        assert_eq!(E::KeepaliveFailed.to_string(), "KEEPALIVE_FAILED");
    }

    #[tokio::test(start_paused = true)]
    async fn starts_absent_backend_and_connects_on_third_poll() {
        let backend = Arc::new(FakeBackend::default());
        let launcher = FakeLauncher::booting(&backend, 3);
        let (supervisor, handle, journal) = supervisor(&backend, &launcher);
        tokio::spawn(supervisor.run());

        let started = Instant::now();
        handle.ensure_connected().await.expect("connected");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1_500) && elapsed < Duration::from_millis(1_550));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

        use SupervisorState as S;
        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                (S::Init, S::CheckingServer),
                (S::CheckingServer, S::StartingServer),
                (S::StartingServer, S::WaitingForServer),
                (S::WaitingForServer, S::Connected),
            ]
        );
        assert_eq!(handle.snapshot().retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_loss_reconnects_to_live_backend() {
        let backend = FakeBackend::running();
        backend.keepalive_failures.store(1, Ordering::SeqCst);
        let launcher = FakeLauncher::broken(&backend);
        let (supervisor, handle, journal) = supervisor(&backend, &launcher);
        tokio::spawn(supervisor.run());

        handle.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        use SupervisorState as S;
        assert_eq!(handle.state(), S::Connected);
        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                (S::Init, S::CheckingServer),
                (S::CheckingServer, S::Connected),
                (S::Connected, S::Reconnecting),
                (S::Reconnecting, S::Connected),
            ]
        );
        assert_eq!(handle.snapshot().retry_count, 0);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
        assert!(backend.keepalives.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_runs_every_interval() {
        let backend = FakeBackend::running();
        let launcher = FakeLauncher::broken(&backend);
        let (supervisor, handle, _journal) = supervisor(&backend, &launcher);
        tokio::spawn(supervisor.run());

        handle.ensure_connected().await.unwrap();
        tokio::time::sleep(Duration::from_secs(95)).await;
        // Immediate beat, then at 30, 60 and 90 seconds.
        assert_eq!(backend.keepalives.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_keepalive_interval_keeps_heartbeat_alive() {
        let backend = FakeBackend::running();
        let launcher = FakeLauncher::broken(&backend);
        let (supervisor, handle) = Supervisor::new(
            3737,
            SupervisorConfig {
                keepalive_interval_secs: 0,
                ..SupervisorConfig::default()
            },
            Arc::clone(&backend) as Arc<dyn BackendProbe>,
            Arc::clone(&launcher) as Arc<dyn Launcher>,
        );
        tokio::spawn(supervisor.run());

        handle.ensure_connected().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(handle.state(), SupervisorState::Connected);
        assert_eq!(backend.keepalives.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retry_budget() {
        let backend = Arc::new(FakeBackend::default());
        let launcher = FakeLauncher::broken(&backend);
        let (supervisor, handle, journal) = supervisor(&backend, &launcher);
        let mut snapshots = handle.snapshot.clone();
        let retries = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&retries);
        tokio::spawn(async move {
            while snapshots.changed().await.is_ok() {
                let count = snapshots.borrow_and_update().retry_count;
                let mut seen = seen.lock().unwrap();
                if count > 0 && seen.last() != Some(&count) {
                    seen.push(count);
                }
            }
        });

        handle.start().unwrap();
        let started = Instant::now();
        let err = supervisor.run().await.unwrap_err();

        assert!(matches!(err, LifecycleError::RetriesExhausted { attempts: 5 }));
        assert!(err.is_fatal());
        // One initial attempt plus five retries, 3s apart.
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 6);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_millis(15_100));
        let errors = journal
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, to)| *to == SupervisorState::Error)
            .count();
        assert_eq!(errors, 6);

        tokio::task::yield_now().await;
        assert_eq!(*retries.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_counts_as_failed_attempt() {
        let backend = Arc::new(FakeBackend::default());
        let launcher = FakeLauncher::booting(&backend, 1_000);
        let (supervisor, handle, _journal) = supervisor(&backend, &launcher);
        tokio::spawn(supervisor.run());

        let err = handle.ensure_connected().await.unwrap_err();
        // 20 polls of 500ms end exactly at the 10s tool timeout; whichever
        // wins, the tool sees a failure rather than a hang.
        assert!(matches!(
            err,
            LifecycleError::ConnectTimeout { .. } | LifecycleError::NotConnected { .. }
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.retry_count, 1);
        assert!(snapshot
            .last_error
            .unwrap_or_default()
            .contains("did not become ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_connected_fails_fast_after_shutdown() {
        let backend = FakeBackend::running();
        let launcher = FakeLauncher::broken(&backend);
        let (supervisor, handle, _journal) = supervisor(&backend, &launcher);
        let task = tokio::spawn(supervisor.run());

        handle.ensure_connected().await.unwrap();
        handle.shutdown().unwrap();
        let final_state = task.await.unwrap().unwrap();
        assert_eq!(final_state, SupervisorState::Shutdown);

        let err = handle.ensure_connected().await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotConnected { .. }));
        let keepalives = backend.keepalives.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.keepalives.load(Ordering::SeqCst), keepalives);
    }
}
