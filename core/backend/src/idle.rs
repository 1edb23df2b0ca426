//! Idle shutdown for the singleton backend.
//!
//! Automation clients prove they are alive with `POST /keepalive`. A periodic
//! check notices when none has arrived within the inactivity threshold and
//! arms a short grace timer; if the grace expires with still no activity the
//! shutdown signal fires and `main` stops the server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use diagrammer_core::{IdleConfig, TimerSlot};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleCheck {
    Active,
    Scheduled,
    AlreadyPending,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleSnapshot {
    pub mcp_active: bool,
    pub last_activity_secs: u64,
    pub seconds_until_shutdown: Option<u64>,
}

#[derive(Debug)]
struct Activity {
    last: Instant,
    keepalive_seen: bool,
    shutdown_at: Option<Instant>,
}

#[derive(Debug)]
pub struct IdleManager {
    config: IdleConfig,
    activity: Mutex<Activity>,
    shutdown_timer: TimerSlot,
    shutdown_tx: watch::Sender<bool>,
}

impl IdleManager {
    pub fn new(config: IdleConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            activity: Mutex::new(Activity {
                last: Instant::now(),
                keepalive_seen: false,
                shutdown_at: None,
            }),
            shutdown_timer: TimerSlot::new("idle-shutdown"),
            shutdown_tx,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Marks a keepalive and cancels any pending shutdown.
    pub fn record_activity(&self) {
        let mut activity = self.lock();
        activity.last = Instant::now();
        activity.keepalive_seen = true;
        activity.shutdown_at = None;
        let cancelled = self.shutdown_timer.cancel();
        drop(activity);

        if cancelled {
            info!("Idle shutdown aborted: keepalive received");
        } else {
            debug!("Keepalive received");
        }
    }

    pub fn check_idle(self: &Arc<Self>) -> IdleCheck {
        if !self.config.enabled {
            return IdleCheck::Disabled;
        }
        // Held until the deadline is recorded so a concurrent keepalive
        // cancels a timer that `shutdown_at` already describes.
        let mut activity = self.lock();
        let now = Instant::now();
        let idle_for = now.saturating_duration_since(activity.last);
        if idle_for < self.config.inactivity_threshold() {
            return IdleCheck::Active;
        }

        let grace = self.config.shutdown_grace();
        let manager = Arc::clone(self);
        let scheduled = self.shutdown_timer.schedule_if_idle(grace, async move {
            manager.confirm_shutdown();
        });
        if !scheduled {
            return IdleCheck::AlreadyPending;
        }

        activity.shutdown_at = Some(now + grace);
        drop(activity);
        info!(
            idle_secs = idle_for.as_secs(),
            grace_secs = grace.as_secs(),
            "No client activity; scheduling idle shutdown"
        );
        IdleCheck::Scheduled
    }

    /// Grace expiry. Returns whether the shutdown signal was raised.
    pub fn confirm_shutdown(&self) -> bool {
        self.lock().shutdown_at = None;
        let idle_for = self.idle_for();
        if idle_for < self.config.inactivity_threshold() {
            info!(
                idle_secs = idle_for.as_secs(),
                "Idle shutdown aborted: activity resumed"
            );
            return false;
        }
        info!(idle_secs = idle_for.as_secs(), "Idle shutdown confirmed");
        self.shutdown_tx.send_replace(true);
        true
    }

    /// Raises the shutdown signal directly (e.g. on Ctrl-C).
    pub fn request_shutdown(&self) {
        self.shutdown_timer.cancel();
        self.shutdown_tx.send_replace(true);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn snapshot(&self) -> IdleSnapshot {
        let now = Instant::now();
        let activity = self.lock();
        let idle_for = now.saturating_duration_since(activity.last);
        IdleSnapshot {
            mcp_active: activity.keepalive_seen && idle_for < self.config.inactivity_threshold(),
            last_activity_secs: idle_for.as_secs(),
            seconds_until_shutdown: activity
                .shutdown_at
                .map(|at| ceil_secs(at.saturating_duration_since(now))),
        }
    }

    /// Periodic inactivity check. Returns once shutdown has been signaled.
    pub async fn run(self: Arc<Self>) {
        if !self.config.enabled {
            info!("Idle shutdown disabled");
            return;
        }
        let mut shutdown = self.subscribe();
        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_idle();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.lock().last)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Activity> {
        self.activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
