//! Single-slot cancelable timers.
//!
//! Every component owns one `TimerSlot` per kind of scheduled action (shutdown
//! grace, reconnect delay, heartbeat). Arming a slot aborts whatever task it
//! held, so at most one timer of a kind is ever pending.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct TimerSlot {
    label: &'static str,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerSlot {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            handle: Mutex::new(None),
        }
    }

    /// Runs `task` after `delay`, replacing any pending timer.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.replace(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }

    /// Spawns `task` immediately, replacing any pending timer. Used for
    /// long-running periodic tasks such as a heartbeat loop.
    pub fn replace<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.lock();
        if let Some(previous) = slot.take() {
            if !previous.is_finished() {
                tracing::debug!(timer = self.label, "Replacing pending timer");
            }
            previous.abort();
        }
        *slot = Some(tokio::spawn(task));
    }

    /// Arms the slot only when nothing is pending. Returns whether a new
    /// timer was scheduled.
    pub fn schedule_if_idle<F>(&self, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        }));
        true
    }

    /// Cancels the pending timer. Returns true when one was still pending.
    pub fn cancel(&self) -> bool {
        match self.lock().take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        // A poisoned slot still holds a valid handle; keep using it.
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn schedule_replaces_pending_timer() {
        let slot = TimerSlot::new("test");
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            slot.schedule(Duration::from_secs(5), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!slot.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let slot = TimerSlot::new("test");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        slot.schedule(Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(slot.is_pending());
        assert!(slot.cancel());
        assert!(!slot.cancel());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_if_idle_keeps_existing_timer() {
        let slot = TimerSlot::new("test");
        let fired = Arc::new(AtomicUsize::new(0));

        let first = Arc::clone(&fired);
        assert!(slot.schedule_if_idle(Duration::from_secs(3), async move {
            first.fetch_add(1, Ordering::SeqCst);
        }));
        let second = Arc::clone(&fired);
        assert!(!slot.schedule_if_idle(Duration::from_secs(1), async move {
            second.fetch_add(10, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Finished timers free the slot again.
        assert!(slot.schedule_if_idle(Duration::from_secs(1), async {}));
    }
}
