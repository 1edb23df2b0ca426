//! Table-driven finite state machine shared by the connection supervisor and
//! the socket reconnector.
//!
//! A machine owns its current state, a [`Behavior`] (the per-state entry
//! handlers plus whatever context they mutate) and an inbox of events. Events
//! arrive either directly through [`StateMachine::transition`] or from other
//! tasks through a cloneable [`Dispatcher`].
//!
//! ## Transition rules
//!
//! - `(state, event)` pairs missing from the table are ignored: the state is
//!   unchanged, no handler runs, no listener is notified, a warning is logged.
//! - The table's shutdown event moves every state to the terminal state.
//! - After a valid transition the destination's entry handler runs, then the
//!   registered listeners see the transition. A handler may return a
//!   follow-up event, which is processed by the same loop, so chains of
//!   handler-driven transitions never recurse.
//! - A handler error (or panic) is converted into the machine's error event.
//!   Only fatal errors (see [`LifecycleError::is_fatal`]) escape to the caller.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, Result};

const JOURNAL_CAPACITY: usize = 256;

/// Bound for state and event tags.
pub trait Tag: Copy + Eq + Hash + Debug + std::fmt::Display + Send + Sync + 'static {}

impl<T> Tag for T where T: Copy + Eq + Hash + Debug + std::fmt::Display + Send + Sync + 'static {}

#[derive(Debug, Clone)]
pub struct TransitionTable<S, E> {
    edges: HashMap<(S, E), S>,
    shutdown: Option<(E, S)>,
}

impl<S: Tag, E: Tag> Default for TransitionTable<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Tag, E: Tag> TransitionTable<S, E> {
    pub fn new() -> Self {
        Self {
            edges: HashMap::new(),
            shutdown: None,
        }
    }

    pub fn on(mut self, from: S, event: E, to: S) -> Self {
        self.edges.insert((from, event), to);
        self
    }

    /// Every state moves to `terminal` on `event`, regardless of its own edges.
    pub fn with_shutdown(mut self, event: E, terminal: S) -> Self {
        self.shutdown = Some((event, terminal));
        self
    }

    pub fn lookup(&self, from: S, event: E) -> Option<S> {
        if let Some((shutdown_event, terminal)) = self.shutdown {
            if event == shutdown_event {
                return Some(terminal);
            }
        }
        self.edges.get(&(from, event)).copied()
    }

    pub fn is_terminal(&self, state: S) -> bool {
        matches!(self.shutdown, Some((_, terminal)) if terminal == state)
    }

    fn is_shutdown_event(&self, event: E) -> bool {
        matches!(self.shutdown, Some((shutdown_event, _)) if shutdown_event == event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord<S, E> {
    pub from: S,
    pub to: S,
    pub event: E,
    pub at: DateTime<Utc>,
}

/// Per-state entry handlers and the context they own.
#[async_trait]
pub trait Behavior<S: Tag, E: Tag>: Send {
    /// Runs after the machine has entered `state`. Returning `Ok(Some(event))`
    /// feeds `event` straight back into the machine.
    async fn on_enter(&mut self, state: S) -> Result<Option<E>>;

    /// Context-dependent guard: may redirect the table's target for this
    /// transition. The default keeps the table's answer.
    fn resolve(&mut self, _from: S, _event: E, to: S) -> S {
        to
    }

    /// Records a non-fatal handler error before the error event is processed.
    fn on_error(&mut self, _state: S, _error: &LifecycleError) {}
}

/// Handle used by other tasks to feed events into a running machine.
#[derive(Debug)]
pub struct Dispatcher<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for Dispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Tag> Dispatcher<E> {
    pub fn dispatch(&self, event: E) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|err| LifecycleError::MachineStopped(format!("event {} dropped", err.0)))
    }
}

#[derive(Debug)]
pub struct Inbox<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

pub fn channel<E: Tag>() -> (Dispatcher<E>, Inbox<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Dispatcher { tx }, Inbox { rx })
}

type Listener<S, E> = Box<dyn Fn(&TransitionRecord<S, E>) + Send + Sync>;

pub struct StateMachine<S: Tag, E: Tag, B> {
    name: &'static str,
    table: TransitionTable<S, E>,
    state: S,
    behavior: B,
    error_event: Option<E>,
    inbox: Inbox<E>,
    backlog: VecDeque<E>,
    state_tx: watch::Sender<S>,
    listeners: Vec<Listener<S, E>>,
    journal: VecDeque<TransitionRecord<S, E>>,
}

impl<S: Tag, E: Tag, B: Behavior<S, E>> StateMachine<S, E, B> {
    pub fn new(
        name: &'static str,
        table: TransitionTable<S, E>,
        initial: S,
        behavior: B,
        inbox: Inbox<E>,
    ) -> Self {
        let (state_tx, _) = watch::channel(initial);
        Self {
            name,
            table,
            state: initial,
            behavior,
            error_event: None,
            inbox,
            backlog: VecDeque::new(),
            state_tx,
            listeners: Vec::new(),
            journal: VecDeque::with_capacity(JOURNAL_CAPACITY),
        }
    }

    /// Event fed back into the machine when an entry handler fails.
    pub fn with_error_event(mut self, event: E) -> Self {
        self.error_event = Some(event);
        self
    }

    /// Registers a transition observer. Listeners run synchronously on the
    /// machine's task and must not block.
    pub fn on_transition<F>(&mut self, listener: F)
    where
        F: Fn(&TransitionRecord<S, E>) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn watch(&self) -> watch::Receiver<S> {
        self.state_tx.subscribe()
    }

    pub fn behavior(&self) -> &B {
        &self.behavior
    }

    pub fn journal(&self) -> impl Iterator<Item = &TransitionRecord<S, E>> {
        self.journal.iter()
    }

    pub fn is_terminated(&self) -> bool {
        self.table.is_terminal(self.state)
    }

    /// Applies `event` and every follow-up event its handlers produce.
    /// Returns the state the machine settled in.
    pub async fn transition(&mut self, event: E) -> Result<S> {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            if self.is_terminated() {
                debug!(machine = self.name, event = %event, "Machine terminated; dropping event");
                break;
            }
            let Some(record) = self.apply(event) else {
                break;
            };
            let entered = self.enter(record.to).await;
            self.notify(&record);
            next = entered?;

            if next.is_some() && self.take_pending_shutdown() {
                if let Some((shutdown_event, _)) = self.table.shutdown {
                    info!(machine = self.name, "Shutdown pre-empts pending transition chain");
                    next = Some(shutdown_event);
                }
            }
        }
        Ok(self.state)
    }

    /// Drains the inbox until the terminal state is reached or every
    /// dispatcher is dropped. Fatal handler errors are returned.
    pub async fn run(&mut self) -> Result<S> {
        while !self.is_terminated() {
            let event = match self.backlog.pop_front() {
                Some(event) => event,
                None => match self.inbox.rx.recv().await {
                    Some(event) => event,
                    None => {
                        debug!(machine = self.name, "All dispatchers dropped");
                        break;
                    }
                },
            };
            self.transition(event).await?;
        }
        Ok(self.state)
    }

    /// Moves to the next state and journals the transition. Listeners are
    /// notified by the caller once the entry handler has run.
    fn apply(&mut self, event: E) -> Option<TransitionRecord<S, E>> {
        let from = self.state;
        let Some(target) = self.table.lookup(from, event) else {
            warn!(
                machine = self.name,
                state = %from,
                event = %event,
                "No transition defined; event ignored"
            );
            return None;
        };
        let to = if self.table.is_shutdown_event(event) {
            target
        } else {
            self.behavior.resolve(from, event, target)
        };

        self.state = to;
        self.state_tx.send_replace(to);

        let record = TransitionRecord {
            from,
            to,
            event,
            at: Utc::now(),
        };
        info!(machine = self.name, from = %from, to = %to, event = %event, "State transition");
        if self.journal.len() == JOURNAL_CAPACITY {
            self.journal.pop_front();
        }
        self.journal.push_back(record.clone());
        Some(record)
    }

    fn notify(&self, record: &TransitionRecord<S, E>) {
        for listener in &self.listeners {
            listener(record);
        }
    }

    async fn enter(&mut self, state: S) -> Result<Option<E>> {
        let outcome = AssertUnwindSafe(self.behavior.on_enter(state))
            .catch_unwind()
            .await;

        let err = match outcome {
            Ok(Ok(next)) => return Ok(next),
            Ok(Err(err)) if err.is_fatal() => {
                error!(machine = self.name, state = %state, error = %err, "Fatal state handler error");
                return Err(err);
            }
            Ok(Err(err)) => {
                warn!(machine = self.name, state = %state, error = %err, "State handler failed");
                err
            }
            Err(_) => {
                error!(machine = self.name, state = %state, "State handler panicked");
                LifecycleError::HandlerPanicked {
                    state: state.to_string(),
                }
            }
        };

        self.behavior.on_error(state, &err);
        if self.error_event.is_none() {
            warn!(machine = self.name, state = %state, "No error event configured; chain stops");
        }
        Ok(self.error_event)
    }

    /// Moves queued events into the backlog and reports whether a shutdown
    /// request was among them.
    fn take_pending_shutdown(&mut self) -> bool {
        while let Ok(event) = self.inbox.rx.try_recv() {
            self.backlog.push_back(event);
        }
        let position = self
            .backlog
            .iter()
            .position(|event| self.table.is_shutdown_event(*event));
        match position {
            Some(index) => {
                self.backlog.remove(index);
                true
            }
            None => false,
        }
    }
}
