//! # diagrammer-core
//!
//! Shared building blocks for the diagrammer processes: the backend, the MCP
//! client and the viewer.
//!
//! ## Design Principles
//!
//! - **One engine, many machines**: [`fsm`] is instantiated separately by the
//!   connection supervisor and the socket reconnector with their own tables.
//! - **Owned state**: nothing here keeps global mutable state. Callers build
//!   values in `main` and pass them down.
//! - **Single-slot timers**: every scheduled action goes through
//!   [`timer::TimerSlot`], which cancels its predecessor before arming.
//! - **Graceful degradation**: a missing config file yields defaults, not errors.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use diagrammer_core::fsm::{self, StateMachine, TransitionTable};
//!
//! let (dispatcher, inbox) = fsm::channel();
//! let mut machine = StateMachine::new("example", table, State::Idle, behavior, inbox);
//! dispatcher.dispatch(Event::Start)?;
//! machine.run().await?;
//! ```

pub mod config;
pub mod error;
pub mod fsm;
pub mod history;
pub mod logging;
pub mod render;
pub mod storage;
pub mod timer;

pub use config::{DiagrammerConfig, IdleConfig, SocketConfig, SupervisorConfig};
pub use error::{ErrorClass, LifecycleError, Result};
pub use history::{HistoryStore, JsonHistoryStore};
pub use render::{DiagramRenderer, OutlineRenderer};
pub use storage::StorageConfig;
pub use timer::TimerSlot;
