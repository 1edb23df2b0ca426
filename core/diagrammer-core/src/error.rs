//! Error types for diagrammer lifecycle and collaborator operations.

use std::path::PathBuf;

/// Coarse classification used by the state machines to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Probe, keepalive, socket or HTTP failure. Always retried.
    Transient,
    /// The backend process could not be started.
    Spawn,
    /// A bounded wait ran out.
    Timeout,
    /// A retry budget is spent. Fatal for the connection supervisor.
    Exhausted,
    /// Anything else (I/O, parsing, bad input).
    Other,
}

/// All errors that can occur in diagrammer operations.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    // ─────────────────────────────────────────────────────────────────────
    // Connectivity
    // ─────────────────────────────────────────────────────────────────────
    #[error("Backend unreachable: {context}: {details}")]
    Connectivity { context: String, details: String },

    #[error("Backend rejected request: {context}: {code}: {message}")]
    Backend {
        context: String,
        status: u16,
        code: String,
        message: String,
    },

    #[error("Socket error: {0}")]
    Socket(String),

    // ─────────────────────────────────────────────────────────────────────
    // Process lifecycle
    // ─────────────────────────────────────────────────────────────────────
    #[error("Failed to spawn backend {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend binary not found (looked for {0})")]
    BackendBinaryNotFound(String),

    #[error("Backend on port {port} did not become ready after {attempts} health checks")]
    ReadinessTimeout { port: u16, attempts: u32 },

    #[error("Timed out after {waited_ms}ms waiting for backend connection (state: {state})")]
    ConnectTimeout { state: String, waited_ms: u64 },

    #[error("Backend connection unavailable (state: {state})")]
    NotConnected { state: String },

    #[error("Connection retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    // ─────────────────────────────────────────────────────────────────────
    // State machine
    // ─────────────────────────────────────────────────────────────────────
    #[error("State handler for {state} panicked")]
    HandlerPanicked { state: String },

    #[error("State machine {0} is no longer running")]
    MachineStopped(String),

    // ─────────────────────────────────────────────────────────────────────
    // Collaborators
    // ─────────────────────────────────────────────────────────────────────
    #[error("Diagram syntax error{}: {message}", line_suffix(.line))]
    Syntax { message: String, line: Option<usize> },

    #[error("Diagram not found: {id}")]
    DiagramNotFound { id: String },

    #[error("Invalid diagram id: {0}")]
    InvalidDiagramId(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ─────────────────────────────────────────────────────────────────────
    // Configuration & I/O
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl LifecycleError {
    pub fn connectivity(context: impl Into<String>, details: impl std::fmt::Display) -> Self {
        LifecycleError::Connectivity {
            context: context.into(),
            details: details.to_string(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        LifecycleError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn classify(&self) -> ErrorClass {
        match self {
            LifecycleError::Connectivity { .. }
            | LifecycleError::Backend { .. }
            | LifecycleError::Socket(_)
            | LifecycleError::NotConnected { .. } => ErrorClass::Transient,
            LifecycleError::Spawn { .. } | LifecycleError::BackendBinaryNotFound(_) => {
                ErrorClass::Spawn
            }
            LifecycleError::ReadinessTimeout { .. } | LifecycleError::ConnectTimeout { .. } => {
                ErrorClass::Timeout
            }
            LifecycleError::RetriesExhausted { .. } => ErrorClass::Exhausted,
            _ => ErrorClass::Other,
        }
    }

    /// Fatal errors escape the state machine instead of being fed back as an
    /// error event.
    pub fn is_fatal(&self) -> bool {
        self.classify() == ErrorClass::Exhausted
    }
}

fn line_suffix(line: &Option<usize>) -> String {
    match line {
        Some(line) => format!(" on line {}", line),
        None => String::new(),
    }
}

/// Convenience type alias for Results using LifecycleError.
pub type Result<T> = std::result::Result<T, LifecycleError>;
