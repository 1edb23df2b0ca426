//! Wire types for the diagrammer backend.
//!
//! This crate is shared by the backend, the MCP client and the viewer so the
//! HTTP bodies and push-channel frames cannot drift apart. The backend remains
//! the authority on validation, but clients reuse the same types to build
//! requests and decode responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 3737;
pub const MAX_SOURCE_BYTES: usize = 512 * 1024; // 512KB

pub const STATUS_PATH: &str = "/status";
pub const KEEPALIVE_PATH: &str = "/keepalive";
pub const SOCKET_PATH: &str = "/ws";
pub const RENDER_PATH: &str = "/api/render";
pub const VALIDATE_PATH: &str = "/api/validate";
pub const DIAGRAMS_PATH: &str = "/api/diagrams";

/// Health probe and status report returned by `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub running: bool,
    pub mcp_active: bool,
    pub last_activity_seconds_ago: u64,
    pub seconds_until_shutdown: Option<u64>,
    pub uptime_seconds: u64,
    pub port: u16,
}

/// Body returned by `POST /keepalive`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveAck {
    pub status: String,
    /// Milliseconds since the Unix epoch at which the keepalive was recorded.
    pub timestamp: i64,
}

impl KeepaliveAck {
    pub fn ok(at: DateTime<Utc>) -> Self {
        Self {
            status: "ok".to_string(),
            timestamp: at.timestamp_millis(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            line: None,
        }
    }

    pub fn with_line(mut self, line: Option<usize>) -> Self {
        self.line = line;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Render / validate
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceRequest {
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedDiagram {
    pub kind: String,
    pub svg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxIssue {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SyntaxIssue>,
}

// ─────────────────────────────────────────────────────────────────────────────
// History
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramRecord {
    pub id: String,
    pub title: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiagramDraft {
    pub title: String,
    pub source: String,
}

impl DiagramDraft {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.title.trim().is_empty() {
            return Err(ErrorInfo::new("missing_field", "title is required"));
        }
        if self.title.chars().count() > 200 {
            return Err(ErrorInfo::new(
                "invalid_title",
                "title must be 200 characters or fewer",
            ));
        }
        validate_source(&self.source)
    }
}

pub fn validate_source(source: &str) -> Result<(), ErrorInfo> {
    if source.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "source is required"));
    }
    if source.len() > MAX_SOURCE_BYTES {
        return Err(ErrorInfo::new(
            "source_too_large",
            format!("source exceeds {} bytes", MAX_SOURCE_BYTES),
        ));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Push channel
// ─────────────────────────────────────────────────────────────────────────────

/// Frames sent by the UI over the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Render {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        source: String,
    },
    Validate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        source: String,
    },
}

/// Frames emitted by the backend over the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RenderResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        kind: String,
        svg: String,
    },
    ValidationResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(flatten)]
        report: ValidationReport,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<usize>,
    },
}

pub fn parse_client_message(text: &str) -> Result<ClientMessage, ErrorInfo> {
    let message: ClientMessage = serde_json::from_str(text).map_err(|err| {
        ErrorInfo::new(
            "invalid_message",
            format!("socket message is not a valid request: {}", err),
        )
    })?;
    match &message {
        ClientMessage::Render { source, .. } | ClientMessage::Validate { source, .. } => {
            validate_source(source)?
        }
    }
    Ok(message)
}

pub fn parse_server_message(text: &str) -> Result<ServerMessage, ErrorInfo> {
    serde_json::from_str(text).map_err(|err| {
        ErrorInfo::new(
            "invalid_message",
            format!("socket message is not a valid response: {}", err),
        )
    })
}
