//! MCP tools exposed over stdio.
//!
//! Every tool first waits for the connection supervisor to report
//! `CONNECTED`, then forwards to the backend's HTTP API.

use std::sync::Arc;

use diagrammer_core::LifecycleError;
use diagrammer_protocol::{DiagramDraft, DiagramRecord};
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler,
};
use serde::Deserialize;

use crate::backend::{BackendClient, BackendProbe};
use crate::supervisor::SupervisorHandle;

const INSTRUCTIONS: &str = "Render and validate Mermaid-style diagrams (graph, flowchart, \
sequenceDiagram, classDiagram, stateDiagram, erDiagram, gantt, pie, journey, gitGraph, mindmap, \
timeline) through the local diagrammer backend. Rendered diagrams also appear in any open viewer. \
Use save_diagram to keep a diagram in history and list_diagrams/get_diagram to find it again.";

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SourceArgs {
    /// Diagram source, starting with the diagram type (e.g. "graph TD")
    source: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SaveDiagramArgs {
    /// Short human-readable title
    title: String,
    /// Diagram source
    source: String,
    /// Existing diagram id to overwrite; omit to create a new entry
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct DiagramIdArgs {
    /// Diagram id as returned by save_diagram or list_diagrams
    id: String,
}

#[derive(Clone)]
pub struct DiagramTools {
    supervisor: SupervisorHandle,
    backend: Arc<BackendClient>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl DiagramTools {
    pub fn new(supervisor: SupervisorHandle, backend: Arc<BackendClient>) -> Self {
        Self {
            supervisor,
            backend,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Render diagram source to SVG. The result is also pushed to connected viewers. Syntax errors are reported with their line number."
    )]
    async fn render_diagram(
        &self,
        Parameters(args): Parameters<SourceArgs>,
    ) -> Result<CallToolResult, McpError> {
        if let Err(err) = self.supervisor.ensure_connected().await {
            return Ok(failure(err));
        }
        match self.backend.render(&args.source).await {
            Ok(rendered) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Rendered {} diagram.\n\n{}",
                rendered.kind, rendered.svg
            ))])),
            Err(err) => Ok(failure(err)),
        }
    }

    #[tool(description = "Check diagram source for syntax errors without rendering it")]
    async fn validate_diagram(
        &self,
        Parameters(args): Parameters<SourceArgs>,
    ) -> Result<CallToolResult, McpError> {
        if let Err(err) = self.supervisor.ensure_connected().await {
            return Ok(failure(err));
        }
        match self.backend.validate(&args.source).await {
            Ok(report) if report.valid => Ok(CallToolResult::success(vec![Content::text(format!(
                "Valid {} diagram.",
                report.kind.unwrap_or_else(|| "unknown".to_string())
            ))])),
            Ok(report) => {
                let text = match report.error {
                    Some(issue) => match issue.line {
                        Some(line) => format!("Invalid diagram (line {}): {}", line, issue.message),
                        None => format!("Invalid diagram: {}", issue.message),
                    },
                    None => "Invalid diagram.".to_string(),
                };
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(err) => Ok(failure(err)),
        }
    }

    #[tool(description = "Save a diagram to history. Pass id to overwrite an existing entry.")]
    async fn save_diagram(
        &self,
        Parameters(args): Parameters<SaveDiagramArgs>,
    ) -> Result<CallToolResult, McpError> {
        if let Err(err) = self.supervisor.ensure_connected().await {
            return Ok(failure(err));
        }
        let draft = DiagramDraft {
            title: args.title,
            source: args.source,
        };
        match self.backend.save_diagram(args.id.as_deref(), &draft).await {
            Ok(record) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Saved '{}' as {}",
                record.title, record.id
            ))])),
            Err(err) => Ok(failure(err)),
        }
    }

    #[tool(description = "List saved diagrams, most recently updated first")]
    async fn list_diagrams(&self) -> Result<CallToolResult, McpError> {
        if let Err(err) = self.supervisor.ensure_connected().await {
            return Ok(failure(err));
        }
        match self.backend.list_diagrams().await {
            Ok(records) if records.is_empty() => {
                Ok(CallToolResult::success(vec![Content::text("No saved diagrams.")]))
            }
            Ok(records) => Ok(CallToolResult::success(vec![Content::text(summarize(
                &records,
            ))])),
            Err(err) => Ok(failure(err)),
        }
    }

    #[tool(description = "Get a saved diagram, including its source")]
    async fn get_diagram(
        &self,
        Parameters(args): Parameters<DiagramIdArgs>,
    ) -> Result<CallToolResult, McpError> {
        if let Err(err) = self.supervisor.ensure_connected().await {
            return Ok(failure(err));
        }
        match self.backend.get_diagram(&args.id).await {
            Ok(record) => {
                let json = serde_json::to_string_pretty(&record)
                    .unwrap_or_else(|e| format!("Serialization error: {}", e));
                Ok(CallToolResult::success(vec![Content::text(json)]))
            }
            Err(err) => Ok(failure(err)),
        }
    }

    #[tool(description = "Delete a saved diagram")]
    async fn delete_diagram(
        &self,
        Parameters(args): Parameters<DiagramIdArgs>,
    ) -> Result<CallToolResult, McpError> {
        if let Err(err) = self.supervisor.ensure_connected().await {
            return Ok(failure(err));
        }
        match self.backend.delete_diagram(&args.id).await {
            Ok(()) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Deleted {}",
                args.id
            ))])),
            Err(err) => Ok(failure(err)),
        }
    }

    #[tool(description = "Report the backend connection state, retry budget and backend status")]
    async fn backend_status(&self) -> Result<CallToolResult, McpError> {
        let connected = self.supervisor.ensure_connected().await;
        let snapshot = self.supervisor.snapshot();
        let mut report = serde_json::json!({
            "state": snapshot.state.to_string(),
            "port": snapshot.port,
            "retryCount": snapshot.retry_count,
            "maxRetries": snapshot.max_retries,
            "lastError": snapshot.last_error,
        });
        match connected {
            Ok(()) => match self.backend.status().await {
                Ok(status) => report["backend"] = serde_json::to_value(status).unwrap_or_default(),
                Err(err) => report["backendError"] = serde_json::Value::String(err.to_string()),
            },
            Err(err) => report["backendError"] = serde_json::Value::String(err.to_string()),
        }
        let text = serde_json::to_string_pretty(&report)
            .unwrap_or_else(|e| format!("Serialization error: {}", e));
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}

#[tool_handler]
impl ServerHandler for DiagramTools {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(INSTRUCTIONS.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

fn failure(err: LifecycleError) -> CallToolResult {
    let text = match &err {
        LifecycleError::Syntax { .. } | LifecycleError::DiagramNotFound { .. } => err.to_string(),
        _ => format!("Diagrammer backend unavailable or failed: {}", err),
    };
    CallToolResult::error(vec![Content::text(text)])
}

fn summarize(records: &[DiagramRecord]) -> String {
    records
        .iter()
        .map(|record| {
            format!(
                "{}  {}  (updated {})",
                record.id,
                record.title,
                record.updated_at.format("%Y-%m-%d %H:%M")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn summary_lists_one_line_per_record() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let records = vec![
            DiagramRecord {
                id: "01B".to_string(),
                title: "Checkout".to_string(),
                source: "graph TD".to_string(),
                created_at: at,
                updated_at: at,
            },
            DiagramRecord {
                id: "01A".to_string(),
                title: "Login".to_string(),
                source: "graph TD".to_string(),
                created_at: at,
                updated_at: at,
            },
        ];
        assert_eq!(
            summarize(&records),
            "01B  Checkout  (updated 2026-03-01 09:30)\n01A  Login  (updated 2026-03-01 09:30)"
        );
    }

    #[test]
    fn syntax_failures_are_reported_verbatim() {
        let result = failure(LifecycleError::Syntax {
            message: "unbalanced '{'".to_string(),
            line: Some(2),
        });
        assert_eq!(result.is_error, Some(true));
    }
}
