//! Diagrammer MCP server.
//!
//! Speaks MCP over stdio and forwards tool calls to the shared local backend,
//! starting the backend on demand and keeping it alive while this client runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use diagrammer_core::logging::{self, WorkerGuard};
use diagrammer_core::{DiagrammerConfig, StorageConfig};
use rmcp::ServiceExt;
use tracing::{error, info, warn};

mod backend;
mod launcher;
mod server;
mod supervisor;

use backend::BackendClient;
use launcher::DetachedLauncher;
use server::DiagramTools;
use supervisor::{Supervisor, SupervisorState};

#[derive(Debug, Parser)]
#[command(name = "diagrammer-mcp", version, about = "MCP server for diagram rendering")]
struct Cli {
    /// Backend port (overrides config.toml)
    #[arg(long, env = "DIAGRAMMER_PORT", global = true)]
    port: Option<u16>,

    /// Alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve MCP over stdio (default)
    Serve,
    /// Register this binary in the current project's .mcp.json
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::Init)) {
        if let Err(err) = init_project() {
            eprintln!("diagrammer-mcp init failed: {}", err);
            std::process::exit(1);
        }
        return;
    }

    let storage = match StorageConfig::from_env() {
        Ok(storage) => storage,
        Err(err) => {
            eprintln!("diagrammer-mcp: {}", err);
            std::process::exit(1);
        }
    };
    let log_guard = logging::init("mcp", &storage);

    let config_path = cli.config.clone().unwrap_or_else(|| storage.config_file());
    let mut config = match DiagrammerConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            DiagrammerConfig::default()
        }
    };
    if let Some(port) = cli.port {
        config.port = port;
    }

    let client = match BackendClient::new(config.port, config.supervisor.probe_timeout()) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(error = %err, "Failed to create backend client");
            logging::exit(1, log_guard);
        }
    };
    let mut launcher = DetachedLauncher::new();
    if let Some(path) = cli.config {
        launcher = launcher.with_config(path);
    }

    let (mut supervisor, handle) = Supervisor::new(
        config.port,
        config.supervisor.clone(),
        client.clone(),
        Arc::new(launcher),
    );
    supervisor.on_transition(|record| {
        if record.to == SupervisorState::Error {
            warn!(from = %record.from, "Backend connection attempt failed");
        }
    });
    let mut supervision = tokio::spawn(supervisor.run());
    if let Err(err) = handle.start() {
        error!(error = %err, "Failed to start connection supervisor");
        logging::exit(1, log_guard);
    }
    info!(port = config.port, "Diagrammer MCP server starting");

    // The supervisor may give up before the client finishes the handshake.
    let serving = DiagramTools::new(handle.clone(), client).serve(rmcp::transport::io::stdio());
    let service = tokio::select! {
        served = serving => match served {
            Ok(service) => service,
            Err(err) => {
                error!(error = %err, "MCP server failed to start");
                logging::exit(1, log_guard);
            }
        },
        outcome = &mut supervision => supervision_ended(outcome, log_guard),
    };

    tokio::select! {
        finished = service.waiting() => {
            if let Err(err) = finished {
                warn!(error = %err, "MCP session ended with error");
            }
            info!("MCP client disconnected; stopping supervisor");
            let _ = handle.shutdown();
            let _ = supervision.await;
        }
        outcome = &mut supervision => supervision_ended(outcome, log_guard),
    }
}

/// The supervisor only stops on its own when the backend is gone for good.
fn supervision_ended(
    outcome: std::result::Result<diagrammer_core::Result<SupervisorState>, tokio::task::JoinError>,
    log_guard: Option<WorkerGuard>,
) -> ! {
    match outcome {
        Ok(Ok(state)) => error!(state = %state, "Supervisor stopped unexpectedly"),
        Ok(Err(err)) => error!(error = %err, "Backend connection lost for good"),
        Err(err) => error!(error = %err, "Supervisor task failed"),
    }
    logging::exit(1, log_guard)
}

/// Writes (or merges) the project-scoped `.mcp.json` entry for this binary.
fn init_project() -> Result<(), Box<dyn std::error::Error>> {
    let binary_path = std::env::current_exe()?
        .canonicalize()?
        .to_string_lossy()
        .to_string();
    let cwd = std::env::current_dir()?;
    let path = write_mcp_json(&cwd, &binary_path)?;
    eprintln!("Wrote {}", path.display());
    Ok(())
}

fn write_mcp_json(dir: &Path, binary_path: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let mcp_json_path = dir.join(".mcp.json");
    let mut root: serde_json::Value = if mcp_json_path.exists() {
        let contents = fs_err::read_to_string(&mcp_json_path)?;
        serde_json::from_str(&contents).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };

    if !root.get("mcpServers").is_some_and(|v| v.is_object()) {
        root["mcpServers"] = serde_json::json!({});
    }
    root["mcpServers"]["diagrammer"] = serde_json::json!({
        "type": "stdio",
        "command": binary_path,
        "args": ["serve"],
    });

    fs_err::write(&mcp_json_path, serde_json::to_string_pretty(&root)?)?;
    Ok(mcp_json_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_merges_into_existing_mcp_json() {
        let temp = tempfile::TempDir::new().unwrap();
        fs_err::write(
            temp.path().join(".mcp.json"),
            r#"{"mcpServers":{"other":{"command":"other-bin"}}}"#,
        )
        .unwrap();

        write_mcp_json(temp.path(), "/usr/local/bin/diagrammer-mcp").unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&fs_err::read_to_string(temp.path().join(".mcp.json")).unwrap())
                .unwrap();
        assert_eq!(written["mcpServers"]["other"]["command"], "other-bin");
        assert_eq!(
            written["mcpServers"]["diagrammer"]["command"],
            "/usr/local/bin/diagrammer-mcp"
        );
        assert_eq!(written["mcpServers"]["diagrammer"]["args"][0], "serve");
    }

    #[test]
    fn cli_defaults_to_serving() {
        let cli = Cli::parse_from(["diagrammer-mcp", "--port", "4000"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(4000));
    }
}
