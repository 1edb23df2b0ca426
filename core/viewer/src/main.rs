//! Diagrammer terminal viewer.
//!
//! Holds a push-channel connection to the backend, prints every diagram the
//! backend broadcasts, and accepts a few commands on stdin.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use diagrammer_core::{logging, DiagrammerConfig, StorageConfig};
use diagrammer_protocol::{ClientMessage, ServerMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

mod connector;
mod reconnector;

use connector::WsConnector;
use reconnector::{Reconnector, ReconnectorHandle};

#[derive(Debug, Parser)]
#[command(name = "diagrammer-viewer", version, about = "Watch diagrams rendered by the diagrammer backend")]
struct Cli {
    /// Backend port (overrides config.toml)
    #[arg(long, env = "DIAGRAMMER_PORT")]
    port: Option<u16>,

    /// Alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write each rendered SVG into this directory
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Render(PathBuf),
    Validate(PathBuf),
    Reconnect,
    Status,
    Quit,
    Help,
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?;
    let arg = parts.next();
    match (verb, arg) {
        ("render", Some(path)) => Some(Command::Render(PathBuf::from(path))),
        ("validate", Some(path)) => Some(Command::Validate(PathBuf::from(path))),
        ("reconnect", None) => Some(Command::Reconnect),
        ("status", None) => Some(Command::Status),
        ("quit" | "exit", None) => Some(Command::Quit),
        _ => Some(Command::Help),
    }
}

const HELP: &str = "commands: render <file> | validate <file> | reconnect | status | quit";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let storage = match StorageConfig::from_env() {
        Ok(storage) => storage,
        Err(err) => {
            eprintln!("diagrammer-viewer: {}", err);
            std::process::exit(1);
        }
    };
    let log_guard = logging::init("viewer", &storage);

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

    let connector = WsConnector::new(config.port);
    info!(url = connector.url(), "Viewer starting");
    let (mut reconnector, handle, mut messages) =
        Reconnector::new(config.socket.clone(), Arc::new(connector));
    reconnector.on_transition(|record| {
        println!("[socket] {} -> {}", record.from, record.to);
    });
    let machine = tokio::spawn(reconnector.run());
    if let Err(err) = handle.connect() {
        error!(error = %err, "Failed to start socket reconnector");
        logging::exit(1, log_guard);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut next_id = 0u64;
    loop {
        tokio::select! {
            message = messages.recv() => {
                let Some(message) = message else { break };
                show(&message, cli.out_dir.as_deref());
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "Failed to read stdin");
                        break;
                    }
                };
                let Some(command) = parse_command(&line) else { continue };
                if command == Command::Quit {
                    break;
                }
                next_id += 1;
                run_command(command, &handle, format!("v{}", next_id));
            }
        }
    }

    machine.abort();
    info!("Viewer stopped");
}

fn run_command(command: Command, handle: &ReconnectorHandle, id: String) {
    match command {
        Command::Render(path) | Command::Validate(path) if !path.exists() => {
            println!("no such file: {}", path.display());
        }
        Command::Render(path) => match fs_err::read_to_string(&path) {
            Ok(source) => {
                if !handle.send(ClientMessage::Render { id: Some(id), source }) {
                    println!("not connected ({}); try `reconnect`", handle.state());
                }
            }
            Err(err) => println!("{}", err),
        },
        Command::Validate(path) => match fs_err::read_to_string(&path) {
            Ok(source) => {
                if !handle.send(ClientMessage::Validate { id: Some(id), source }) {
                    println!("not connected ({}); try `reconnect`", handle.state());
                }
            }
            Err(err) => println!("{}", err),
        },
        Command::Reconnect => {
            if let Err(err) = handle.connect() {
                println!("reconnect failed: {}", err);
            }
        }
        Command::Status => println!("{} (attempts {})", handle.state(), handle.attempts()),
        Command::Help | Command::Quit => println!("{}", HELP),
    }
}

fn show(message: &ServerMessage, out_dir: Option<&Path>) {
    match message {
        ServerMessage::RenderResult { id, kind, svg } => {
            println!("rendered {} diagram ({} bytes)", kind, svg.len());
            if let Some(dir) = out_dir {
                let name = id.clone().unwrap_or_else(|| chrono::Utc::now().format("%Y%m%dT%H%M%S%3f").to_string());
                let path = dir.join(format!("{}.svg", name));
                match fs_err::write(&path, svg) {
                    Ok(()) => println!("  wrote {}", path.display()),
                    Err(err) => warn!(error = %err, "Failed to write SVG"),
                }
            }
        }
        ServerMessage::ValidationResult { report, .. } => match (&report.error, report.valid) {
            (_, true) => println!(
                "valid {} diagram",
                report.kind.as_deref().unwrap_or("unknown")
            ),
            (Some(issue), false) => match issue.line {
                Some(line) => println!("invalid (line {}): {}", line, issue.message),
                None => println!("invalid: {}", issue.message),
            },
            (None, false) => println!("invalid"),
        },
        ServerMessage::Error { message, line, .. } => match line {
            Some(line) => println!("error (line {}): {}", line, message),
            None => println!("error: {}", message),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_shell_commands() {
        assert_eq!(
            parse_command("render flow.mmd"),
            Some(Command::Render(PathBuf::from("flow.mmd")))
        );
        assert_eq!(parse_command("  reconnect "), Some(Command::Reconnect));
        assert_eq!(parse_command("exit"), Some(Command::Quit));
        assert_eq!(parse_command("render"), Some(Command::Help));
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn rendered_svg_lands_in_out_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        show(
            &ServerMessage::RenderResult {
                id: Some("v1".to_string()),
                kind: "graph".to_string(),
                svg: "<svg/>".to_string(),
            },
            Some(temp.path()),
        );
        assert_eq!(
            fs_err::read_to_string(temp.path().join("v1.svg")).unwrap(),
            "<svg/>"
        );
    }
}
