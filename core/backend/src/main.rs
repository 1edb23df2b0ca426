//! Diagrammer backend entrypoint.
//!
//! A single local HTTP + WebSocket server shared by every automation client
//! and viewer on the machine. It is started on demand by the first MCP client
//! that finds no backend on the port, and it stops itself once no client has
//! sent a keepalive for a while.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use diagrammer_core::{
    logging, DiagrammerConfig, JsonHistoryStore, OutlineRenderer, StorageConfig,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

mod idle;
mod routes;
mod socket;
mod state;

use idle::IdleManager;
use state::AppState;

#[derive(Debug, Parser)]
#[command(name = "diagrammer-backend", version, about = "Local diagram rendering backend")]
struct Cli {
    /// Port to bind on 127.0.0.1 (overrides config.toml)
    #[arg(long, env = "DIAGRAMMER_PORT")]
    port: Option<u16>,

    /// Alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep running without keepalives (for running the backend by hand)
    #[arg(long)]
    no_idle_shutdown: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let storage = match StorageConfig::from_env() {
        Ok(storage) => storage,
        Err(err) => {
            eprintln!("diagrammer-backend: {}", err);
            std::process::exit(1);
        }
    };
    let log_guard = logging::init("backend", &storage);

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
    if cli.no_idle_shutdown {
        config.idle.enabled = false;
    }

    if let Err(err) = storage.ensure_dirs() {
        error!(error = %err, "Failed to prepare storage directories");
        logging::exit(1, log_guard);
    }

    let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, config.port)).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            info!(port = config.port, "Another backend already owns the port; exiting");
            return;
        }
        Err(err) => {
            error!(error = %err, port = config.port, "Failed to bind backend port");
            logging::exit(1, log_guard);
        }
    };

    let idle = Arc::new(IdleManager::new(config.idle.clone()));
    let state = AppState::new(
        config.port,
        Arc::clone(&idle),
        Arc::new(OutlineRenderer),
        Arc::new(JsonHistoryStore::new(&storage)),
    );
    tokio::spawn(Arc::clone(&idle).run());

    info!(
        port = config.port,
        idle_shutdown = idle.is_enabled(),
        root = %storage.root().display(),
        "Diagrammer backend started"
    );

    let app = routes::router(state);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&idle)))
        .await;

    if let Err(err) = served {
        error!(error = %err, "Backend server failed");
        logging::exit(1, log_guard);
    }
    info!("Diagrammer backend stopped");
}

async fn shutdown_signal(idle: Arc<IdleManager>) {
    let mut shutdown = idle.subscribe();
    let idle_stop = async {
        let _ = shutdown.wait_for(|stop| *stop).await;
    };
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = idle_stop => {}
        _ = ctrl_c => {
            info!("Interrupted; shutting down");
            idle.request_shutdown();
        }
    }
}
