//! Tracing subscriber setup shared by the three binaries.
//!
//! Diagnostics go to stderr (stdout carries the MCP transport) and to a daily
//! rolling file under `logs/`. `DIAGRAMMER_DEBUG_LOG=1` forces debug level;
//! otherwise `RUST_LOG` applies, defaulting to `info`.

use std::env;

pub use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::storage::StorageConfig;

pub const DEBUG_LOG_ENV: &str = "DIAGRAMMER_DEBUG_LOG";

/// Installs the global subscriber. Hold the returned guard until exit so the
/// file writer flushes; `None` means file logging could not be set up.
pub fn init(component: &str, storage: &StorageConfig) -> Option<WorkerGuard> {
    let logs_dir = storage.logs_dir();
    let file_writer = match fs_err::create_dir_all(&logs_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&logs_dir, format!("{}.log", component));
            Some(tracing_appender::non_blocking(appender))
        }
        Err(err) => {
            eprintln!("diagrammer: file logging disabled: {}", err);
            None
        }
    };

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let (file_layer, guard) = match file_writer {
        Some((writer, guard)) => (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        ),
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    guard
}

/// Flushes the file writer, then exits. `std::process::exit` runs no
/// destructors, so the guard is dropped here first.
pub fn exit(code: i32, guard: Option<WorkerGuard>) -> ! {
    drop(guard);
    std::process::exit(code)
}

fn filter() -> EnvFilter {
    if debug_enabled(env::var(DEBUG_LOG_ENV).ok().as_deref()) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn debug_enabled(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "TRUE" | "yes" | "YES"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_accepts_truthy_values() {
        assert!(debug_enabled(Some("1")));
        assert!(debug_enabled(Some("yes")));
        assert!(!debug_enabled(Some("0")));
        assert!(!debug_enabled(None));
    }
}
