//! Starting the backend as an independent process.
//!
//! The backend must outlive the MCP client that started it: other clients may
//! already be using it. It runs in its own session with null stdio and is
//! never killed from here; a background thread only reaps it.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use diagrammer_core::{LifecycleError, Result};
use tracing::{debug, info, warn};

pub const BACKEND_BIN_ENV: &str = "DIAGRAMMER_BACKEND_BIN";
const BACKEND_BIN_NAME: &str = "diagrammer-backend";

pub trait Launcher: Send + Sync {
    fn launch(&self, port: u16) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct DetachedLauncher {
    binary: Option<PathBuf>,
    config: Option<PathBuf>,
}

impl DetachedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: PathBuf) -> Self {
        self.binary = Some(binary);
        self
    }

    /// Forwarded as `--config` so both processes read the same file.
    pub fn with_config(mut self, config: PathBuf) -> Self {
        self.config = Some(config);
        self
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        if let Some(binary) = &self.binary {
            return Ok(binary.clone());
        }
        if let Some(binary) = std::env::var_os(BACKEND_BIN_ENV).filter(|value| !value.is_empty()) {
            return Ok(PathBuf::from(binary));
        }
        if let Some(sibling) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(BACKEND_BIN_NAME)))
            .filter(|path| path.is_file())
        {
            return Ok(sibling);
        }
        find_in_path(BACKEND_BIN_NAME)
            .ok_or_else(|| LifecycleError::BackendBinaryNotFound(BACKEND_BIN_NAME.to_string()))
    }
}

impl Launcher for DetachedLauncher {
    fn launch(&self, port: u16) -> Result<()> {
        let binary = self.resolve_binary()?;
        let mut cmd = Command::new(&binary);
        cmd.arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(config) = &self.config {
            cmd.arg("--config").arg(config);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| LifecycleError::Spawn {
            command: binary.display().to_string(),
            source,
        })?;
        let pid = child.id();
        info!(pid, port, binary = %binary.display(), "Spawned backend");

        let reaper = std::thread::Builder::new()
            .name("backend-reaper".to_string())
            .spawn(move || match child.wait() {
                Ok(status) => debug!(pid, %status, "Backend process exited"),
                Err(err) => warn!(pid, error = %err, "Failed to reap backend process"),
            });
        if let Err(err) = reaper {
            warn!(pid, error = %err, "Failed to start reaper thread");
        }
        Ok(())
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let launcher =
            DetachedLauncher::new().with_binary(PathBuf::from("/nonexistent/diagrammer-backend"));
        let err = launcher.launch(3737).unwrap_err();
        assert!(matches!(err, LifecycleError::Spawn { .. }));
        assert_eq!(err.classify(), diagrammer_core::ErrorClass::Spawn);
    }

    #[cfg(unix)]
    #[test]
    fn launches_detached_child() {
        let temp = tempfile::TempDir::new().unwrap();
        let marker = temp.path().join("started");
        let script = temp.path().join("fake-backend");
        fs_err::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" > '{}'\n", marker.display()),
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            fs_err::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        DetachedLauncher::new()
            .with_binary(script)
            .launch(4242)
            .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut args = String::new();
        while args.trim().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
            args = std::fs::read_to_string(&marker).unwrap_or_default();
        }
        assert_eq!(args.trim(), "--port 4242");
    }
}
