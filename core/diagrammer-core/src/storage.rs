//! Storage paths for diagrammer data.
//!
//! Every process resolves its files through `StorageConfig` so tests can point
//! the whole tree at a temporary directory with [`StorageConfig::with_root`].
//!
//! Layout under the root (default `~/.diagrammer`, or `$DIAGRAMMER_HOME`):
//!
//! ```text
//! config.toml
//! history/<ulid>.json
//! logs/<component>.log.<date>
//! ```

use std::path::{Path, PathBuf};

use crate::error::{LifecycleError, Result};

pub const HOME_ENV: &str = "DIAGRAMMER_HOME";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl StorageConfig {
    /// Resolves the root from `DIAGRAMMER_HOME`, falling back to
    /// `~/.diagrammer`.
    pub fn from_env() -> Result<Self> {
        if let Some(root) = std::env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self::with_root(PathBuf::from(root)));
        }
        let home = dirs::home_dir().ok_or(LifecycleError::HomeNotFound)?;
        Ok(Self::with_root(home.join(".diagrammer")))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Path to a single diagram record.
    pub fn diagram_file(&self, id: &str) -> PathBuf {
        self.history_dir().join(format!("{}.json", id))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.history_dir(), self.logs_dir()] {
            fs_err::create_dir_all(&dir)
                .map_err(|err| LifecycleError::io("Failed to create storage directory", err))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn paths_hang_off_root() {
        let storage = StorageConfig::with_root(PathBuf::from("/tmp/diagrammer-test"));
        assert_eq!(
            storage.config_file(),
            PathBuf::from("/tmp/diagrammer-test/config.toml")
        );
        assert_eq!(
            storage.diagram_file("01ABC"),
            PathBuf::from("/tmp/diagrammer-test/history/01ABC.json")
        );
        assert_eq!(storage.logs_dir(), PathBuf::from("/tmp/diagrammer-test/logs"));
    }

    #[test]
    fn ensure_dirs_creates_layout() {
        let temp = TempDir::new().unwrap();
        let storage = StorageConfig::with_root(temp.path().join("root"));
        storage.ensure_dirs().unwrap();
        assert!(storage.history_dir().is_dir());
        assert!(storage.logs_dir().is_dir());
    }
}
