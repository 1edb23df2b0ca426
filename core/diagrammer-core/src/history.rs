//! Diagram history: a keyed collection of saved diagrams.
//!
//! [`JsonHistoryStore`] keeps one JSON file per record under `history/`,
//! named by the record's ULID. Writes go through a temp file in the same
//! directory and are persisted atomically.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use diagrammer_protocol::{DiagramDraft, DiagramRecord};
use tempfile::NamedTempFile;
use ulid::Ulid;

use crate::error::{LifecycleError, Result};
use crate::storage::StorageConfig;

pub trait HistoryStore: Send + Sync {
    /// All records, most recently updated first.
    fn list(&self) -> Result<Vec<DiagramRecord>>;
    fn get(&self, id: &str) -> Result<DiagramRecord>;
    fn create(&self, draft: DiagramDraft) -> Result<DiagramRecord>;
    fn update(&self, id: &str, draft: DiagramDraft) -> Result<DiagramRecord>;
    fn delete(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct JsonHistoryStore {
    dir: PathBuf,
}

impl JsonHistoryStore {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            dir: storage.history_dir(),
        }
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(LifecycleError::InvalidDiagramId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    fn read_record(&self, path: &Path) -> Result<DiagramRecord> {
        let content = fs_err::read_to_string(path)
            .map_err(|err| LifecycleError::io("Failed to read diagram", err))?;
        serde_json::from_str(&content).map_err(|source| LifecycleError::Json {
            context: format!("parsing {}", path.display()),
            source,
        })
    }

    fn write_record(&self, record: &DiagramRecord) -> Result<()> {
        let path = self.record_path(&record.id)?;
        fs_err::create_dir_all(&self.dir)
            .map_err(|err| LifecycleError::io("Failed to create history directory", err))?;
        let contents = serde_json::to_string_pretty(record).map_err(|source| LifecycleError::Json {
            context: format!("serializing diagram {}", record.id),
            source,
        })?;
        atomic_write(&path, &contents)
    }
}

impl HistoryStore for JsonHistoryStore {
    fn list(&self) -> Result<Vec<DiagramRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs_err::read_dir(&self.dir)
            .map_err(|err| LifecycleError::io("Failed to list history", err))?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| LifecycleError::io("Failed to list history", err))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match self.read_record(&path) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "Skipping unreadable diagram")
                }
            }
        }
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| b.id.cmp(&a.id)));
        Ok(records)
    }

    fn get(&self, id: &str) -> Result<DiagramRecord> {
        let path = self.record_path(id)?;
        if !path.exists() {
            return Err(LifecycleError::DiagramNotFound { id: id.to_string() });
        }
        self.read_record(&path)
    }

    fn create(&self, draft: DiagramDraft) -> Result<DiagramRecord> {
        draft
            .validate()
            .map_err(|info| LifecycleError::InvalidRequest(info.message))?;
        let now = Utc::now();
        let record = DiagramRecord {
            id: Ulid::new().to_string(),
            title: draft.title.trim().to_string(),
            source: draft.source,
            created_at: now,
            updated_at: now,
        };
        self.write_record(&record)?;
        tracing::debug!(id = %record.id, "Saved diagram");
        Ok(record)
    }

    fn update(&self, id: &str, draft: DiagramDraft) -> Result<DiagramRecord> {
        draft
            .validate()
            .map_err(|info| LifecycleError::InvalidRequest(info.message))?;
        let mut record = self.get(id)?;
        record.title = draft.title.trim().to_string();
        record.source = draft.source;
        record.updated_at = Utc::now();
        self.write_record(&record)?;
        Ok(record)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let path = self.record_path(id)?;
        match fs_err::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(LifecycleError::DiagramNotFound { id: id.to_string() })
            }
            Err(err) => Err(LifecycleError::io("Failed to delete diagram", err)),
        }
    }
}

fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| LifecycleError::io(format!("creating temp file in {}", dir.display()), e))?;
    tmp.write_all(contents.as_bytes())
        .map_err(|e| LifecycleError::io(format!("writing temp file for {}", path.display()), e))?;
    tmp.flush()
        .map_err(|e| LifecycleError::io(format!("flushing temp file for {}", path.display()), e))?;
    tmp.persist(path).map_err(|e| {
        LifecycleError::io(format!("persisting temp file to {}", path.display()), e.error)
    })?;
    Ok(())
}
