//! Where per-cycle status documents go.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::models::SyncStatus;

/// Status sink errors.
#[derive(Error, Debug)]
pub enum StatusError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StatusResult<T> = Result<T, StatusError>;

/// Receives one status document per cycle.
pub trait StatusSink: Send {
    fn write(&mut self, status: &SyncStatus) -> StatusResult<()>;
}

/// Pretty JSON file, overwritten every cycle.
#[derive(Debug, Clone)]
pub struct JsonFileStatusSink {
    path: PathBuf,
}

impl JsonFileStatusSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StatusError {
    StatusError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl StatusSink for JsonFileStatusSink {
    fn write(&mut self, status: &SyncStatus) -> StatusResult<()> {
        let json = serde_json::to_string_pretty(status)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))
    }
}

/// Keeps every status in memory (for testing).
#[derive(Debug, Clone, Default)]
pub struct MemoryStatusSink {
    statuses: Arc<Mutex<Vec<SyncStatus>>>,
}

impl MemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, oldest first.
    pub fn statuses(&self) -> Vec<SyncStatus> {
        self.statuses
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl StatusSink for MemoryStatusSink {
    fn write(&mut self, status: &SyncStatus) -> StatusResult<()> {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.push(status.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SourceKind, SyncOperation};

    #[test]
    fn test_json_file_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonFileStatusSink::new(dir.path().join("status/cdc.json"));

        let mut first = SyncStatus::begin(SyncOperation::InitialLoad, SourceKind::Cdc);
        first.inserted = 10;
        first.finish(true, None);
        sink.write(&first).unwrap();

        let mut second = SyncStatus::begin(SyncOperation::DeltaSync, SourceKind::Cdc);
        second.finish(false, Some("source unavailable".into()));
        sink.write(&second).unwrap();

        let text = fs::read_to_string(sink.path()).unwrap();
        let stored: SyncStatus = serde_json::from_str(&text).unwrap();
        assert_eq!(stored, second);
        assert!(text.contains("\"delta_sync\""));
        assert!(!dir.path().join("status/cdc.json.tmp").exists());
    }

    #[test]
    fn test_memory_sink_is_shared_by_clones() {
        let sink = MemoryStatusSink::new();
        let mut writer = sink.clone();
        writer
            .write(&SyncStatus::begin(SyncOperation::Idle, SourceKind::Snapshot))
            .unwrap();
        assert_eq!(sink.statuses().len(), 1);
    }
}
