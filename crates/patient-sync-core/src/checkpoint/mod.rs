//! Checkpoint persistence.
//!
//! Checkpoints are plain key/value strings behind [`StateStore`]; the file,
//! SQLite and in-memory backends are interchangeable. A missing key means
//! "never run", not an error.

mod file;
mod sqlite;

pub use file::*;
pub use sqlite::*;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::SourceKind;

/// Checkpoint store errors.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid checkpoint key: {0}")]
    InvalidKey(String),
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Minimal key/value persistence for checkpoints.
pub trait StateStore: Send {
    fn get(&self, key: &str) -> CheckpointResult<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> CheckpointResult<()>;

    fn remove(&mut self, key: &str) -> CheckpointResult<()>;
}

/// In-memory store (for testing).
#[derive(Debug, Default, Clone)]
pub struct MemoryStateStore {
    values: HashMap<String, String>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> CheckpointResult<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> CheckpointResult<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> CheckpointResult<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// Per-source view over a [`StateStore`].
pub struct Checkpoint {
    source: SourceKind,
    store: Box<dyn StateStore>,
}

impl Checkpoint {
    pub fn new(source: SourceKind, store: Box<dyn StateStore>) -> Self {
        Self { source, store }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}_{}", self.source.name(), suffix)
    }

    /// Last delivered source identifier.
    pub fn last_processed_key(&self) -> CheckpointResult<Option<String>> {
        Ok(self
            .store
            .get(&self.key("last_processed_id"))?
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()))
    }

    pub fn save_last_processed_key(&mut self, key: &str) -> CheckpointResult<()> {
        let k = self.key("last_processed_id");
        self.store.set(&k, key)
    }

    /// Time of the last successful incremental cycle; unparseable values read as absent.
    pub fn last_sync_time(&self) -> CheckpointResult<Option<DateTime<Utc>>> {
        let raw = self.store.get(&self.key("last_sync_time"))?;
        Ok(raw.and_then(|v| {
            DateTime::parse_from_rfc3339(v.trim())
                .ok()
                .map(|t| t.with_timezone(&Utc))
        }))
    }

    pub fn save_last_sync_time(&mut self, time: DateTime<Utc>) -> CheckpointResult<()> {
        let k = self.key("last_sync_time");
        self.store.set(&k, &time.to_rfc3339())
    }

    /// Identifiers already delivered (snapshot source only).
    pub fn processed_set(&self) -> CheckpointResult<BTreeSet<String>> {
        let raw = self.store.get(&self.key("processed_ids"))?;
        Ok(raw
            .map(|v| {
                v.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn save_processed_set(&mut self, ids: &BTreeSet<String>) -> CheckpointResult<()> {
        let k = self.key("processed_ids");
        let value = ids.iter().cloned().collect::<Vec<_>>().join("\n");
        self.store.set(&k, &value)
    }

    pub fn clear_processed_set(&mut self) -> CheckpointResult<()> {
        let k = self.key("processed_ids");
        self.store.remove(&k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_means_never_run() {
        let cp = Checkpoint::new(SourceKind::Cdc, Box::new(MemoryStateStore::new()));
        assert_eq!(cp.last_processed_key().unwrap(), None);
        assert_eq!(cp.last_sync_time().unwrap(), None);
        assert!(cp.processed_set().unwrap().is_empty());
    }

    #[test]
    fn test_round_trip() {
        let mut cp = Checkpoint::new(SourceKind::Snapshot, Box::new(MemoryStateStore::new()));
        cp.save_last_processed_key("42/A").unwrap();
        assert_eq!(cp.last_processed_key().unwrap(), Some("42/A".into()));

        let now = Utc::now();
        cp.save_last_sync_time(now).unwrap();
        let read = cp.last_sync_time().unwrap().unwrap();
        assert_eq!(read.timestamp(), now.timestamp());

        let ids: BTreeSet<String> = ["1/A", "2/B"].iter().map(|s| s.to_string()).collect();
        cp.save_processed_set(&ids).unwrap();
        assert_eq!(cp.processed_set().unwrap(), ids);

        cp.clear_processed_set().unwrap();
        assert!(cp.processed_set().unwrap().is_empty());
    }

    #[test]
    fn test_garbage_sync_time_reads_as_absent() {
        let mut store = MemoryStateStore::new();
        store.set("cdc_last_sync_time", "yesterday").unwrap();
        let cp = Checkpoint::new(SourceKind::Cdc, Box::new(store));
        assert_eq!(cp.last_sync_time().unwrap(), None);
    }
}
