//! Repositories over the two sources and the consolidated store.

mod cdc;
mod schema;
mod snapshot;
mod target;

pub use cdc::*;
pub use schema::*;
pub use snapshot::*;
pub use target::*;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::checkpoint::{CheckpointError, CheckpointResult};
use crate::connector::{Connector, ConnectorError};
use crate::models::{DeltaRecord, RawRecord, SourceKind};

/// Repository errors.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("could not connect to {0}")]
    ConnectFailed(String),

    #[error("{operation} is not supported by the {kind} source")]
    Unsupported {
        operation: &'static str,
        kind: SourceKind,
    },
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Open the connection if it is not open yet.
pub(crate) fn ensure_connected(connector: &mut dyn Connector, name: &str) -> RepositoryResult<()> {
    if connector.is_connected() || connector.connect() {
        Ok(())
    } else {
        Err(RepositoryError::ConnectFailed(name.to_string()))
    }
}

/// Closed set of source repositories.
pub enum SourceRepository {
    Snapshot(SnapshotRepository),
    Cdc(CdcRepository),
}

impl SourceRepository {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceRepository::Snapshot(_) => SourceKind::Snapshot,
            SourceRepository::Cdc(_) => SourceKind::Cdc,
        }
    }

    /// Next batch of not-yet-delivered records, ascending by id.
    pub fn get_patients(&mut self, batch_size: usize) -> RepositoryResult<Vec<RawRecord>> {
        match self {
            SourceRepository::Snapshot(repo) => repo.get_patients(batch_size),
            SourceRepository::Cdc(repo) => repo.get_patients(batch_size),
        }
    }

    /// Unprocessed change rows, deduplicated and marked processed.
    pub fn get_patient_deltas(&mut self, batch_size: usize) -> RepositoryResult<Vec<DeltaRecord>> {
        match self {
            SourceRepository::Cdc(repo) => repo.get_patient_deltas(batch_size),
            SourceRepository::Snapshot(_) => Err(RepositoryError::Unsupported {
                operation: "delta sync",
                kind: SourceKind::Snapshot,
            }),
        }
    }

    pub fn get_total_patient_count(&mut self) -> RepositoryResult<u64> {
        match self {
            SourceRepository::Snapshot(repo) => repo.get_total_patient_count(),
            SourceRepository::Cdc(repo) => repo.get_total_patient_count(),
        }
    }

    /// Current cursor; checkpoint read failures are logged and read as absent.
    pub fn last_processed_key(&self) -> Option<String> {
        let result = match self {
            SourceRepository::Snapshot(repo) => repo.checkpoint().last_processed_key(),
            SourceRepository::Cdc(repo) => repo.checkpoint().last_processed_key(),
        };
        result.unwrap_or_else(|e| {
            warn!(source = %self.kind(), error = %e, "Failed to read checkpoint");
            None
        })
    }

    /// Record a delivered batch. The cursor moves to the batch maximum.
    pub fn save_last_processed(&mut self, keys: &[String]) -> CheckpointResult<()> {
        match self {
            SourceRepository::Snapshot(repo) => repo.save_last_processed(keys),
            SourceRepository::Cdc(repo) => repo.save_last_processed(keys),
        }
    }

    /// Step a numeric cursor by one to bridge an id gap.
    ///
    /// Returns `false` when the cursor is not numeric or cannot be saved.
    pub fn advance_past_gap(&mut self) -> bool {
        let current = self.last_processed_key().unwrap_or_else(|| "0".to_string());
        let Ok(value) = current.parse::<i64>() else {
            debug!(source = %self.kind(), cursor = %current, "Cursor is not numeric, not stepping");
            return false;
        };
        let next = (value + 1).to_string();
        let result = match self {
            SourceRepository::Snapshot(repo) => repo.checkpoint_mut().save_last_processed_key(&next),
            SourceRepository::Cdc(repo) => repo.checkpoint_mut().save_last_processed_key(&next),
        };
        match result {
            Ok(()) => {
                debug!(source = %self.kind(), from = value, to = %next, "Stepped cursor past gap");
                true
            }
            Err(e) => {
                warn!(source = %self.kind(), error = %e, "Failed to step cursor");
                false
            }
        }
    }

    pub fn get_last_sync_time(&self) -> CheckpointResult<Option<DateTime<Utc>>> {
        match self {
            SourceRepository::Snapshot(repo) => repo.checkpoint().last_sync_time(),
            SourceRepository::Cdc(repo) => repo.checkpoint().last_sync_time(),
        }
    }

    pub fn save_last_sync_time(&mut self, time: DateTime<Utc>) -> CheckpointResult<()> {
        match self {
            SourceRepository::Snapshot(repo) => repo.checkpoint_mut().save_last_sync_time(time),
            SourceRepository::Cdc(repo) => repo.checkpoint_mut().save_last_sync_time(time),
        }
    }

    /// Prepare for a pass over the whole population (snapshot full sync).
    pub fn begin_full_pass(&mut self) {
        if let SourceRepository::Snapshot(repo) = self {
            repo.begin_full_pass();
        }
    }

    pub fn disconnect(&mut self) {
        if let SourceRepository::Cdc(repo) = self {
            repo.disconnect();
        }
    }
}
