//! Patient Sync Core Library
//!
//! Keeps a consolidated patient store in step with two hospital information
//! systems that expose very different change-tracking capabilities.
//!
//! # Architecture
//!
//! ```text
//!   Snapshot source (HTTP pull)          CDC source (tables + change log)
//!            │                                      │
//!     RecordParser                                  │
//!            │                                      │
//!            └──────────► SourceRepository ◄────────┘
//!                              │     ▲
//!                              │     └── Checkpoint (cursor, sync time, processed set)
//!                              ▼
//!                 Transformer → Patient   (EtlService)
//!                              │
//!                              ▼
//!                      TargetRepository   keyed by (hisnumber, source)
//!                              ▲
//!                         SyncDaemon      INITIAL_LOAD / DELTA_SYNC / FULL_SYNC / IDLE_WAIT
//! ```
//!
//! # Modules
//!
//! - [`models`]: Domain types (Patient, raw records, deltas, sync status)
//! - [`connector`]: Connector traits plus SQLite and HTTP implementations
//! - [`parser`]: Snapshot stream to records
//! - [`transform`]: Per-source transformers and value normalizers
//! - [`checkpoint`]: Resumable sync state behind a key/value store
//! - [`repository`]: Source and target repositories
//! - [`etl`]: Record processing and service wiring
//! - [`daemon`]: The sync state machine
//! - [`config`]: TOML configuration

pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod daemon;
pub mod etl;
pub mod models;
pub mod parser;
pub mod repository;
pub mod retry;
pub mod transform;

// Re-export commonly used types
pub use config::{SyncConfig, INITIAL_LOAD_COMPLETION_THRESHOLD};
pub use daemon::{ShutdownToken, SyncDaemon, SyncState};
pub use etl::{create_etl_service, EtlService, SkipReason};
pub use models::{Patient, SourceKind, SyncStatus};

use thiserror::Error;

/// Top-level error for wiring and running a sync.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    UnknownSource(#[from] models::UnknownSource),

    #[error("source {0} is not configured")]
    SourceNotConfigured(SourceKind),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),

    #[error("repository error: {0}")]
    Repository(#[from] repository::RepositoryError),
}
