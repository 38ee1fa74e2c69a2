//! Daemon configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration that syncs nothing until a source section is filled in.
//!
//! # Structure
//!
//! ```text
//! SyncConfig
//! ├── daemon: DaemonConfig        # batch size, idle interval, thresholds
//! ├── state: StateConfig          # checkpoint backend
//! ├── status: StatusConfig        # per-cycle JSON status file
//! ├── target: TargetConfig        # consolidated store
//! └── sources
//!     ├── snapshot: SnapshotSourceConfig
//!     └── cdc: CdcSourceConfig
//! ```
//!
//! # Example
//!
//! ```toml
//! [daemon]
//! batch_size = 500
//! idle_interval_secs = 120
//!
//! [state]
//! backend = "file"
//! path = "/var/lib/patient-sync/state"
//!
//! [target]
//! sqlite_path = "/var/lib/patient-sync/patients.db"
//!
//! [sources.snapshot]
//! url = "http://his-legacy.internal/export/patients"
//! businessunit = 2
//!
//! [sources.cdc]
//! sqlite_path = "/var/lib/his/his.db"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::BusinessUnit;
use crate::parser::DEFAULT_DELIMITER;
use crate::repository::DEFAULT_MARK_CHUNK_SIZE;

/// Share of the source population that must be in the target before the
/// initial load counts as complete.
pub const INITIAL_LOAD_COMPLETION_THRESHOLD: f64 = 0.95;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

impl SyncConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: SyncConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let d = &self.daemon;
        if d.batch_size == 0 {
            return Err(ConfigError::Invalid("daemon.batch_size must be positive".into()));
        }
        if !(d.completion_threshold > 0.0 && d.completion_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "daemon.completion_threshold must be in (0, 1], got {}",
                d.completion_threshold
            )));
        }
        if d.max_empty_batches == 0 {
            return Err(ConfigError::Invalid("daemon.max_empty_batches must be positive".into()));
        }
        if let Some(snapshot) = &self.sources.snapshot {
            if snapshot.url.trim().is_empty() {
                return Err(ConfigError::Invalid("sources.snapshot.url is empty".into()));
            }
            if snapshot.attempts == 0 {
                return Err(ConfigError::Invalid("sources.snapshot.attempts must be positive".into()));
            }
        }
        if let Some(cdc) = &self.sources.cdc {
            if cdc.mark_chunk_size == 0 {
                return Err(ConfigError::Invalid("sources.cdc.mark_chunk_size must be positive".into()));
            }
            if cdc.mark_retry_attempts == 0 {
                return Err(ConfigError::Invalid(
                    "sources.cdc.mark_retry_attempts must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

fn default_batch_size() -> usize {
    1000
}
fn default_idle_interval_secs() -> u64 {
    60
}
fn default_completion_threshold() -> f64 {
    INITIAL_LOAD_COMPLETION_THRESHOLD
}
fn default_max_empty_batches() -> u32 {
    3
}
fn default_progress_every() -> u32 {
    5
}

/// Sync loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sleep between cycles.
    #[serde(default = "default_idle_interval_secs")]
    pub idle_interval_secs: u64,

    /// `dest / source` ratio at which the initial load is complete.
    #[serde(default = "default_completion_threshold")]
    pub completion_threshold: f64,

    /// Consecutive empty batches before an initial load gives up for the cycle.
    #[serde(default = "default_max_empty_batches")]
    pub max_empty_batches: u32,

    /// Log completion progress every N batches.
    #[serde(default = "default_progress_every")]
    pub progress_every: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            idle_interval_secs: default_idle_interval_secs(),
            completion_threshold: default_completion_threshold(),
            max_empty_batches: default_max_empty_batches(),
            progress_every: default_progress_every(),
        }
    }
}

impl DaemonConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    File,
    Sqlite,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state")
}

/// Checkpoint persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackend,

    /// Directory for the file backend, database file for the SQLite backend.
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            path: default_state_path(),
        }
    }
}

/// Per-cycle status document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusConfig {
    /// `None` disables the status file.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_target_path() -> PathBuf {
    PathBuf::from("patients.db")
}

/// Consolidated store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_target_path")]
    pub sqlite_path: PathBuf,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_target_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub snapshot: Option<SnapshotSourceConfig>,
    #[serde(default)]
    pub cdc: Option<CdcSourceConfig>,
}

fn default_delimiter() -> char {
    DEFAULT_DELIMITER
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_read_timeout_secs() -> u64 {
    300
}
fn default_snapshot_attempts() -> u32 {
    2
}
fn default_snapshot_retry_delay_secs() -> u64 {
    60
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_businessunit() -> BusinessUnit {
    BusinessUnit::Hospital
}

/// HTTP snapshot source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSourceConfig {
    pub url: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_snapshot_attempts")]
    pub attempts: u32,
    #[serde(default = "default_snapshot_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// How long a fetched population is reused.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_businessunit")]
    pub businessunit: BusinessUnit,
}

impl SnapshotSourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            delimiter: default_delimiter(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            attempts: default_snapshot_attempts(),
            retry_delay_secs: default_snapshot_retry_delay_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            businessunit: default_businessunit(),
        }
    }
}

fn default_patients_table() -> String {
    "patients".to_string()
}
fn default_delta_table() -> String {
    "patient_delta".to_string()
}
fn default_mark_chunk_size() -> usize {
    DEFAULT_MARK_CHUNK_SIZE
}
fn default_mark_retry_attempts() -> u32 {
    3
}
fn default_mark_retry_delay_ms() -> u64 {
    1000
}

/// Relational CDC source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcSourceConfig {
    pub sqlite_path: PathBuf,
    #[serde(default = "default_patients_table")]
    pub patients_table: String,
    #[serde(default = "default_delta_table")]
    pub delta_table: String,
    #[serde(default = "default_businessunit")]
    pub businessunit: BusinessUnit,
    #[serde(default = "default_mark_chunk_size")]
    pub mark_chunk_size: usize,
    #[serde(default = "default_mark_retry_attempts")]
    pub mark_retry_attempts: u32,
    /// First backoff delay; later attempts double it.
    #[serde(default = "default_mark_retry_delay_ms")]
    pub mark_retry_delay_ms: u64,
}

impl CdcSourceConfig {
    pub fn new(sqlite_path: impl Into<PathBuf>) -> Self {
        Self {
            sqlite_path: sqlite_path.into(),
            patients_table: default_patients_table(),
            delta_table: default_delta_table(),
            businessunit: default_businessunit(),
            mark_chunk_size: default_mark_chunk_size(),
            mark_retry_attempts: default_mark_retry_attempts(),
            mark_retry_delay_ms: default_mark_retry_delay_ms(),
        }
    }
}
