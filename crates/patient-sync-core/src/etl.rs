//! ETL service: one source repository plus its matching transformer.

use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointResult, FileStateStore, SqliteStateStore, StateStore};
use crate::config::{CdcSourceConfig, SnapshotSourceConfig, StateBackend, StateConfig, SyncConfig};
use crate::connector::{HttpSnapshotConnector, HttpSnapshotSettings, SqliteConnector};
use crate::models::{BusinessUnit, Patient, RawRecord, SourceKind};
use crate::repository::{CdcRepository, CdcSettings, SnapshotRepository, SnapshotSettings, SourceRepository};
use crate::retry::RetryPolicy;
use crate::transform::Transformer;
use crate::SyncError;

/// Why a record was skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The record itself is unusable.
    #[error("bad data: {0}")]
    BadData(String),

    /// The pipeline produced something it never should.
    #[error("internal error: {0}")]
    Defect(String),
}

impl SkipReason {
    pub fn is_defect(&self) -> bool {
        matches!(self, SkipReason::Defect(_))
    }
}

pub struct EtlService {
    repository: SourceRepository,
    transformer: Transformer,
}

impl EtlService {
    /// The transformer is chosen from the repository's kind.
    pub fn new(repository: SourceRepository, businessunit: BusinessUnit) -> Self {
        let transformer = Transformer::for_source(repository.kind(), businessunit);
        Self {
            repository,
            transformer,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.repository.kind()
    }

    pub fn repository(&self) -> &SourceRepository {
        &self.repository
    }

    pub fn repository_mut(&mut self) -> &mut SourceRepository {
        &mut self.repository
    }

    /// Transform and validate one raw record. Failures are logged with the
    /// raw record attached; callers skip the record and continue.
    pub fn process_record(&self, raw: &RawRecord) -> Result<Patient, SkipReason> {
        let Some(transformed) = self.transformer.transform(raw) else {
            let reason = SkipReason::Defect(format!(
                "{} transformer received a record from another source",
                self.transformer.kind()
            ));
            error!(?raw, reason = %reason, "Record skipped");
            return Err(reason);
        };

        Patient::new(transformed).map_err(|e| {
            if e.is_defect() {
                let reason = SkipReason::Defect(e.to_string());
                error!(?raw, reason = %reason, "Record skipped");
                reason
            } else {
                let reason = SkipReason::BadData(e.to_string());
                warn!(?raw, reason = %reason, "Record skipped");
                reason
            }
        })
    }
}

/// Open the configured checkpoint backend.
pub fn open_state_store(config: &StateConfig) -> CheckpointResult<Box<dyn StateStore>> {
    Ok(match config.backend {
        StateBackend::File => Box::new(FileStateStore::new(&config.path)),
        StateBackend::Sqlite => {
            if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| {
                    crate::checkpoint::CheckpointError::Io {
                        path: parent.display().to_string(),
                        source,
                    }
                })?;
            }
            Box::new(SqliteStateStore::open(&config.path)?)
        }
    })
}

fn snapshot_repository(source: &SnapshotSourceConfig, checkpoint: Checkpoint) -> SourceRepository {
    let fetcher = HttpSnapshotConnector::new(HttpSnapshotSettings {
        url: source.url.clone(),
        connect_timeout: Duration::from_secs(source.connect_timeout_secs),
        read_timeout: Duration::from_secs(source.read_timeout_secs),
        attempts: source.attempts,
        retry_delay: Duration::from_secs(source.retry_delay_secs),
    });
    let settings = SnapshotSettings {
        delimiter: source.delimiter,
        cache_ttl: Duration::from_secs(source.cache_ttl_secs),
    };
    SourceRepository::Snapshot(SnapshotRepository::new(Box::new(fetcher), checkpoint, settings))
}

fn cdc_repository(source: &CdcSourceConfig, checkpoint: Checkpoint) -> SourceRepository {
    let settings = CdcSettings {
        patients_table: source.patients_table.clone(),
        delta_table: source.delta_table.clone(),
        mark_chunk_size: source.mark_chunk_size,
        mark_retry: RetryPolicy {
            max_attempts: source.mark_retry_attempts,
            initial_delay: Duration::from_millis(source.mark_retry_delay_ms),
            ..RetryPolicy::lock_conflict()
        },
    };
    let connector = SqliteConnector::open(&source.sqlite_path);
    SourceRepository::Cdc(CdcRepository::new(Box::new(connector), checkpoint, settings))
}

/// Build the ETL service for a named source (`snapshot` or `cdc`).
pub fn create_etl_service(source_name: &str, config: &SyncConfig) -> Result<EtlService, SyncError> {
    let kind: SourceKind = source_name.parse()?;
    let checkpoint = Checkpoint::new(kind, open_state_store(&config.state)?);

    let (repository, businessunit) = match kind {
        SourceKind::Snapshot => {
            let source = config
                .sources
                .snapshot
                .as_ref()
                .ok_or(SyncError::SourceNotConfigured(kind))?;
            (snapshot_repository(source, checkpoint), source.businessunit)
        }
        SourceKind::Cdc => {
            let source = config
                .sources
                .cdc
                .as_ref()
                .ok_or(SyncError::SourceNotConfigured(kind))?;
            (cdc_repository(source, checkpoint), source.businessunit)
        }
    };

    info!(source = %kind, businessunit = businessunit.code(), "ETL service created");
    Ok(EtlService::new(repository, businessunit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryStateStore;
    use crate::connector::SqlValue;
    use crate::models::{CdcRow, SnapshotRecord};

    fn cdc_service() -> EtlService {
        let checkpoint = Checkpoint::new(SourceKind::Cdc, Box::new(MemoryStateStore::new()));
        let repo = CdcRepository::new(
            Box::new(SqliteConnector::in_memory()),
            checkpoint,
            CdcSettings::default(),
        );
        EtlService::new(SourceRepository::Cdc(repo), BusinessUnit::Outpatient)
    }

    #[test]
    fn test_process_cdc_record() {
        let service = cdc_service();
        let mut row = CdcRow::default();
        row.insert("patient_id", SqlValue::Integer(501));
        row.insert("lastname", "Orlova".into());
        row.insert("birthdate", "15.03.1990".into());
        row.insert("phone", "89991234567".into());

        let patient = service.process_record(&RawRecord::Cdc(row)).unwrap();
        assert_eq!(patient.hisnumber(), "501");
        assert_eq!(patient.source(), SourceKind::Cdc);
        assert_eq!(patient.businessunit(), BusinessUnit::Outpatient);
        assert_eq!(patient.telephone(), Some("79991234567"));
    }

    #[test]
    fn test_record_from_other_source_is_a_defect() {
        let service = cdc_service();
        let raw = RawRecord::Snapshot(SnapshotRecord::default());
        assert!(service.process_record(&raw).unwrap_err().is_defect());
    }

    #[test]
    fn test_missing_id_is_bad_data() {
        let service = cdc_service();
        let err = service.process_record(&RawRecord::Cdc(CdcRow::default())).unwrap_err();
        assert!(matches!(err, SkipReason::BadData(_)));
    }

    #[test]
    fn test_unknown_business_unit_is_recovered() {
        let service = cdc_service();
        let mut row = CdcRow::default();
        row.insert("patient_id", SqlValue::Integer(77));
        row.insert("businessunit", SqlValue::Integer(0));

        let patient = service.process_record(&RawRecord::Cdc(row)).unwrap();
        assert_eq!(patient.hisnumber(), "77");
        assert_eq!(patient.businessunit(), BusinessUnit::Outpatient);
    }

    #[test]
    fn test_create_etl_service() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::default();
        config.state.path = dir.path().join("state");

        assert!(matches!(
            create_etl_service("legacy", &config),
            Err(SyncError::UnknownSource(_))
        ));
        assert!(matches!(
            create_etl_service("cdc", &config),
            Err(SyncError::SourceNotConfigured(SourceKind::Cdc))
        ));

        config.sources.cdc = Some(CdcSourceConfig::new(dir.path().join("his.db")));
        let service = create_etl_service("cdc", &config).unwrap();
        assert_eq!(service.kind(), SourceKind::Cdc);

        config.sources.snapshot = Some(SnapshotSourceConfig::new("http://127.0.0.1:1/patients"));
        let service = create_etl_service("snapshot", &config).unwrap();
        assert_eq!(service.kind(), SourceKind::Snapshot);
    }
}
