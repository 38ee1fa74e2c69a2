//! Sync daemon state machine.
//!
//! One daemon drives one source:
//!
//! ```text
//! decide ─┬─ ratio < threshold ──────────────────► INITIAL_LOAD ─┐
//!         ├─ ratio ≥ threshold, timestamp saved ─► DELTA_SYNC    ├─► sleep ─► decide
//!         │                                        or FULL_SYNC  │
//!         └─ ratio ≥ threshold, no timestamp ────► IDLE_WAIT ────┘
//! ```
//!
//! `DELTA_SYNC` is taken by CDC sources and `FULL_SYNC` by snapshot sources.
//!
//! Everything is sequential and blocking. Shutdown is polled between records,
//! between batches and during the idle sleep.

mod shutdown;
mod status;

pub use shutdown::*;
pub use status::*;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::{DaemonConfig, SyncConfig};
use crate::connector::SqliteConnector;
use crate::etl::{create_etl_service, EtlService, SkipReason};
use crate::models::{CompletionCheck, DeltaOperation, RawRecord, SourceKind, SyncOperation, SyncStatus};
use crate::repository::{TargetRepository, UpsertOutcome};
use crate::SyncError;

/// Which step the next cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    InitialLoad,
    /// CDC sources only
    DeltaSync,
    /// Snapshot sources only; every cycle re-walks the full population
    FullSync,
    IdleWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    /// Existing keys are left alone.
    Insert,
    Upsert,
}

pub struct SyncDaemon {
    etl: EtlService,
    target: TargetRepository,
    status_sink: Option<Box<dyn StatusSink>>,
    settings: DaemonConfig,
    shutdown: ShutdownToken,
}

impl SyncDaemon {
    pub fn new(
        etl: EtlService,
        target: TargetRepository,
        settings: DaemonConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            etl,
            target,
            status_sink: None,
            settings,
            shutdown,
        }
    }

    pub fn with_status_sink(mut self, sink: Box<dyn StatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    /// Wire a daemon for one named source from configuration.
    pub fn from_config(
        source_name: &str,
        config: &SyncConfig,
        shutdown: ShutdownToken,
    ) -> Result<Self, SyncError> {
        let etl = create_etl_service(source_name, config)?;
        let target = TargetRepository::new(Box::new(SqliteConnector::open(&config.target.sqlite_path)))?;
        let daemon = Self::new(etl, target, config.daemon.clone(), shutdown);
        Ok(match &config.status.path {
            Some(path) => daemon.with_status_sink(Box::new(JsonFileStatusSink::new(path))),
            None => daemon,
        })
    }

    pub fn kind(&self) -> SourceKind {
        self.etl.kind()
    }

    pub fn target_mut(&mut self) -> &mut TargetRepository {
        &mut self.target
    }

    /// Compare the target population for this source with the source's.
    pub fn check_initial_load_complete(&mut self) -> Result<CompletionCheck, SyncError> {
        let kind = self.kind();
        let source_count = self.etl.repository_mut().get_total_patient_count()?;
        let dest_count = self.target.count_patients(kind)?;
        let check = CompletionCheck::compute(source_count, dest_count, self.settings.completion_threshold);
        debug!(
            source = %kind,
            source_count,
            dest_count,
            ratio = check.ratio,
            complete = check.complete,
            "Completion check"
        );
        Ok(check)
    }

    /// Decide what this cycle does.
    pub fn next_state(&mut self) -> Result<SyncState, SyncError> {
        let check = self.check_initial_load_complete()?;
        if !check.complete {
            return Ok(SyncState::InitialLoad);
        }

        let kind = self.kind();
        let last_sync = self.etl.repository().get_last_sync_time().unwrap_or_else(|e| {
            warn!(source = %kind, error = %e, "Failed to read last sync time");
            None
        });
        if last_sync.is_some() {
            return Ok(match kind {
                SourceKind::Cdc => SyncState::DeltaSync,
                SourceKind::Snapshot => SyncState::FullSync,
            });
        }

        // Loaded but never synced, e.g. a deployment that predates timestamps.
        info!(source = %kind, ratio = check.ratio, "Initial load complete, recording first sync time");
        if let Err(e) = self.etl.repository_mut().save_last_sync_time(Utc::now()) {
            warn!(source = %kind, error = %e, "Failed to save sync time");
        }
        Ok(SyncState::IdleWait)
    }

    pub fn perform_initial_load(&mut self) -> SyncStatus {
        let mut status = SyncStatus::begin(SyncOperation::InitialLoad, self.kind());
        info!(source = %self.kind(), "Starting initial load");
        let result = self.load_batches(&mut status, LoadMode::Insert);

        match self.check_initial_load_complete() {
            Ok(check) => {
                status.record_completion(&check);
                info!(
                    source = %self.kind(),
                    ratio = check.ratio,
                    complete = check.complete,
                    "Initial load pass finished"
                );
            }
            Err(e) => warn!(source = %self.kind(), error = %e, "Completion check failed"),
        }
        self.finish(status, result)
    }

    pub fn perform_full_sync(&mut self) -> SyncStatus {
        let mut status = SyncStatus::begin(SyncOperation::FullSync, self.kind());
        info!(source = %self.kind(), "Starting full sync");
        self.etl.repository_mut().begin_full_pass();
        let result = self.load_batches(&mut status, LoadMode::Upsert);
        if result.is_ok() && status.errors == 0 && !self.shutdown.is_triggered() {
            self.save_sync_time();
        }
        self.finish(status, result)
    }

    pub fn perform_delta_sync(&mut self) -> SyncStatus {
        let mut status = SyncStatus::begin(SyncOperation::DeltaSync, self.kind());
        let result = self.apply_deltas(&mut status);
        if result.is_ok() && status.errors == 0 && !self.shutdown.is_triggered() {
            self.save_sync_time();
        }
        self.finish(status, result)
    }

    /// Run one cycle and publish its status.
    pub fn run_cycle(&mut self) -> SyncStatus {
        let status = match self.next_state() {
            Ok(SyncState::InitialLoad) => self.perform_initial_load(),
            Ok(SyncState::DeltaSync) => self.perform_delta_sync(),
            Ok(SyncState::FullSync) => self.perform_full_sync(),
            Ok(SyncState::IdleWait) => {
                let mut status = SyncStatus::begin(SyncOperation::Idle, self.kind());
                status.finish(true, Some("sync time recorded".to_string()));
                status
            }
            Err(e) => {
                warn!(source = %self.kind(), error = %e, "Could not determine sync state");
                let mut status = SyncStatus::begin(SyncOperation::Idle, self.kind());
                status.finish(false, Some(e.to_string()));
                status
            }
        };

        if let Some(sink) = self.status_sink.as_mut() {
            if let Err(e) = sink.write(&status) {
                warn!(error = %e, "Failed to write status");
            }
        }
        status
    }

    /// Cycle until shutdown, sleeping the idle interval between cycles.
    pub fn run(&mut self) {
        info!(source = %self.kind(), "Sync daemon started");
        while !self.shutdown.is_triggered() {
            let status = self.run_cycle();
            info!(
                source = %self.kind(),
                operation = ?status.operation,
                success = status.success,
                processed = status.processed,
                errors = status.errors,
                duration_secs = status.duration_secs,
                "Cycle finished"
            );
            self.shutdown.sleep(self.settings.idle_interval());
        }
        self.etl.repository_mut().disconnect();
        self.target.disconnect();
        info!(source = %self.kind(), "Sync daemon stopped");
    }

    fn finish(&self, mut status: SyncStatus, result: Result<(), SyncError>) -> SyncStatus {
        match result {
            Ok(()) if self.shutdown.is_triggered() => status.finish(false, Some("interrupted".into())),
            Ok(()) => status.finish(status.errors == 0, None),
            Err(e) => {
                error!(source = %self.kind(), operation = ?status.operation, error = %e, "Sync step failed");
                status.finish(false, Some(e.to_string()));
            }
        }
        status
    }

    fn save_sync_time(&mut self) {
        if let Err(e) = self.etl.repository_mut().save_last_sync_time(Utc::now()) {
            warn!(source = %self.kind(), error = %e, "Failed to save sync time");
        }
    }

    fn count_skip(status: &mut SyncStatus, reason: &SkipReason) {
        if reason.is_defect() {
            status.errors += 1;
        } else {
            status.skipped += 1;
        }
    }

    fn count_upsert(status: &mut SyncStatus, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => status.inserted += 1,
            UpsertOutcome::Updated => status.updated += 1,
            UpsertOutcome::Unchanged => status.unchanged += 1,
        }
    }

    /// Batch loop shared by initial load and full sync.
    ///
    /// A target write failure stops the loop after checkpointing the records
    /// already written.
    fn load_batches(&mut self, status: &mut SyncStatus, mode: LoadMode) -> Result<(), SyncError> {
        let kind = self.kind();
        let batch_size = self.settings.batch_size;
        let mut empty_streak = 0u32;

        while !self.shutdown.is_triggered() {
            let batch = self.etl.repository_mut().get_patients(batch_size)?;

            if batch.is_empty() {
                empty_streak += 1;
                if empty_streak >= self.settings.max_empty_batches {
                    debug!(source = %kind, empty_streak, "No more records");
                    break;
                }
                self.etl.repository_mut().advance_past_gap();
                continue;
            }
            empty_streak = 0;
            status.batches += 1;
            status.fetched += batch.len() as u64;

            let mut keys = Vec::with_capacity(batch.len());
            let mut write_error = None;
            for raw in &batch {
                if self.shutdown.is_triggered() {
                    break;
                }
                match self.load_record(raw, mode, status) {
                    Ok(()) => {}
                    Err(e) => {
                        write_error = Some(e);
                        break;
                    }
                }
                if let Some(key) = raw.key() {
                    keys.push(key);
                }
            }

            if let Err(e) = self.etl.repository_mut().save_last_processed(&keys) {
                warn!(source = %kind, error = %e, "Failed to save checkpoint");
            }
            if let Some(e) = write_error {
                return Err(e);
            }

            let near_end = batch.len() < batch_size;
            let every = u64::from(self.settings.progress_every.max(1));
            if mode == LoadMode::Insert && (near_end || status.batches % every == 0) {
                match self.check_initial_load_complete() {
                    Ok(check) => {
                        status.record_completion(&check);
                        info!(
                            source = %kind,
                            batches = status.batches,
                            processed = status.processed,
                            ratio = check.ratio,
                            "Initial load progress"
                        );
                    }
                    Err(e) => warn!(source = %kind, error = %e, "Completion check failed"),
                }
            } else {
                debug!(source = %kind, batch = batch.len(), total = status.fetched, "Batch done");
            }
        }
        Ok(())
    }

    fn load_record(&mut self, raw: &RawRecord, mode: LoadMode, status: &mut SyncStatus) -> Result<(), SyncError> {
        let patient = match self.etl.process_record(raw) {
            Ok(patient) => patient,
            Err(reason) => {
                Self::count_skip(status, &reason);
                return Ok(());
            }
        };

        match mode {
            LoadMode::Insert => {
                if self.target.insert_patient(&patient)? {
                    status.inserted += 1;
                } else {
                    status.unchanged += 1;
                }
            }
            LoadMode::Upsert => {
                let outcome = self.target.upsert_patient(&patient)?;
                Self::count_upsert(status, outcome);
            }
        }
        status.processed += 1;
        Ok(())
    }

    /// Pull one delta batch and apply it. Rows are already flagged processed
    /// on return from the repository, so apply failures are counted, not retried.
    fn apply_deltas(&mut self, status: &mut SyncStatus) -> Result<(), SyncError> {
        let kind = self.kind();
        let deltas = self.etl.repository_mut().get_patient_deltas(self.settings.batch_size)?;
        status.batches = u64::from(!deltas.is_empty());
        status.fetched = deltas.len() as u64;
        if deltas.is_empty() {
            debug!(source = %kind, "No pending deltas");
            return Ok(());
        }

        let (mut inserts, mut updates, mut deletes) = (Vec::new(), Vec::new(), Vec::new());
        for delta in deltas {
            match delta.operation {
                DeltaOperation::Insert => inserts.push(delta),
                DeltaOperation::Update => updates.push(delta),
                DeltaOperation::Delete => deletes.push(delta),
            }
        }
        info!(
            source = %kind,
            inserts = inserts.len(),
            updates = updates.len(),
            deletes = deletes.len(),
            "Applying deltas"
        );

        for (delta, operation) in inserts
            .iter()
            .map(|d| (d, DeltaOperation::Insert))
            .chain(updates.iter().map(|d| (d, DeltaOperation::Update)))
        {
            if self.shutdown.is_triggered() {
                return Ok(());
            }
            let raw = RawRecord::Cdc(delta.row.clone());
            let patient = match self.etl.process_record(&raw) {
                Ok(patient) => patient,
                Err(reason) => {
                    Self::count_skip(status, &reason);
                    continue;
                }
            };

            let applied = match operation {
                DeltaOperation::Insert => match self.target.insert_patient(&patient) {
                    Ok(true) => Ok(UpsertOutcome::Inserted),
                    // Already stored between enqueue and apply.
                    Ok(false) => self.target.upsert_patient(&patient),
                    Err(e) => Err(e),
                },
                _ => self.target.upsert_patient(&patient),
            };
            match applied {
                Ok(outcome) => {
                    Self::count_upsert(status, outcome);
                    status.processed += 1;
                }
                Err(e) => {
                    warn!(source = %kind, delta_id = delta.delta_id, hisnumber = %delta.hisnumber, error = %e, "Failed to apply delta");
                    status.errors += 1;
                }
            }
        }

        for delta in &deletes {
            self.target.mark_patient_deleted(&delta.hisnumber, kind);
            status.deleted += 1;
            status.processed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, MemoryStateStore};
    use crate::connector::{Connector, ConnectorResult, QueryResult, SnapshotFetcher, SqlValue};
    use crate::models::BusinessUnit;
    use crate::repository::{
        CdcRepository, CdcSettings, SnapshotRepository, SnapshotSettings, SourceRepository,
    };
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts batch reads of the patients table.
    struct CountingConnector {
        inner: SqliteConnector,
        batch_reads: Arc<AtomicUsize>,
    }

    impl Connector for CountingConnector {
        fn connect(&mut self) -> bool {
            self.inner.connect()
        }

        fn disconnect(&mut self) {
            self.inner.disconnect()
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        fn execute(&mut self, query: &str, params: &[SqlValue]) -> ConnectorResult<Option<QueryResult>> {
            if query.contains("WHERE patient_id > ?") {
                self.batch_reads.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.execute(query, params)
        }

        fn commit(&mut self) -> ConnectorResult<()> {
            self.inner.commit()
        }
    }

    struct StaticFetcher(Vec<String>);

    impl SnapshotFetcher for StaticFetcher {
        fn fetch_all(&mut self) -> Vec<String> {
            self.0.clone()
        }
    }

    fn cdc_source(patients: i64) -> SqliteConnector {
        let mut c = SqliteConnector::in_memory();
        assert!(c.connect());
        c.execute(
            "CREATE TABLE patients (patient_id INTEGER PRIMARY KEY, lastname TEXT, firstname TEXT, \
             middlename TEXT, birthdate TEXT, doc_type INTEGER, doc_number TEXT, email TEXT, phone TEXT, \
             his_password TEXT, businessunit INTEGER)",
            &[],
        )
        .unwrap();
        c.execute(
            "CREATE TABLE patient_delta (delta_id INTEGER PRIMARY KEY AUTOINCREMENT, operation TEXT, \
             processed TEXT NOT NULL DEFAULT 'N', patient_id INTEGER, lastname TEXT, firstname TEXT, \
             middlename TEXT, birthdate TEXT, doc_type INTEGER, doc_number TEXT, email TEXT, phone TEXT, \
             his_password TEXT, businessunit INTEGER)",
            &[],
        )
        .unwrap();
        for id in 1..=patients {
            c.execute(
                "INSERT INTO patients (patient_id, lastname, birthdate) VALUES (?, ?, '01.02.1980')",
                &[SqlValue::Integer(id), format!("Patient{}", id).into()],
            )
            .unwrap();
        }
        c
    }

    fn daemon(source: SqliteConnector, batch_size: usize) -> SyncDaemon {
        cdc_daemon(Box::new(source), batch_size)
    }

    fn cdc_daemon(source: Box<dyn Connector>, batch_size: usize) -> SyncDaemon {
        let checkpoint = Checkpoint::new(SourceKind::Cdc, Box::new(MemoryStateStore::new()));
        let settings = CdcSettings {
            mark_retry: RetryPolicy::testing(),
            ..Default::default()
        };
        let repo = CdcRepository::new(source, checkpoint, settings);
        with_daemon(EtlService::new(SourceRepository::Cdc(repo), BusinessUnit::Hospital), batch_size)
    }

    fn snapshot_daemon(lines: &[&str], batch_size: usize) -> SyncDaemon {
        let checkpoint = Checkpoint::new(SourceKind::Snapshot, Box::new(MemoryStateStore::new()));
        let fetcher = StaticFetcher(lines.iter().map(|l| l.to_string()).collect());
        let repo = SnapshotRepository::new(Box::new(fetcher), checkpoint, SnapshotSettings::default());
        with_daemon(EtlService::new(SourceRepository::Snapshot(repo), BusinessUnit::Outpatient), batch_size)
    }

    fn with_daemon(etl: EtlService, batch_size: usize) -> SyncDaemon {
        let target = TargetRepository::new(Box::new(SqliteConnector::in_memory())).unwrap();
        let config = DaemonConfig {
            batch_size,
            idle_interval_secs: 0,
            ..Default::default()
        };
        SyncDaemon::new(etl, target, config, ShutdownToken::new())
    }

    #[test]
    fn test_state_progression() {
        let mut d = daemon(cdc_source(25), 10);

        assert_eq!(d.next_state().unwrap(), SyncState::InitialLoad);
        let status = d.perform_initial_load();
        assert!(status.success);
        assert_eq!(status.inserted, 25);
        assert_eq!(status.batches, 3);
        assert_eq!(status.completion_ratio, Some(1.0));

        // Complete but no timestamp yet: record it and idle.
        assert_eq!(d.next_state().unwrap(), SyncState::IdleWait);
        assert_eq!(d.next_state().unwrap(), SyncState::DeltaSync);
    }

    #[test]
    fn test_initial_load_is_idempotent() {
        let mut d = daemon(cdc_source(5), 100);
        assert_eq!(d.perform_initial_load().inserted, 5);
        d.etl
            .repository_mut()
            .save_last_processed(&["0".to_string()])
            .unwrap();
        // Rewound cursor: every record is re-read and found already stored.
        let status = d.perform_initial_load();
        assert_eq!(status.inserted, 0);
        assert_eq!(d.target.count_patients(SourceKind::Cdc).unwrap(), 5);
    }

    #[test]
    fn test_shutdown_stops_load() {
        let mut d = daemon(cdc_source(5), 2);
        d.shutdown.trigger();
        let status = d.perform_initial_load();
        assert_eq!(status.fetched, 0);
        assert!(!status.success);
        assert_eq!(status.message.as_deref(), Some("interrupted"));
    }

    #[test]
    fn test_empty_batches_step_numeric_cursor_then_stop() {
        let batch_reads = Arc::new(AtomicUsize::new(0));
        let source = CountingConnector {
            inner: cdc_source(5),
            batch_reads: batch_reads.clone(),
        };
        let mut d = cdc_daemon(Box::new(source), 10);

        let status = d.perform_initial_load();
        assert!(status.success);
        assert_eq!(status.inserted, 5);
        assert_eq!(status.batches, 1);

        // One full read, then three empty ones; the cursor is stepped between empties.
        assert_eq!(d.settings.max_empty_batches, 3);
        assert_eq!(batch_reads.load(Ordering::SeqCst), 4);
        assert_eq!(d.etl.repository().last_processed_key(), Some("7".to_string()));
    }

    #[test]
    fn test_empty_batches_leave_snapshot_cursor_alone() {
        let mut d = snapshot_daemon(
            &[
                "2/B;Petrov;Oleg;;19880101;03;;123456;;;",
                "1/A;Ivanova;Anna;;19900315;21;4512;345678;anna@example.org;89991234567;",
            ],
            10,
        );

        let status = d.perform_initial_load();
        assert!(status.success);
        assert_eq!(status.inserted, 2);
        assert_eq!(d.etl.repository().last_processed_key(), Some("2/B".to_string()));

        // A rerun over an exhausted population reads only empties.
        let rerun = d.perform_initial_load();
        assert_eq!(rerun.fetched, 0);
        assert_eq!(d.etl.repository().last_processed_key(), Some("2/B".to_string()));
    }
}
