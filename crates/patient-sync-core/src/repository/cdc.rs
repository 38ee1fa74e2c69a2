//! Repository over the CDC source.
//!
//! Expected source tables (names configurable):
//!
//! ```text
//! <patients>: patient_id, lastname, firstname, middlename, birthdate,
//!             doc_type, doc_number, email, phone, his_password, businessunit
//! <delta>:    delta_id, operation, processed ('N'/'Y'), plus the patient columns
//! ```
//!
//! # Mark-processed protocol
//!
//! The delta table is shared with other consumers, so rows read by
//! [`CdcRepository::get_patient_deltas`] are flagged `processed = 'Y'` in the
//! same call. Updates go out in chunks inside a bounded retry that only
//! retries lock conflicts. A verification read then counts what is actually
//! flagged; a shortfall is logged and healed by the next cycle, which
//! re-reads anything still `'N'`.

use tracing::{debug, info, warn};

use super::{ensure_connected, RepositoryResult};
use crate::checkpoint::{Checkpoint, CheckpointResult};
use crate::connector::{Connector, ConnectorError, QueryResult, SqlValue};
use crate::models::{dedup_latest, CdcRow, DeltaOperation, DeltaRecord, RawRecord};
use crate::retry::RetryPolicy;

/// Patient columns read from both tables.
const PATIENT_COLUMNS: &str = "patient_id, lastname, firstname, middlename, birthdate, \
     doc_type, doc_number, email, phone, his_password, businessunit";

/// Ids per mark-processed statement.
pub const DEFAULT_MARK_CHUNK_SIZE: usize = 100;

/// CDC repository settings.
#[derive(Debug, Clone)]
pub struct CdcSettings {
    pub patients_table: String,
    pub delta_table: String,
    pub mark_chunk_size: usize,
    pub mark_retry: RetryPolicy,
}

impl Default for CdcSettings {
    fn default() -> Self {
        Self {
            patients_table: "patients".to_string(),
            delta_table: "patient_delta".to_string(),
            mark_chunk_size: DEFAULT_MARK_CHUNK_SIZE,
            mark_retry: RetryPolicy::lock_conflict(),
        }
    }
}

pub struct CdcRepository {
    connector: Box<dyn Connector>,
    checkpoint: Checkpoint,
    settings: CdcSettings,
}

fn rows(result: Option<QueryResult>) -> Vec<CdcRow> {
    result
        .map(|r| {
            let columns = r.columns;
            r.rows
                .into_iter()
                .map(|values| CdcRow::from_columns(&columns, values))
                .collect()
        })
        .unwrap_or_default()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl CdcRepository {
    pub fn new(connector: Box<dyn Connector>, checkpoint: Checkpoint, settings: CdcSettings) -> Self {
        Self {
            connector,
            checkpoint,
            settings,
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub(crate) fn checkpoint_mut(&mut self) -> &mut Checkpoint {
        &mut self.checkpoint
    }

    pub fn disconnect(&mut self) {
        self.connector.disconnect();
    }

    fn connect(&mut self) -> RepositoryResult<()> {
        ensure_connected(self.connector.as_mut(), "cdc source")
    }

    fn cursor(&self) -> i64 {
        match self.checkpoint.last_processed_key() {
            Ok(Some(key)) => key.parse().unwrap_or_else(|_| {
                warn!(cursor = %key, "Non-numeric CDC cursor, starting from 0");
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "Failed to read CDC cursor, starting from 0");
                0
            }
        }
    }

    /// Rows with `patient_id` above the cursor, ascending, capped at `batch_size`.
    pub fn get_patients(&mut self, batch_size: usize) -> RepositoryResult<Vec<RawRecord>> {
        self.connect()?;
        let cursor = self.cursor();
        let query = format!(
            "SELECT {} FROM {} WHERE patient_id > ? ORDER BY patient_id LIMIT ?",
            PATIENT_COLUMNS, self.settings.patients_table
        );
        let result = self.connector.execute(
            &query,
            &[SqlValue::Integer(cursor), SqlValue::Integer(batch_size as i64)],
        )?;
        let batch: Vec<RawRecord> = rows(result).into_iter().map(RawRecord::Cdc).collect();
        debug!(cursor, batch = batch.len(), "CDC batch read");
        Ok(batch)
    }

    pub fn get_total_patient_count(&mut self) -> RepositoryResult<u64> {
        self.connect()?;
        let query = format!("SELECT COUNT(*) FROM {}", self.settings.patients_table);
        let result = self.connector.execute(&query, &[])?;
        Ok(result
            .as_ref()
            .and_then(QueryResult::scalar)
            .and_then(SqlValue::as_i64)
            .unwrap_or(0)
            .max(0) as u64)
    }

    /// Move the cursor to the numeric maximum of a delivered batch.
    pub fn save_last_processed(&mut self, keys: &[String]) -> CheckpointResult<()> {
        match keys.iter().filter_map(|k| k.parse::<i64>().ok()).max() {
            Some(max) => self.checkpoint.save_last_processed_key(&max.to_string()),
            None => Ok(()),
        }
    }

    /// Read unprocessed change rows, keep the newest per patient and mark
    /// every read row processed before returning.
    pub fn get_patient_deltas(&mut self, batch_size: usize) -> RepositoryResult<Vec<DeltaRecord>> {
        self.connect()?;
        let query = format!(
            "SELECT delta_id, operation, {} FROM {} WHERE processed = 'N' ORDER BY delta_id LIMIT ?",
            PATIENT_COLUMNS, self.settings.delta_table
        );
        let result = self
            .connector
            .execute(&query, &[SqlValue::Integer(batch_size as i64)])?;

        let mut read_ids = Vec::new();
        let mut records = Vec::new();
        for row in rows(result) {
            let Some(delta_id) = row.int("delta_id") else {
                warn!(?row, "Delta row without delta_id, cannot mark it");
                continue;
            };
            read_ids.push(delta_id);

            let operation = match row.text("operation").unwrap_or_default().parse::<DeltaOperation>() {
                Ok(op) => op,
                Err(op) => {
                    warn!(delta_id, operation = %op, "Unknown delta operation, skipping");
                    continue;
                }
            };
            let Some(hisnumber) = row.patient_id() else {
                warn!(delta_id, "Delta row without patient_id, skipping");
                continue;
            };
            records.push(DeltaRecord {
                delta_id,
                operation,
                hisnumber,
                row,
            });
        }

        let read = records.len();
        let deltas = dedup_latest(records);

        if !read_ids.is_empty() {
            let marked = self.mark_processed(&read_ids);
            if marked < read_ids.len() {
                warn!(
                    read = read_ids.len(),
                    marked,
                    "Not all delta rows are flagged processed; they will be re-read next cycle"
                );
            }
        }

        info!(rows = read_ids.len(), valid = read, unique = deltas.len(), "Delta batch read");
        Ok(deltas)
    }

    /// Flag delta rows processed. Returns the number confirmed by a
    /// verification read, or the number updated if verification fails.
    pub fn mark_processed(&mut self, delta_ids: &[i64]) -> usize {
        if delta_ids.is_empty() {
            return 0;
        }
        if let Err(e) = self.connect() {
            warn!(error = %e, "Cannot mark delta rows processed");
            return 0;
        }

        let chunk_size = self.settings.mark_chunk_size.max(1);
        let retry = self.settings.mark_retry.clone();
        let table = self.settings.delta_table.clone();
        let mut updated = 0usize;

        for chunk in delta_ids.chunks(chunk_size) {
            let query = format!(
                "UPDATE {} SET processed = 'Y' WHERE delta_id IN ({})",
                table,
                placeholders(chunk.len())
            );
            let params: Vec<SqlValue> = chunk.iter().map(|id| SqlValue::Integer(*id)).collect();
            let connector = &mut self.connector;

            let result = retry.run(
                "mark_processed",
                |_| {
                    connector.execute(&query, &params)?;
                    connector.commit()
                },
                ConnectorError::is_lock_conflict,
            );
            match result {
                Ok(()) => updated += chunk.len(),
                Err(e) => warn!(chunk = chunk.len(), error = %e, "Failed to mark delta chunk processed"),
            }
        }

        if updated == 0 {
            return 0;
        }

        match self.count_flagged(delta_ids) {
            Ok(verified) => {
                if verified < delta_ids.len() {
                    warn!(expected = delta_ids.len(), verified, "Mark-processed verification shortfall");
                }
                verified
            }
            Err(e) => {
                warn!(error = %e, "Mark-processed verification read failed");
                updated
            }
        }
    }

    fn count_flagged(&mut self, delta_ids: &[i64]) -> Result<usize, ConnectorError> {
        let mut total = 0usize;
        for chunk in delta_ids.chunks(self.settings.mark_chunk_size.max(1)) {
            let query = format!(
                "SELECT COUNT(*) FROM {} WHERE processed = 'Y' AND delta_id IN ({})",
                self.settings.delta_table,
                placeholders(chunk.len())
            );
            let params: Vec<SqlValue> = chunk.iter().map(|id| SqlValue::Integer(*id)).collect();
            let result = self.connector.execute(&query, &params)?;
            total += result
                .as_ref()
                .and_then(QueryResult::scalar)
                .and_then(SqlValue::as_i64)
                .unwrap_or(0)
                .max(0) as usize;
        }
        Ok(total)
    }
}
