//! Consolidated patient store.

use tracing::{debug, info};

use super::{ensure_connected, RepositoryResult, TARGET_SCHEMA};
use crate::connector::{Connector, QueryResult, SqlValue};
use crate::models::{Patient, SourceKind, StorablePatient};

/// What an upsert did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Stored content already matched
    Unchanged,
}

const STORED_COLUMNS: &str = "hisnumber, source, businessunit, lastname, name, surname, birthdate, \
     documenttype, document_number, email, telephone, his_password, login_email";

/// Writer for the consolidated store, keyed by `(hisnumber, source)`.
pub struct TargetRepository {
    connector: Box<dyn Connector>,
}

fn storable_params(storable: &StorablePatient, hash: String) -> Vec<SqlValue> {
    vec![
        storable.hisnumber.clone().into(),
        SqlValue::Integer(storable.source),
        SqlValue::Integer(storable.businessunit),
        storable.lastname.clone().into(),
        storable.name.clone().into(),
        storable.surname.clone().into(),
        storable.birthdate.clone().into(),
        SqlValue::Integer(storable.documenttype),
        storable.document_number.clone().into(),
        storable.email.clone().into(),
        storable.telephone.clone().into(),
        storable.his_password.clone().into(),
        storable.login_email.clone().into(),
        hash.into(),
    ]
}

fn count(result: Option<QueryResult>) -> u64 {
    result
        .as_ref()
        .and_then(QueryResult::scalar)
        .and_then(SqlValue::as_i64)
        .unwrap_or(0)
        .max(0) as u64
}

impl TargetRepository {
    /// Wrap a connector and create the schema if needed.
    pub fn new(mut connector: Box<dyn Connector>) -> RepositoryResult<Self> {
        ensure_connected(connector.as_mut(), "target store")?;
        for stmt in TARGET_SCHEMA {
            connector.execute(stmt, &[])?;
        }
        connector.commit()?;
        Ok(Self { connector })
    }

    fn connect(&mut self) -> RepositoryResult<()> {
        ensure_connected(self.connector.as_mut(), "target store")
    }

    pub fn patient_exists(&mut self, hisnumber: &str, source: SourceKind) -> RepositoryResult<bool> {
        Ok(self.stored_hash(hisnumber, source)?.is_some())
    }

    fn stored_hash(&mut self, hisnumber: &str, source: SourceKind) -> RepositoryResult<Option<String>> {
        self.connect()?;
        let result = self.connector.execute(
            "SELECT record_hash FROM patients WHERE hisnumber = ? AND source = ?",
            &[hisnumber.into(), SqlValue::Integer(source.code())],
        )?;
        Ok(result.and_then(|r| r.rows.into_iter().next()).map(|row| {
            row.into_iter()
                .next()
                .and_then(|v| v.as_text())
                .unwrap_or_default()
        }))
    }

    /// Stored row for a key.
    pub fn get_patient(
        &mut self,
        hisnumber: &str,
        source: SourceKind,
    ) -> RepositoryResult<Option<StorablePatient>> {
        self.connect()?;
        let query = format!(
            "SELECT {} FROM patients WHERE hisnumber = ? AND source = ?",
            STORED_COLUMNS
        );
        let result = self
            .connector
            .execute(&query, &[hisnumber.into(), SqlValue::Integer(source.code())])?;
        let Some(result) = result else {
            return Ok(None);
        };
        let Some(row) = result.rows.into_iter().next() else {
            return Ok(None);
        };

        let mut values = row.into_iter();
        let mut text = || values.next().and_then(|v| v.as_text());
        let hisnumber = text().unwrap_or_default();
        let source = text().and_then(|v| v.parse().ok()).unwrap_or(0);
        let businessunit = text().and_then(|v| v.parse().ok()).unwrap_or(0);
        let lastname = text();
        let name = text();
        let surname = text();
        let birthdate = text();
        let documenttype = text().and_then(|v| v.parse().ok()).unwrap_or(0);
        Ok(Some(StorablePatient {
            hisnumber,
            source,
            businessunit,
            lastname,
            name,
            surname,
            birthdate,
            documenttype,
            document_number: text(),
            email: text(),
            telephone: text(),
            his_password: text(),
            login_email: text(),
        }))
    }

    /// Insert a patient. Returns `false` when the key is already stored.
    pub fn insert_patient(&mut self, patient: &Patient) -> RepositoryResult<bool> {
        if self.patient_exists(patient.hisnumber(), patient.source())? {
            debug!(hisnumber = patient.hisnumber(), source = %patient.source(), "Patient already stored");
            return Ok(false);
        }
        self.write_insert(&patient.to_storable())?;
        Ok(true)
    }

    /// Existence check, then update or insert.
    ///
    /// Not atomic: two writers racing on one key can both see it missing,
    /// and the loser then fails on the unique constraint.
    pub fn upsert_patient(&mut self, patient: &Patient) -> RepositoryResult<UpsertOutcome> {
        let storable = patient.to_storable();
        let hash = storable.content_hash();

        match self.stored_hash(&storable.hisnumber, patient.source())? {
            None => {
                self.write_insert(&storable)?;
                Ok(UpsertOutcome::Inserted)
            }
            Some(stored) if stored == hash => Ok(UpsertOutcome::Unchanged),
            Some(_) => {
                let mut params = storable_params(&storable, hash);
                // Key columns move to the WHERE clause.
                let hisnumber = params.remove(0);
                let source = params.remove(0);
                params.push(hisnumber);
                params.push(source);
                self.connector.execute(
                    r#"
                    UPDATE patients SET
                        businessunit = ?, lastname = ?, name = ?, surname = ?, birthdate = ?,
                        documenttype = ?, document_number = ?, email = ?, telephone = ?,
                        his_password = ?, login_email = ?, record_hash = ?,
                        updated_at = datetime('now')
                    WHERE hisnumber = ? AND source = ?
                    "#,
                    &params,
                )?;
                self.connector.commit()?;
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    fn write_insert(&mut self, storable: &StorablePatient) -> RepositoryResult<()> {
        let hash = storable.content_hash();
        let query = format!(
            "INSERT INTO patients ({}, record_hash) VALUES ({})",
            STORED_COLUMNS,
            vec!["?"; 14].join(", ")
        );
        self.connector.execute(&query, &storable_params(storable, hash))?;
        self.connector.commit()?;
        Ok(())
    }

    /// Records are retained; a delete is only logged.
    pub fn mark_patient_deleted(&mut self, hisnumber: &str, source: SourceKind) {
        info!(hisnumber, source = %source, "Delete received, record retained");
    }

    /// Stored rows for one source.
    pub fn count_patients(&mut self, source: SourceKind) -> RepositoryResult<u64> {
        self.connect()?;
        let result = self.connector.execute(
            "SELECT COUNT(*) FROM patients WHERE source = ?",
            &[SqlValue::Integer(source.code())],
        )?;
        Ok(count(result))
    }

    pub fn disconnect(&mut self) {
        self.connector.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SqliteConnector;
    use crate::models::{BusinessUnit, TransformedRecord};

    fn store() -> TargetRepository {
        TargetRepository::new(Box::new(SqliteConnector::in_memory())).unwrap()
    }

    fn patient(hisnumber: &str, source: SourceKind, lastname: &str) -> Patient {
        let mut record = TransformedRecord::minimal(hisnumber.into(), source, BusinessUnit::Hospital);
        record.lastname = Some(lastname.into());
        record.document_number = Some("0045 123".into());
        Patient::new(record).unwrap()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut target = store();
        let p = patient("42", SourceKind::Cdc, "Petrov");

        assert!(!target.patient_exists("42", SourceKind::Cdc).unwrap());
        assert!(target.insert_patient(&p).unwrap());
        assert!(target.patient_exists("42", SourceKind::Cdc).unwrap());
        assert!(!target.insert_patient(&p).unwrap());
        assert_eq!(target.count_patients(SourceKind::Cdc).unwrap(), 1);
    }

    #[test]
    fn test_same_hisnumber_per_source_is_distinct() {
        let mut target = store();
        target.insert_patient(&patient("42", SourceKind::Cdc, "A")).unwrap();
        target.insert_patient(&patient("42", SourceKind::Snapshot, "B")).unwrap();
        assert_eq!(target.count_patients(SourceKind::Cdc).unwrap(), 1);
        assert_eq!(target.count_patients(SourceKind::Snapshot).unwrap(), 1);
    }

    #[test]
    fn test_upsert_outcomes() {
        let mut target = store();
        let first = patient("7", SourceKind::Snapshot, "Sidorov");
        assert_eq!(target.upsert_patient(&first).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(target.upsert_patient(&first).unwrap(), UpsertOutcome::Unchanged);

        let changed = patient("7", SourceKind::Snapshot, "Sidorova");
        assert_eq!(target.upsert_patient(&changed).unwrap(), UpsertOutcome::Updated);
        assert_eq!(target.count_patients(SourceKind::Snapshot).unwrap(), 1);

        let stored = target.get_patient("7", SourceKind::Snapshot).unwrap().unwrap();
        assert_eq!(stored, changed.to_storable());
        assert_eq!(stored.document_number.as_deref(), Some("0045123"));
    }

    #[test]
    fn test_delete_retains_record() {
        let mut target = store();
        target.insert_patient(&patient("9", SourceKind::Cdc, "X")).unwrap();
        target.mark_patient_deleted("9", SourceKind::Cdc);
        assert!(target.patient_exists("9", SourceKind::Cdc).unwrap());
    }
}
