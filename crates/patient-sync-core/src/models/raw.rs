//! Raw records as delivered by the sources, before transformation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::connector::SqlValue;

/// Column carrying the patient identifier in the CDC source tables.
pub const PATIENT_ID_COLUMN: &str = "patient_id";

/// Columns never written to logs.
const REDACTED_COLUMNS: &[&str] = &["his_password"];

/// One logical record reconstructed from the snapshot text stream.
///
/// Fields are positional in the stream; missing trailing fields are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// `<digits>/<alnum>` identifier, used as the hisnumber
    pub id: String,
    pub lastname: String,
    pub name: String,
    pub surname: String,
    /// `YYYYMMDD`
    pub birthdate: String,
    /// Legacy document type code
    pub documenttype: String,
    pub doc_series: String,
    pub doc_number: String,
    pub contact_email: String,
    pub telephone: String,
    /// Login id in the companion web API
    pub login_email: String,
}

impl SnapshotRecord {
    /// Number of positional fields in a complete record.
    pub const FIELD_COUNT: usize = 11;

    /// Build a record from positional fields, defaulting missing ones.
    pub fn from_fields(fields: &[String]) -> Self {
        let field = |i: usize| fields.get(i).cloned().unwrap_or_default();
        Self {
            id: field(0),
            lastname: field(1),
            name: field(2),
            surname: field(3),
            birthdate: field(4),
            documenttype: field(5),
            doc_series: field(6),
            doc_number: field(7),
            contact_email: field(8),
            telephone: field(9),
            login_email: field(10),
        }
    }

    /// Sort key: numeric prefix first, then the suffix.
    pub fn sort_key(&self) -> (u64, String) {
        id_sort_key(&self.id)
    }
}

/// Ordering key for `<digits>/<alnum>` identifiers.
pub fn id_sort_key(id: &str) -> (u64, String) {
    match id.split_once('/') {
        Some((digits, suffix)) => (digits.parse().unwrap_or(u64::MAX), suffix.to_string()),
        None => (id.parse().unwrap_or(u64::MAX), String::new()),
    }
}

/// A row read from the CDC source, keyed by lowercased column name.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CdcRow {
    values: HashMap<String, SqlValue>,
}

impl fmt::Debug for CdcRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sorted: BTreeMap<&str, &SqlValue> =
            self.values.iter().map(|(k, v)| (k.as_str(), v)).collect();
        let mut map = f.debug_map();
        for (column, value) in sorted {
            if REDACTED_COLUMNS.contains(&column) && !value.is_null() {
                map.entry(&column, &"<redacted>");
            } else {
                map.entry(&column, value);
            }
        }
        map.finish()
    }
}

impl CdcRow {
    /// Zip column names with one row of values.
    pub fn from_columns(columns: &[String], values: Vec<SqlValue>) -> Self {
        Self {
            values: columns
                .iter()
                .map(|c| c.to_lowercase())
                .zip(values)
                .collect(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column).filter(|v| !v.is_null())
    }

    /// Column value coerced to trimmed, non-empty text.
    pub fn text(&self, column: &str) -> Option<String> {
        self.get(column).and_then(SqlValue::as_text)
    }

    /// Column value coerced to an integer.
    pub fn int(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    pub fn insert(&mut self, column: &str, value: SqlValue) {
        self.values.insert(column.to_lowercase(), value);
    }

    /// The patient identifier, coerced to text.
    pub fn patient_id(&self) -> Option<String> {
        self.text(PATIENT_ID_COLUMN)
    }
}

/// A record from either source, ready for the transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "record", rename_all = "snake_case")]
pub enum RawRecord {
    Snapshot(SnapshotRecord),
    Cdc(CdcRow),
}

impl RawRecord {
    /// Source-side identifier used for checkpointing.
    pub fn key(&self) -> Option<String> {
        match self {
            RawRecord::Snapshot(record) => Some(record.id.clone()).filter(|id| !id.is_empty()),
            RawRecord::Cdc(row) => row.patient_id(),
        }
    }
}
