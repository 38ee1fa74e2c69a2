//! Source systems, business units and document type codes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::PatientError;

/// The two upstream hospital information systems.
///
/// The discriminants are the values stored in the `source` column of the
/// consolidated store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Legacy system reachable only through a full-population HTTP pull.
    Snapshot = 1,
    /// Relational system with an append-only change table.
    Cdc = 2,
}

impl SourceKind {
    /// Numeric code as persisted in the target store.
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Short name used for checkpoint keys and logs.
    pub fn name(self) -> &'static str {
        match self {
            SourceKind::Snapshot => "snapshot",
            SourceKind::Cdc => "cdc",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<i64> for SourceKind {
    type Error = PatientError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SourceKind::Snapshot),
            2 => Ok(SourceKind::Cdc),
            other => Err(PatientError::InvalidSource(other)),
        }
    }
}

/// Error returned when a source name is outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown source: {0}")]
pub struct UnknownSource(pub String);

impl FromStr for SourceKind {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "snapshot" | "1" => Ok(SourceKind::Snapshot),
            "cdc" | "2" => Ok(SourceKind::Cdc),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

/// Business unit owning a patient record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum BusinessUnit {
    Hospital = 1,
    Outpatient = 2,
    Diagnostics = 3,
}

impl BusinessUnit {
    pub fn code(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for BusinessUnit {
    type Error = PatientError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(BusinessUnit::Hospital),
            2 => Ok(BusinessUnit::Outpatient),
            3 => Ok(BusinessUnit::Diagnostics),
            other => Err(PatientError::InvalidBusinessUnit(other)),
        }
    }
}

impl From<BusinessUnit> for i64 {
    fn from(unit: BusinessUnit) -> Self {
        unit.code()
    }
}

/// Canonical identity document codes.
///
/// The consolidated store only knows codes `1..=17`; anything a source
/// cannot map lands on [`DocumentType::OTHER`].
pub struct DocumentType;

impl DocumentType {
    pub const PASSPORT: u8 = 1;
    pub const INTERNATIONAL_PASSPORT: u8 = 2;
    pub const BIRTH_CERTIFICATE: u8 = 3;
    pub const MILITARY_ID: u8 = 4;
    pub const FOREIGN_PASSPORT: u8 = 5;
    pub const RESIDENCE_PERMIT: u8 = 6;
    pub const TEMPORARY_RESIDENCE_PERMIT: u8 = 7;
    pub const REFUGEE_CERTIFICATE: u8 = 8;
    pub const TEMPORARY_IDENTITY_CARD: u8 = 9;
    pub const SEAMAN_PASSPORT: u8 = 10;
    pub const DIPLOMATIC_PASSPORT: u8 = 11;
    pub const OFFICER_ID: u8 = 12;
    pub const USSR_PASSPORT: u8 = 13;
    pub const FOREIGN_BIRTH_CERTIFICATE: u8 = 14;
    pub const TEMPORARY_ASYLUM_CERTIFICATE: u8 = 15;
    pub const STATELESS_PERSON_DOCUMENT: u8 = 16;
    pub const OTHER: u8 = 17;

    /// Whether a code is inside the canonical range.
    pub fn is_valid(code: i64) -> bool {
        (1..=17).contains(&code)
    }

    /// Clamp any value into the canonical range.
    pub fn normalize(code: Option<i64>) -> u8 {
        match code {
            Some(c) if Self::is_valid(c) => c as u8,
            _ => Self::OTHER,
        }
    }
}
