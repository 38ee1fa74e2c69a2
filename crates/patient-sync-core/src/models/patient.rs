//! Canonical patient model.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{BusinessUnit, DocumentType, SourceKind};
use crate::transform::{digits_only, normalize_phone};

/// Patient construction errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatientError {
    #[error("invalid source code: {0}")]
    InvalidSource(i64),

    #[error("invalid business unit: {0}")]
    InvalidBusinessUnit(i64),

    #[error("empty hisnumber")]
    EmptyHisnumber,
}

impl PatientError {
    /// Transformers set the source and only pass through known business
    /// units, so a violation there is a transformer defect.
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            PatientError::InvalidSource(_) | PatientError::InvalidBusinessUnit(_)
        )
    }
}

pub type PatientResult<T> = Result<T, PatientError>;

/// Transformer output, not yet validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformedRecord {
    pub hisnumber: String,
    pub source: i64,
    pub businessunit: i64,
    pub lastname: Option<String>,
    pub name: Option<String>,
    pub surname: Option<String>,
    pub birthdate: Option<NaiveDate>,
    pub documenttype: Option<i64>,
    pub document_number: Option<String>,
    pub email: Option<String>,
    pub telephone: Option<String>,
    pub his_password: Option<String>,
    pub login_email: Option<String>,
}

impl TransformedRecord {
    /// The fallback record a transformer emits when it cannot map a row.
    pub fn minimal(hisnumber: String, source: SourceKind, businessunit: BusinessUnit) -> Self {
        Self {
            hisnumber,
            source: source.code(),
            businessunit: businessunit.code(),
            documenttype: Some(DocumentType::OTHER as i64),
            ..Default::default()
        }
    }
}

/// A validated demographic record for one (source, hisnumber) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    hisnumber: String,
    source: SourceKind,
    businessunit: BusinessUnit,
    lastname: Option<String>,
    name: Option<String>,
    surname: Option<String>,
    birthdate: Option<NaiveDate>,
    documenttype: u8,
    document_number: Option<String>,
    email: Option<String>,
    telephone: Option<String>,
    his_password: Option<String>,
    login_email: Option<String>,
    /// Assigned by downstream matching, never here
    uuid: Option<String>,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Patient {
    /// Validate and normalize a transformed record.
    pub fn new(record: TransformedRecord) -> PatientResult<Self> {
        let source = SourceKind::try_from(record.source)?;
        let businessunit = BusinessUnit::try_from(record.businessunit)?;

        let hisnumber = record.hisnumber.trim().to_string();
        if hisnumber.is_empty() {
            return Err(PatientError::EmptyHisnumber);
        }

        let (his_password, login_email) = match source {
            SourceKind::Cdc => (clean(record.his_password), None),
            SourceKind::Snapshot => (None, clean(record.login_email)),
        };

        Ok(Self {
            hisnumber,
            source,
            businessunit,
            lastname: clean(record.lastname),
            name: clean(record.name),
            surname: clean(record.surname),
            birthdate: record.birthdate,
            documenttype: DocumentType::normalize(record.documenttype),
            document_number: record.document_number.as_deref().and_then(digits_only),
            email: clean(record.email),
            telephone: record.telephone.as_deref().and_then(normalize_phone),
            his_password,
            login_email,
            uuid: None,
        })
    }

    pub fn hisnumber(&self) -> &str {
        &self.hisnumber
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn businessunit(&self) -> BusinessUnit {
        self.businessunit
    }

    pub fn lastname(&self) -> Option<&str> {
        self.lastname.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn surname(&self) -> Option<&str> {
        self.surname.as_deref()
    }

    pub fn birthdate(&self) -> Option<NaiveDate> {
        self.birthdate
    }

    pub fn documenttype(&self) -> u8 {
        self.documenttype
    }

    pub fn document_number(&self) -> Option<&str> {
        self.document_number.as_deref()
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn telephone(&self) -> Option<&str> {
        self.telephone.as_deref()
    }

    pub fn his_password(&self) -> Option<&str> {
        self.his_password.as_deref()
    }

    pub fn login_email(&self) -> Option<&str> {
        self.login_email.as_deref()
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    /// Convert to the shape written to the target store (uuid stripped).
    pub fn to_storable(&self) -> StorablePatient {
        StorablePatient {
            hisnumber: self.hisnumber.clone(),
            source: self.source.code(),
            businessunit: self.businessunit.code(),
            lastname: self.lastname.clone(),
            name: self.name.clone(),
            surname: self.surname.clone(),
            birthdate: self.birthdate.map(|d| d.format("%Y-%m-%d").to_string()),
            documenttype: i64::from(self.documenttype),
            document_number: self.document_number.clone(),
            email: self.email.clone(),
            telephone: self.telephone.clone(),
            his_password: self.his_password.clone(),
            login_email: self.login_email.clone(),
        }
    }
}

/// Row shape persisted in the consolidated store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorablePatient {
    pub hisnumber: String,
    pub source: i64,
    pub businessunit: i64,
    pub lastname: Option<String>,
    pub name: Option<String>,
    pub surname: Option<String>,
    /// ISO `YYYY-MM-DD`
    pub birthdate: Option<String>,
    pub documenttype: i64,
    pub document_number: Option<String>,
    pub email: Option<String>,
    pub telephone: Option<String>,
    pub his_password: Option<String>,
    pub login_email: Option<String>,
}

impl StorablePatient {
    /// SHA-256 over the canonical JSON, hex encoded.
    pub fn content_hash(&self) -> String {
        // Struct field order is fixed, so the JSON is deterministic.
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&json))
    }
}
