//! Transformer for rows read from the CDC source.

use tracing::warn;

use super::normalizer::{digits_only, normalize_phone, parse_dotted_date};
use crate::connector::SqlValue;
use crate::models::{BusinessUnit, CdcRow, DocumentType, SourceKind, TransformedRecord};

/// Legacy "no document" code.
const LEGACY_NO_DOCUMENT: i64 = 0;
/// Entry and transit visa codes, not identity documents.
const LEGACY_VISA_CODES: [i64; 2] = [18, 19];

/// Map a CDC document type code to the canonical range. Total over `i64`.
pub fn map_cdc_document_type(code: i64) -> u8 {
    match code {
        LEGACY_NO_DOCUMENT => DocumentType::OTHER,
        c if LEGACY_VISA_CODES.contains(&c) => DocumentType::OTHER,
        1 => DocumentType::PASSPORT,
        2 => DocumentType::FOREIGN_PASSPORT,
        5 => DocumentType::INTERNATIONAL_PASSPORT,
        c if DocumentType::is_valid(c) => c as u8,
        _ => DocumentType::OTHER,
    }
}

/// Column names in the CDC patient and delta tables.
pub mod columns {
    pub const LASTNAME: &str = "lastname";
    pub const FIRSTNAME: &str = "firstname";
    pub const MIDDLENAME: &str = "middlename";
    pub const BIRTHDATE: &str = "birthdate";
    pub const DOC_TYPE: &str = "doc_type";
    pub const DOC_NUMBER: &str = "doc_number";
    pub const EMAIL: &str = "email";
    pub const PHONE: &str = "phone";
    pub const HIS_PASSWORD: &str = "his_password";
    pub const BUSINESSUNIT: &str = "businessunit";
}

#[derive(Debug)]
enum CdcTransformError {
    MissingPatientId,
}

/// Maps [`CdcRow`]s into the canonical shape.
#[derive(Debug, Clone)]
pub struct CdcTransformer {
    businessunit: BusinessUnit,
}

impl CdcTransformer {
    /// `businessunit` applies when a row does not carry its own unit.
    pub fn new(businessunit: BusinessUnit) -> Self {
        Self { businessunit }
    }

    /// Transform one row. Never fails: on an unmappable row a minimal
    /// record with document type 17 is returned.
    pub fn transform(&self, row: &CdcRow) -> TransformedRecord {
        match self.try_transform(row) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = ?e, ?row, "CDC row could not be mapped");
                TransformedRecord::minimal(
                    row.patient_id().unwrap_or_default(),
                    SourceKind::Cdc,
                    self.businessunit,
                )
            }
        }
    }

    /// The row's own unit when it is a known one, else the default.
    fn row_businessunit(&self, row: &CdcRow, hisnumber: &str) -> BusinessUnit {
        let Some(code) = row.int(columns::BUSINESSUNIT) else {
            return self.businessunit;
        };
        BusinessUnit::try_from(code).unwrap_or_else(|_| {
            warn!(
                hisnumber,
                businessunit = code,
                default = self.businessunit.code(),
                "Unknown business unit, using default"
            );
            self.businessunit
        })
    }

    fn try_transform(&self, row: &CdcRow) -> Result<TransformedRecord, CdcTransformError> {
        let hisnumber = row.patient_id().ok_or(CdcTransformError::MissingPatientId)?;
        let businessunit = self.row_businessunit(row, &hisnumber);

        let birthdate = match row.get(columns::BIRTHDATE) {
            Some(SqlValue::Date(d)) => Some(*d),
            Some(other) => other.as_text().as_deref().and_then(parse_dotted_date),
            None => None,
        };

        let documenttype = row
            .int(columns::DOC_TYPE)
            .map(map_cdc_document_type)
            .unwrap_or(DocumentType::OTHER);

        Ok(TransformedRecord {
            hisnumber,
            source: SourceKind::Cdc.code(),
            businessunit: businessunit.code(),
            lastname: row.text(columns::LASTNAME),
            name: row.text(columns::FIRSTNAME),
            surname: row.text(columns::MIDDLENAME),
            birthdate,
            documenttype: Some(i64::from(documenttype)),
            document_number: row.text(columns::DOC_NUMBER).as_deref().and_then(digits_only),
            email: row.text(columns::EMAIL),
            telephone: row.text(columns::PHONE).as_deref().and_then(normalize_phone),
            his_password: row.text(columns::HIS_PASSWORD),
            login_email: None,
        })
    }
}
