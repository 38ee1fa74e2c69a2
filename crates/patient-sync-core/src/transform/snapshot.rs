//! Transformer for records parsed from the snapshot source.

use tracing::warn;

use super::normalizer::{digits_only, non_empty, normalize_phone, parse_compact_date};
use crate::models::{BusinessUnit, DocumentType, SnapshotRecord, SourceKind, TransformedRecord};

/// Map a legacy document code to the canonical range.
///
/// The snapshot source uses the two-digit federal identity document codes.
pub fn map_snapshot_document_type(code: &str) -> u8 {
    let code = code.trim().trim_start_matches('0');
    match code {
        "21" => DocumentType::PASSPORT,
        "22" => DocumentType::INTERNATIONAL_PASSPORT,
        "3" => DocumentType::BIRTH_CERTIFICATE,
        "7" => DocumentType::MILITARY_ID,
        "10" => DocumentType::FOREIGN_PASSPORT,
        "12" => DocumentType::RESIDENCE_PERMIT,
        "15" => DocumentType::TEMPORARY_RESIDENCE_PERMIT,
        "13" => DocumentType::REFUGEE_CERTIFICATE,
        "14" => DocumentType::TEMPORARY_IDENTITY_CARD,
        "26" => DocumentType::SEAMAN_PASSPORT,
        "9" => DocumentType::DIPLOMATIC_PASSPORT,
        "4" => DocumentType::OFFICER_ID,
        "1" => DocumentType::USSR_PASSPORT,
        "23" => DocumentType::FOREIGN_BIRTH_CERTIFICATE,
        "19" => DocumentType::TEMPORARY_ASYLUM_CERTIFICATE,
        "27" => DocumentType::STATELESS_PERSON_DOCUMENT,
        _ => DocumentType::OTHER,
    }
}

/// Maps [`SnapshotRecord`]s into the canonical shape.
#[derive(Debug, Clone)]
pub struct SnapshotTransformer {
    businessunit: BusinessUnit,
}

impl SnapshotTransformer {
    pub fn new(businessunit: BusinessUnit) -> Self {
        Self { businessunit }
    }

    /// Transform one record. Never fails: unusable fields become `None`.
    pub fn transform(&self, record: &SnapshotRecord) -> TransformedRecord {
        let hisnumber = record.id.trim().to_string();
        if hisnumber.is_empty() {
            warn!(?record, "Snapshot record has no id");
            return TransformedRecord::minimal(hisnumber, SourceKind::Snapshot, self.businessunit);
        }

        let document = format!("{}{}", record.doc_series, record.doc_number);

        TransformedRecord {
            hisnumber,
            source: SourceKind::Snapshot.code(),
            businessunit: self.businessunit.code(),
            lastname: non_empty(&record.lastname),
            name: non_empty(&record.name),
            surname: non_empty(&record.surname),
            birthdate: parse_compact_date(&record.birthdate),
            documenttype: Some(i64::from(map_snapshot_document_type(&record.documenttype))),
            document_number: digits_only(&document),
            email: non_empty(&record.contact_email),
            telephone: normalize_phone(&record.telephone),
            his_password: None,
            login_email: non_empty(&record.login_email),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record() -> SnapshotRecord {
        SnapshotRecord {
            id: "120/AB".into(),
            lastname: "Smirnova".into(),
            name: "Anna".into(),
            surname: "".into(),
            birthdate: "19900315".into(),
            documenttype: "21".into(),
            doc_series: "45 12".into(),
            doc_number: "345678".into(),
            contact_email: "anna@example.org".into(),
            telephone: "8 999 123 45 67".into(),
            login_email: "anna.login@example.org".into(),
        }
    }

    #[test]
    fn test_transform_full_record() {
        let out = SnapshotTransformer::new(BusinessUnit::Outpatient).transform(&record());
        assert_eq!(out.hisnumber, "120/AB");
        assert_eq!(out.source, 1);
        assert_eq!(out.businessunit, 2);
        assert_eq!(out.surname, None);
        assert_eq!(out.birthdate, NaiveDate::from_ymd_opt(1990, 3, 15));
        assert_eq!(out.documenttype, Some(1));
        assert_eq!(out.document_number.as_deref(), Some("4512345678"));
        assert_eq!(out.telephone.as_deref(), Some("79991234567"));
        assert_eq!(out.login_email.as_deref(), Some("anna.login@example.org"));
    }

    #[test]
    fn test_bad_fields_become_none() {
        let mut rec = record();
        rec.birthdate = "19901315".into();
        rec.documenttype = "99".into();
        rec.doc_series = "".into();
        rec.doc_number = "n/a".into();
        let out = SnapshotTransformer::new(BusinessUnit::Hospital).transform(&rec);
        assert_eq!(out.birthdate, None);
        assert_eq!(out.documenttype, Some(17));
        assert_eq!(out.document_number, None);
    }

    #[test]
    fn test_document_code_table() {
        assert_eq!(map_snapshot_document_type("03"), DocumentType::BIRTH_CERTIFICATE);
        assert_eq!(map_snapshot_document_type(" 22 "), DocumentType::INTERNATIONAL_PASSPORT);
        assert_eq!(map_snapshot_document_type(""), DocumentType::OTHER);
    }

    #[test]
    fn test_missing_id_yields_minimal_record() {
        let mut rec = record();
        rec.id = " ".into();
        let out = SnapshotTransformer::new(BusinessUnit::Hospital).transform(&rec);
        assert_eq!(out.hisnumber, "");
        assert_eq!(out.documenttype, Some(17));
        assert_eq!(out.lastname, None);
    }
}
