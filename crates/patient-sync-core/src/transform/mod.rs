//! Source-specific transformers producing the canonical record shape.
//!
//! Pipeline: raw record → [`Transformer`] → [`TransformedRecord`] → `Patient::new`

mod cdc;
mod normalizer;
mod snapshot;

pub use cdc::*;
pub use normalizer::*;
pub use snapshot::*;

use crate::models::{BusinessUnit, RawRecord, SourceKind, TransformedRecord};

/// Closed set of transformers, one per source kind.
#[derive(Debug, Clone)]
pub enum Transformer {
    Snapshot(SnapshotTransformer),
    Cdc(CdcTransformer),
}

impl Transformer {
    /// Pick the transformer for a source kind.
    pub fn for_source(kind: SourceKind, businessunit: BusinessUnit) -> Self {
        match kind {
            SourceKind::Snapshot => Transformer::Snapshot(SnapshotTransformer::new(businessunit)),
            SourceKind::Cdc => Transformer::Cdc(CdcTransformer::new(businessunit)),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Transformer::Snapshot(_) => SourceKind::Snapshot,
            Transformer::Cdc(_) => SourceKind::Cdc,
        }
    }

    /// Transform a raw record.
    ///
    /// Returns `None` only when the record belongs to the other source.
    pub fn transform(&self, raw: &RawRecord) -> Option<TransformedRecord> {
        match (self, raw) {
            (Transformer::Snapshot(t), RawRecord::Snapshot(record)) => Some(t.transform(record)),
            (Transformer::Cdc(t), RawRecord::Cdc(row)) => Some(t.transform(row)),
            _ => None,
        }
    }
}
