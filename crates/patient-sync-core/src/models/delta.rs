//! Change-log rows from the CDC source.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::CdcRow;

/// Operation recorded in the change table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeltaOperation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for DeltaOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeltaOperation::Insert => "INSERT",
            DeltaOperation::Update => "UPDATE",
            DeltaOperation::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

impl FromStr for DeltaOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INSERT" | "I" => Ok(DeltaOperation::Insert),
            "UPDATE" | "U" => Ok(DeltaOperation::Update),
            "DELETE" | "D" => Ok(DeltaOperation::Delete),
            other => Err(other.to_string()),
        }
    }
}

/// One change row together with its parsed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub delta_id: i64,
    pub operation: DeltaOperation,
    pub hisnumber: String,
    /// Patient payload as of this change
    pub row: CdcRow,
}

/// Keep only the newest change per hisnumber (highest `delta_id` wins).
///
/// Output is ordered by `delta_id`.
pub fn dedup_latest(records: Vec<DeltaRecord>) -> Vec<DeltaRecord> {
    let mut latest: HashMap<String, DeltaRecord> = HashMap::new();
    for record in records {
        match latest.get(&record.hisnumber) {
            Some(existing) if existing.delta_id > record.delta_id => {}
            _ => {
                latest.insert(record.hisnumber.clone(), record);
            }
        }
    }

    let mut out: Vec<DeltaRecord> = latest.into_values().collect();
    out.sort_by_key(|r| r.delta_id);
    out
}
