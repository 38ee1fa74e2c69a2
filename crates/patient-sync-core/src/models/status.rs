//! Per-cycle sync status written to the status sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SourceKind;

/// Which path a cycle took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    InitialLoad,
    FullSync,
    DeltaSync,
    Idle,
}

/// Result of comparing destination and source populations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionCheck {
    pub source_count: u64,
    pub dest_count: u64,
    pub ratio: f64,
    pub complete: bool,
}

impl CompletionCheck {
    /// An empty source counts as fully loaded.
    pub fn compute(source_count: u64, dest_count: u64, threshold: f64) -> Self {
        let ratio = if source_count == 0 {
            1.0
        } else {
            dest_count as f64 / source_count as f64
        };
        Self {
            source_count,
            dest_count,
            ratio,
            complete: ratio >= threshold,
        }
    }
}

/// Snapshot of one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub cycle_id: Uuid,
    pub operation: SyncOperation,
    pub source: SourceKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    pub batches: u64,
    pub fetched: u64,
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_ratio: Option<f64>,
    pub success: bool,
    pub message: Option<String>,
}

impl SyncStatus {
    /// Start a new cycle record.
    pub fn begin(operation: SyncOperation, source: SourceKind) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            operation,
            source,
            started_at: Utc::now(),
            finished_at: None,
            duration_secs: 0.0,
            batches: 0,
            fetched: 0,
            processed: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            deleted: 0,
            skipped: 0,
            errors: 0,
            source_count: None,
            dest_count: None,
            completion_ratio: None,
            success: false,
            message: None,
        }
    }

    pub fn record_completion(&mut self, check: &CompletionCheck) {
        self.source_count = Some(check.source_count);
        self.dest_count = Some(check.dest_count);
        self.completion_ratio = Some(check.ratio);
    }

    /// Stamp the finish time and outcome.
    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_secs = (now - self.started_at).num_milliseconds() as f64 / 1000.0;
        self.success = success;
        self.message = message;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_threshold() {
        assert!(CompletionCheck::compute(100, 95, 0.95).complete);
        assert!(!CompletionCheck::compute(100, 94, 0.95).complete);
        assert!(CompletionCheck::compute(0, 0, 0.95).complete);
    }

    #[test]
    fn test_status_json_shape() {
        let mut status = SyncStatus::begin(SyncOperation::InitialLoad, SourceKind::Cdc);
        status.record_completion(&CompletionCheck::compute(10, 5, 0.95));
        status.finish(true, None);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["operation"], "initial_load");
        assert_eq!(json["source"], "cdc");
        assert_eq!(json["completion_ratio"], 0.5);
        assert!(json["finished_at"].is_string());
    }

    #[test]
    fn test_delta_status_omits_counts() {
        let status = SyncStatus::begin(SyncOperation::DeltaSync, SourceKind::Cdc);
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("source_count").is_none());
    }
}
