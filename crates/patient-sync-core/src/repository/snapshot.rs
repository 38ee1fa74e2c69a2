//! Repository over the snapshot source.
//!
//! The source has no cursor: every pull returns the whole population. The
//! repository keeps a processed set of delivered ids and hands out the
//! remainder in id order. The pulled population is cached for a few minutes
//! so batch loops do not re-pull on every call.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::RepositoryResult;
use crate::checkpoint::{Checkpoint, CheckpointResult};
use crate::connector::SnapshotFetcher;
use crate::models::{id_sort_key, RawRecord, SnapshotRecord};
use crate::parser::{parse_records, DEFAULT_DELIMITER};

/// How long a pulled population stays fresh.
pub const DEFAULT_POPULATION_TTL: Duration = Duration::from_secs(300);

/// Snapshot repository settings.
#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub delimiter: char,
    pub cache_ttl: Duration,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER,
            cache_ttl: DEFAULT_POPULATION_TTL,
        }
    }
}

struct CachedPopulation {
    fetched_at: Instant,
    records: Vec<SnapshotRecord>,
}

pub struct SnapshotRepository {
    fetcher: Box<dyn SnapshotFetcher>,
    checkpoint: Checkpoint,
    settings: SnapshotSettings,
    cache: Option<CachedPopulation>,
    processed: BTreeSet<String>,
}

impl SnapshotRepository {
    /// Create the repository, loading the processed set from the checkpoint.
    pub fn new(fetcher: Box<dyn SnapshotFetcher>, checkpoint: Checkpoint, settings: SnapshotSettings) -> Self {
        let processed = checkpoint.processed_set().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load processed set, starting empty");
            BTreeSet::new()
        });
        if !processed.is_empty() {
            info!(count = processed.len(), "Restored snapshot processed set");
        }
        Self {
            fetcher,
            checkpoint,
            settings,
            cache: None,
            processed,
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub(crate) fn checkpoint_mut(&mut self) -> &mut Checkpoint {
        &mut self.checkpoint
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// The whole population, sorted by id and unique per id.
    fn population(&mut self) -> &[SnapshotRecord] {
        let fresh = self
            .cache
            .as_ref()
            .is_some_and(|c| c.fetched_at.elapsed() < self.settings.cache_ttl);

        if !fresh {
            let lines = self.fetcher.fetch_all();
            let parsed = parse_records(&lines, self.settings.delimiter);
            let parsed_count = parsed.len();

            // Last occurrence of an id wins.
            let mut by_id: HashMap<String, SnapshotRecord> = HashMap::with_capacity(parsed.len());
            for record in parsed {
                by_id.insert(record.id.clone(), record);
            }
            let mut records: Vec<SnapshotRecord> = by_id.into_values().collect();
            records.sort_by_key(|r| r.sort_key());

            info!(
                lines = lines.len(),
                parsed = parsed_count,
                unique = records.len(),
                "Snapshot population loaded"
            );

            // An empty pull is not cached so the next call tries again.
            self.cache = if records.is_empty() {
                None
            } else {
                Some(CachedPopulation {
                    fetched_at: Instant::now(),
                    records,
                })
            };
        }

        self.cache.as_ref().map(|c| c.records.as_slice()).unwrap_or(&[])
    }

    /// Up to `batch_size` records not delivered yet, ascending by id.
    pub fn get_patients(&mut self, batch_size: usize) -> RepositoryResult<Vec<RawRecord>> {
        self.population();
        let Some(cache) = self.cache.as_ref() else {
            return Ok(Vec::new());
        };
        let batch: Vec<RawRecord> = cache
            .records
            .iter()
            .filter(|r| !self.processed.contains(&r.id))
            .take(batch_size)
            .cloned()
            .map(RawRecord::Snapshot)
            .collect();
        debug!(batch = batch.len(), processed = self.processed.len(), "Snapshot batch selected");
        Ok(batch)
    }

    pub fn get_total_patient_count(&mut self) -> RepositoryResult<u64> {
        Ok(self.population().len() as u64)
    }

    /// Add a delivered batch to the processed set and move the cursor.
    ///
    /// The in-memory set is updated even if persisting fails.
    pub fn save_last_processed(&mut self, keys: &[String]) -> CheckpointResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.processed.extend(keys.iter().cloned());
        if let Some(max) = keys.iter().max_by_key(|k| id_sort_key(k)) {
            self.checkpoint.save_last_processed_key(max)?;
        }
        self.checkpoint.save_processed_set(&self.processed)
    }

    /// Forget what was delivered so the next batches walk the whole population.
    ///
    /// The cached population is kept; it still expires on its own TTL.
    pub fn begin_full_pass(&mut self) {
        self.processed.clear();
        if let Err(e) = self.checkpoint.clear_processed_set() {
            warn!(error = %e, "Failed to clear persisted processed set");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryStateStore;
    use crate::models::SourceKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StaticFetcher {
        lines: Vec<String>,
        calls: Arc<AtomicUsize>,
    }

    impl SnapshotFetcher for StaticFetcher {
        fn fetch_all(&mut self) -> Vec<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.lines.clone()
        }
    }

    fn line(id: &str) -> String {
        format!("{};Last;First;Middle;19900101;21;4510;123456;a@example.org;89990000000;login@example.org", id)
    }

    fn repo(ids: &[&str], ttl: Duration) -> (SnapshotRepository, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = StaticFetcher {
            lines: ids.iter().map(|id| line(id)).collect(),
            calls: calls.clone(),
        };
        let checkpoint = Checkpoint::new(SourceKind::Snapshot, Box::new(MemoryStateStore::new()));
        let settings = SnapshotSettings {
            cache_ttl: ttl,
            ..Default::default()
        };
        (SnapshotRepository::new(Box::new(fetcher), checkpoint, settings), calls)
    }

    fn keys(batch: &[RawRecord]) -> Vec<String> {
        batch.iter().filter_map(RawRecord::key).collect()
    }

    #[test]
    fn test_batches_exclude_processed_and_are_sorted() {
        let (mut repo, _) = repo(&["30/C", "4/A", "10/B", "4/A"], DEFAULT_POPULATION_TTL);

        assert_eq!(repo.get_total_patient_count().unwrap(), 3);

        let first = repo.get_patients(2).unwrap();
        assert_eq!(keys(&first), vec!["4/A", "10/B"]);
        repo.save_last_processed(&keys(&first)).unwrap();
        assert_eq!(repo.checkpoint().last_processed_key().unwrap(), Some("10/B".into()));

        let second = repo.get_patients(2).unwrap();
        assert_eq!(keys(&second), vec!["30/C"]);
        repo.save_last_processed(&keys(&second)).unwrap();

        assert!(repo.get_patients(2).unwrap().is_empty());
        assert_eq!(repo.checkpoint().processed_set().unwrap().len(), 3);
    }

    #[test]
    fn test_population_is_cached() {
        let (mut repo, calls) = repo(&["1/A", "2/B"], DEFAULT_POPULATION_TTL);
        repo.get_patients(1).unwrap();
        repo.get_patients(1).unwrap();
        repo.get_total_patient_count().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_expired_cache_refetches() {
        let (mut repo, calls) = repo(&["1/A"], Duration::ZERO);
        repo.get_patients(1).unwrap();
        repo.get_patients(1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_full_pass_resets_processed() {
        let (mut repo, _) = repo(&["1/A", "2/B"], DEFAULT_POPULATION_TTL);
        let batch = repo.get_patients(10).unwrap();
        repo.save_last_processed(&keys(&batch)).unwrap();
        assert!(repo.get_patients(10).unwrap().is_empty());

        repo.begin_full_pass();
        assert_eq!(repo.processed_count(), 0);
        assert_eq!(repo.get_patients(10).unwrap().len(), 2);
    }

    #[test]
    fn test_full_pass_keeps_cached_population() {
        let (mut repo, calls) = repo(&["1/A", "2/B"], DEFAULT_POPULATION_TTL);
        assert_eq!(repo.get_total_patient_count().unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        repo.begin_full_pass();
        assert_eq!(repo.get_patients(10).unwrap().len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_pull_is_empty_batch() {
        let (mut repo, calls) = repo(&[], DEFAULT_POPULATION_TTL);
        assert!(repo.get_patients(10).unwrap().is_empty());
        assert_eq!(repo.get_total_patient_count().unwrap(), 0);
        // not cached
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
