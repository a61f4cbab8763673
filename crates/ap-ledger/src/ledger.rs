//! The exploration ledger: every evaluation of one search run, in order.

use ap_types::{ApResult, KnobSpace, LedgerError, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::record::EvaluationRecord;
use crate::store::RecordStore;

/// Aggregate over all repeats of one config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub config: RuntimeConfig,
    pub mean_time: f64,
    /// Sample standard deviation; zero for a single sample.
    pub std_dev: f64,
    pub samples: usize,
    /// Step of the first evaluation of this config.
    pub first_step: usize,
}

/// Append-only log of evaluations backed by a [`RecordStore`].
///
/// Every `append` writes a full snapshot before returning, so a crash never
/// loses an acknowledged record.
pub struct ExplorationLedger {
    space: KnobSpace,
    store: Box<dyn RecordStore>,
    records: Vec<EvaluationRecord>,
}

impl std::fmt::Debug for ExplorationLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplorationLedger")
            .field("store", &self.store.describe())
            .field("records", &self.records.len())
            .finish()
    }
}

impl ExplorationLedger {
    /// Open a ledger, loading whatever the store already holds.
    pub fn open(space: KnobSpace, store: Box<dyn RecordStore>) -> ApResult<Self> {
        let mut records = store.load()?;
        for record in &records {
            record.config.validate(&space)?;
        }
        records.sort_by_key(|r| r.step);
        refresh_repeat_counts(&mut records);

        if !records.is_empty() {
            tracing::info!(
                "Resuming ledger {} with {} records",
                store.describe(),
                records.len()
            );
        }
        Ok(Self {
            space,
            store,
            records,
        })
    }

    pub fn space(&self) -> &KnobSpace {
        &self.space
    }

    pub fn records(&self) -> &[EvaluationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    /// Step index for the next record.
    pub fn next_step(&self) -> usize {
        self.records.last().map_or(0, |r| r.step + 1)
    }

    /// Add a record and persist the full ledger.
    ///
    /// Repeats of an already-measured config are kept; every row for that
    /// config, old and new, ends up with the same `repeat_count`.
    pub fn append(&mut self, mut record: EvaluationRecord) -> ApResult<&EvaluationRecord> {
        if self.store.is_complete() {
            return Err(LedgerError::AlreadyComplete {
                path: self.store.describe(),
            }
            .into());
        }
        record.config.validate(&self.space)?;

        // Staged so a failed save leaves the ledger as it was.
        let mut staged = self.records.clone();
        let repeats = staged.iter().filter(|r| r.config == record.config).count() + 1;
        if repeats > 1 {
            tracing::debug!("Config {} measured {} times", record.config, repeats);
            for existing in staged.iter_mut().filter(|r| r.config == record.config) {
                existing.repeat_count = repeats;
            }
        }
        record.repeat_count = repeats;
        staged.push(record);

        self.store.save(&staged)?;
        self.records = staged;
        let index = self.records.len() - 1;
        Ok(&self.records[index])
    }

    /// The `n` fastest records, ties broken by earliest step. Repeats are
    /// included.
    pub fn best_n(&self, n: usize) -> Vec<&EvaluationRecord> {
        let mut ranked: Vec<&EvaluationRecord> = self.records.iter().collect();
        ranked.sort_by(|a, b| by_time_then_step(a, b));
        ranked.truncate(n);
        ranked
    }

    /// Like [`best_n`](Self::best_n), restricted to the first occurrence of
    /// each config.
    pub fn best_n_first_seen(&self, n: usize) -> Vec<&EvaluationRecord> {
        let mut seen = HashSet::new();
        let mut ranked: Vec<&EvaluationRecord> = self
            .records
            .iter()
            .filter(|r| seen.insert(&r.config))
            .collect();
        ranked.sort_by(|a, b| by_time_then_step(a, b));
        ranked.truncate(n);
        ranked
    }

    /// Per-config mean and spread across repeats, fastest mean first.
    pub fn summarize(&self) -> Vec<ConfigSummary> {
        let mut groups: HashMap<&RuntimeConfig, Vec<&EvaluationRecord>> = HashMap::new();
        for record in &self.records {
            groups.entry(&record.config).or_default().push(record);
        }

        let mut summaries: Vec<ConfigSummary> = groups
            .into_iter()
            .map(|(config, rows)| {
                let times: Vec<f64> = rows.iter().map(|r| r.time).collect();
                let (mean_time, std_dev) = mean_and_std(&times);
                ConfigSummary {
                    config: config.clone(),
                    mean_time,
                    std_dev,
                    samples: times.len(),
                    first_step: rows.iter().map(|r| r.step).min().unwrap_or_default(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| {
            a.mean_time
                .total_cmp(&b.mean_time)
                .then(a.first_step.cmp(&b.first_step))
        });
        summaries
    }

    pub fn total_optimizer_overhead(&self) -> f64 {
        self.records.iter().map(|r| r.optimizer_overhead).sum()
    }

    pub fn total_execution_time(&self) -> f64 {
        self.records.iter().map(|r| r.time).sum()
    }

    pub fn mark_complete(&mut self) -> ApResult<()> {
        self.store.mark_complete(&self.records)
    }

    pub fn is_complete(&self) -> bool {
        self.store.is_complete()
    }
}

fn by_time_then_step(a: &EvaluationRecord, b: &EvaluationRecord) -> Ordering {
    a.time.total_cmp(&b.time).then(a.step.cmp(&b.step))
}

fn refresh_repeat_counts(records: &mut [EvaluationRecord]) {
    let mut counts: HashMap<RuntimeConfig, usize> = HashMap::new();
    for record in records.iter() {
        *counts.entry(record.config.clone()).or_default() += 1;
    }
    for record in records.iter_mut() {
        record.repeat_count = counts[&record.config];
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (f64::NAN, 0.0);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n == 1 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CsvRecordStore, MemoryRecordStore};

    fn space() -> KnobSpace {
        KnobSpace::openmp(&[1, 2, 4], &["r.cc@12"], 3).unwrap()
    }

    fn config(threads: usize, policy: usize) -> RuntimeConfig {
        RuntimeConfig::new()
            .with("num_threads", threads)
            .with("proc_bind", 0)
            .with("places", 1)
            .with("r.cc@12", policy)
    }

    fn ledger() -> ExplorationLedger {
        ExplorationLedger::open(space(), Box::new(MemoryRecordStore::new())).unwrap()
    }

    #[test]
    fn repeats_share_a_count_and_are_both_kept() {
        let mut ledger = ledger();
        ledger
            .append(EvaluationRecord::new(config(1, 2), 4.0, 0))
            .unwrap();
        ledger
            .append(EvaluationRecord::new(config(0, 0), 6.0, 1))
            .unwrap();
        let appended = ledger
            .append(EvaluationRecord::new(config(1, 2), 4.2, 2))
            .unwrap();
        assert_eq!(appended.repeat_count, 2);

        let repeats: Vec<_> = ledger
            .records()
            .iter()
            .filter(|r| r.config == config(1, 2))
            .collect();
        assert_eq!(repeats.len(), 2);
        assert!(repeats.iter().all(|r| r.repeat_count == 2));
        assert_eq!(ledger.records()[1].repeat_count, 1);

        let best: Vec<usize> = ledger.best_n(3).iter().map(|r| r.step).collect();
        assert_eq!(best, vec![0, 2, 1]);
        let first_seen: Vec<usize> = ledger.best_n_first_seen(3).iter().map(|r| r.step).collect();
        assert_eq!(first_seen, vec![0, 1]);
    }

    #[test]
    fn ties_break_on_earliest_step() {
        let mut ledger = ledger();
        for (step, threads) in [(0, 2), (1, 1), (2, 0)] {
            ledger
                .append(EvaluationRecord::new(config(threads, 0), 5.0, step))
                .unwrap();
        }
        let best: Vec<usize> = ledger.best_n(2).iter().map(|r| r.step).collect();
        assert_eq!(best, vec![0, 1]);
    }

    #[test]
    fn summary_averages_repeats() {
        let mut ledger = ledger();
        ledger.append(EvaluationRecord::new(config(1, 0), 2.0, 0)).unwrap();
        ledger.append(EvaluationRecord::new(config(1, 0), 4.0, 1)).unwrap();
        ledger.append(EvaluationRecord::new(config(2, 0), 2.5, 2)).unwrap();

        let summary = ledger.summarize();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].config, config(2, 0));
        assert_eq!(summary[1].mean_time, 3.0);
        assert_eq!(summary[1].samples, 2);
        assert!((summary[1].std_dev - std::f64::consts::SQRT_2).abs() < 1e-12);
        assert_eq!(summary[0].std_dev, 0.0);
    }

    #[test]
    fn totals_separate_overhead_from_execution() {
        let mut ledger = ledger();
        ledger
            .append(EvaluationRecord::new(config(0, 0), 10.0, 0).with_overhead(0.5))
            .unwrap();
        ledger
            .append(EvaluationRecord::new(config(0, 1), 12.0, 1).with_overhead(0.25))
            .unwrap();
        assert_eq!(ledger.total_execution_time(), 22.0);
        assert_eq!(ledger.total_optimizer_overhead(), 0.75);
        assert_eq!(ledger.next_step(), 2);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut ledger = ledger();
        let bad = config(0, 0).with("r.cc@12", 7);
        assert!(ledger.append(EvaluationRecord::new(bad, 1.0, 0)).is_err());
        assert!(ledger.is_empty());
    }

    #[test]
    fn reopen_restores_records_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lulesh-30-bo-ucb-seed1.csv");
        {
            let store = CsvRecordStore::new(&path, space());
            let mut ledger = ExplorationLedger::open(space(), Box::new(store)).unwrap();
            ledger.append(EvaluationRecord::new(config(0, 1), 3.0, 0)).unwrap();
            ledger.append(EvaluationRecord::new(config(0, 1), 3.5, 1)).unwrap();
            ledger.append(EvaluationRecord::new(config(2, 2), 1.0, 2)).unwrap();
        }

        let store = CsvRecordStore::new(&path, space());
        let ledger = ExplorationLedger::open(space(), Box::new(store)).unwrap();
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.records()[0].repeat_count, 2);
        assert_eq!(ledger.records()[2].repeat_count, 1);
        assert_eq!(ledger.next_step(), 3);
        assert_eq!(ledger.best_n(1)[0].config, config(2, 2));
    }

    #[test]
    fn complete_ledger_refuses_appends() {
        let mut ledger = ledger();
        ledger.append(EvaluationRecord::new(config(0, 0), 1.0, 0)).unwrap();
        ledger.mark_complete().unwrap();
        assert!(ledger.is_complete());
        let err = ledger
            .append(EvaluationRecord::new(config(0, 1), 1.0, 1))
            .unwrap_err();
        assert!(err.to_string().contains("already marked complete"));
    }

    /// Accepts `allowed` saves, then fails every one after.
    struct FlakyStore {
        allowed: usize,
        saved: usize,
    }

    impl RecordStore for FlakyStore {
        fn load(&self) -> ApResult<Vec<EvaluationRecord>> {
            Ok(Vec::new())
        }

        fn save(&mut self, records: &[EvaluationRecord]) -> ApResult<()> {
            if self.saved >= self.allowed {
                return Err(LedgerError::PersistFailed {
                    path: "flaky.csv".to_string(),
                    message: "disk full".to_string(),
                }
                .into());
            }
            self.saved = records.len();
            Ok(())
        }

        fn mark_complete(&mut self, _records: &[EvaluationRecord]) -> ApResult<()> {
            Ok(())
        }

        fn is_complete(&self) -> bool {
            false
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    #[test]
    fn failed_save_leaves_records_untouched() {
        let store = FlakyStore {
            allowed: 1,
            saved: 0,
        };
        let mut ledger = ExplorationLedger::open(space(), Box::new(store)).unwrap();
        ledger.append(EvaluationRecord::new(config(2, 0), 3.0, 0)).unwrap();

        let err = ledger
            .append(EvaluationRecord::new(config(2, 0), 2.5, 1))
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.next_step(), 1);
        assert_eq!(ledger.records()[0].repeat_count, 1);
        assert_eq!(ledger.records()[0].time, 3.0);
    }
}
