//! Required-minus-completed reconciliation.

use ap_types::{ApResult, QueueError, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::completion::Completion;
use crate::sweep::SweepDefinition;

/// Time value a worker writes when a run produced no measurement.
pub const FAILURE_SENTINEL: f64 = -1.0;

const TIME_EPSILON: f64 = 1e-9;

/// Configs assigned to one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBatch {
    /// 1-based position among `total` batches.
    pub index: usize,
    pub total: usize,
    pub configs: Vec<RuntimeConfig>,
}

impl JobBatch {
    /// `job_<index>_of_<total>`
    pub fn dir_name(&self) -> String {
        format!("job_{}_of_{}", self.index, self.total)
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Distinct required configs.
    pub required: usize,
    /// Distinct configs with a usable measurement.
    pub completed: usize,
    /// Completion rows dropped as failed or timed out.
    pub discarded: usize,
    pub remaining: Vec<RuntimeConfig>,
    pub batches: Vec<JobBatch>,
}

impl Reconciliation {
    pub fn is_finished(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// Computes the work still outstanding for a sweep and splits it into
/// batches.
#[derive(Debug, Clone)]
pub struct JobQueueReconciler {
    sweep: SweepDefinition,
    batch_size: usize,
    failure_sentinel: f64,
    timeout_value: Option<f64>,
}

impl JobQueueReconciler {
    pub fn new(sweep: SweepDefinition, batch_size: usize) -> ApResult<Self> {
        if batch_size == 0 {
            return Err(QueueError::InvalidBatchSize { batch_size }.into());
        }
        Ok(Self {
            sweep,
            batch_size,
            failure_sentinel: FAILURE_SENTINEL,
            timeout_value: None,
        })
    }

    pub fn with_failure_sentinel(mut self, sentinel: f64) -> Self {
        self.failure_sentinel = sentinel;
        self
    }

    /// Treat completions carrying this time as timed out, i.e. not done.
    pub fn with_timeout_value(mut self, timeout: f64) -> Self {
        self.timeout_value = Some(timeout);
        self
    }

    pub fn sweep(&self) -> &SweepDefinition {
        &self.sweep
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether a completion counts as done.
    pub fn is_usable(&self, time: f64) -> bool {
        let matches = |value: f64| (time - value).abs() < TIME_EPSILON;
        time.is_finite()
            && time >= 0.0
            && !matches(self.failure_sentinel)
            && !self.timeout_value.is_some_and(matches)
    }

    /// `required - completed`, chunked into batches.
    ///
    /// Pure: the same inputs always yield the same batches.
    pub fn reconcile(
        &self,
        required: &[RuntimeConfig],
        completions: &[Completion],
    ) -> ApResult<Reconciliation> {
        let mut seen = HashSet::new();
        let mut unique_required = Vec::new();
        for config in required {
            config.validate(&self.sweep.space)?;
            if seen.insert(config) {
                unique_required.push(config.clone());
            }
        }

        let mut completed = HashSet::new();
        let mut discarded = 0;
        for completion in completions {
            if self.is_usable(completion.time) {
                completed.insert(&completion.config);
            } else {
                discarded += 1;
            }
        }

        let remaining: Vec<RuntimeConfig> = unique_required
            .iter()
            .filter(|c| !completed.contains(c))
            .cloned()
            .collect();

        let total = remaining.len().div_ceil(self.batch_size);
        let batches = remaining
            .chunks(self.batch_size)
            .enumerate()
            .map(|(i, chunk)| JobBatch {
                index: i + 1,
                total,
                configs: chunk.to_vec(),
            })
            .collect();

        let done = unique_required.len() - remaining.len();
        tracing::info!(
            "{}-{}: {} required, {} completed, {} remaining in {} batches ({} failed rows ignored)",
            self.sweep.program,
            self.sweep.problem_size,
            unique_required.len(),
            done,
            remaining.len(),
            total,
            discarded
        );

        Ok(Reconciliation {
            required: unique_required.len(),
            completed: done,
            discarded,
            remaining,
            batches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_types::{Knob, KnobSpace};

    fn sweep() -> SweepDefinition {
        let space = KnobSpace::new(vec![
            Knob::global("threads", "OMP_NUM_THREADS", [10, 20]),
            Knob::global("bind", "OMP_PROC_BIND", ["close", "spread"]),
        ])
        .unwrap();
        SweepDefinition::new("lulesh", "30", space)
    }

    fn config(threads: usize, bind: usize) -> RuntimeConfig {
        RuntimeConfig::new().with("threads", threads).with("bind", bind)
    }

    #[test]
    fn remaining_excludes_completed_configs() {
        let reconciler = JobQueueReconciler::new(sweep(), 10).unwrap();
        let required = vec![config(0, 0), config(1, 0)];
        // Built in the opposite key order to the required configs.
        let done = RuntimeConfig::new().with("bind", 0).with("threads", 0);
        let result = reconciler
            .reconcile(&required, &[Completion::new(done, 3.2)])
            .unwrap();
        assert_eq!(result.remaining, vec![config(1, 0)]);
        assert_eq!(result.batches.len(), 1);
        assert_eq!(result.completed, 1);
    }

    #[test]
    fn reconciling_twice_gives_identical_batches() {
        let reconciler = JobQueueReconciler::new(sweep(), 3).unwrap();
        let required = sweep().enumerate().unwrap();
        let completions = vec![Completion::new(config(1, 1), 2.0)];
        let first = reconciler.reconcile(&required, &completions).unwrap();
        let second = reconciler.reconcile(&required, &completions).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.batches.len(), 1);
        assert_eq!(first.batches[0].dir_name(), "job_1_of_1");
    }

    #[test]
    fn nothing_remains_when_everything_completed() {
        let reconciler = JobQueueReconciler::new(sweep(), 2).unwrap();
        let required = sweep().enumerate().unwrap();
        let completions: Vec<_> = required
            .iter()
            .map(|c| Completion::new(c.clone(), 1.0))
            .collect();
        let result = reconciler.reconcile(&required, &completions).unwrap();
        assert!(result.is_finished());
        assert!(result.batches.is_empty());
    }

    #[test]
    fn failed_and_timed_out_runs_are_requeued() {
        let reconciler = JobQueueReconciler::new(sweep(), 2)
            .unwrap()
            .with_timeout_value(120.0);
        let required = sweep().enumerate().unwrap();
        let completions = vec![
            Completion::new(config(0, 0), -1.0),
            Completion::new(config(0, 1), 120.0),
            Completion::new(config(1, 0), f64::NAN),
            Completion::new(config(1, 1), 4.0),
            Completion::new(config(1, 1), 4.1),
        ];
        let result = reconciler.reconcile(&required, &completions).unwrap();
        assert_eq!(result.remaining, vec![config(0, 0), config(0, 1), config(1, 0)]);
        assert_eq!(result.discarded, 3);
        assert_eq!(result.completed, 1);
        let sizes: Vec<usize> = result.batches.iter().map(|b| b.configs.len()).collect();
        assert_eq!(sizes, vec![2, 1]);
        assert!(result.batches.iter().all(|b| b.total == 2));
    }

    #[test]
    fn a_late_success_overrides_an_earlier_failure() {
        let reconciler = JobQueueReconciler::new(sweep(), 4).unwrap();
        let completions = vec![
            Completion::new(config(0, 0), -1.0),
            Completion::new(config(0, 0), 2.5),
        ];
        let result = reconciler.reconcile(&[config(0, 0)], &completions).unwrap();
        assert!(result.is_finished());
    }

    #[test]
    fn duplicate_required_configs_collapse() {
        let reconciler = JobQueueReconciler::new(sweep(), 4).unwrap();
        let required = vec![config(0, 0), config(0, 0), config(1, 1)];
        let result = reconciler.reconcile(&required, &[]).unwrap();
        assert_eq!(result.required, 2);
        assert_eq!(result.remaining, vec![config(0, 0), config(1, 1)]);
    }

    #[test]
    fn zero_batch_size_rejected() {
        assert!(JobQueueReconciler::new(sweep(), 0).is_err());
    }
}
