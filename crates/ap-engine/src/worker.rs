//! Batch worker: works through one `job_<i>_of_<n>` directory.

use ap_queue::{read_batch, Completion, CompletionFile, SweepDefinition, FAILURE_SENTINEL};
use ap_types::{ApError, ApResult, EvaluationError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::budget::{PreemptionSignal, Unbounded};
use crate::evaluator::Evaluator;
use crate::exit::{FINISHED_EXIT_CODE, PREEMPTED_EXIT_CODE};

/// What one worker invocation did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Configs with a usable time written to `complete.csv`.
    pub evaluated: usize,
    /// Configs recorded with the failure sentinel.
    pub failed: usize,
    /// Configs recorded with the timeout as their time.
    pub timed_out: usize,
    /// Configs still without a completion row when the worker stopped.
    pub remaining: usize,
    pub preempted: bool,
}

impl WorkerReport {
    pub fn exit_code(&self) -> i32 {
        if self.preempted {
            PREEMPTED_EXIT_CODE
        } else {
            FINISHED_EXIT_CODE
        }
    }
}

pub struct BatchWorker {
    sweep: SweepDefinition,
    batch_dir: PathBuf,
    evaluator: Box<dyn Evaluator>,
    preemption: Box<dyn PreemptionSignal>,
    failure_sentinel: f64,
}

impl std::fmt::Debug for BatchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWorker")
            .field("batch_dir", &self.batch_dir)
            .field("evaluator", &self.evaluator.describe())
            .finish()
    }
}

impl BatchWorker {
    pub fn new(
        sweep: SweepDefinition,
        batch_dir: impl Into<PathBuf>,
        evaluator: Box<dyn Evaluator>,
    ) -> Self {
        Self {
            sweep,
            batch_dir: batch_dir.into(),
            evaluator,
            preemption: Box::new(Unbounded),
            failure_sentinel: FAILURE_SENTINEL,
        }
    }

    pub fn with_preemption(mut self, preemption: Box<dyn PreemptionSignal>) -> Self {
        self.preemption = preemption;
        self
    }

    pub fn with_failure_sentinel(mut self, sentinel: f64) -> Self {
        self.failure_sentinel = sentinel;
        self
    }

    pub fn batch_dir(&self) -> &Path {
        &self.batch_dir
    }

    /// Evaluate every config in `todo.csv` not yet in `complete.csv`.
    ///
    /// Each result is on disk before the next config starts, so a killed
    /// worker loses at most the run in flight.
    pub async fn run(&mut self) -> ApResult<WorkerReport> {
        let todo = read_batch(&self.batch_dir, &self.sweep)?;
        let completions = CompletionFile::in_dir(&self.batch_dir);
        let done: HashSet<_> = completions
            .read(&self.sweep)?
            .into_iter()
            .map(|c| c.config)
            .collect();

        let pending: Vec<_> = todo.into_iter().filter(|c| !done.contains(c)).collect();
        info!(
            "{}: {} configs to run ({} already complete)",
            self.batch_dir.display(),
            pending.len(),
            done.len()
        );

        let mut report = WorkerReport {
            remaining: pending.len(),
            ..Default::default()
        };
        for config in pending {
            if self.preemption.should_stop() {
                info!(
                    "Stopping {} with {} configs left",
                    self.batch_dir.display(),
                    report.remaining
                );
                report.preempted = true;
                return Ok(report);
            }

            let started = Instant::now();
            let time = match self.evaluator.evaluate(&config).await {
                Ok(evaluation) if evaluation.timed_out => {
                    report.timed_out += 1;
                    evaluation.time
                }
                Ok(evaluation) => {
                    report.evaluated += 1;
                    evaluation.time
                }
                Err(ApError::Evaluation(
                    e @ (EvaluationError::MeasurementFailure { .. }
                    | EvaluationError::ProcessFailed { .. }),
                )) => {
                    warn!("{} failed: {}", config, e);
                    report.failed += 1;
                    self.failure_sentinel
                }
                Err(e) => return Err(e),
            };
            completions.append(&self.sweep, Completion::new(config.clone(), time))?;
            self.preemption.observe_step(started.elapsed());
            report.remaining -= 1;
            debug!("{} -> {}", config, time);
        }

        info!(
            "{}: finished ({} measured, {} timed out, {} failed)",
            self.batch_dir.display(),
            report.evaluated,
            report.timed_out,
            report.failed
        );
        Ok(report)
    }
}
