//! The ask/evaluate/tell loop for one search run.

use ap_ledger::{EvaluationRecord, ExplorationLedger};
use ap_optimizer::{build_adapter, AdapterState, OptimizerAdapter, OptimizerSettings, PolicyCodec};
use ap_queue::FAILURE_SENTINEL;
use ap_types::{ApResult, EvaluationError, KnobSpace};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::budget::{PreemptionSignal, Unbounded};
use crate::evaluator::Evaluator;
use crate::exit::{FINISHED_EXIT_CODE, PREEMPTED_EXIT_CODE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchState {
    Init,
    Stepping,
    Done,
    TimeBudgetExceeded,
}

/// How a call to [`SearchLoop::run`] ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SearchOutcome {
    /// The ledger reached the step limit.
    Finished { steps: usize },
    /// The optimizer converged before the step limit.
    Exhausted { steps: usize, reason: String },
    /// The ledger was already marked complete; nothing ran.
    AlreadyDone { steps: usize },
    /// Stopped for the wall-clock budget; relaunch to continue.
    Preempted { steps: usize },
}

impl SearchOutcome {
    pub fn steps(&self) -> usize {
        match self {
            Self::Finished { steps }
            | Self::Exhausted { steps, .. }
            | Self::AlreadyDone { steps }
            | Self::Preempted { steps } => *steps,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Preempted { .. } => PREEMPTED_EXIT_CODE,
            _ => FINISHED_EXIT_CODE,
        }
    }
}

fn is_failure(time: f64) -> bool {
    !time.is_finite() || time < 0.0 || (time - FAILURE_SENTINEL).abs() < 1e-9
}

/// Drives one optimizer against one evaluator, persisting every step.
pub struct SearchLoop {
    codec: PolicyCodec,
    adapter: Box<dyn OptimizerAdapter>,
    ledger: ExplorationLedger,
    evaluator: Box<dyn Evaluator>,
    preemption: Box<dyn PreemptionSignal>,
    max_steps: usize,
    state: SearchState,
    exhausted: Option<String>,
    method: String,
    run_id: Uuid,
}

impl std::fmt::Debug for SearchLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchLoop")
            .field("method", &self.method)
            .field("ledger", &self.ledger)
            .field("evaluator", &self.evaluator.describe())
            .field("max_steps", &self.max_steps)
            .field("state", &self.state)
            .finish()
    }
}

impl SearchLoop {
    /// Build the codec and adapter and bring the adapter up to date with
    /// whatever the ledger already holds.
    pub fn new(
        space: KnobSpace,
        optimizer: &OptimizerSettings,
        seed: u64,
        ledger: ExplorationLedger,
        evaluator: Box<dyn Evaluator>,
        max_steps: usize,
    ) -> ApResult<Self> {
        let codec = PolicyCodec::new(space);
        let adapter = build_adapter(optimizer, &codec, seed)?;
        Self::from_parts(codec, adapter, ledger, evaluator, max_steps)
    }

    /// Drive an already-built adapter. It must be freshly seeded: the
    /// ledger is replayed into it the same way [`SearchLoop::new`] does.
    pub fn with_adapter(
        space: KnobSpace,
        adapter: Box<dyn OptimizerAdapter>,
        ledger: ExplorationLedger,
        evaluator: Box<dyn Evaluator>,
        max_steps: usize,
    ) -> ApResult<Self> {
        Self::from_parts(PolicyCodec::new(space), adapter, ledger, evaluator, max_steps)
    }

    fn from_parts(
        codec: PolicyCodec,
        adapter: Box<dyn OptimizerAdapter>,
        ledger: ExplorationLedger,
        evaluator: Box<dyn Evaluator>,
        max_steps: usize,
    ) -> ApResult<Self> {
        let method = adapter.describe().method;
        let mut search = Self {
            codec,
            adapter,
            ledger,
            evaluator,
            preemption: Box::new(Unbounded),
            max_steps,
            state: SearchState::Init,
            exhausted: None,
            method,
            run_id: Uuid::new_v4(),
        };
        if !search.ledger.is_complete() {
            search.replay()?;
        }
        Ok(search)
    }

    pub fn with_preemption(mut self, preemption: Box<dyn PreemptionSignal>) -> Self {
        self.preemption = preemption;
        self
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn ledger(&self) -> &ExplorationLedger {
        &self.ledger
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Feed recorded results back through a freshly seeded adapter so it
    /// resumes the trajectory it was on.
    fn replay(&mut self) -> ApResult<()> {
        let records: Vec<(ap_types::RuntimeConfig, f64)> = self
            .ledger
            .records()
            .iter()
            .map(|r| (r.config.clone(), r.time))
            .collect();
        if records.is_empty() {
            return Ok(());
        }

        for (step, (config, time)) in records.iter().enumerate() {
            let suggestion = match self.adapter.suggest() {
                Ok(s) => s,
                Err(e) if e.is_search_exhausted() => {
                    warn!(
                        "Optimizer exhausted while replaying step {} of {}",
                        step,
                        records.len()
                    );
                    self.exhausted = Some(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            };
            let decoded = self.codec.decode(&suggestion.point)?;
            if decoded != *config {
                warn!(
                    "Replay diverged at step {}: optimizer proposed {}, ledger has {}",
                    step, decoded, config
                );
            }
            self.adapter.register(&suggestion.point, *time)?;
        }
        // Replay time is not attributable to any new record.
        self.adapter.take_overhead();

        info!(
            "Replayed {} ledger records into the {} optimizer",
            records.len(),
            self.method
        );
        Ok(())
    }

    /// One suggest/evaluate/register/append cycle.
    async fn step(&mut self) -> ApResult<()> {
        let suggestion = self.adapter.suggest()?;
        let config = self.codec.decode(&suggestion.point)?;

        let evaluation = self.evaluator.evaluate(&config).await?;
        if evaluation.timed_out {
            warn!("Step {} timed out; recording {}s", self.ledger.next_step(), evaluation.time);
        }
        if is_failure(evaluation.time) {
            return Err(EvaluationError::MeasurementFailure {
                config: config.to_string(),
                message: format!("evaluator returned {}", evaluation.time),
            }
            .into());
        }

        self.adapter.register(&suggestion.point, evaluation.time)?;
        let overhead = self.adapter.take_overhead();

        let mut record = EvaluationRecord::new(config, evaluation.time, self.ledger.next_step())
            .with_overhead(overhead)
            .with_extra("optimizer", &self.method)
            .with_extra("generation", suggestion.sample.generation)
            .with_extra("individual", suggestion.sample.individual)
            .with_extra("timedOut", evaluation.timed_out)
            .with_extra("runId", self.run_id);
        for (key, value) in evaluation.record {
            record.extras.insert(key, value);
        }

        let record = self.ledger.append(record)?;
        debug!(
            "Step {}: {} -> {:.4}s (overhead {:.4}s, repeat {})",
            record.step, record.config, record.time, record.optimizer_overhead, record.repeat_count
        );
        Ok(())
    }

    /// Step until the ledger holds `max_steps` records, the optimizer
    /// converges, or the preemption signal fires.
    pub async fn run(&mut self) -> ApResult<SearchOutcome> {
        if self.ledger.is_complete() {
            info!("Ledger {} is already complete", self.ledger.describe());
            self.state = SearchState::Done;
            return Ok(SearchOutcome::AlreadyDone {
                steps: self.ledger.len(),
            });
        }

        self.state = SearchState::Stepping;
        info!(
            "Searching with {} (run {}): {} of {} steps done",
            self.method,
            self.run_id,
            self.ledger.len(),
            self.max_steps
        );

        loop {
            if let Some(reason) = self.exhausted.take() {
                return self.finish_exhausted(reason);
            }
            if self.ledger.len() >= self.max_steps {
                self.ledger.mark_complete()?;
                self.state = SearchState::Done;
                info!(
                    "Finished {} steps; optimizer overhead {:.2}s, execution {:.2}s",
                    self.ledger.len(),
                    self.ledger.total_optimizer_overhead(),
                    self.ledger.total_execution_time()
                );
                return Ok(SearchOutcome::Finished {
                    steps: self.ledger.len(),
                });
            }
            if self.preemption.should_stop() {
                self.state = SearchState::TimeBudgetExceeded;
                info!(
                    "Time budget exhausted after {} steps; exiting for relaunch",
                    self.ledger.len()
                );
                return Ok(SearchOutcome::Preempted {
                    steps: self.ledger.len(),
                });
            }

            let started = Instant::now();
            match self.step().await {
                Ok(()) => self.preemption.observe_step(started.elapsed()),
                Err(e) if e.is_search_exhausted() => {
                    self.exhausted = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }
            if self.adapter.state() == AdapterState::Exhausted && self.exhausted.is_none() {
                self.exhausted = Some(format!("{} adapter converged", self.method));
            }
        }
    }

    fn finish_exhausted(&mut self, reason: String) -> ApResult<SearchOutcome> {
        self.ledger.mark_complete()?;
        self.state = SearchState::Done;
        info!("Search exhausted after {} steps: {}", self.ledger.len(), reason);
        Ok(SearchOutcome::Exhausted {
            steps: self.ledger.len(),
            reason,
        })
    }
}
