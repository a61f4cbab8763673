//! JSON settings for the search and sweep binaries.

use ap_ledger::{ExplorationLedger, LedgerDirectory};
use ap_optimizer::OptimizerSettings;
use ap_queue::{SamplingPlan, SweepDefinition};
use ap_types::{ApResult, KnobSpace, RuntimeConfig};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::budget::{PreemptionSignal, Unbounded, WallClockBudget};
use crate::evaluator::{CommandEvaluator, Evaluator, LookupEvaluator, RegexExtractor};
use crate::search::SearchLoop;

/// Environment variable naming the default settings file.
pub const SETTINGS_ENV: &str = "AUTOPOLICY_SETTINGS";

/// Read a JSON settings file.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> ApResult<T> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ap_types::config_error!("cannot read settings {}: {}", path.display(), e)
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// How the knob space is described in a settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpaceSettings {
    /// Thread counts and instrumented regions; proc-bind and places use the
    /// standard OpenMP choices.
    Openmp {
        thread_counts: Vec<u32>,
        regions: Vec<String>,
        #[serde(default = "default_region_policies")]
        region_policies: usize,
    },
    /// Every knob listed explicitly.
    Explicit { knobs: KnobSpace },
}

fn default_region_policies() -> usize {
    2
}

impl SpaceSettings {
    pub fn build(&self) -> ApResult<KnobSpace> {
        match self {
            Self::Openmp {
                thread_counts,
                regions,
                region_policies,
            } => KnobSpace::openmp(thread_counts, regions, *region_policies),
            Self::Explicit { knobs } => Ok(knobs.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluatorSettings {
    /// Run a shell command per evaluation.
    Command {
        command: String,
        #[serde(default)]
        working_dir: Option<PathBuf>,
        #[serde(default = "default_timeout_seconds")]
        timeout_seconds: f64,
        /// Text preceding the timing value in the program output.
        #[serde(default)]
        marker: Option<String>,
        /// Regex whose first capture group is the timing value. Exclusive
        /// with `marker`.
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Answer from completed sweep data (a `complete.csv` or sweep dir).
    Lookup { database: PathBuf },
}

fn default_timeout_seconds() -> f64 {
    120.0
}

impl EvaluatorSettings {
    /// Timeout applied to each run, if the evaluator runs anything.
    pub fn timeout_seconds(&self) -> Option<f64> {
        match self {
            Self::Command {
                timeout_seconds, ..
            } => Some(*timeout_seconds),
            Self::Lookup { .. } => None,
        }
    }

    pub fn build(&self, sweep: &SweepDefinition) -> ApResult<Box<dyn Evaluator>> {
        match self {
            Self::Command {
                command,
                working_dir,
                timeout_seconds,
                marker,
                pattern,
                env,
            } => {
                if !(timeout_seconds.is_finite() && *timeout_seconds > 0.0) {
                    return Err(ap_types::config_error!(
                        "timeout_seconds must be positive, got {}",
                        timeout_seconds
                    ));
                }
                let mut evaluator = CommandEvaluator::new(
                    sweep.space.clone(),
                    command.clone(),
                    Duration::from_secs_f64(*timeout_seconds),
                )?
                .with_env(env.clone());
                if let Some(dir) = working_dir {
                    evaluator = evaluator.with_working_dir(dir);
                }
                match (marker, pattern) {
                    (Some(_), Some(_)) => {
                        return Err(ap_types::config_error!(
                            "set either marker or pattern for {:?}, not both",
                            command
                        ));
                    }
                    (Some(marker), None) => {
                        evaluator =
                            evaluator.with_extractor(Box::new(RegexExtractor::marker(marker)?));
                    }
                    (None, Some(pattern)) => {
                        evaluator =
                            evaluator.with_extractor(Box::new(RegexExtractor::new(pattern)?));
                    }
                    (None, None) => {}
                }
                Ok(Box::new(evaluator))
            }
            Self::Lookup { database } => Ok(Box::new(LookupEvaluator::load(sweep, database)?)),
        }
    }
}

/// Wall-clock limit for one process under a batch scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetSettings {
    pub seconds: f64,
    /// Time kept free at the end for the final write and exit.
    #[serde(default = "default_reserve_seconds")]
    pub reserve_seconds: f64,
}

fn default_reserve_seconds() -> f64 {
    60.0
}

impl BudgetSettings {
    pub fn signal(budget: Option<&Self>) -> Box<dyn PreemptionSignal> {
        match budget {
            Some(b) => Box::new(WallClockBudget::new(
                Duration::from_secs_f64(b.seconds.max(0.0)),
                Duration::from_secs_f64(b.reserve_seconds.max(0.0)),
            )),
            None => Box::new(Unbounded),
        }
    }
}

/// One optimizer run against one program and problem size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSettings {
    pub program: String,
    pub problem_size: String,
    pub space: SpaceSettings,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default)]
    pub budget: Option<BudgetSettings>,
    /// Defaults to the per-user data directory.
    #[serde(default)]
    pub ledger_dir: Option<PathBuf>,
    pub evaluator: EvaluatorSettings,
}

fn default_seed() -> u64 {
    1
}

fn default_max_steps() -> usize {
    100
}

impl SearchSettings {
    pub fn new(
        program: impl Into<String>,
        problem_size: impl Into<String>,
        space: SpaceSettings,
        evaluator: EvaluatorSettings,
    ) -> Self {
        Self {
            program: program.into(),
            problem_size: problem_size.into(),
            space,
            optimizer: OptimizerSettings::default(),
            seed: default_seed(),
            max_steps: default_max_steps(),
            budget: None,
            ledger_dir: None,
            evaluator,
        }
    }

    pub fn load(path: &Path) -> ApResult<Self> {
        load_json(path)
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerSettings) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_budget(mut self, seconds: f64, reserve_seconds: f64) -> Self {
        self.budget = Some(BudgetSettings {
            seconds,
            reserve_seconds,
        });
        self
    }

    pub fn with_ledger_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ledger_dir = Some(dir.into());
        self
    }

    pub fn ledger_directory(&self) -> ApResult<LedgerDirectory> {
        let root = self
            .ledger_dir
            .clone()
            .unwrap_or_else(LedgerDirectory::default_root);
        LedgerDirectory::new(root)
    }

    /// Open the ledger this run writes to.
    pub fn open_ledger(&self, space: KnobSpace) -> ApResult<ExplorationLedger> {
        self.ledger_directory()?.open(
            space,
            &self.program,
            &self.problem_size,
            &self.optimizer.tag(),
            self.seed,
        )
    }

    /// Assemble the search loop, resuming from any existing ledger.
    pub fn build(&self) -> ApResult<SearchLoop> {
        let space = self.space.build()?;
        let sweep = SweepDefinition::new(&self.program, &self.problem_size, space.clone());
        let evaluator = self.evaluator.build(&sweep)?;
        let ledger = self.open_ledger(space.clone())?;
        let search = SearchLoop::new(
            space,
            &self.optimizer,
            self.seed,
            ledger,
            evaluator,
            self.max_steps,
        )?;
        Ok(search.with_preemption(BudgetSettings::signal(self.budget.as_ref())))
    }
}

/// An exhaustive sweep distributed over batch workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSettings {
    pub sweep: SweepDefinition,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    pub sweep_dir: PathBuf,
    pub evaluator: EvaluatorSettings,
    #[serde(default)]
    pub budget: Option<BudgetSettings>,
    /// Sampling plan to measure instead of the full Cartesian product.
    #[serde(default)]
    pub plan: Option<PathBuf>,
}

fn default_batch_size() -> usize {
    50
}

impl SweepSettings {
    pub fn new(
        sweep: SweepDefinition,
        sweep_dir: impl Into<PathBuf>,
        evaluator: EvaluatorSettings,
    ) -> Self {
        Self {
            sweep,
            batch_size: default_batch_size(),
            sweep_dir: sweep_dir.into(),
            evaluator,
            budget: None,
            plan: None,
        }
    }

    pub fn load(path: &Path) -> ApResult<Self> {
        load_json(path)
    }

    pub fn with_plan(mut self, plan: impl Into<PathBuf>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    /// Configs the sweep must measure: the plan's unique rows, or every
    /// config in the space.
    pub fn required(&self) -> ApResult<Vec<RuntimeConfig>> {
        match &self.plan {
            Some(path) => Ok(SamplingPlan::load(path, &self.sweep)?.required()),
            None => self.sweep.enumerate(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Time value that marks a timed-out run in completion files.
    pub fn timeout_value(&self) -> Option<f64> {
        self.evaluator.timeout_seconds()
    }
}
