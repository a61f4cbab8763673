// Autopolicy engine
// Search loop, batch workers and the evaluation boundary

pub mod budget;
pub mod evaluator;
pub mod exit;
pub mod search;
pub mod settings;
pub mod worker;

pub use budget::{PreemptionSignal, Unbounded, WallClockBudget};
pub use evaluator::{
    CommandEvaluator, Evaluation, Evaluator, LookupEvaluator, RegexExtractor, TimingExtractor,
};
pub use exit::{ERROR_EXIT_CODE, FINISHED_EXIT_CODE, PREEMPTED_EXIT_CODE};
pub use search::{SearchLoop, SearchOutcome, SearchState};
pub use settings::{
    load_json, BudgetSettings, EvaluatorSettings, SearchSettings, SpaceSettings, SweepSettings,
    SETTINGS_ENV,
};
pub use worker::{BatchWorker, WorkerReport};

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber used by the binaries. `RUST_LOG` overrides the
/// default `info` level.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber may already be set when embedded in another program.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
